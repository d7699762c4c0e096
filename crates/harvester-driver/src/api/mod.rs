//! Harvester API capability
//!
//! The driver talks to Harvester through [`HarvesterApi`]. Two generations
//! implement it: [`KubeHarvesterApi`] over the native cluster API and
//! [`SteveHarvesterApi`] over the older REST API. One is picked per process
//! by [`connect`]; [`LazyApi`] defers that choice until the first call.
//!
//! Getters return `Ok(None)` for resources that do not exist so callers can
//! tell absence from failure.

mod native;
mod rest;

pub use native::KubeHarvesterApi;
pub use rest::SteveHarvesterApi;

use std::fmt;

use async_trait::async_trait;
use harvester_common::crd::{
    KeyPair, NetworkAttachmentDefinition, Setting, VirtualMachine, VirtualMachineImage,
    VirtualMachineInstance,
};
use harvester_common::Result;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::config::ConnectionConfig;

/// Power actions exposed by the VM action endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Stop,
    Restart,
}

impl VmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop => "stop",
            VmAction::Restart => "restart",
        }
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations the driver needs from Harvester
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HarvesterApi: Send + Sync {
    /// Cluster-wide setting by name
    async fn get_setting(&self, name: &str) -> Result<Option<Setting>>;

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>>;

    /// Running instance of a VM; `None` while the VM is stopped
    async fn get_vmi(&self, namespace: &str, name: &str)
        -> Result<Option<VirtualMachineInstance>>;

    /// Create a VM, returning it with server-assigned fields (uid)
    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;

    /// Apply a JSON merge patch to a VM; fields the patch omits are untouched
    async fn patch_vm(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    /// Delete a VM with foreground propagation
    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()>;

    async fn vm_action(&self, namespace: &str, name: &str, action: VmAction) -> Result<()>;

    async fn get_image(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineImage>>;

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    async fn get_key_pair(&self, namespace: &str, name: &str) -> Result<Option<KeyPair>>;

    async fn get_network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
}

/// Open a connection with the generation `connection` selects
pub async fn connect(connection: &ConnectionConfig) -> Result<Box<dyn HarvesterApi>> {
    if connection.use_rest_api() {
        info!("Connecting through the Harvester REST API");
        Ok(Box::new(SteveHarvesterApi::connect(connection).await?))
    } else {
        info!("Connecting through the Kubernetes API");
        Ok(Box::new(KubeHarvesterApi::connect(connection).await?))
    }
}

/// Connects on first use and reuses the connection afterwards
pub struct LazyApi {
    connection: ConnectionConfig,
    api: OnceCell<Box<dyn HarvesterApi>>,
}

impl LazyApi {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            api: OnceCell::new(),
        }
    }

    async fn api(&self) -> Result<&dyn HarvesterApi> {
        let api = self
            .api
            .get_or_try_init(|| connect(&self.connection))
            .await?;
        Ok(api.as_ref())
    }
}

#[async_trait]
impl HarvesterApi for LazyApi {
    async fn get_setting(&self, name: &str) -> Result<Option<Setting>> {
        self.api().await?.get_setting(name).await
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>> {
        self.api().await?.get_vm(namespace, name).await
    }

    async fn get_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstance>> {
        self.api().await?.get_vmi(namespace, name).await
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.api().await?.create_vm(vm).await
    }

    async fn patch_vm(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.api().await?.patch_vm(namespace, name, patch).await
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()> {
        self.api().await?.delete_vm(namespace, name).await
    }

    async fn vm_action(&self, namespace: &str, name: &str, action: VmAction) -> Result<()> {
        self.api().await?.vm_action(namespace, name, action).await
    }

    async fn get_image(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineImage>> {
        self.api().await?.get_image(namespace, name).await
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        self.api().await?.get_storage_class(name).await
    }

    async fn get_key_pair(&self, namespace: &str, name: &str) -> Result<Option<KeyPair>> {
        self.api().await?.get_key_pair(namespace, name).await
    }

    async fn get_network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>> {
        self.api().await?.get_network(namespace, name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.api().await?.create_secret(secret).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_match_endpoint_verbs() {
        assert_eq!(VmAction::Start.as_str(), "start");
        assert_eq!(VmAction::Stop.to_string(), "stop");
        assert_eq!(VmAction::Restart.as_str(), "restart");
    }

    #[tokio::test]
    async fn lazy_api_surfaces_connect_errors() {
        let api = LazyApi::new(ConnectionConfig {
            kubeconfig_content: Some("not: [a kubeconfig".to_string()),
            ..Default::default()
        });
        assert!(api.get_vm("default", "node").await.is_err());
    }
}
