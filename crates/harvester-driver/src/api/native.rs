//! HarvesterApi over the Kubernetes API

use std::time::Duration;

use async_trait::async_trait;
use harvester_common::crd::{
    KeyPair, NetworkAttachmentDefinition, Setting, VirtualMachine, VirtualMachineImage,
    VirtualMachineInstance, KUBEVIRT_SUBRESOURCE_GROUP, KUBEVIRT_VERSION,
};
use harvester_common::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use tracing::debug;

use super::{HarvesterApi, VmAction};
use crate::config::ConnectionConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed `kube` client for KubeVirt, Harvester and core resources
pub struct KubeHarvesterApi {
    client: Client,
}

impl KubeHarvesterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from kubeconfig content, or the ambient kubeconfig
    /// (`KUBECONFIG`, then in-cluster) when none is given.
    pub async fn connect(connection: &ConnectionConfig) -> Result<Self> {
        let mut config = match &connection.kubeconfig_content {
            Some(content) => {
                let kubeconfig = Kubeconfig::from_yaml(content).map_err(|e| {
                    Error::validation_for_field(
                        "harvester-kubeconfig-content",
                        format!("invalid kubeconfig: {e}"),
                    )
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::validation_for_field(
                            "harvester-kubeconfig-content",
                            format!("invalid kubeconfig: {e}"),
                        )
                    })?
            }
            None => Config::infer().await.map_err(kube::Error::InferConfig)?,
        };
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);
        Ok(Self::new(Client::try_from(config)?))
    }

    fn vms(&self, namespace: &str) -> Api<VirtualMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Path of a KubeVirt power action
fn action_path(namespace: &str, name: &str, action: VmAction) -> String {
    format!(
        "/apis/{KUBEVIRT_SUBRESOURCE_GROUP}/{KUBEVIRT_VERSION}/namespaces/{namespace}/virtualmachines/{name}/{action}"
    )
}

fn namespace_of(vm: &VirtualMachine) -> Result<&str> {
    vm.metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("virtual machine", "namespace is not set"))
}

fn name_of(vm: &VirtualMachine) -> Result<&str> {
    vm.metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("virtual machine", "name is not set"))
}

#[async_trait]
impl HarvesterApi for KubeHarvesterApi {
    async fn get_setting(&self, name: &str) -> Result<Option<Setting>> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &Setting::api_resource());
        match api.get_opt(name).await? {
            Some(obj) => Ok(Some(serde_json::from_value(obj.data)?)),
            None => Ok(None),
        }
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>> {
        Ok(self.vms(namespace).get_opt(name).await?)
    }

    async fn get_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstance>> {
        let api: Api<VirtualMachineInstance> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let created = self
            .vms(namespace_of(vm)?)
            .create(&PostParams::default(), vm)
            .await?;
        debug!(vm = %name_of(&created)?, uid = ?created.metadata.uid, "Created virtual machine");
        Ok(created)
    }

    async fn patch_vm(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.vms(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()> {
        self.vms(namespace)
            .delete(name, &DeleteParams::foreground())
            .await?;
        Ok(())
    }

    async fn vm_action(&self, namespace: &str, name: &str, action: VmAction) -> Result<()> {
        let request = http::Request::put(action_path(namespace, name, action))
            .body(Vec::new())
            .map_err(|e| Error::internal_with_context("vm action", e.to_string()))?;
        self.client.request_text(request).await?;
        Ok(())
    }

    async fn get_image(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineImage>> {
        let api: Api<VirtualMachineImage> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_key_pair(&self, namespace: &str, name: &str) -> Result<Option<KeyPair>> {
        let api: Api<KeyPair> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>> {
        let api: Api<NetworkAttachmentDefinition> =
            Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("secret", "namespace is not set"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), secret).await?)
    }
}
