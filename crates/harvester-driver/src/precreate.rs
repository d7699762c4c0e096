//! Checks run before a machine is created
//!
//! Everything the VM will reference has to exist up front; a create that
//! fails halfway leaves a VM behind for the caller to clean up.

use harvester_common::{namespaced_name_parts_or, Error, Result};
use harvester_vm::VmConfig;
use tracing::{debug, info};

use crate::api::HarvesterApi;

/// Setting holding the Harvester server version
pub const SERVER_VERSION_SETTING: &str = "server-version";

const UNSUPPORTED_VERSION_PREFIX: &str = "v0.1.0";

/// What the checks learned about the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreCreateOutcome {
    pub server_version: String,
    /// Public key of the configured key pair
    pub key_pair_public_key: Option<String>,
}

pub async fn pre_create_check(
    api: &dyn HarvesterApi,
    config: &VmConfig,
) -> Result<PreCreateOutcome> {
    let namespace = config.namespace.as_str();

    let server_version = api
        .get_setting(SERVER_VERSION_SETTING)
        .await?
        .map(|s| s.effective_value().to_string())
        .ok_or_else(|| Error::not_found("setting", SERVER_VERSION_SETTING))?;
    if server_version.starts_with(UNSUPPORTED_VERSION_PREFIX) {
        return Err(Error::validation(format!(
            "current harvester server version is {server_version}, only support v0.2.0+"
        )));
    }
    debug!(version = %server_version, "Harvester server version");

    if api.get_vm(namespace, &config.machine_name).await?.is_some() {
        return Err(Error::validation(format!(
            "machine {} already exists in namespace {namespace}",
            config.machine_name
        )));
    }

    let key_pair_public_key = match &config.ssh.key_pair_name {
        Some(key_pair_name) => {
            let (kp_namespace, kp_name) = namespaced_name_parts_or(key_pair_name, namespace)?;
            let key_pair = api
                .get_key_pair(&kp_namespace, &kp_name)
                .await?
                .ok_or_else(|| Error::not_found("keypair", format!("{kp_namespace}/{kp_name}")))?;
            if !key_pair.is_validated() {
                return Err(Error::validation(format!(
                    "keypair {key_pair_name} is not validated"
                )));
            }
            Some(key_pair.spec.public_key)
        }
        None => None,
    };

    for disk in &config.disks {
        if let Some(image) = &disk.image {
            let (image_namespace, image_name) = namespaced_name_parts_or(image, namespace)?;
            if api.get_image(&image_namespace, &image_name).await?.is_none() {
                return Err(Error::not_found("image", format!("{image_namespace}/{image_name}")));
            }
        }
        if let Some(storage_class) = &disk.storage_class {
            if api.get_storage_class(storage_class).await?.is_none() {
                return Err(Error::not_found("storage class", storage_class.clone()));
            }
        }
    }

    for interface in &config.interfaces {
        if let Some(network) = &interface.network {
            let (net_namespace, net_name) = namespaced_name_parts_or(network, namespace)?;
            if api.get_network(&net_namespace, &net_name).await?.is_none() {
                return Err(Error::not_found("network", format!("{net_namespace}/{net_name}")));
            }
        }
    }

    info!(machine = %config.machine_name, namespace = %namespace, "Pre-create checks passed");
    Ok(PreCreateOutcome {
        server_version,
        key_pair_public_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockHarvesterApi;
    use harvester_common::crd::{
        KeyPair, KeyPairCondition, KeyPairSpec, KeyPairStatus, NetworkAttachmentDefinition,
        NetworkAttachmentDefinitionSpec, Setting, VirtualMachine, VirtualMachineImage,
        VirtualMachineImageSpec, VirtualMachineSpec,
    };
    use harvester_vm::RawMachineConfig;
    use k8s_openapi::api::storage::v1::StorageClass;
    use mockall::predicate::eq;

    fn config(raw: RawMachineConfig) -> VmConfig {
        VmConfig::from_raw(RawMachineConfig {
            machine_name: "node-1".to_string(),
            cpu_count: 2,
            memory_size: 4,
            disk_size: 20,
            image_name: "ubuntu".to_string(),
            network_name: "vlan1".to_string(),
            ssh_port: 22,
            ..raw
        })
        .unwrap()
    }

    fn version(value: &str) -> Option<Setting> {
        Some(Setting {
            value: String::new(),
            default: value.to_string(),
        })
    }

    fn image() -> Option<VirtualMachineImage> {
        Some(VirtualMachineImage::new("ubuntu", VirtualMachineImageSpec::default()))
    }

    fn network() -> Option<NetworkAttachmentDefinition> {
        Some(NetworkAttachmentDefinition::new(
            "vlan1",
            NetworkAttachmentDefinitionSpec::default(),
        ))
    }

    fn key_pair(validated: bool) -> Option<KeyPair> {
        let mut kp = KeyPair::new(
            "dev",
            KeyPairSpec {
                public_key: "ssh-rsa AAAA dev".to_string(),
            },
        );
        kp.status = Some(KeyPairStatus {
            finger_print: None,
            conditions: vec![KeyPairCondition {
                type_: "validated".to_string(),
                status: if validated { "True" } else { "False" }.to_string(),
                message: None,
            }],
        });
        Some(kp)
    }

    fn healthy_cluster() -> MockHarvesterApi {
        let mut api = MockHarvesterApi::new();
        api.expect_get_setting()
            .with(eq(SERVER_VERSION_SETTING))
            .returning(|_| Ok(version("v1.3.1")));
        api.expect_get_vm().returning(|_, _| Ok(None));
        api.expect_get_image()
            .with(eq("default"), eq("ubuntu"))
            .returning(|_, _| Ok(image()));
        api.expect_get_network()
            .with(eq("default"), eq("vlan1"))
            .returning(|_, _| Ok(network()));
        api
    }

    #[tokio::test]
    async fn passes_when_everything_exists() {
        let api = healthy_cluster();
        let outcome = pre_create_check(&api, &config(Default::default())).await.unwrap();
        assert_eq!(outcome.server_version, "v1.3.1");
        assert_eq!(outcome.key_pair_public_key, None);
    }

    #[tokio::test]
    async fn rejects_old_servers() {
        let mut api = MockHarvesterApi::new();
        api.expect_get_setting().returning(|_| Ok(version("v0.1.0-rc1")));
        let err = pre_create_check(&api, &config(Default::default())).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error: current harvester server version is v0.1.0-rc1, only support v0.2.0+"
        );
    }

    #[tokio::test]
    async fn rejects_existing_machine() {
        let mut api = MockHarvesterApi::new();
        api.expect_get_setting().returning(|_| Ok(version("v1.2.0")));
        api.expect_get_vm()
            .with(eq("default"), eq("node-1"))
            .returning(|_, _| {
                Ok(Some(VirtualMachine::new(
                    "node-1",
                    VirtualMachineSpec::default(),
                )))
            });
        let err = pre_create_check(&api, &config(Default::default())).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("machine node-1 already exists in namespace default"));
    }

    #[tokio::test]
    async fn missing_image_is_not_found() {
        let mut api = MockHarvesterApi::new();
        api.expect_get_setting().returning(|_| Ok(version("v1.2.0")));
        api.expect_get_vm().returning(|_, _| Ok(None));
        api.expect_get_image().returning(|_, _| Ok(None));
        let err = pre_create_check(&api, &config(Default::default())).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "image default/ubuntu not found");
    }

    #[tokio::test]
    async fn missing_network_is_not_found() {
        let mut api = MockHarvesterApi::new();
        api.expect_get_setting().returning(|_| Ok(version("v1.2.0")));
        api.expect_get_vm().returning(|_, _| Ok(None));
        api.expect_get_image().returning(|_, _| Ok(image()));
        api.expect_get_network().returning(|_, _| Ok(None));
        let err = pre_create_check(&api, &config(Default::default())).await.unwrap_err();
        assert_eq!(err.to_string(), "network default/vlan1 not found");
    }

    #[tokio::test]
    async fn blank_disk_checks_storage_class() {
        let mut api = healthy_cluster();
        api.expect_get_storage_class()
            .with(eq("longhorn"))
            .returning(|_| Ok(None));
        let cfg = config(RawMachineConfig {
            disk_info: r#"{"disks":[{"imageName":"ubuntu","size":20,"bootOrder":1},{"storageClassName":"longhorn","size":50}]}"#
                .to_string(),
            ..Default::default()
        });
        let err = pre_create_check(&api, &cfg).await.unwrap_err();
        assert_eq!(err.to_string(), "storage class longhorn not found");

        let mut api = healthy_cluster();
        api.expect_get_storage_class()
            .returning(|_| Ok(Some(StorageClass::default())));
        assert!(pre_create_check(&api, &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn image_disk_storage_class_is_checked_too() {
        let mut api = healthy_cluster();
        api.expect_get_storage_class()
            .with(eq("fast-ssd"))
            .times(1)
            .returning(|_| Ok(None));
        let cfg = config(RawMachineConfig {
            disk_info: r#"{"disks":[{"imageName":"ubuntu","storageClassName":"fast-ssd","size":20,"bootOrder":1}]}"#
                .to_string(),
            ..Default::default()
        });
        let err = pre_create_check(&api, &cfg).await.unwrap_err();
        assert_eq!(err.to_string(), "storage class fast-ssd not found");
    }

    #[tokio::test]
    async fn key_pair_supplies_public_key() {
        let mut api = healthy_cluster();
        api.expect_get_key_pair()
            .with(eq("default"), eq("dev"))
            .returning(|_, _| Ok(key_pair(true)));
        let cfg = config(RawMachineConfig {
            key_pair_name: "dev".to_string(),
            ssh_private_key_path: "/home/dev/.ssh/id_rsa".to_string(),
            ..Default::default()
        });
        let outcome = pre_create_check(&api, &cfg).await.unwrap();
        assert_eq!(outcome.key_pair_public_key.as_deref(), Some("ssh-rsa AAAA dev"));
    }

    #[tokio::test]
    async fn unvalidated_key_pair_is_rejected() {
        let mut api = healthy_cluster();
        api.expect_get_key_pair().returning(|_, _| Ok(key_pair(false)));
        let cfg = config(RawMachineConfig {
            key_pair_name: "dev".to_string(),
            ssh_private_key_path: "/home/dev/.ssh/id_rsa".to_string(),
            ..Default::default()
        });
        let err = pre_create_check(&api, &cfg).await.unwrap_err();
        assert!(err.to_string().contains("keypair dev is not validated"));
    }
}
