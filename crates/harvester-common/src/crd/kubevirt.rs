//! KubeVirt VirtualMachine and VirtualMachineInstance resources
//!
//! Only the subset of the KubeVirt API the driver reads or writes is modelled.
//! Unknown fields returned by the server are ignored on deserialization.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Affinity;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// KubeVirt API group
pub const KUBEVIRT_GROUP: &str = "kubevirt.io";

/// KubeVirt API version used by the driver
pub const KUBEVIRT_VERSION: &str = "v1";

/// Group of the KubeVirt subresource API (start/stop/restart actions)
pub const KUBEVIRT_SUBRESOURCE_GROUP: &str = "subresources.kubevirt.io";

/// Run strategy: restart the instance unless it shut down cleanly
pub const RUN_STRATEGY_RERUN_ON_FAILURE: &str = "RerunOnFailure";

/// Eviction strategy: live-migrate on node drain
pub const EVICTION_STRATEGY_LIVE_MIGRATE: &str = "LiveMigrate";

/// Desired state of a KubeVirt virtual machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Run strategy (e.g. `RerunOnFailure`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<String>,

    /// Template for the running instance
    #[serde(default)]
    pub template: VirtualMachineInstanceTemplateSpec,
}

/// Observed state of a virtual machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Human readable status (Running, Stopped, Provisioning, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printable_status: Option<String>,

    /// Whether the instance is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

/// Instance template embedded in a VirtualMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceTemplateSpec {
    /// Labels and annotations propagated to the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    /// Instance specification
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

/// Specification of a virtual machine instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Virtual hardware
    #[serde(default)]
    pub domain: DomainSpec,

    /// Scheduling affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Networks the interfaces attach to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,

    /// Volumes backing the disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// What to do with the instance when its node is drained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_strategy: Option<String>,
}

/// Virtual hardware of an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default)]
    pub devices: Devices,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,
}

/// CPU topology and placement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    #[serde(default)]
    pub cores: u32,

    #[serde(default)]
    pub sockets: u32,

    #[serde(default)]
    pub threads: u32,

    /// CPU model override (e.g. `host-passthrough`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Pin vCPUs to dedicated host cores
    #[serde(default, skip_serializing_if = "is_false")]
    pub dedicated_cpu_placement: bool,

    /// Run the emulator thread on its own core
    #[serde(default, skip_serializing_if = "is_false")]
    pub isolate_emulator_thread: bool,
}

/// Resource requests and limits of an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, Quantity>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Quantity>,
}

/// Devices attached to an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<Gpu>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<Tpm>,
}

/// A disk device; exactly one of `disk` or `cdrom` is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdrom: Option<DiskTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
}

/// Bus a disk is attached to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DiskTarget {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bus: String,
}

/// A network interface; `bridge` or `masquerade` selects the binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<EmptyObject>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<EmptyObject>,
}

/// vGPU passthrough device
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Gpu {
    pub name: String,
    pub device_name: String,
}

/// Emulated TPM device
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Tpm {}

/// Presence-only marker serialized as `{}`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EmptyObject {}

/// Hypervisor features
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    /// System management mode, required by secure boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smm: Option<FeatureState>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FeatureState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Firmware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<Bootloader>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Bootloader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi: Option<Efi>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Efi {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_boot: Option<bool>,
}

/// A network an interface attaches to; `pod` or `multus` is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Network {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<EmptyObject>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus: Option<MultusNetwork>,
}

/// Secondary network provided through a NetworkAttachmentDefinition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultusNetwork {
    /// `<namespace>/<name>` of the attachment definition
    pub network_name: String,
}

/// A volume backing a disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_no_cloud: Option<CloudInitNoCloudSource>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimVolumeSource {
    pub claim_name: String,

    /// Hot-pluggable volumes survive VM removal unless explicitly requested
    #[serde(default, skip_serializing_if = "is_false")]
    pub hotpluggable: bool,
}

/// NoCloud datasource; inline payloads or secret references
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitNoCloudSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_data_secret_ref: Option<SecretReference>,
}

/// Reference to a secret in the VM's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
}

/// Running instance of a virtual machine; only the status is consulted
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    shortname = "vmi",
    namespaced,
    status = "VirtualMachineInstanceStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_strategy: Option<String>,
}

/// Observed state of an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    /// Pending, Scheduling, Scheduled, Running, Succeeded, Failed, Unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Interfaces reported by the guest agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InstanceInterface>,
}

/// Interface state reported for an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Address, possibly with a prefix length (`10.0.0.5/24`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl VirtualMachineInstance {
    /// The instance phase, empty when not reported
    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default()
    }

    /// Address of the first reported interface, if any
    pub fn first_ip_address(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.interfaces.first())
            .and_then(|i| i.ip_address.as_deref())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;
    use serde_json::json;

    #[test]
    fn resource_coordinates() {
        assert_eq!(VirtualMachine::api_version(&()), "kubevirt.io/v1");
        assert_eq!(VirtualMachine::plural(&()), "virtualmachines");
        assert_eq!(VirtualMachineInstance::kind(&()), "VirtualMachineInstance");
    }

    #[test]
    fn instance_status_from_server_json() {
        let vmi: VirtualMachineInstance = serde_json::from_value(json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachineInstance",
            "metadata": {"name": "node-1", "namespace": "default", "uid": "abc"},
            "spec": {"domain": {"devices": {}}},
            "status": {
                "phase": "Running",
                "interfaces": [{"ipAddress": "10.0.0.5/24", "name": "nic-0"}]
            }
        }))
        .unwrap();
        assert_eq!(vmi.phase(), "Running");
        assert_eq!(vmi.first_ip_address(), Some("10.0.0.5/24"));
    }

    #[test]
    fn empty_markers_serialize_as_objects() {
        let iface = Interface {
            name: "nic-0".to_string(),
            model: Some("virtio".to_string()),
            bridge: Some(EmptyObject::default()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&iface).unwrap(),
            json!({"name": "nic-0", "model": "virtio", "bridge": {}})
        );
    }

    #[test]
    fn volume_field_names_match_kubevirt() {
        let volume = Volume {
            name: "cloudinitdisk".to_string(),
            cloud_init_no_cloud: Some(CloudInitNoCloudSource {
                network_data_secret_ref: Some(SecretReference {
                    name: "node-1-cloudinit".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&volume).unwrap(),
            json!({
                "name": "cloudinitdisk",
                "cloudInitNoCloud": {"networkDataSecretRef": {"name": "node-1-cloudinit"}}
            })
        );
    }
}
