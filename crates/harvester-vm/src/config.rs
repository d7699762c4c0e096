//! Machine configuration model
//!
//! Flag values arrive as [`RawMachineConfig`] and are validated once into a
//! [`VmConfig`]. The legacy single-disk and single-network flags are folded
//! into the list form here, so the rest of the crate only sees lists.

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use harvester_common::{Error, Result, DEFAULT_NAMESPACE};
use serde::{Deserialize, Serialize};

use crate::labels::parse_labels;
use crate::network_data::validate_network_data;

/// Default number of vCPUs
pub const DEFAULT_CPU_COUNT: u32 = 2;

/// Default memory size in GiB
pub const DEFAULT_MEMORY_GIB: u32 = 4;

/// Default SSH user
pub const DEFAULT_SSH_USER: &str = "docker";

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default disk bus
pub const DEFAULT_DISK_BUS: &str = "virtio";

/// Default NIC model
pub const DEFAULT_NETWORK_MODEL: &str = "virtio";

/// Network type selecting the cluster pod network
pub const NETWORK_TYPE_POD: &str = "pod";

// =============================================================================
// Wire formats
// =============================================================================

/// JSON accepted by `--harvester-disk-info`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DiskInfo {
    #[serde(default)]
    pub disks: Vec<DiskInfoEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfoEntry {
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub storage_class_name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub boot_order: u32,
    #[serde(default)]
    pub bus: String,
    #[serde(default, rename = "type")]
    pub disk_type: String,
    #[serde(default)]
    pub hot_plug_able: bool,
}

/// JSON accepted by `--harvester-network-info`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NetworkInfo {
    #[serde(default)]
    pub interfaces: Vec<NetworkInfoEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfoEntry {
    #[serde(default)]
    pub network_name: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, rename = "type")]
    pub interface_type: String,
}

/// JSON accepted by `--harvester-vgpu-info`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VGpuInfo {
    #[serde(default, rename = "vGPURequests")]
    pub vgpu_requests: Vec<VGpuRequest>,
}

/// A vGPU profile to pass through
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VGpuRequest {
    pub name: String,
    pub device_name: String,
}

// =============================================================================
// Normalized model
// =============================================================================

/// How a disk is presented to the guest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DiskKind {
    #[default]
    Disk,
    CdRom,
}

impl DiskKind {
    fn from_wire(value: &str) -> Result<Self> {
        match value {
            "" | "disk" => Ok(Self::Disk),
            "cd-rom" | "cdrom" => Ok(Self::CdRom),
            other => Err(Error::validation_for_field(
                "harvester-disk-info",
                format!("unsupported disk type {other:?}"),
            )),
        }
    }
}

/// One disk of the machine
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    /// Image to clone, `name` or `namespace/name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Storage class for a blank volume; replaced by the image's class when
    /// an image is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    pub size_gib: u32,
    pub boot_order: u32,
    pub bus: String,
    pub kind: DiskKind,
    pub hot_pluggable: bool,
}

/// Interface binding method
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InterfaceBinding {
    Bridge,
    Masquerade,
}

impl InterfaceBinding {
    fn from_wire(value: &str, pod_network: bool) -> Result<Self> {
        match value {
            "" if pod_network => Ok(Self::Masquerade),
            "" | "bridge" => Ok(Self::Bridge),
            "masquerade" => Ok(Self::Masquerade),
            other => Err(Error::validation_for_field(
                "harvester-network-info",
                format!("unsupported interface type {other:?}"),
            )),
        }
    }
}

/// One network interface of the machine
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceSpec {
    /// Network attachment, `name` or `namespace/name`; `None` attaches the
    /// pod network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    pub model: String,
    pub binding: InterfaceBinding,
}

/// SSH access to the machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Harvester key pair whose public key is injected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair_name: Option<String>,
    /// Private key to reuse instead of generating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub add_user_to_docker_group: bool,
}

/// Firmware and CPU feature toggles
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmFeatures {
    pub efi: bool,
    pub secure_boot: bool,
    pub cpu_pinning: bool,
    pub isolate_emulator_thread: bool,
    pub tpm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
}

/// Validated machine configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub machine_name: String,
    pub namespace: String,
    pub cpu: u32,
    pub memory_gib: u32,
    pub disks: Vec<DiskSpec>,
    pub interfaces: Vec<NetworkInterfaceSpec>,
    #[serde(default)]
    pub vgpus: Vec<VGpuRequest>,
    #[serde(default)]
    pub network_type: String,
    pub ssh: SshConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_config_path: Option<PathBuf>,
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub network_data: String,
    /// Affinity JSON supplied by the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,
    #[serde(default)]
    pub features: VmFeatures,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,
}

impl VmConfig {
    /// Whether the machine uses the pod network instead of a VM network
    pub fn is_pod_network(&self) -> bool {
        self.network_type == NETWORK_TYPE_POD
    }

    /// Validate raw flag values and normalize them
    pub fn from_raw(raw: RawMachineConfig) -> Result<Self> {
        if raw.machine_name.is_empty() {
            return Err(Error::validation("machine name is required"));
        }
        if raw.cpu_count == 0 {
            return Err(Error::validation_for_field(
                "harvester-cpu-count",
                "cpu count must be positive",
            ));
        }
        if raw.memory_size == 0 {
            return Err(Error::validation_for_field(
                "harvester-memory-size",
                "memory size must be positive",
            ));
        }
        if raw.enable_secure_boot && !raw.enable_efi {
            return Err(Error::validation_for_field(
                "harvester-enable-secure-boot",
                "enable secure boot requires enable EFI",
            ));
        }
        if !raw.key_pair_name.is_empty() && raw.ssh_private_key_path.is_empty() {
            return Err(Error::validation_for_field(
                "harvester-ssh-private-key-path",
                "must specify the ssh private key path of the harvester key pair",
            ));
        }

        let pod_network = raw.network_type == NETWORK_TYPE_POD;
        let disks = normalize_disks(&raw)?;
        let interfaces = normalize_interfaces(&raw, pod_network)?;
        let vgpus = parse_vgpu_info(&raw.vgpu_info)?;

        let network_data = decode_base64_or_plain(&raw.network_data);
        validate_network_data(&network_data)?;

        let extra_labels = parse_labels(&raw.vm_labels)?;

        Ok(Self {
            namespace: non_empty(&raw.namespace).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            cpu: raw.cpu_count,
            memory_gib: raw.memory_size,
            disks,
            interfaces,
            vgpus,
            ssh: SshConfig {
                user: non_empty(&raw.ssh_user).unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
                port: raw.ssh_port,
                password: non_empty(&raw.ssh_password),
                key_pair_name: non_empty(&raw.key_pair_name),
                private_key_path: non_empty(&raw.ssh_private_key_path).map(PathBuf::from),
                add_user_to_docker_group: raw.add_user_to_docker_group,
            },
            cloud_config_path: non_empty(&raw.cloud_config).map(PathBuf::from),
            user_data: decode_base64_or_plain(&raw.user_data),
            network_data,
            affinity: non_empty(&decode_base64_or_plain(&raw.vm_affinity)),
            features: VmFeatures {
                efi: raw.enable_efi,
                secure_boot: raw.enable_secure_boot,
                cpu_pinning: raw.cpu_pinning,
                isolate_emulator_thread: raw.isolate_emulator_thread,
                tpm: raw.enable_tpm,
                cpu_model: non_empty(&raw.cpu_model),
            },
            reserved_memory: non_empty(&raw.reserved_memory),
            cluster_name: non_empty(&raw.cluster_name),
            extra_labels,
            network_type: raw.network_type,
            machine_name: raw.machine_name,
        })
    }
}

/// Flag values as supplied on the command line or environment
#[derive(Clone, Debug, Default)]
pub struct RawMachineConfig {
    pub machine_name: String,
    pub namespace: String,
    pub cpu_count: u32,
    pub memory_size: u32,
    pub disk_size: i64,
    pub disk_bus: String,
    pub image_name: String,
    pub disk_info: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_password: String,
    pub key_pair_name: String,
    pub ssh_private_key_path: String,
    pub add_user_to_docker_group: bool,
    pub network_type: String,
    pub network_name: String,
    pub network_model: String,
    pub network_info: String,
    pub cloud_config: String,
    pub user_data: String,
    pub network_data: String,
    pub vm_affinity: String,
    pub enable_efi: bool,
    pub enable_secure_boot: bool,
    pub vgpu_info: String,
    pub cpu_pinning: bool,
    pub isolate_emulator_thread: bool,
    pub enable_tpm: bool,
    pub cpu_model: String,
    pub reserved_memory: String,
    pub cluster_name: String,
    pub vm_labels: String,
}

fn normalize_disks(raw: &RawMachineConfig) -> Result<Vec<DiskSpec>> {
    if raw.disk_info.is_empty() {
        if raw.image_name.is_empty() {
            return Err(Error::validation_for_field(
                "harvester-image-name",
                "must specify harvester image name",
            ));
        }
        return Ok(vec![DiskSpec {
            image: Some(raw.image_name.clone()),
            storage_class: None,
            size_gib: positive_size(raw.disk_size, "harvester-disk-size").map_err(|_| {
                Error::validation_for_field(
                    "harvester-disk-size",
                    "must specify harvester disk size",
                )
            })?,
            boot_order: 1,
            bus: non_empty(&raw.disk_bus).unwrap_or_else(|| DEFAULT_DISK_BUS.to_string()),
            kind: DiskKind::Disk,
            hot_pluggable: false,
        }]);
    }

    let info: DiskInfo = serde_json::from_str(&raw.disk_info).map_err(|e| {
        Error::validation_for_field("harvester-disk-info", format!("invalid disk info: {e}"))
    })?;

    info.disks
        .into_iter()
        .map(|disk| {
            if disk.image_name.is_empty() && disk.storage_class_name.is_empty() {
                return Err(Error::validation_for_field(
                    "harvester-disk-info",
                    "must specify image name or storageClass name in harvester disk info",
                ));
            }
            Ok(DiskSpec {
                size_gib: positive_size(disk.size, "harvester-disk-info")?,
                kind: DiskKind::from_wire(&disk.disk_type)?,
                image: non_empty(&disk.image_name),
                storage_class: non_empty(&disk.storage_class_name),
                boot_order: disk.boot_order,
                bus: non_empty(&disk.bus).unwrap_or_else(|| DEFAULT_DISK_BUS.to_string()),
                hot_pluggable: disk.hot_plug_able,
            })
        })
        .collect()
}

fn normalize_interfaces(
    raw: &RawMachineConfig,
    pod_network: bool,
) -> Result<Vec<NetworkInterfaceSpec>> {
    if raw.network_info.is_empty() {
        if raw.network_name.is_empty() && !pod_network {
            return Err(Error::validation_for_field(
                "harvester-network-name",
                "must specify harvester network name",
            ));
        }
        return Ok(vec![NetworkInterfaceSpec {
            network: non_empty(&raw.network_name),
            mac_address: None,
            model: non_empty(&raw.network_model)
                .unwrap_or_else(|| DEFAULT_NETWORK_MODEL.to_string()),
            binding: InterfaceBinding::from_wire("", raw.network_name.is_empty())?,
        }]);
    }

    let info: NetworkInfo = serde_json::from_str(&raw.network_info).map_err(|e| {
        Error::validation_for_field(
            "harvester-network-info",
            format!("invalid network info: {e}"),
        )
    })?;

    info.interfaces
        .into_iter()
        .map(|nic| {
            if nic.network_name.is_empty() && !pod_network {
                return Err(Error::validation_for_field(
                    "harvester-network-info",
                    "must specify network name in harvester network info",
                ));
            }
            Ok(NetworkInterfaceSpec {
                binding: InterfaceBinding::from_wire(
                    &nic.interface_type,
                    nic.network_name.is_empty(),
                )?,
                network: non_empty(&nic.network_name),
                mac_address: non_empty(&nic.mac_address),
                model: non_empty(&nic.model).unwrap_or_else(|| DEFAULT_NETWORK_MODEL.to_string()),
            })
        })
        .collect()
}

fn parse_vgpu_info(vgpu_info: &str) -> Result<Vec<VGpuRequest>> {
    if vgpu_info.is_empty() {
        return Ok(Vec::new());
    }
    let info: VGpuInfo = serde_json::from_str(vgpu_info).map_err(|e| {
        Error::validation_for_field(
            "harvester-vgpu-info",
            format!("error unmarshalling vgpuInfo string: {e}"),
        )
    })?;
    Ok(info.vgpu_requests)
}

fn positive_size(size: i64, field: &str) -> Result<u32> {
    u32::try_from(size)
        .ok()
        .filter(|s| *s > 0)
        .ok_or_else(|| {
            Error::validation_for_field(field, "must specify disk size in harvester disk info")
        })
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Decode base64 text, falling back to the input when it is not base64 of a
/// UTF-8 string.
pub fn decode_base64_or_plain(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    STANDARD
        .decode(value)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| value.to_string())
}
