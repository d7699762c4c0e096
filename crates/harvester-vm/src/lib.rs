//! Machine configuration and VirtualMachine compilation for the Harvester driver
//!
//! Turns validated machine flags into cloud-init documents and a KubeVirt
//! VirtualMachine. Pure compilation crate: no API calls, no file I/O.

pub mod builder;
pub mod cloudinit;
pub mod config;
pub mod labels;
pub mod network_data;

pub use builder::{build_vm, ResolvedDisk};
pub use cloudinit::{
    cloud_init_secret_name, compose, place, set_secret_owner, CloudInitDocuments,
    CloudInitPlacement, Credentials,
};
pub use config::{
    decode_base64_or_plain, DiskKind, DiskSpec, InterfaceBinding, NetworkInterfaceSpec,
    RawMachineConfig, SshConfig, VGpuRequest, VmConfig, VmFeatures,
};
pub use labels::{format_label_value, machine_set_label, parse_labels};
pub use network_data::validate_network_data;
