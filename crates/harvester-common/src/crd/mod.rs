//! Typed resources for KubeVirt, Harvester and Multus
//!
//! These are shared by both API generations: the native cluster API returns
//! them through `kube::Api`, and the legacy REST API returns the same JSON.

mod harvester;
mod kubevirt;

pub use harvester::{
    KeyPair, KeyPairCondition, KeyPairSpec, KeyPairStatus, NetworkAttachmentDefinition,
    NetworkAttachmentDefinitionSpec, Setting, VirtualMachineImage, VirtualMachineImageSpec,
    VirtualMachineImageStatus, HARVESTER_GROUP, HARVESTER_VERSION, KEY_PAIR_VALIDATED,
};
pub use kubevirt::{
    Bootloader, CloudInitNoCloudSource, Cpu, Devices, Disk, DiskTarget, DomainSpec, Efi,
    EmptyObject, FeatureState, Features, Firmware, Gpu, InstanceInterface, Interface,
    MultusNetwork, Network, PersistentVolumeClaimVolumeSource, ResourceRequirements,
    SecretReference, Tpm, VirtualMachine, VirtualMachineInstance,
    VirtualMachineInstanceResourceSpec, VirtualMachineInstanceSpec, VirtualMachineInstanceStatus,
    VirtualMachineInstanceTemplateSpec, VirtualMachineSpec, VirtualMachineStatus, Volume,
    EVICTION_STRATEGY_LIVE_MIGRATE, KUBEVIRT_GROUP, KUBEVIRT_SUBRESOURCE_GROUP, KUBEVIRT_VERSION,
    RUN_STRATEGY_RERUN_ON_FAILURE,
};
