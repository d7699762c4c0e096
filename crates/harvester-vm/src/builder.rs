//! VirtualMachine compilation
//!
//! The VM is assembled by a sequence of `with_*` steps. Each step takes the
//! VM by value and returns it, so every step can be tested on its own and no
//! partially built state is shared. [`build_vm`] runs the full sequence.
//!
//! Image lookups happen before compilation: callers pass [`ResolvedDisk`]s
//! that already carry the image's backing storage class.

use std::collections::BTreeMap;

use harvester_common::crd::{
    Bootloader, CloudInitNoCloudSource, Cpu, Disk, DiskTarget, Efi, EmptyObject, FeatureState,
    Features, Firmware, Gpu, Interface, MultusNetwork, Network,
    PersistentVolumeClaimVolumeSource, Tpm, VirtualMachine, VirtualMachineInstanceTemplateSpec,
    VirtualMachineSpec, Volume, EVICTION_STRATEGY_LIVE_MIGRATE, RUN_STRATEGY_RERUN_ON_FAILURE,
};
use harvester_common::{Error, Result, DRIVER_CREATOR};
use k8s_openapi::api::core::v1::{
    Affinity, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodAffinityTerm,
    VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use rand::Rng;
use tracing::debug;

use crate::config::{
    DiskKind, DiskSpec, InterfaceBinding, NetworkInterfaceSpec, VGpuRequest, VmConfig, VmFeatures,
};
use crate::labels::{
    format_label_value, machine_set_label, node_pool_name, CLUSTER_NAME_LABEL,
    MACHINE_SET_NAME_LABEL, POOL_NAME_LABEL,
};

/// Label naming the tool that created the VM
pub const CREATOR_LABEL: &str = "harvesterhci.io/creator";

/// Template label carrying the VM name
pub const VM_NAME_LABEL: &str = "harvesterhci.io/vmName";

/// Template annotation listing key-pair names (JSON)
pub const SSH_NAMES_ANNOTATION: &str = "harvesterhci.io/sshNames";

/// Template annotation listing volume claim names (JSON)
pub const DISK_NAMES_ANNOTATION: &str = "harvesterhci.io/diskNames";

/// VM annotation holding the volume claim templates (JSON)
pub const VOLUME_CLAIM_TEMPLATES_ANNOTATION: &str = "harvesterhci.io/volumeClaimTemplates";

/// Claim annotation naming the source image (`namespace/name`)
pub const IMAGE_ID_ANNOTATION: &str = "harvesterhci.io/imageId";

/// VM annotation with the memory reserved for the hypervisor
pub const RESERVED_MEMORY_ANNOTATION: &str = "harvesterhci.io/reservedMemory";

/// Name of the cloud-init disk and volume
pub const CLOUD_INIT_DISK_NAME: &str = "cloudinitdisk";

/// Topology key for the generated affinity terms
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

const DISK_NAME_PREFIX: &str = "disk";
const INTERFACE_NAME_PREFIX: &str = "nic";
const CLAIM_SUFFIX_LEN: usize = 5;
const CLAIM_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// A disk with its external references resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDisk {
    pub spec: DiskSpec,
    /// `namespace/name` of the source image
    pub image_id: Option<String>,
    /// Storage class of the claim; the image's class for image-backed disks
    pub storage_class: Option<String>,
}

impl ResolvedDisk {
    /// A disk that needs no image lookup
    pub fn blank(spec: DiskSpec) -> Self {
        Self {
            storage_class: spec.storage_class.clone(),
            image_id: None,
            spec,
        }
    }

    /// An image-backed disk whose image lives on `storage_class`
    pub fn from_image(spec: DiskSpec, image_id: String, storage_class: String) -> Self {
        Self {
            spec,
            image_id: Some(image_id),
            storage_class: Some(storage_class),
        }
    }
}

/// Compile the full VM for a machine.
pub fn build_vm<R: Rng>(
    config: &VmConfig,
    disks: &[ResolvedDisk],
    cloud_init: CloudInitNoCloudSource,
    rng: &mut R,
) -> Result<VirtualMachine> {
    let machine_set = machine_set_label(&config.namespace, &config.machine_name);
    debug!(machine = %config.machine_name, machine_set = %machine_set, "Compiling virtual machine");

    let vm = new_vm(&config.machine_name, &config.namespace);
    let vm = with_resources(vm, config.cpu, config.memory_gib);
    let vm = with_cloud_init(vm, cloud_init);
    let vm = with_labels(vm, &grouping_labels(config, &machine_set));
    let vm = with_labels(vm, &config.extra_labels);
    let vm = match &config.reserved_memory {
        Some(reserved) => with_annotation(vm, RESERVED_MEMORY_ANNOTATION, reserved),
        None => vm,
    };
    let vm = with_affinity(vm, config.affinity.as_deref(), &machine_set)?;
    let key_pairs: Vec<String> = config.ssh.key_pair_name.iter().cloned().collect();
    let vm = with_ssh_names(vm, &key_pairs)?;
    let vm = with_interfaces(vm, &config.interfaces);
    let vm = with_vgpus(vm, &config.vgpus);
    let vm = with_disks(vm, disks, rng)?;
    Ok(with_features(vm, &config.features))
}

/// Machine-set, cluster and pool labels for a machine
pub fn grouping_labels(config: &VmConfig, machine_set: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(
        MACHINE_SET_NAME_LABEL.to_string(),
        machine_set.to_string(),
    )]);
    if let Some(cluster) = &config.cluster_name {
        labels.insert(CLUSTER_NAME_LABEL.to_string(), format_label_value(cluster));
        labels.insert(
            POOL_NAME_LABEL.to_string(),
            format_label_value(&node_pool_name(&config.machine_name, cluster)),
        );
    }
    labels
}

/// Empty VM with identity, creator labels and run policy
pub fn new_vm(name: &str, namespace: &str) -> VirtualMachine {
    let creator = BTreeMap::from([(CREATOR_LABEL.to_string(), DRIVER_CREATOR.to_string())]);
    let mut template_labels = creator.clone();
    template_labels.insert(VM_NAME_LABEL.to_string(), name.to_string());

    let mut vm = VirtualMachine::new(
        name,
        VirtualMachineSpec {
            run_strategy: Some(RUN_STRATEGY_RERUN_ON_FAILURE.to_string()),
            template: VirtualMachineInstanceTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    ..Default::default()
                }),
                ..Default::default()
            },
        },
    );
    vm.metadata.namespace = Some(namespace.to_string());
    vm.metadata.labels = Some(creator);
    vm.spec.template.spec.eviction_strategy = Some(EVICTION_STRATEGY_LIVE_MIGRATE.to_string());
    vm
}

/// CPU topology and resource limits
pub fn with_resources(mut vm: VirtualMachine, cpu: u32, memory_gib: u32) -> VirtualMachine {
    let domain = &mut vm.spec.template.spec.domain;
    domain.cpu = Some(Cpu {
        cores: cpu,
        sockets: 1,
        threads: 1,
        ..Default::default()
    });
    domain
        .resources
        .limits
        .insert("cpu".to_string(), Quantity(cpu.to_string()));
    domain
        .resources
        .limits
        .insert("memory".to_string(), Quantity(format!("{memory_gib}Gi")));
    vm
}

/// Attach the NoCloud cloud-init disk
pub fn with_cloud_init(mut vm: VirtualMachine, source: CloudInitNoCloudSource) -> VirtualMachine {
    let spec = &mut vm.spec.template.spec;
    spec.domain.devices.disks.push(Disk {
        name: CLOUD_INIT_DISK_NAME.to_string(),
        disk: Some(DiskTarget {
            bus: "virtio".to_string(),
        }),
        ..Default::default()
    });
    spec.volumes.push(Volume {
        name: CLOUD_INIT_DISK_NAME.to_string(),
        cloud_init_no_cloud: Some(source),
        ..Default::default()
    });
    vm
}

/// Add labels to the VM and its instance template
pub fn with_labels(mut vm: VirtualMachine, labels: &BTreeMap<String, String>) -> VirtualMachine {
    if labels.is_empty() {
        return vm;
    }
    vm.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.clone());
    template_metadata(&mut vm)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.clone());
    vm
}

/// Add an annotation to the VM object
pub fn with_annotation(mut vm: VirtualMachine, key: &str, value: &str) -> VirtualMachine {
    vm.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    vm
}

fn with_template_annotation(mut vm: VirtualMachine, key: &str, value: String) -> VirtualMachine {
    template_metadata(&mut vm)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value);
    vm
}

fn template_metadata(vm: &mut VirtualMachine) -> &mut ObjectMeta {
    vm.spec
        .template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
}

/// Apply user affinity, extended with soft terms on the machine-set label.
///
/// The extra weight-1 term is appended to the preferred lists of whichever
/// of pod affinity and pod anti-affinity the user declared; undeclared
/// sections stay absent. Without user affinity the VM gets none.
pub fn with_affinity(
    mut vm: VirtualMachine,
    affinity_json: Option<&str>,
    machine_set: &str,
) -> Result<VirtualMachine> {
    let Some(affinity_json) = affinity_json.filter(|a| !a.trim().is_empty()) else {
        return Ok(vm);
    };
    let mut affinity: Affinity = serde_json::from_str(affinity_json).map_err(|e| {
        Error::validation_for_field("harvester-vm-affinity", format!("invalid affinity: {e}"))
    })?;

    let term = WeightedPodAffinityTerm {
        weight: 1,
        pod_affinity_term: PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    MACHINE_SET_NAME_LABEL.to_string(),
                    machine_set.to_string(),
                )])),
                ..Default::default()
            }),
            topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
            ..Default::default()
        },
    };
    if let Some(pod_affinity) = affinity.pod_affinity.as_mut() {
        pod_affinity
            .preferred_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new)
            .push(term.clone());
    }
    if let Some(anti_affinity) = affinity.pod_anti_affinity.as_mut() {
        anti_affinity
            .preferred_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new)
            .push(term);
    }

    vm.spec.template.spec.affinity = Some(affinity);
    Ok(vm)
}

/// Record the key pairs injected into the guest
pub fn with_ssh_names(vm: VirtualMachine, key_pairs: &[String]) -> Result<VirtualMachine> {
    let names = serde_json::to_string(key_pairs)?;
    Ok(with_template_annotation(vm, SSH_NAMES_ANNOTATION, names))
}

/// Attach network interfaces as `nic-<index>`
pub fn with_interfaces(
    mut vm: VirtualMachine,
    interfaces: &[NetworkInterfaceSpec],
) -> VirtualMachine {
    let spec = &mut vm.spec.template.spec;
    for (index, nic) in interfaces.iter().enumerate() {
        let name = format!("{INTERFACE_NAME_PREFIX}-{index}");
        let (bridge, masquerade) = match nic.binding {
            InterfaceBinding::Bridge => (Some(EmptyObject::default()), None),
            InterfaceBinding::Masquerade => (None, Some(EmptyObject::default())),
        };
        spec.domain.devices.interfaces.push(Interface {
            name: name.clone(),
            model: Some(nic.model.clone()),
            mac_address: nic.mac_address.clone(),
            bridge,
            masquerade,
        });
        spec.networks.push(match &nic.network {
            Some(network) => Network {
                name,
                multus: Some(MultusNetwork {
                    network_name: network.clone(),
                }),
                ..Default::default()
            },
            None => Network {
                name,
                pod: Some(EmptyObject::default()),
                ..Default::default()
            },
        });
    }
    vm
}

/// Pass through one vGPU per request
pub fn with_vgpus(mut vm: VirtualMachine, vgpus: &[VGpuRequest]) -> VirtualMachine {
    vm.spec
        .template
        .spec
        .domain
        .devices
        .gpus
        .extend(vgpus.iter().map(|v| Gpu {
            name: v.name.clone(),
            device_name: v.device_name.clone(),
        }));
    vm
}

/// Attach disks as `disk-<index>`, each backed by a new volume claim.
///
/// Claims are described in the volume-claim-templates annotation; Harvester
/// creates them from there. Claim names get a random suffix.
pub fn with_disks<R: Rng>(
    mut vm: VirtualMachine,
    disks: &[ResolvedDisk],
    rng: &mut R,
) -> Result<VirtualMachine> {
    let vm_name = vm.metadata.name.clone().unwrap_or_default();
    let mut claims = Vec::with_capacity(disks.len());
    let mut claim_names = Vec::with_capacity(disks.len());

    for (index, disk) in disks.iter().enumerate() {
        let disk_name = format!("{DISK_NAME_PREFIX}-{index}");
        let claim_name = format!("{vm_name}-{disk_name}-{}", claim_suffix(rng));

        let target = Some(DiskTarget {
            bus: disk.spec.bus.clone(),
        });
        let (disk_target, cdrom_target) = match disk.spec.kind {
            DiskKind::Disk => (target, None),
            DiskKind::CdRom => (None, target),
        };
        let spec = &mut vm.spec.template.spec;
        spec.domain.devices.disks.push(Disk {
            name: disk_name.clone(),
            disk: disk_target,
            cdrom: cdrom_target,
            boot_order: (disk.spec.boot_order > 0).then_some(disk.spec.boot_order),
        });
        spec.volumes.push(Volume {
            name: disk_name,
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.clone(),
                hotpluggable: disk.spec.hot_pluggable,
            }),
            ..Default::default()
        });

        claims.push(volume_claim(&claim_name, disk));
        claim_names.push(claim_name);
    }

    let claims = serde_json::to_string(&claims)?;
    let names = serde_json::to_string(&claim_names)?;
    let vm = with_annotation(vm, VOLUME_CLAIM_TEMPLATES_ANNOTATION, &claims);
    Ok(with_template_annotation(vm, DISK_NAMES_ANNOTATION, names))
}

fn volume_claim(claim_name: &str, disk: &ResolvedDisk) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name.to_string()),
            annotations: disk
                .image_id
                .as_ref()
                .map(|id| BTreeMap::from([(IMAGE_ID_ANNOTATION.to_string(), id.clone())])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            volume_mode: Some("Block".to_string()),
            storage_class_name: disk.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format!("{}Gi", disk.spec.size_gib)),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn claim_suffix<R: Rng>(rng: &mut R) -> String {
    (0..CLAIM_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CLAIM_SUFFIX_ALPHABET.len());
            char::from(CLAIM_SUFFIX_ALPHABET[idx])
        })
        .collect()
}

/// Firmware, CPU placement and TPM toggles
pub fn with_features(mut vm: VirtualMachine, features: &VmFeatures) -> VirtualMachine {
    let domain = &mut vm.spec.template.spec.domain;
    if features.efi {
        domain.features.get_or_insert_with(Features::default).smm = Some(FeatureState {
            enabled: Some(features.secure_boot),
        });
        domain.firmware = Some(Firmware {
            bootloader: Some(Bootloader {
                efi: Some(Efi {
                    secure_boot: Some(features.secure_boot),
                }),
            }),
        });
    }
    let cpu = domain.cpu.get_or_insert_with(Cpu::default);
    cpu.dedicated_cpu_placement = features.cpu_pinning;
    cpu.isolate_emulator_thread = features.isolate_emulator_thread;
    if let Some(model) = &features.cpu_model {
        cpu.model = Some(model.clone());
    }
    if features.tpm {
        domain.devices.tpm = Some(Tpm {});
    }
    vm
}
