//! Command-line and environment surface
//!
//! Every machine flag can also be set through its `HARVESTER_*` environment
//! variable. String values that carry documents (kubeconfig, user data,
//! network data, affinity) may be base64 encoded.

use clap::Args;
use harvester_common::DEFAULT_NAMESPACE;
use harvester_vm::config::{
    DEFAULT_CPU_COUNT, DEFAULT_MEMORY_GIB, DEFAULT_SSH_PORT, DEFAULT_SSH_USER,
};
use harvester_vm::{decode_base64_or_plain, RawMachineConfig};

use crate::config::ConnectionConfig;

/// How to reach Harvester
#[derive(Args, Clone, Debug, Default)]
pub struct ConnectionArgs {
    /// Kubeconfig of the Harvester cluster, raw or base64
    #[arg(long = "harvester-kubeconfig-content", env = "HARVESTER_KUBECONFIG_CONTENT")]
    pub kubeconfig_content: Option<String>,

    #[arg(long = "harvester-cluster-type", env = "HARVESTER_CLUSTER_TYPE")]
    pub cluster_type: Option<String>,

    #[arg(long = "harvester-cluster-id", env = "HARVESTER_CLUSTER_ID")]
    pub cluster_id: Option<String>,

    /// Harvester URL; used with the REST API when no kubeconfig is given
    #[arg(long = "harvester-endpoint", env = "HARVESTER_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long = "harvester-username", env = "HARVESTER_USERNAME")]
    pub username: Option<String>,

    #[arg(long = "harvester-password", env = "HARVESTER_PASSWORD")]
    pub password: Option<String>,

    /// Skip TLS verification of the Harvester endpoint
    #[arg(long = "harvester-insecure-skip-verify", env = "HARVESTER_INSECURE_SKIP_VERIFY")]
    pub insecure_skip_verify: bool,
}

impl ConnectionArgs {
    pub fn into_connection(self) -> ConnectionConfig {
        ConnectionConfig {
            kubeconfig_content: self
                .kubeconfig_content
                .filter(|c| !c.is_empty())
                .map(|c| decode_base64_or_plain(&c)),
            endpoint: self.endpoint.filter(|e| !e.is_empty()),
            username: self.username.filter(|u| !u.is_empty()),
            password: self.password.filter(|p| !p.is_empty()),
            insecure_skip_verify: self.insecure_skip_verify,
            cluster_type: self.cluster_type.filter(|t| !t.is_empty()),
            cluster_id: self.cluster_id.filter(|i| !i.is_empty()),
        }
    }
}

/// Shape of the virtual machine
#[derive(Args, Clone, Debug)]
pub struct VmArgs {
    #[arg(
        long = "harvester-vm-namespace",
        env = "HARVESTER_VM_NAMESPACE",
        default_value = DEFAULT_NAMESPACE
    )]
    pub namespace: String,

    #[arg(
        long = "harvester-cpu-count",
        env = "HARVESTER_CPU_COUNT",
        default_value_t = DEFAULT_CPU_COUNT
    )]
    pub cpu_count: u32,

    /// Memory in GiB
    #[arg(
        long = "harvester-memory-size",
        env = "HARVESTER_MEMORY_SIZE",
        default_value_t = DEFAULT_MEMORY_GIB
    )]
    pub memory_size: u32,

    /// Disk size in GiB (single-disk form)
    #[arg(long = "harvester-disk-size", env = "HARVESTER_DISK_SIZE", default_value_t = 0)]
    pub disk_size: i64,

    #[arg(long = "harvester-disk-bus", env = "HARVESTER_DISK_BUS", default_value = "")]
    pub disk_bus: String,

    #[arg(long = "harvester-image-name", env = "HARVESTER_IMAGE_NAME", default_value = "")]
    pub image_name: String,

    /// Disk list as JSON, replaces the single-disk flags
    #[arg(long = "harvester-disk-info", env = "HARVESTER_DISK_INFO", default_value = "")]
    pub disk_info: String,

    #[arg(
        long = "harvester-ssh-user",
        env = "HARVESTER_SSH_USER",
        default_value = DEFAULT_SSH_USER
    )]
    pub ssh_user: String,

    #[arg(
        long = "harvester-ssh-port",
        env = "HARVESTER_SSH_PORT",
        default_value_t = DEFAULT_SSH_PORT
    )]
    pub ssh_port: u16,

    #[arg(long = "harvester-ssh-password", env = "HARVESTER_SSH_PASSWORD", default_value = "")]
    pub ssh_password: String,

    #[arg(long = "harvester-key-pair-name", env = "HARVESTER_KEY_PAIR_NAME", default_value = "")]
    pub key_pair_name: String,

    #[arg(
        long = "harvester-ssh-private-key-path",
        env = "HARVESTER_SSH_PRIVATE_KEY_PATH",
        default_value = ""
    )]
    pub ssh_private_key_path: String,

    #[arg(long = "harvester-add-user-to-docker-group", env = "HARVESTER_ADD_USER_TO_DOCKER_GROUP")]
    pub add_user_to_docker_group: bool,

    /// `pod` attaches the cluster pod network
    #[arg(long = "harvester-network-type", env = "HARVESTER_NETWORK_TYPE", default_value = "")]
    pub network_type: String,

    #[arg(long = "harvester-network-name", env = "HARVESTER_NETWORK_NAME", default_value = "")]
    pub network_name: String,

    #[arg(long = "harvester-network-model", env = "HARVESTER_NETWORK_MODEL", default_value = "")]
    pub network_model: String,

    /// Interface list as JSON, replaces the single-network flags
    #[arg(long = "harvester-network-info", env = "HARVESTER_NETWORK_INFO", default_value = "")]
    pub network_info: String,

    /// Path of a cloud-config file merged into user data
    #[arg(long = "harvester-cloud-config", env = "HARVESTER_CLOUD_CONFIG", default_value = "")]
    pub cloud_config: String,

    #[arg(long = "harvester-user-data", env = "HARVESTER_USER_DATA", default_value = "")]
    pub user_data: String,

    #[arg(long = "harvester-network-data", env = "HARVESTER_NETWORK_DATA", default_value = "")]
    pub network_data: String,

    /// Affinity as JSON
    #[arg(long = "harvester-vm-affinity", env = "HARVESTER_VM_AFFINITY", default_value = "")]
    pub vm_affinity: String,

    #[arg(long = "harvester-enable-efi", env = "HARVESTER_ENABLE_EFI")]
    pub enable_efi: bool,

    #[arg(long = "harvester-enable-secure-boot", env = "HARVESTER_ENABLE_SECURE_BOOT")]
    pub enable_secure_boot: bool,

    #[arg(long = "harvester-vgpu-info", env = "HARVESTER_VGPU_INFO", default_value = "")]
    pub vgpu_info: String,

    #[arg(long = "harvester-cpu-pinning", env = "HARVESTER_CPU_PINNING")]
    pub cpu_pinning: bool,

    #[arg(long = "harvester-isolate-emulator-thread", env = "HARVESTER_ISOLATE_EMULATOR_THREAD")]
    pub isolate_emulator_thread: bool,

    #[arg(long = "harvester-enable-tpm", env = "HARVESTER_ENABLE_TPM")]
    pub enable_tpm: bool,

    #[arg(long = "harvester-cpu-model", env = "HARVESTER_CPU_MODEL", default_value = "")]
    pub cpu_model: String,

    /// Value of the reserved-memory annotation, e.g. `256Mi`
    #[arg(
        long = "harvester-reserved-memory",
        env = "HARVESTER_RESERVED_MEMORY",
        default_value = ""
    )]
    pub reserved_memory: String,

    /// Cluster the machine belongs to; adds cluster and pool labels
    #[arg(long = "harvester-cluster-name", env = "HARVESTER_CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    /// Extra labels, `k1=v1,k2=v2`
    #[arg(long = "harvester-vm-labels", env = "HARVESTER_VM_LABELS", default_value = "")]
    pub vm_labels: String,
}

impl VmArgs {
    pub fn into_raw(self, machine_name: String) -> RawMachineConfig {
        RawMachineConfig {
            machine_name,
            namespace: self.namespace,
            cpu_count: self.cpu_count,
            memory_size: self.memory_size,
            disk_size: self.disk_size,
            disk_bus: self.disk_bus,
            image_name: self.image_name,
            disk_info: self.disk_info,
            ssh_user: self.ssh_user,
            ssh_port: self.ssh_port,
            ssh_password: self.ssh_password,
            key_pair_name: self.key_pair_name,
            ssh_private_key_path: self.ssh_private_key_path,
            add_user_to_docker_group: self.add_user_to_docker_group,
            network_type: self.network_type,
            network_name: self.network_name,
            network_model: self.network_model,
            network_info: self.network_info,
            cloud_config: self.cloud_config,
            user_data: self.user_data,
            network_data: self.network_data,
            vm_affinity: self.vm_affinity,
            enable_efi: self.enable_efi,
            enable_secure_boot: self.enable_secure_boot,
            vgpu_info: self.vgpu_info,
            cpu_pinning: self.cpu_pinning,
            isolate_emulator_thread: self.isolate_emulator_thread,
            enable_tpm: self.enable_tpm,
            cpu_model: self.cpu_model,
            reserved_memory: self.reserved_memory,
            cluster_name: self.cluster_name,
            vm_labels: self.vm_labels,
        }
    }
}

/// Arguments of `create` and `pre-create-check`
#[derive(Args, Clone, Debug)]
pub struct CreateArgs {
    pub machine_name: String,

    #[command(flatten)]
    pub vm: VmArgs,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments of commands acting on an existing machine
#[derive(Args, Clone, Debug)]
pub struct MachineArgs {
    pub machine_name: String,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::{Cli, Commands};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn create_defaults() {
        let cli = parse(&[
            "docker-machine-driver-harvester",
            "create",
            "node-1",
            "--harvester-image-name",
            "ubuntu",
            "--harvester-disk-size",
            "40",
            "--harvester-network-name",
            "vlan1",
        ]);
        let Commands::Create(args) = cli.command else {
            panic!("expected create");
        };
        let raw = args.vm.into_raw(args.machine_name);
        assert_eq!(raw.machine_name, "node-1");
        assert_eq!(raw.namespace, "default");
        assert_eq!(raw.cpu_count, 2);
        assert_eq!(raw.memory_size, 4);
        assert_eq!(raw.ssh_user, "docker");
        assert_eq!(raw.ssh_port, 22);
        assert_eq!(raw.disk_size, 40);
    }

    #[test]
    fn kubeconfig_content_accepts_base64() {
        let cli = parse(&[
            "docker-machine-driver-harvester",
            "state",
            "node-1",
            "--harvester-kubeconfig-content",
            "YXBpVmVyc2lvbjogdjEK",
        ]);
        let Commands::State(args) = cli.command else {
            panic!("expected state");
        };
        let conn = args.connection.into_connection();
        assert_eq!(conn.kubeconfig_content.as_deref(), Some("apiVersion: v1\n"));
        assert!(!conn.use_rest_api());
    }

    #[test]
    fn endpoint_without_kubeconfig_selects_rest_api() {
        let cli = parse(&[
            "docker-machine-driver-harvester",
            "ip",
            "node-1",
            "--harvester-endpoint",
            "https://harvester.local",
            "--harvester-username",
            "admin",
            "--harvester-password",
            "secret",
        ]);
        let Commands::Ip(args) = cli.command else {
            panic!("expected ip");
        };
        let conn = args.connection.into_connection();
        assert!(conn.use_rest_api());
        assert_eq!(conn.username.as_deref(), Some("admin"));
    }

    #[test]
    fn feature_flags_map_through() {
        let cli = parse(&[
            "docker-machine-driver-harvester",
            "pre-create-check",
            "node-1",
            "--harvester-enable-efi",
            "--harvester-enable-secure-boot",
            "--harvester-enable-tpm",
            "--harvester-vm-labels",
            "team=infra",
            "--harvester-reserved-memory",
            "256Mi",
        ]);
        let Commands::PreCreateCheck(args) = cli.command else {
            panic!("expected pre-create-check");
        };
        let raw = args.vm.into_raw(args.machine_name);
        assert!(raw.enable_efi && raw.enable_secure_boot && raw.enable_tpm);
        assert_eq!(raw.vm_labels, "team=infra");
        assert_eq!(raw.reserved_memory, "256Mi");
    }
}
