//! Cloud-init user-data and network-data composition
//!
//! User data is assembled from credential blocks, the cloud-config file and
//! the inline user-data override, in that order, using append-slice deep
//! merge: nested mappings merge, later scalars win, and lists concatenate
//! with the later source's items first.
//! Network data is passed through untouched.
//!
//! Payloads over [`INLINE_PAYLOAD_LIMIT`] bytes move into a side secret that
//! the VM references by name. The secret can only be owner-referenced once the
//! VM exists, so it is returned separately for the caller to create afterwards.

use std::collections::BTreeMap;

use harvester_common::crd::{
    CloudInitNoCloudSource, SecretReference, VirtualMachine, KUBEVIRT_GROUP, KUBEVIRT_VERSION,
};
use harvester_common::yaml::{merge_append, parse_yaml_mapping, to_yaml};
use harvester_common::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use serde_json::{json, Map, Value};

use crate::config::VmConfig;

/// First line of every user-data document
pub const USER_DATA_HEADER: &str = "#cloud-config";

/// Marker line that must stay above the header when present
pub const JINJA_TEMPLATE_MARKER: &str = "## template: jinja";

/// Largest payload kept inline in the VM spec
pub const INLINE_PAYLOAD_LIMIT: usize = 2048;

/// Secret key holding externalized user data
pub const USER_DATA_SECRET_KEY: &str = "userdata";

/// Secret key holding externalized network data
pub const NETWORK_DATA_SECRET_KEY: &str = "networkdata";

/// Credentials rendered into the user-data document
#[derive(Clone, Debug, Default)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: Option<&'a str>,
    pub public_key: Option<&'a str>,
    pub add_user_to_docker_group: bool,
    /// Install the guest agent so the platform can report guest addresses
    pub install_guest_agent: bool,
}

impl<'a> Credentials<'a> {
    pub fn from_config(config: &'a VmConfig, public_key: Option<&'a str>) -> Self {
        Self {
            user: &config.ssh.user,
            password: config.ssh.password.as_deref(),
            public_key: public_key.filter(|k| !k.trim().is_empty()),
            add_user_to_docker_group: config.ssh.add_user_to_docker_group,
            install_guest_agent: !config.is_pod_network(),
        }
    }

    fn blocks(&self) -> Vec<Value> {
        let mut blocks = Vec::new();
        if self.install_guest_agent {
            blocks.push(json!({
                "package_update": true,
                "packages": ["qemu-guest-agent"],
                "runcmd": [["systemctl", "enable", "--now", "qemu-guest-agent"]],
            }));
        }
        if let Some(password) = self.password {
            blocks.push(json!({
                "user": self.user,
                "password": password,
                "chpasswd": {"expire": false},
                "ssh_pwauth": true,
            }));
        }
        if let Some(key) = self.public_key {
            let key = key.trim_end();
            if self.add_user_to_docker_group {
                blocks.push(json!({
                    "groups": ["docker"],
                    "users": [{
                        "name": self.user,
                        "sudo": "ALL=(ALL) NOPASSWD:ALL",
                        "groups": "sudo, docker",
                        "shell": "/bin/bash",
                        "ssh_authorized_keys": [key],
                    }],
                }));
            } else {
                blocks.push(json!({"ssh_authorized_keys": [key]}));
            }
        }
        blocks
    }
}

/// Composed user-data and network-data pair
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudInitDocuments {
    pub user_data: String,
    pub network_data: String,
}

/// Compose both documents for a machine.
///
/// `cloud_config` is the content of the cloud-config file, if one is
/// configured.
pub fn compose(
    config: &VmConfig,
    public_key: Option<&str>,
    cloud_config: Option<&str>,
) -> Result<CloudInitDocuments> {
    let credentials = Credentials::from_config(config, public_key);
    Ok(CloudInitDocuments {
        user_data: compose_user_data(&credentials, cloud_config, &config.user_data)?,
        network_data: config.network_data.clone(),
    })
}

/// Merge credential blocks, cloud-config file and override into one document
pub fn compose_user_data(
    credentials: &Credentials<'_>,
    cloud_config: Option<&str>,
    user_data_override: &str,
) -> Result<String> {
    let mut merged = Value::Object(Map::new());
    for block in credentials.blocks() {
        merge_append(&mut merged, block);
    }
    if let Some(content) = cloud_config {
        merge_append(&mut merged, parse_cloud_config(content, "harvester-cloud-config")?);
    }
    merge_append(
        &mut merged,
        parse_cloud_config(user_data_override, "harvester-user-data")?,
    );

    let body = match &merged {
        Value::Object(map) if map.is_empty() => String::new(),
        value => to_yaml(value)?,
    };

    let mut document = String::new();
    if starts_with_jinja_marker(user_data_override) {
        document.push_str(JINJA_TEMPLATE_MARKER);
        document.push('\n');
    }
    document.push_str(USER_DATA_HEADER);
    document.push('\n');
    document.push_str(&body);
    Ok(document)
}

fn parse_cloud_config(content: &str, field: &str) -> Result<Value> {
    parse_yaml_mapping(content)
        .map(Value::Object)
        .map_err(|e| Error::validation_for_field(field, format!("invalid cloud-config: {e}")))
}

fn starts_with_jinja_marker(text: &str) -> bool {
    text.lines()
        .next()
        .is_some_and(|line| line.trim_end() == JINJA_TEMPLATE_MARKER)
}

/// Where the documents end up: inline in the VM, or in a side secret
#[derive(Clone, Debug, PartialEq)]
pub struct CloudInitPlacement {
    /// NoCloud volume source for the VM spec
    pub source: CloudInitNoCloudSource,
    /// Side secret, present only when something was externalized
    pub secret: Option<Secret>,
}

/// Name of the side secret for a machine
pub fn cloud_init_secret_name(machine_name: &str) -> String {
    format!("{machine_name}-cloudinit")
}

/// Decide inline vs. externalized placement for the composed documents.
///
/// Network data follows the user-data size decision: it is externalized when
/// the *user data* exceeds the limit, whatever its own length.
pub fn place(
    machine_name: &str,
    namespace: &str,
    documents: &CloudInitDocuments,
) -> CloudInitPlacement {
    let secret_name = cloud_init_secret_name(machine_name);
    let externalize = documents.user_data.len() > INLINE_PAYLOAD_LIMIT;
    let mut source = CloudInitNoCloudSource::default();
    let mut data = BTreeMap::new();

    if externalize {
        data.insert(
            USER_DATA_SECRET_KEY.to_string(),
            ByteString(documents.user_data.as_bytes().to_vec()),
        );
        source.secret_ref = Some(SecretReference {
            name: secret_name.clone(),
        });
    } else {
        source.user_data = Some(documents.user_data.clone());
    }

    if !documents.network_data.is_empty() {
        if externalize {
            data.insert(
                NETWORK_DATA_SECRET_KEY.to_string(),
                ByteString(documents.network_data.as_bytes().to_vec()),
            );
            source.network_data_secret_ref = Some(SecretReference {
                name: secret_name.clone(),
            });
        } else {
            source.network_data = Some(documents.network_data.clone());
        }
    }

    let secret = (!data.is_empty()).then(|| Secret {
        metadata: ObjectMeta {
            name: Some(secret_name),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    });

    CloudInitPlacement { source, secret }
}

/// Tie the side secret to the created VM so it is garbage-collected with it
pub fn set_secret_owner(secret: &mut Secret, vm: &VirtualMachine) {
    secret.metadata.owner_references = Some(vec![OwnerReference {
        api_version: format!("{KUBEVIRT_GROUP}/{KUBEVIRT_VERSION}"),
        kind: "VirtualMachine".to_string(),
        name: vm.metadata.name.clone().unwrap_or_default(),
        uid: vm.metadata.uid.clone().unwrap_or_default(),
        ..Default::default()
    }]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_common::crd::VirtualMachineSpec;

    const RKE2_CLOUD_CONFIG: &str = "runcmd:\n- sh /usr/local/custom_script/install.sh\n";

    fn bare() -> Credentials<'static> {
        Credentials {
            user: "ubuntu",
            ..Default::default()
        }
    }

    #[test]
    fn empty_inputs_yield_header_only() {
        assert_eq!(compose_user_data(&bare(), None, "").unwrap(), "#cloud-config\n");
        assert_eq!(
            compose_user_data(&bare(), Some(""), "").unwrap(),
            "#cloud-config\n"
        );
    }

    #[test]
    fn cloud_config_file_passes_through() {
        assert_eq!(
            compose_user_data(&bare(), Some(RKE2_CLOUD_CONFIG), "").unwrap(),
            format!("#cloud-config\n{RKE2_CLOUD_CONFIG}")
        );
    }

    #[test]
    fn override_list_items_come_before_file_items() {
        let user_data = "#cloud-config\npackage_update: true\npackages:\n- qemu-guest-agent\nruncmd:\n- - systemctl\n- - enable\n- - --now\n- - qemu-guest-agent.service\n";
        let merged = compose_user_data(&bare(), Some(RKE2_CLOUD_CONFIG), user_data).unwrap();
        assert_eq!(
            merged,
            "#cloud-config\npackage_update: true\npackages:\n- qemu-guest-agent\nruncmd:\n- - systemctl\n- - enable\n- - --now\n- - qemu-guest-agent.service\n- sh /usr/local/custom_script/install.sh\n"
        );
    }

    #[test]
    fn override_scalars_win() {
        let merged = compose_user_data(
            &bare(),
            Some("hostname: from-file\nmanage_etc_hosts: true\n"),
            "hostname: from-override\n",
        )
        .unwrap();
        assert_eq!(
            merged,
            "#cloud-config\nhostname: from-override\nmanage_etc_hosts: true\n"
        );
    }

    #[test]
    fn jinja_marker_is_hoisted_above_header() {
        let merged = compose_user_data(
            &bare(),
            None,
            "## template: jinja\n#cloud-config\nhostname: '{{ v1.local_hostname }}'\n",
        )
        .unwrap();
        assert!(merged.starts_with("## template: jinja\n#cloud-config\n"));
        let parsed = harvester_common::yaml::parse_yaml(&merged).unwrap();
        assert_eq!(parsed["hostname"], "{{ v1.local_hostname }}");
    }

    #[test]
    fn password_and_key_blocks() {
        let credentials = Credentials {
            user: "ubuntu",
            password: Some("s3cret"),
            public_key: Some("ssh-rsa AAAA test\n"),
            ..Default::default()
        };
        let doc = compose_user_data(&credentials, None, "").unwrap();
        assert_eq!(
            doc,
            "#cloud-config\nchpasswd:\n  expire: false\npassword: s3cret\nssh_authorized_keys:\n- ssh-rsa AAAA test\nssh_pwauth: true\nuser: ubuntu\n"
        );
    }

    #[test]
    fn docker_group_user_block() {
        let credentials = Credentials {
            user: "rancher",
            public_key: Some("ssh-rsa AAAA test"),
            add_user_to_docker_group: true,
            ..Default::default()
        };
        let parsed = harvester_common::yaml::parse_yaml(
            &compose_user_data(&credentials, None, "").unwrap(),
        )
        .unwrap();
        assert_eq!(parsed["groups"], json!(["docker"]));
        assert_eq!(parsed["users"][0]["name"], "rancher");
        assert_eq!(parsed["users"][0]["groups"], "sudo, docker");
        assert_eq!(parsed["users"][0]["ssh_authorized_keys"], json!(["ssh-rsa AAAA test"]));
        assert!(parsed.get("ssh_authorized_keys").is_none());
    }

    #[test]
    fn guest_agent_runcmd_merges_with_file() {
        let credentials = Credentials {
            install_guest_agent: true,
            ..bare()
        };
        let parsed = harvester_common::yaml::parse_yaml(
            &compose_user_data(&credentials, Some(RKE2_CLOUD_CONFIG), "").unwrap(),
        )
        .unwrap();
        assert_eq!(
            parsed["runcmd"],
            json!([
                "sh /usr/local/custom_script/install.sh",
                ["systemctl", "enable", "--now", "qemu-guest-agent"]
            ])
        );
        assert_eq!(parsed["packages"], json!(["qemu-guest-agent"]));
    }

    #[test]
    fn invalid_override_is_rejected() {
        let err = compose_user_data(&bare(), None, "- not\n- a mapping\n").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    fn documents(user_len: usize, network_data: &str) -> CloudInitDocuments {
        CloudInitDocuments {
            user_data: "x".repeat(user_len),
            network_data: network_data.to_string(),
        }
    }

    #[test]
    fn small_documents_stay_inline() {
        let placement = place(
            "node-1",
            "default",
            &documents(INLINE_PAYLOAD_LIMIT, "version: 2\n"),
        );
        assert!(placement.secret.is_none());
        assert_eq!(placement.source.user_data.as_ref().map(String::len), Some(2048));
        assert_eq!(placement.source.network_data.as_deref(), Some("version: 2\n"));
        assert!(placement.source.secret_ref.is_none());
    }

    #[test]
    fn large_user_data_moves_to_secret() {
        let placement = place("node-1", "fleet", &documents(INLINE_PAYLOAD_LIMIT + 1, ""));
        let secret = placement.secret.unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("node-1-cloudinit"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("fleet"));
        let data = secret.data.unwrap();
        assert_eq!(data[USER_DATA_SECRET_KEY].0.len(), 2049);
        assert!(!data.contains_key(NETWORK_DATA_SECRET_KEY));
        assert!(placement.source.user_data.is_none());
        assert_eq!(
            placement.source.secret_ref,
            Some(SecretReference {
                name: "node-1-cloudinit".to_string()
            })
        );
        assert!(placement.source.network_data_secret_ref.is_none());
    }

    #[test]
    fn network_data_placement_follows_user_data_size() {
        // Large network data stays inline while the user data is small.
        let large_network = "n".repeat(4096);
        let placement = place("node-1", "default", &documents(10, &large_network));
        assert!(placement.secret.is_none());
        assert_eq!(placement.source.network_data.as_deref(), Some(large_network.as_str()));

        // Small network data is externalized along with large user data.
        let placement = place("node-1", "default", &documents(3000, "version: 2\n"));
        let data = placement.secret.unwrap().data.unwrap();
        assert_eq!(data[NETWORK_DATA_SECRET_KEY].0, b"version: 2\n".to_vec());
        assert!(placement.source.network_data.is_none());
        assert!(placement.source.network_data_secret_ref.is_some());
    }

    #[test]
    fn secret_owner_points_at_vm() {
        let mut vm = VirtualMachine::new("node-1", VirtualMachineSpec::default());
        vm.metadata.uid = Some("3f2a".to_string());
        let mut secret = place("node-1", "default", &documents(5000, ""))
            .secret
            .unwrap();
        set_secret_owner(&mut secret, &vm);
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].api_version, "kubevirt.io/v1");
        assert_eq!(owners[0].kind, "VirtualMachine");
        assert_eq!(owners[0].name, "node-1");
        assert_eq!(owners[0].uid, "3f2a");
    }
}
