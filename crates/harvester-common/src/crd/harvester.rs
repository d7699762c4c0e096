//! Harvester and Multus resources consulted before and during VM creation

use kube::discovery::ApiResource;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Harvester API group
pub const HARVESTER_GROUP: &str = "harvesterhci.io";

/// Harvester API version
pub const HARVESTER_VERSION: &str = "v1beta1";

/// Key pair condition set once the public key has been parsed
pub const KEY_PAIR_VALIDATED: &str = "validated";

/// A VM image uploaded to Harvester
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "harvesterhci.io",
    version = "v1beta1",
    kind = "VirtualMachineImage",
    plural = "virtualmachineimages",
    namespaced,
    status = "VirtualMachineImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImageStatus {
    /// Storage class backing volumes created from this image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i32>,
}

impl VirtualMachineImage {
    /// Storage class of volumes cloned from the image, empty when not yet known
    pub fn storage_class_name(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .unwrap_or_default()
    }
}

/// An SSH public key registered with Harvester
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "harvesterhci.io",
    version = "v1beta1",
    kind = "KeyPair",
    plural = "keypairs",
    namespaced,
    status = "KeyPairStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairSpec {
    pub public_key: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finger_print: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<KeyPairCondition>,
}

/// Condition of a key pair (`type` is e.g. `validated`, `status` is `True`/`False`)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl KeyPair {
    /// Whether Harvester accepted the public key
    pub fn is_validated(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == KEY_PAIR_VALIDATED && c.status == "True")
        })
    }
}

/// A cluster-wide Harvester setting.
///
/// Settings carry `value`/`default` at the top level instead of a spec, so
/// they are fetched as dynamic objects and decoded into this view.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Setting {
    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub default: String,
}

impl Setting {
    /// The effective value: `value` when set, otherwise `default`
    pub fn effective_value(&self) -> &str {
        if self.value.is_empty() {
            &self.default
        } else {
            &self.value
        }
    }

    /// API coordinates for dynamic access
    pub fn api_resource() -> ApiResource {
        ApiResource {
            group: HARVESTER_GROUP.to_string(),
            version: HARVESTER_VERSION.to_string(),
            api_version: format!("{}/{}", HARVESTER_GROUP, HARVESTER_VERSION),
            kind: "Setting".to_string(),
            plural: "settings".to_string(),
        }
    }
}

/// A Multus network attachment; Harvester VM networks are backed by these
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentDefinitionSpec {
    /// CNI configuration JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_pair_validation_requires_true_condition() {
        let mut keypair: KeyPair = serde_json::from_value(json!({
            "apiVersion": "harvesterhci.io/v1beta1",
            "kind": "KeyPair",
            "metadata": {"name": "dev", "namespace": "default"},
            "spec": {"publicKey": "ssh-rsa AAAA dev"},
            "status": {"conditions": [{"type": "validated", "status": "True"}]}
        }))
        .unwrap();
        assert!(keypair.is_validated());
        assert_eq!(keypair.spec.public_key, "ssh-rsa AAAA dev");

        keypair.status = Some(KeyPairStatus {
            conditions: vec![KeyPairCondition {
                type_: KEY_PAIR_VALIDATED.to_string(),
                status: "False".to_string(),
                message: None,
            }],
            ..Default::default()
        });
        assert!(!keypair.is_validated());

        keypair.status = None;
        assert!(!keypair.is_validated());
    }

    #[test]
    fn image_exposes_backing_storage_class() {
        let image: VirtualMachineImage = serde_json::from_value(json!({
            "apiVersion": "harvesterhci.io/v1beta1",
            "kind": "VirtualMachineImage",
            "metadata": {"name": "ubuntu", "namespace": "default"},
            "spec": {"displayName": "ubuntu-22.04"},
            "status": {"storageClassName": "longhorn-ubuntu", "progress": 100}
        }))
        .unwrap();
        assert_eq!(image.storage_class_name(), "longhorn-ubuntu");
    }

    #[test]
    fn setting_falls_back_to_default() {
        let setting: Setting =
            serde_json::from_value(json!({"default": "v1.2.0", "metadata": {}})).unwrap();
        assert_eq!(setting.effective_value(), "v1.2.0");

        let setting: Setting =
            serde_json::from_value(json!({"value": "v0.1.0", "default": "v1.2.0"})).unwrap();
        assert_eq!(setting.effective_value(), "v0.1.0");
        assert_eq!(Setting::api_resource().plural, "settings");
    }
}
