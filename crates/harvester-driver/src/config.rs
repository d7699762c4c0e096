//! Driver configuration: the validated VM model plus how to reach Harvester

use harvester_vm::VmConfig;
use serde::{Deserialize, Serialize};

/// How to reach the Harvester cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Kubeconfig content (already base64-decoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_content: Option<String>,

    /// Harvester URL for the legacy REST API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Skip TLS verification for the legacy REST API
    #[serde(default)]
    pub insecure_skip_verify: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl ConnectionConfig {
    /// The legacy REST API is used only for an explicit endpoint without
    /// kubeconfig content.
    pub fn use_rest_api(&self) -> bool {
        self.endpoint.is_some() && self.kubeconfig_content.is_none()
    }

    /// Take connection settings supplied on this invocation over stored ones.
    pub fn overlay(&mut self, other: ConnectionConfig) {
        if other.kubeconfig_content.is_some() {
            self.kubeconfig_content = other.kubeconfig_content;
        }
        if other.endpoint.is_some() {
            self.endpoint = other.endpoint;
        }
        if other.username.is_some() {
            self.username = other.username;
        }
        if other.password.is_some() {
            self.password = other.password;
        }
        self.insecure_skip_verify |= other.insecure_skip_verify;
    }
}

/// Everything a lifecycle operation needs to know about the machine
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub vm: VmConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl DriverConfig {
    pub fn machine_name(&self) -> &str {
        &self.vm.machine_name
    }

    pub fn namespace(&self) -> &str {
        &self.vm.namespace
    }
}
