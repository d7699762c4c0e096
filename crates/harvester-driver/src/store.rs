//! Local machine store
//!
//! Each machine owns `<storage>/machines/<name>/` holding its SSH key pair and
//! `harvester-driver.json`, the record every later invocation reloads.

use std::path::{Path, PathBuf};

use harvester_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DriverConfig;

const MACHINES_DIR: &str = "machines";
const STATE_FILE: &str = "harvester-driver.json";
const PRIVATE_KEY_FILE: &str = "id_rsa";

/// Default storage root, `~/.docker/machine`
pub fn default_storage_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".docker").join("machine"))
        .ok_or_else(|| {
            Error::internal_with_context("machine store", "could not determine home directory")
        })
}

/// Persisted state of one machine
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    pub config: DriverConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Public key injected into the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
}

impl MachineRecord {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            ip_address: None,
            ssh_public_key: None,
        }
    }
}

/// Directory of one machine
#[derive(Clone, Debug)]
pub struct MachineStore {
    dir: PathBuf,
}

impl MachineStore {
    /// Store of `machine_name` under `storage_path`; the name must be a single
    /// path component.
    pub fn new(storage_path: &Path, machine_name: &str) -> Result<Self> {
        if machine_name.is_empty()
            || machine_name.contains(['/', '\\'])
            || machine_name.contains("..")
        {
            return Err(Error::validation_for_field(
                "machine-name",
                format!("invalid machine name {machine_name:?}"),
            ));
        }
        Ok(Self {
            dir: storage_path.join(MACHINES_DIR).join(machine_name),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    pub fn ssh_public_key_path(&self) -> PathBuf {
        self.dir.join(format!("{PRIVATE_KEY_FILE}.pub"))
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::io(format!("creating {}", self.dir.display()), e))
    }

    pub async fn load(&self) -> Result<MachineRecord> {
        let path = self.state_path();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::serialization_for_kind("machine record", e.to_string()))
    }

    pub async fn save(&self, record: &MachineRecord) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.state_path();
        let content = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
        debug!(path = %path.display(), "Saved machine record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use harvester_vm::{RawMachineConfig, VmConfig};

    fn record() -> MachineRecord {
        let vm = VmConfig::from_raw(RawMachineConfig {
            machine_name: "node-1".to_string(),
            cpu_count: 2,
            memory_size: 4,
            disk_size: 20,
            image_name: "ubuntu".to_string(),
            network_name: "vlan1".to_string(),
            ssh_port: 22,
            ..Default::default()
        })
        .unwrap();
        MachineRecord::new(DriverConfig {
            vm,
            connection: ConnectionConfig::default(),
        })
    }

    #[test]
    fn layout_under_machines_dir() {
        let store = MachineStore::new(Path::new("/var/lib/machine"), "node-1").unwrap();
        assert_eq!(store.dir(), Path::new("/var/lib/machine/machines/node-1"));
        assert_eq!(store.ssh_key_path(), Path::new("/var/lib/machine/machines/node-1/id_rsa"));
        assert_eq!(
            store.ssh_public_key_path(),
            Path::new("/var/lib/machine/machines/node-1/id_rsa.pub")
        );
    }

    #[tokio::test]
    async fn record_survives_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MachineStore::new(tmp.path(), "node-1").unwrap();
        let mut record = record();
        record.ip_address = Some("10.0.0.5".to_string());

        store.save(&record).await.unwrap();
        assert_eq!(store.load().await.unwrap(), record);
    }

    #[tokio::test]
    async fn missing_record_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MachineStore::new(tmp.path(), "ghost").unwrap();
        assert!(matches!(store.load().await.unwrap_err(), Error::Io { .. }));
    }

    #[test]
    fn names_that_escape_the_store_are_rejected() {
        let root = Path::new("/var/lib/machine");
        for name in ["", "../other", "a/b", "..", "a\\b", "node..1"] {
            match MachineStore::new(root, name) {
                Err(Error::Validation { field, .. }) => {
                    assert_eq!(field.as_deref(), Some("machine-name"), "{name}")
                }
                other => panic!("expected validation error for {name:?}, got {other:?}"),
            }
        }
        assert!(MachineStore::new(root, "pool-a-7f9c2-x7k2q").is_ok());
    }
}
