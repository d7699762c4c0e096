//! Machine lifecycle
//!
//! [`Driver`] owns one machine: its persisted record, its store directory and
//! a Harvester connection. Every operation is a short sequence of API calls
//! followed, where the platform converges asynchronously, by bounded polling.

use std::fmt;
use std::net::Ipv4Addr;

use harvester_common::crd::VirtualMachine;
use harvester_common::{namespaced_name_parts_or, poll_until, Error, PollConfig, Result};
use harvester_vm::{build_vm, compose, place, set_secret_owner, ResolvedDisk, VmConfig};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::api::{HarvesterApi, VmAction};
use crate::precreate::pre_create_check;
use crate::ssh::prepare_key_material;
use crate::store::{MachineRecord, MachineStore};

/// Annotation listing the claims Harvester deletes together with the VM
pub const REMOVED_PVCS_ANNOTATION: &str = "harvesterhci.io/removedPersistentVolumeClaims";

/// Annotation forcing removal of hot-pluggable claims as well
pub const REMOVE_ALL_PVCS_ANNOTATION: &str = "harvesterhci.io/removeAllPersistentVolumeClaims";

/// Port of the Docker daemon in the guest
pub const DOCKER_PORT: u16 = 2376;

/// Machine state as reported to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    None,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl MachineState {
    /// State of an existing instance from its phase
    pub fn from_phase(phase: &str) -> Self {
        match phase {
            "Pending" | "Scheduling" | "Scheduled" => MachineState::Starting,
            "Running" => MachineState::Running,
            "Succeeded" => MachineState::Stopping,
            "Failed" => MachineState::Error,
            _ => MachineState::None,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::None => "",
            MachineState::Starting => "Starting",
            MachineState::Running => "Running",
            MachineState::Stopping => "Stopping",
            MachineState::Stopped => "Stopped",
            MachineState::Error => "Error",
        };
        f.write_str(s)
    }
}

pub struct Driver {
    record: MachineRecord,
    store: MachineStore,
    api: Box<dyn HarvesterApi>,
    poll: PollConfig,
}

impl Driver {
    pub fn new(record: MachineRecord, store: MachineStore, api: Box<dyn HarvesterApi>) -> Self {
        Self {
            record,
            store,
            api,
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn record(&self) -> &MachineRecord {
        &self.record
    }

    fn vm_config(&self) -> &VmConfig {
        &self.record.config.vm
    }

    fn name(&self) -> &str {
        self.record.config.machine_name()
    }

    fn namespace(&self) -> &str {
        self.record.config.namespace()
    }

    fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    /// Validate the cluster side before [`Driver::create`]; remembers the key
    /// pair's public key.
    pub async fn pre_create_check(&mut self) -> Result<()> {
        let outcome = pre_create_check(self.api.as_ref(), self.vm_config()).await?;
        if outcome.key_pair_public_key.is_some() {
            self.record.ssh_public_key = outcome.key_pair_public_key;
        }
        self.store.save(&self.record).await
    }

    pub async fn create(&mut self) -> Result<()> {
        let config = self.vm_config().clone();
        info!(machine = %config.machine_name, namespace = %config.namespace, "Creating machine");

        let local_public_key = prepare_key_material(&self.store, &config.ssh).await?;
        if local_public_key.is_some() {
            self.record.ssh_public_key = local_public_key;
        }

        let cloud_config = match &config.cloud_config_path {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| Error::io(format!("reading cloud config {}", path.display()), e))?,
            ),
            None => None,
        };
        let documents = compose(
            &config,
            self.record.ssh_public_key.as_deref(),
            cloud_config.as_deref(),
        )?;
        let placement = place(&config.machine_name, &config.namespace, &documents);

        let disks = self.resolve_disks(&config).await?;
        let vm = build_vm(&config, &disks, placement.source, &mut rand::thread_rng())?;

        let created = self.api.create_vm(&vm).await.map_err(|e| {
            if e.is_already_exists() {
                Error::already_exists("virtual machine", self.qualified_name())
            } else {
                e
            }
        })?;
        debug!(
            machine = %config.machine_name,
            uid = ?created.metadata.uid,
            "Virtual machine submitted"
        );

        if let Some(mut secret) = placement.secret {
            set_secret_owner(&mut secret, &created);
            self.api.create_secret(&secret).await?;
            debug!(machine = %config.machine_name, "Cloud-init secret created");
        }
        self.store.save(&self.record).await?;

        self.wait_for_ready().await?;
        let ip = self.get_ip().await?;
        info!(machine = %config.machine_name, ip = %ip, "Machine is ready");
        self.record.ip_address = Some(ip);
        self.store.save(&self.record).await
    }

    async fn resolve_disks(&self, config: &VmConfig) -> Result<Vec<ResolvedDisk>> {
        let mut resolved = Vec::with_capacity(config.disks.len());
        for disk in &config.disks {
            let Some(image) = &disk.image else {
                resolved.push(ResolvedDisk::blank(disk.clone()));
                continue;
            };
            let (namespace, name) = namespaced_name_parts_or(image, &config.namespace)?;
            let image_id = format!("{namespace}/{name}");
            let found = self
                .api
                .get_image(&namespace, &name)
                .await?
                .ok_or_else(|| Error::not_found("image", image_id.clone()))?;
            let storage_class = found.storage_class_name().to_string();
            resolved.push(ResolvedDisk::from_image(disk.clone(), image_id, storage_class));
        }
        Ok(resolved)
    }

    /// Current state; fails when the VM itself does not exist
    pub async fn get_state(&self) -> Result<MachineState> {
        self.api
            .get_vm(self.namespace(), self.name())
            .await?
            .ok_or_else(|| Error::not_found("virtual machine", self.qualified_name()))?;
        let state = match self.api.get_vmi(self.namespace(), self.name()).await? {
            Some(vmi) => MachineState::from_phase(vmi.phase()),
            None => MachineState::Stopped,
        };
        Ok(state)
    }

    /// IPv4 address of the first interface; the machine must be running
    pub async fn get_ip(&self) -> Result<String> {
        let state = self.get_state().await?;
        if state != MachineState::Running {
            return Err(Error::validation(format!(
                "machine {} is not running, current state is {state}",
                self.name()
            )));
        }
        let vmi = self
            .api
            .get_vmi(self.namespace(), self.name())
            .await?
            .ok_or_else(|| Error::not_found("virtual machine instance", self.qualified_name()))?;
        let address = vmi.first_ip_address().unwrap_or_default();
        let address = address.split('/').next().unwrap_or_default();
        address
            .parse::<Ipv4Addr>()
            .map(|ip| ip.to_string())
            .map_err(|_| Error::validation(format!("{address} is not a valid IPv4 address")))
    }

    pub async fn get_ssh_hostname(&self) -> Result<String> {
        self.get_ip().await
    }

    pub async fn get_url(&self) -> Result<String> {
        let ip = self.get_ip().await?;
        Ok(format!("tcp://{ip}:{DOCKER_PORT}"))
    }

    pub async fn start(&self) -> Result<()> {
        debug!(machine = %self.name(), "Starting machine");
        self.api
            .vm_action(self.namespace(), self.name(), VmAction::Start)
            .await?;
        self.wait_for_ready().await
    }

    pub async fn stop(&self) -> Result<()> {
        debug!(machine = %self.name(), "Stopping machine");
        self.api
            .vm_action(self.namespace(), self.name(), VmAction::Stop)
            .await?;
        self.wait_for_state(MachineState::Stopped).await
    }

    pub async fn kill(&self) -> Result<()> {
        self.stop().await
    }

    /// Restart and wait until a new instance replaces the old one
    pub async fn restart(&self) -> Result<()> {
        debug!(machine = %self.name(), "Restarting machine");
        let vmi = self
            .api
            .get_vmi(self.namespace(), self.name())
            .await?
            .ok_or_else(|| Error::not_found("virtual machine instance", self.qualified_name()))?;
        let old_uid = vmi.metadata.uid.unwrap_or_default();

        self.api
            .vm_action(self.namespace(), self.name(), VmAction::Restart)
            .await?;

        let old_uid = old_uid.as_str();
        poll_until(&self.poll, "machine restart", move || self.instance_replaced(old_uid)).await?;
        self.wait_for_ready().await
    }

    /// Delete the VM and its claims; succeeds when the VM is already gone
    pub async fn remove(&self) -> Result<()> {
        debug!(machine = %self.name(), "Removing machine");
        let Some(vm) = self.api.get_vm(self.namespace(), self.name()).await? else {
            info!(machine = %self.name(), "Machine already removed");
            return Ok(());
        };

        let patch = claim_removal_patch(&vm);
        self.api
            .patch_vm(self.namespace(), self.name(), &patch)
            .await?;
        match self.api.delete_vm(self.namespace(), self.name()).await {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }

        poll_until(&self.poll, "machine removed", move || self.is_removed()).await?;
        info!(machine = %self.name(), "Machine removed");
        Ok(())
    }

    async fn wait_for_state(&self, target: MachineState) -> Result<()> {
        poll_until(&self.poll, format!("machine to be {target}"), move || {
            self.is_in_state(target)
        })
        .await
    }

    async fn wait_for_ready(&self) -> Result<()> {
        self.wait_for_state(MachineState::Running).await?;
        poll_until(&self.poll, "machine ip", move || self.has_ip()).await
    }

    async fn is_in_state(&self, target: MachineState) -> Result<bool> {
        Ok(self.get_state().await? == target)
    }

    async fn has_ip(&self) -> Result<bool> {
        self.get_ip().await.map(|ip| !ip.is_empty())
    }

    async fn instance_replaced(&self, old_uid: &str) -> Result<bool> {
        let vmi = self.api.get_vmi(self.namespace(), self.name()).await?;
        Ok(vmi.is_some_and(|vmi| vmi.metadata.uid.as_deref() != Some(old_uid)))
    }

    async fn is_removed(&self) -> Result<bool> {
        Ok(self
            .api
            .get_vm(self.namespace(), self.name())
            .await?
            .is_none())
    }
}

/// Merge patch recording which claims Harvester should delete with the VM.
///
/// Hot-pluggable claims are kept unless the VM asks for all of them to go.
fn claim_removal_patch(vm: &VirtualMachine) -> Value {
    let remove_all = vm
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REMOVE_ALL_PVCS_ANNOTATION))
        .is_some_and(|v| v == "true");

    let claims: Vec<&str> = vm
        .spec
        .template
        .spec
        .volumes
        .iter()
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .filter(|claim| remove_all || !claim.hotpluggable)
        .map(|claim| claim.claim_name.as_str())
        .collect();

    json!({
        "metadata": {
            "annotations": {
                REMOVED_PVCS_ANNOTATION: claims.join(","),
            }
        }
    })
}
