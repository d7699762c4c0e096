//! Harvester machine driver
//!
//! Provisions one Harvester virtual machine per machine name and answers
//! lifecycle queries about it. Each invocation of the binary runs one
//! command; state carried between invocations lives in the machine store.

pub mod api;
pub mod args;
pub mod config;
pub mod driver;
pub mod precreate;
pub mod ssh;
pub mod store;

pub use harvester_common::{Error, Result};

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use harvester_vm::VmConfig;
use tracing::debug;

use crate::api::LazyApi;
use crate::args::{CreateArgs, MachineArgs};
use crate::config::DriverConfig;
use crate::driver::Driver;
use crate::store::{default_storage_path, MachineRecord, MachineStore};

/// Harvester driver for docker-machine compatible provisioners
#[derive(Parser, Debug)]
#[command(name = "docker-machine-driver-harvester")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Root of the machine store
    #[arg(long, global = true, env = "MACHINE_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the cluster, then create the machine and wait for its IP
    Create(CreateArgs),
    /// Only run the checks that precede create
    PreCreateCheck(CreateArgs),
    Start(MachineArgs),
    Stop(MachineArgs),
    /// Same as stop
    Kill(MachineArgs),
    Restart(MachineArgs),
    /// Remove the machine and its volumes
    Rm(MachineArgs),
    /// Print the machine state
    State(MachineArgs),
    /// Print the machine IPv4 address
    Ip(MachineArgs),
    /// Print the Docker URL of the machine
    Url(MachineArgs),
    /// Print the SSH hostname of the machine
    SshHostname(MachineArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let storage = match self.storage_path {
            Some(path) => path,
            None => default_storage_path()?,
        };
        debug!(storage = %storage.display(), "Machine store");

        match self.command {
            Commands::Create(args) => {
                let mut driver = new_machine(&storage, args)?;
                driver.pre_create_check().await?;
                driver.create().await
            }
            Commands::PreCreateCheck(args) => new_machine(&storage, args)?.pre_create_check().await,
            Commands::Start(args) => existing_machine(&storage, args).await?.start().await,
            Commands::Stop(args) => existing_machine(&storage, args).await?.stop().await,
            Commands::Kill(args) => existing_machine(&storage, args).await?.kill().await,
            Commands::Restart(args) => existing_machine(&storage, args).await?.restart().await,
            Commands::Rm(args) => existing_machine(&storage, args).await?.remove().await,
            Commands::State(args) => {
                let state = existing_machine(&storage, args).await?.get_state().await?;
                println!("{state}");
                Ok(())
            }
            Commands::Ip(args) => {
                println!("{}", existing_machine(&storage, args).await?.get_ip().await?);
                Ok(())
            }
            Commands::Url(args) => {
                println!("{}", existing_machine(&storage, args).await?.get_url().await?);
                Ok(())
            }
            Commands::SshHostname(args) => {
                let hostname = existing_machine(&storage, args).await?.get_ssh_hostname().await?;
                println!("{hostname}");
                Ok(())
            }
        }
    }
}

fn new_machine(storage: &Path, args: CreateArgs) -> Result<Driver> {
    let vm = VmConfig::from_raw(args.vm.into_raw(args.machine_name))?;
    let store = MachineStore::new(storage, &vm.machine_name)?;
    let config = DriverConfig {
        vm,
        connection: args.connection.into_connection(),
    };
    let api = LazyApi::new(config.connection.clone());
    Ok(Driver::new(MachineRecord::new(config), store, Box::new(api)))
}

/// Reload a machine from its store; connection flags given now win over the
/// stored ones.
async fn existing_machine(storage: &Path, args: MachineArgs) -> Result<Driver> {
    let store = MachineStore::new(storage, &args.machine_name)?;
    let mut record = store.load().await?;
    record
        .config
        .connection
        .overlay(args.connection.into_connection());
    let api = LazyApi::new(record.config.connection.clone());
    Ok(Driver::new(record, store, Box::new(api)))
}
