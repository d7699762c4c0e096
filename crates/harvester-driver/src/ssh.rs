//! SSH key material for a machine

use std::path::Path;

use harvester_common::{Error, Result};
use harvester_vm::SshConfig;
use tokio::process::Command;
use tracing::debug;

use crate::store::MachineStore;

const KEY_BITS: &str = "2048";

/// Put the machine's key pair in the store.
///
/// Generates a fresh RSA key, or copies the configured private key (and its
/// `.pub` unless a Harvester key pair supplies the public half). Returns the
/// public key text when a local `.pub` is in use; `None` means the key
/// pair's registered public key applies.
pub async fn prepare_key_material(store: &MachineStore, ssh: &SshConfig) -> Result<Option<String>> {
    store.ensure_dir().await?;
    let key_path = store.ssh_key_path();
    let public_key_path = store.ssh_public_key_path();

    match &ssh.private_key_path {
        None => {
            debug!(path = %key_path.display(), "Generating SSH key");
            generate_key(&key_path).await?;
        }
        Some(source) => {
            debug!(source = %source.display(), "Using configured SSH private key");
            copy_file(source, &key_path).await?;
            if ssh.key_pair_name.is_some() {
                return Ok(None);
            }
            let mut source_public = source.clone().into_os_string();
            source_public.push(".pub");
            copy_file(Path::new(&source_public), &public_key_path).await?;
        }
    }

    let public_key = tokio::fs::read_to_string(&public_key_path)
        .await
        .map_err(|e| Error::io(format!("reading {}", public_key_path.display()), e))?;
    Ok(Some(public_key))
}

async fn generate_key(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| Error::io(format!("removing {}", path.display()), e))?;
    }
    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "rsa", "-b", KEY_BITS, "-N", "", "-f"])
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::io("running ssh-keygen", e))?;
    if !output.status.success() {
        return Err(Error::internal_with_context(
            "ssh-keygen",
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| Error::io(format!("copying {} to {}", from.display(), to.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_key_pair(dir: &Path) -> std::path::PathBuf {
        let private = dir.join("my_key");
        tokio::fs::write(&private, "PRIVATE").await.unwrap();
        tokio::fs::write(dir.join("my_key.pub"), "ssh-rsa AAAA user@host\n")
            .await
            .unwrap();
        private
    }

    #[tokio::test]
    async fn copies_private_and_public_key() {
        let src = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let store = MachineStore::new(storage.path(), "node-1").unwrap();
        let ssh = SshConfig {
            private_key_path: Some(write_key_pair(src.path()).await),
            ..Default::default()
        };

        let public_key = prepare_key_material(&store, &ssh).await.unwrap();
        assert_eq!(public_key.as_deref(), Some("ssh-rsa AAAA user@host\n"));
        assert_eq!(
            tokio::fs::read_to_string(store.ssh_key_path()).await.unwrap(),
            "PRIVATE"
        );
    }

    #[tokio::test]
    async fn key_pair_skips_public_key_copy() {
        let src = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let store = MachineStore::new(storage.path(), "node-1").unwrap();
        let ssh = SshConfig {
            private_key_path: Some(write_key_pair(src.path()).await),
            key_pair_name: Some("dev".to_string()),
            ..Default::default()
        };

        assert_eq!(prepare_key_material(&store, &ssh).await.unwrap(), None);
        assert!(!store.ssh_public_key_path().exists());
    }

    #[tokio::test]
    async fn missing_private_key_is_an_io_error() {
        let storage = tempfile::tempdir().unwrap();
        let store = MachineStore::new(storage.path(), "node-1").unwrap();
        let ssh = SshConfig {
            private_key_path: Some("/nonexistent/id_rsa".into()),
            ..Default::default()
        };
        assert!(matches!(
            prepare_key_material(&store, &ssh).await.unwrap_err(),
            Error::Io { .. }
        ));
    }
}
