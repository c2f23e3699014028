//! SSH key pair used to reach provisioned instances.
//!
//! The pair lives in the state directory as `id_rsa` / `id_rsa.pub` so that
//! instances reused from a previous run still accept it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::{debug, info};

use super::{TransportError, TransportResult};

pub const PRIVATE_KEY_FILE: &str = "id_rsa";
pub const PUBLIC_KEY_FILE: &str = "id_rsa.pub";

/// Location of the private key and the public key in authorized_keys form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: PathBuf,
    pub public_key: String,
}

/// Loads the key pair from `dir`, generating it with `ssh-keygen` if either
/// half is missing.
pub async fn ensure_key_pair(dir: &Path) -> TransportResult<KeyPair> {
    let private_key = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);

    if private_key.exists() && public_path.exists() {
        debug!("Reusing SSH key pair in {}", dir.display());
        return read_pair(private_key, &public_path).await;
    }

    info!("Generating SSH key pair in {}", dir.display());
    tokio::fs::create_dir_all(dir).await?;
    for stale in [&private_key, &public_path] {
        if stale.exists() {
            tokio::fs::remove_file(stale).await?;
        }
    }

    let output = tokio::process::Command::new("ssh-keygen")
        .args(["-q", "-t", "rsa", "-b", "4096", "-N", "", "-C", "integrun", "-f"])
        .arg(&private_key)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| TransportError::Key(format!("failed to run ssh-keygen: {}", e)))?;
    if !output.status.success() {
        return Err(TransportError::Key(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    read_pair(private_key, &public_path).await
}

async fn read_pair(private_key: PathBuf, public_path: &Path) -> TransportResult<KeyPair> {
    let public_key = tokio::fs::read_to_string(public_path)
        .await?
        .trim()
        .to_string();
    if public_key.is_empty() {
        return Err(TransportError::Key(format!(
            "{} is empty",
            public_path.display()
        )));
    }
    Ok(KeyPair {
        private_key,
        public_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_existing_pair_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "private").unwrap();
        std::fs::write(
            dir.path().join(PUBLIC_KEY_FILE),
            "ssh-rsa AAAAB3Nza integrun\n",
        )
        .unwrap();

        let pair = ensure_key_pair(dir.path()).await.unwrap();
        assert_eq!(pair.private_key, dir.path().join(PRIVATE_KEY_FILE));
        assert_eq!(pair.public_key, "ssh-rsa AAAAB3Nza integrun");
    }

    #[tokio::test]
    async fn test_empty_public_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "private").unwrap();
        std::fs::write(dir.path().join(PUBLIC_KEY_FILE), "\n").unwrap();

        let err = ensure_key_pair(dir.path()).await.unwrap_err();
        assert!(matches!(err, TransportError::Key(_)));
    }
}
