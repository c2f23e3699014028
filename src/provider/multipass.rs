//! Local VMs through the `multipass` CLI.
//!
//! multipass corrupts its own state when invoked concurrently, so every call
//! that changes VMs goes through one lock. Before a launch any VM with the
//! same name is force-deleted, which makes re-provisioning after a crashed
//! run safe. The generated public key is injected with a cloud-init document
//! written to `multipass launch --cloud-init -`.
//!
//! Only Ubuntu guests matching the host architecture are supported.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use tracing::{Instrument, error, info, warn};

use super::{
    Instance, InstanceProvisioner, ProvisionError, ProvisionResult, ProvisionerKind, Tool,
};
use crate::config::{MultipassConfig, RunConfig};
use crate::define::{Arch, OsProfile, OsType};
use crate::planner::OsBatch;
use crate::transport::keys::PUBLIC_KEY_FILE;

pub const NAME: &str = "multipass";

const UBUNTU_RELEASES: [&str; 3] = ["20.04", "22.04", "24.04"];
const USERNAME: &str = "ubuntu";
const REMOTE_PATH: &str = "/home/ubuntu/agent";

pub struct MultipassProvisioner {
    config: MultipassConfig,
    span: tracing::Span,
    lock: tokio::sync::Mutex<()>,
}

impl MultipassProvisioner {
    pub fn new(config: MultipassConfig) -> Self {
        Self {
            config,
            span: tracing::Span::none(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn launch(&self, batch: &OsBatch, public_key: &str) -> ProvisionResult<Instance> {
        let _guard = self.lock.lock().await;

        let listing = Tool::new("multipass")
            .args(["list", "--format", "json"])
            .output()
            .await?;
        if list_names(&listing.stdout)?.iter().any(|n| *n == batch.id) {
            warn!("Deleting existing VM {}", batch.id);
            Tool::new("multipass")
                .args(["delete", "-p", batch.id.as_str()])
                .output()
                .await?;
        }

        info!("Launching VM {} (ubuntu {})", batch.id, batch.profile.version);
        Tool::new("multipass")
            .arg("launch")
            .args(["-c", &self.config.cpus.to_string()])
            .args(["-d", self.config.disk.as_str()])
            .args(["-m", self.config.memory.as_str()])
            .args(["-n", batch.id.as_str()])
            .args(["--cloud-init", "-"])
            .arg(batch.profile.version.as_str())
            .stdin(cloud_init(public_key))
            .timeout(Duration::from_secs(self.config.launch_timeout_secs))
            .stream()
            .await?;

        let info = Tool::new("multipass")
            .args(["info", batch.id.as_str(), "--format", "json"])
            .output()
            .await?;
        let ip = parse_ipv4(&info.stdout, &batch.id)?;

        Ok(Instance {
            provisioner: NAME.to_string(),
            id: batch.id.clone(),
            name: batch.id.clone(),
            ip,
            username: USERNAME.to_string(),
            remote_path: REMOTE_PATH.to_string(),
            internal: Default::default(),
        })
    }

    async fn delete(&self, name: &str) -> ProvisionResult<()> {
        let _guard = self.lock.lock().await;
        Tool::new("multipass")
            .args(["delete", "-p", name])
            .output()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceProvisioner for MultipassProvisioner {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::Vm
    }

    fn set_logger(&mut self, span: tracing::Span) {
        self.span = span;
    }

    fn supported(&self, profile: &OsProfile) -> bool {
        profile.os_type == OsType::Linux
            && profile.distro == "ubuntu"
            && UBUNTU_RELEASES.contains(&profile.version.as_str())
            && Arch::host() == Some(profile.arch)
    }

    async fn provision(
        &self,
        config: &RunConfig,
        batches: &[OsBatch],
    ) -> ProvisionResult<Vec<Instance>> {
        let key_path = config.state_dir.join(PUBLIC_KEY_FILE);
        let public_key = tokio::fs::read_to_string(&key_path).await?;
        let public_key = public_key.trim();

        let results = join_all(
            batches
                .iter()
                .map(|b| self.launch(b, public_key).instrument(self.span.clone())),
        )
        .await;

        let mut instances = Vec::new();
        let mut errors = Vec::new();
        for (batch, result) in batches.iter().zip(results) {
            match result {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    error!(parent: &self.span, "Failed to launch VM {}: {}", batch.id, e);
                    errors.push(format!("{}: {}", batch.id, e));
                }
            }
        }
        if instances.is_empty() && !errors.is_empty() {
            return Err(ProvisionError::batches(errors));
        }
        Ok(instances)
    }

    async fn clean(&self, _config: &RunConfig, instances: &[Instance]) -> ProvisionResult<()> {
        for instance in instances {
            info!(parent: &self.span, "Deleting VM {}", instance.name);
            if let Err(e) = self.delete(&instance.name).await {
                warn!(parent: &self.span, "Failed to delete VM {}: {}", instance.name, e);
            }
        }
        Ok(())
    }
}

/// Cloud-init document authorizing `public_key` for the default user.
pub fn cloud_init(public_key: &str) -> String {
    format!("#cloud-config\nssh_authorized_keys:\n  - {}\n", public_key)
}

#[derive(Deserialize)]
struct ListOutput {
    #[serde(default)]
    list: Vec<ListEntry>,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
}

#[derive(Deserialize)]
struct InfoOutput {
    #[serde(default)]
    info: std::collections::BTreeMap<String, InfoEntry>,
}

#[derive(Deserialize)]
struct InfoEntry {
    #[serde(default)]
    ipv4: Vec<String>,
}

fn list_names(json: &str) -> ProvisionResult<Vec<String>> {
    let out: ListOutput = serde_json::from_str(json)
        .map_err(|e| ProvisionError::Parse(format!("multipass list: {}", e)))?;
    Ok(out.list.into_iter().map(|e| e.name).collect())
}

fn parse_ipv4(json: &str, name: &str) -> ProvisionResult<String> {
    let out: InfoOutput = serde_json::from_str(json)
        .map_err(|e| ProvisionError::Parse(format!("multipass info: {}", e)))?;
    out.info
        .get(name)
        .and_then(|entry| entry.ipv4.first().cloned())
        .ok_or_else(|| ProvisionError::Parse(format!("multipass info has no IPv4 for {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ubuntu(version: &str, arch: Arch) -> OsProfile {
        OsProfile {
            os_type: OsType::Linux,
            arch,
            distro: "ubuntu".to_string(),
            version: version.to_string(),
            docker_variant: String::new(),
        }
    }

    #[test]
    fn test_cloud_init() {
        assert_eq!(
            cloud_init("ssh-rsa AAAA integrun"),
            "#cloud-config\nssh_authorized_keys:\n  - ssh-rsa AAAA integrun\n"
        );
    }

    #[test]
    fn test_list_names() {
        let json = r#"{"list": [
            {"ipv4": ["10.0.0.5"], "name": "linux-amd64-ubuntu-2204-default", "release": "22.04 LTS", "state": "Running"},
            {"ipv4": [], "name": "primary", "release": "24.04 LTS", "state": "Stopped"}
        ]}"#;
        assert_eq!(
            list_names(json).unwrap(),
            vec!["linux-amd64-ubuntu-2204-default", "primary"]
        );
        assert!(list_names("not json").is_err());
    }

    #[test]
    fn test_parse_ipv4() {
        let json = r#"{"errors": [], "info": {"vm1": {"ipv4": ["192.168.64.7"], "state": "Running"}}}"#;
        assert_eq!(parse_ipv4(json, "vm1").unwrap(), "192.168.64.7");
        assert!(parse_ipv4(json, "vm2").is_err());
    }

    #[test]
    fn test_supported_follows_host_arch() {
        let p = MultipassProvisioner::new(MultipassConfig::default());
        let Some(host) = Arch::host() else { return };
        let other = match host {
            Arch::Amd64 => Arch::Arm64,
            Arch::Arm64 => Arch::Amd64,
        };
        assert!(p.supported(&ubuntu("22.04", host)));
        assert!(!p.supported(&ubuntu("22.04", other)));
        assert!(!p.supported(&ubuntu("18.04", host)));

        let mut rhel = ubuntu("8", host);
        rhel.distro = "rhel".to_string();
        assert!(!p.supported(&rhel));
    }
}
