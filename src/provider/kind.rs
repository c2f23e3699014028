//! Kubernetes clusters through `kind`.
//!
//! Each Kubernetes planning unit gets its own cluster named after the batch
//! ID. The test binary is compiled once per architecture and baked into an
//! image layered on the agent image of the requested variant; both artifacts
//! are shared across clusters through a [`RunCache`]. Clusters that already
//! exist (from a crashed run) are reused rather than recreated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::image::BuildImageOptions;
use futures::StreamExt;
use futures::future::join_all;
use serde::Deserialize;
use tracing::{Instrument, debug, error, info, warn};

use super::{
    Instance, InstanceProvisioner, ProvisionError, ProvisionResult, ProvisionerKind, Tool,
};
use crate::cache::RunCache;
use crate::config::{KindConfig, RunConfig};
use crate::define::{Arch, OsProfile, OsType};
use crate::planner::OsBatch;

pub const NAME: &str = "kind";

/// `internal` key holding the kubeconfig path.
pub const KUBECONFIG: &str = "config";
/// `internal` key holding the Kubernetes version.
pub const VERSION: &str = "version";
/// `internal` key holding the test image loaded into the cluster.
pub const AGENT_IMAGE: &str = "agent_image";

/// Where the test binary lives inside the test image.
pub const IMAGE_TEST_BINARY: &str = "/usr/share/integration/integration.test";

const CONTROL_PLANE: [&str; 4] = [
    "kube-apiserver",
    "etcd",
    "kube-controller-manager",
    "kube-scheduler",
];
const POLL_INTERVAL: Duration = Duration::from_secs(5);

const CLUSTER_CONFIG: &str = "kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
nodes:
- role: control-plane
";

pub struct KindProvisioner {
    config: KindConfig,
    docker: Docker,
    span: tracing::Span,
    binaries: RunCache<PathBuf>,
    images: RunCache<String>,
}

impl KindProvisioner {
    pub fn new(config: KindConfig) -> ProvisionResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            config,
            docker,
            span: tracing::Span::none(),
            binaries: RunCache::new(),
            images: RunCache::new(),
        })
    }

    fn work_dir(run: &RunConfig) -> PathBuf {
        run.state_dir.join(NAME)
    }

    async fn test_binary(&self, run: &RunConfig, arch: Arch) -> ProvisionResult<PathBuf> {
        self.binaries
            .get_or_try_init(arch.as_str(), || async {
                let dir = Self::work_dir(run);
                tokio::fs::create_dir_all(&dir).await?;
                let dir = tokio::fs::canonicalize(&dir).await?;
                let output = dir.join(format!("integration-{}.test", arch));
                info!("Compiling test binary for linux/{}", arch);
                Tool::new("go")
                    .args(["test", "-c", "-o"])
                    .arg(output.to_string_lossy().into_owned())
                    .arg(self.config.test_package.as_str())
                    .env("GOOS", "linux")
                    .env("GOARCH", arch.as_str())
                    .env("CGO_ENABLED", "0")
                    .current_dir(&run.repo_dir)
                    .stream()
                    .await?;
                Ok(output)
            })
            .await
    }

    async fn test_image(&self, run: &RunConfig, profile: &OsProfile) -> ProvisionResult<String> {
        let key = format!("{}/{}", profile.docker_variant, profile.arch);
        self.images
            .get_or_try_init(&key, || async {
                let binary = self.test_binary(run, profile.arch).await?;
                let base = base_image(
                    &self.config.agent_image,
                    &profile.docker_variant,
                    &run.agent_version,
                );
                let tag = format!("{}-tests", base);
                info!("Building {}", tag);
                self.build_image(&tag, &base, binary, profile.arch).await?;
                Ok(tag)
            })
            .await
    }

    async fn build_image(
        &self,
        tag: &str,
        base: &str,
        binary: PathBuf,
        arch: Arch,
    ) -> ProvisionResult<()> {
        let dockerfile = dockerfile(base);
        let context = tokio::task::spawn_blocking(move || build_context(&dockerfile, &binary))
            .await
            .map_err(anyhow::Error::from)??;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            platform: format!("linux/{}", arch),
            rm: true,
            ..Default::default()
        };
        let mut build = self.docker.build_image(options, None, Some(context.into()));
        while let Some(info) = build.next().await {
            let info = info?;
            if let Some(message) = info.error {
                return Err(ProvisionError::Image {
                    image: tag.to_string(),
                    message,
                });
            }
            if let Some(line) = info.stream.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
                debug!("{}", line);
            }
        }
        Ok(())
    }

    async fn existing_clusters(&self) -> ProvisionResult<Vec<String>> {
        let out = Tool::new("kind").args(["get", "clusters"]).output().await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn wait_for_control_plane(&self, kubeconfig: &Path, name: &str) -> ProvisionResult<()> {
        let limit = Duration::from_secs(self.config.control_plane_timeout_secs);
        let poll = async {
            loop {
                let mut ready = true;
                for component in CONTROL_PLANE {
                    let out = Tool::new("kubectl")
                        .arg("--kubeconfig")
                        .arg(kubeconfig.to_string_lossy().into_owned())
                        .args(["get", "pods", "-n", "kube-system"])
                        .args(["-l", &format!("component={}", component)])
                        .args(["-o", "json"])
                        .output()
                        .await;
                    match out.and_then(|o| pods_ready(&o.stdout)) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("{} not ready yet in {}", component, name);
                            ready = false;
                            break;
                        }
                        Err(e) => {
                            debug!("Checking {} in {}: {}", component, name, e);
                            ready = false;
                            break;
                        }
                    }
                }
                if ready {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(limit, poll).await.map_err(|_| {
            ProvisionError::Timeout(format!(
                "control plane of {} not ready within {:?}",
                name, limit
            ))
        })
    }

    async fn create(&self, run: &RunConfig, batch: &OsBatch) -> ProvisionResult<Instance> {
        let profile = &batch.profile;
        let name = batch.id.as_str();
        let image = self.test_image(run, profile).await?;

        if self.existing_clusters().await?.iter().any(|c| c == name) {
            info!("Reusing cluster {}", name);
        } else {
            info!("Creating cluster {} (kubernetes {})", name, profile.version);
            Tool::new("kind")
                .args(["create", "cluster", "--name", name])
                .args(["--image", &node_image(&self.config.node_image, &profile.version)])
                .args(["--config", "-"])
                .stdin(CLUSTER_CONFIG)
                .stream()
                .await?;
        }

        let kubeconfig = tokio::fs::canonicalize(Self::work_dir(run))
            .await?
            .join(format!("{}.kubeconfig", name));
        let raw = Tool::new("kind")
            .args(["get", "kubeconfig", "--name", name])
            .output()
            .await?;
        tokio::fs::write(&kubeconfig, raw.stdout).await?;

        self.wait_for_control_plane(&kubeconfig, name).await?;

        Tool::new("kind")
            .args(["load", "docker-image", image.as_str(), "--name", name])
            .stream()
            .await?;

        let mut internal = BTreeMap::new();
        internal.insert(KUBECONFIG.to_string(), kubeconfig.to_string_lossy().into_owned());
        internal.insert(VERSION.to_string(), profile.version.clone());
        internal.insert(AGENT_IMAGE.to_string(), image);

        Ok(Instance {
            provisioner: NAME.to_string(),
            id: batch.id.clone(),
            name: name.to_string(),
            ip: String::new(),
            username: String::new(),
            remote_path: String::new(),
            internal,
        })
    }
}

#[async_trait]
impl InstanceProvisioner for KindProvisioner {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::Cluster
    }

    fn set_logger(&mut self, span: tracing::Span) {
        self.span = span;
    }

    fn supported(&self, profile: &OsProfile) -> bool {
        profile.os_type == OsType::Kubernetes && Arch::host() == Some(profile.arch)
    }

    async fn provision(
        &self,
        config: &RunConfig,
        batches: &[OsBatch],
    ) -> ProvisionResult<Vec<Instance>> {
        let results = join_all(
            batches
                .iter()
                .map(|b| self.create(config, b).instrument(self.span.clone())),
        )
        .await;

        let mut instances = Vec::new();
        let mut errors = Vec::new();
        for (batch, result) in batches.iter().zip(results) {
            match result {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    error!(parent: &self.span, "Failed to create cluster {}: {}", batch.id, e);
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
        let deletes = instances.iter().map(|instance| async move {
            info!(parent: &self.span, "Deleting cluster {}", instance.name);
            Tool::new("kind")
                .args(["delete", "cluster", "--name", instance.name.as_str()])
                .output()
                .await
                .map_err(|e| format!("{}: {}", instance.name, e))?;
            if let Some(path) = instance.internal.get(KUBECONFIG) {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!(parent: &self.span, "Failed to remove {}: {}", path, e);
                }
            }
            Ok::<_, String>(())
        });
        let errors: Vec<String> = join_all(deletes)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::cleanup(errors))
        }
    }
}

/// Agent image for a variant; `basic` is the unsuffixed image.
pub fn base_image(repository: &str, variant: &str, version: &str) -> String {
    match variant {
        "" | "basic" => format!("{}:{}", repository, version),
        other => format!("{}-{}:{}", repository, other, version),
    }
}

pub fn node_image(repository: &str, version: &str) -> String {
    format!("{}:v{}", repository, version.trim_start_matches('v'))
}

fn dockerfile(base: &str) -> String {
    format!(
        "FROM {}\nCOPY integration.test {}\n",
        base, IMAGE_TEST_BINARY
    )
}

/// Build context holding the Dockerfile and the test binary.
fn build_context(dockerfile: &str, binary: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
    archive.append_path_with_name(binary, "integration.test")?;
    archive.into_inner()
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

/// True when the list has pods and all of them report `Ready=True`.
fn pods_ready(json: &str) -> ProvisionResult<bool> {
    let list: PodList = serde_json::from_str(json)
        .map_err(|e| ProvisionError::Parse(format!("kubectl get pods: {}", e)))?;
    Ok(!list.items.is_empty()
        && list.items.iter().all(|pod| {
            pod.status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
        }))
}
