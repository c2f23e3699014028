//! Configuration schema for an integration run.
//!
//! ```text
//! RunConfig (root)
//! ├── run settings      - build artifacts, versions, filters, timeouts
//! ├── MultipassConfig   - [multipass] local VM sizing
//! ├── OgcConfig         - [ogc] cloud VM CLI image and credentials
//! ├── KindConfig        - [kind] cluster images and readiness bounds
//! └── EssConfig         - [ess] managed stack API endpoint and key
//! ```
//!
//! The configuration is frozen once the run starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::planner::{PlanOptions, PlanResult, parse_platform};

/// Root configuration for one orchestration run.
///
/// # Example
///
/// ```toml
/// binary_name = "elastic-agent"
/// agent_version = "9.1.0-SNAPSHOT"
/// stack_version = "9.1.0-SNAPSHOT"
/// go_version = "1.22.6"
/// instance_provisioner = "multipass"
/// platforms = ["linux/amd64"]
///
/// [extra_env]
/// AGENT_KEEP_INSTALLED = "true"
///
/// [ess]
/// api_key = "..."
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Directory holding the state file, SSH keys and the source snapshot.
    ///
    /// Default: `.integration-cache`
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory holding the packaged builds under test.
    ///
    /// Default: `build/distributions`
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,

    /// Repository root that is snapshotted and shipped to instances.
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,

    /// JSON file with the batch definitions.
    #[serde(default = "default_batches_file")]
    pub batches_file: PathBuf,

    /// Name of the binary under test, e.g. `elastic-agent` or `metricbeat`.
    #[serde(default)]
    pub binary_name: String,

    #[serde(default)]
    pub agent_version: String,

    /// Stack version used by batches that do not pin one.
    #[serde(default)]
    pub stack_version: String,

    /// Go toolchain installed on instances during preparation.
    #[serde(default)]
    pub go_version: String,

    /// Platform filters, see [`parse_platform`].
    #[serde(default)]
    pub platforms: Vec<String>,

    /// Package formats to test (`targz`, `zip`, `rpm`, `deb`).
    #[serde(default)]
    pub packages: Vec<String>,

    #[serde(default)]
    pub groups: Vec<String>,

    /// Expand each batch across every matching profile.
    #[serde(default)]
    pub matrix: bool,

    /// Only run this test.
    #[serde(default)]
    pub single_test: Option<String>,

    /// Extra flags passed to `go test`, exported as `GOTEST_FLAGS`.
    #[serde(default)]
    pub test_flags: String,

    /// Where per-batch diagnostics are collected. Disabled when unset.
    #[serde(default)]
    pub diagnostics_dir: Option<PathBuf>,

    #[serde(default)]
    pub verbose: bool,

    /// Environment added to every test run.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,

    /// Overall deadline for a run.
    ///
    /// Default: 7200 (2 hours)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// One of `multipass`, `ogc`, `kind`.
    #[serde(default = "default_instance_provisioner")]
    pub instance_provisioner: String,

    /// One of `stateful`, `serverless`.
    #[serde(default = "default_stack_provisioner")]
    pub stack_provisioner: String,

    #[serde(default)]
    pub multipass: MultipassConfig,

    #[serde(default)]
    pub ogc: OgcConfig,

    #[serde(default)]
    pub kind: KindConfig,

    #[serde(default)]
    pub ess: EssConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".integration-cache")
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("build/distributions")
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_batches_file() -> PathBuf {
    PathBuf::from("testing/integration/batches.json")
}

fn default_run_timeout() -> u64 {
    2 * 60 * 60
}

fn default_instance_provisioner() -> String {
    "ogc".to_string()
}

fn default_stack_provisioner() -> String {
    "stateful".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            build_dir: default_build_dir(),
            repo_dir: default_repo_dir(),
            batches_file: default_batches_file(),
            binary_name: String::new(),
            agent_version: String::new(),
            stack_version: String::new(),
            go_version: String::new(),
            platforms: Vec::new(),
            packages: Vec::new(),
            groups: Vec::new(),
            matrix: false,
            single_test: None,
            test_flags: String::new(),
            diagnostics_dir: None,
            verbose: false,
            extra_env: BTreeMap::new(),
            run_timeout_secs: default_run_timeout(),
            instance_provisioner: default_instance_provisioner(),
            stack_provisioner: default_stack_provisioner(),
            multipass: MultipassConfig::default(),
            ogc: OgcConfig::default(),
            kind: KindConfig::default(),
            ess: EssConfig::default(),
        }
    }
}

impl RunConfig {
    /// Rejects configurations missing required fields.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("binary_name", &self.binary_name),
            ("agent_version", &self.agent_version),
            ("stack_version", &self.stack_version),
            ("go_version", &self.go_version),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            bail!("missing required config fields: {}", missing.join(", "));
        }
        if self.build_dir.as_os_str().is_empty() {
            bail!("missing required config field: build_dir");
        }
        if self.instance_provisioner == "ogc" && self.ogc.service_token_path.as_os_str().is_empty()
        {
            bail!("ogc.service_token_path is required by the ogc provisioner");
        }
        for platform in &self.platforms {
            parse_platform(platform)?;
        }
        Ok(())
    }

    /// Rejects runs that need a managed stack without an API key.
    pub fn validate_stack_access(&self, needs_stack: bool) -> Result<()> {
        if needs_stack && self.ess.api_key.trim().is_empty() {
            bail!(
                "ess.api_key is required by the {} stack provisioner",
                self.stack_provisioner
            );
        }
        Ok(())
    }

    /// Planner filters derived from this configuration.
    pub fn plan_options(&self) -> PlanResult<PlanOptions> {
        Ok(PlanOptions {
            platforms: self
                .platforms
                .iter()
                .map(|p| parse_platform(p))
                .collect::<PlanResult<_>>()?,
            groups: self.groups.clone(),
            matrix: self.matrix,
            single_test: self.single_test.clone().filter(|t| !t.is_empty()),
        })
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Expands `~` and environment variables in every path field.
    pub fn expand_paths(&mut self) {
        expand(&mut self.state_dir);
        expand(&mut self.build_dir);
        expand(&mut self.repo_dir);
        expand(&mut self.batches_file);
        expand(&mut self.ogc.service_token_path);
        if let Some(dir) = self.diagnostics_dir.as_mut() {
            expand(dir);
        }
    }
}

fn expand(path: &mut PathBuf) {
    let raw = path.to_string_lossy().into_owned();
    match shellexpand::full(&raw) {
        Ok(expanded) => *path = PathBuf::from(expanded.as_ref()),
        Err(e) => tracing::warn!("Leaving path {} unexpanded: {}", raw, e),
    }
}

/// `[multipass]` local VM sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultipassConfig {
    #[serde(default = "default_cpus")]
    pub cpus: u32,

    #[serde(default = "default_disk")]
    pub disk: String,

    #[serde(default = "default_memory")]
    pub memory: String,

    /// Bound on a single `multipass launch`.
    ///
    /// Default: 300
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
}

fn default_cpus() -> u32 {
    2
}

fn default_disk() -> String {
    "50G".to_string()
}

fn default_memory() -> String {
    "4G".to_string()
}

fn default_launch_timeout() -> u64 {
    300
}

impl Default for MultipassConfig {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            disk: default_disk(),
            memory: default_memory(),
            launch_timeout_secs: default_launch_timeout(),
        }
    }
}

/// `[ogc]` containerized cloud VM CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OgcConfig {
    /// Image with the CLI as entrypoint.
    #[serde(default = "default_ogc_image")]
    pub image: String,

    /// Service account token mounted into the CLI container.
    #[serde(default)]
    pub service_token_path: PathBuf,

    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    /// Labels attached to every machine.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_ogc_image() -> String {
    "docker.elastic.co/observability-ci/ogc:5.0.1".to_string()
}

fn default_datacenter() -> String {
    "us-central1-a".to_string()
}

impl Default for OgcConfig {
    fn default() -> Self {
        Self {
            image: default_ogc_image(),
            service_token_path: PathBuf::new(),
            datacenter: default_datacenter(),
            labels: BTreeMap::new(),
        }
    }
}

impl OgcConfig {
    /// Region derived from the datacenter, e.g. `us-central1`.
    pub fn region(&self) -> &str {
        match self.datacenter.rfind('-') {
            Some(idx) => &self.datacenter[..idx],
            None => &self.datacenter,
        }
    }

    pub fn token_path(&self) -> &Path {
        &self.service_token_path
    }
}

/// `[kind]` Kubernetes-in-docker clusters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KindConfig {
    /// Repository of the agent image the test image is built on.
    #[serde(default = "default_agent_image")]
    pub agent_image: String,

    #[serde(default = "default_node_image")]
    pub node_image: String,

    /// Go package compiled into the test image.
    #[serde(default = "default_test_package")]
    pub test_package: String,

    /// Bound on waiting for control-plane pods.
    ///
    /// Default: 300
    #[serde(default = "default_control_plane_timeout")]
    pub control_plane_timeout_secs: u64,
}

fn default_agent_image() -> String {
    "docker.elastic.co/beats/elastic-agent".to_string()
}

fn default_node_image() -> String {
    "kindest/node".to_string()
}

fn default_test_package() -> String {
    "./testing/integration".to_string()
}

fn default_control_plane_timeout() -> u64 {
    300
}

impl Default for KindConfig {
    fn default() -> Self {
        Self {
            agent_image: default_agent_image(),
            node_image: default_node_image(),
            test_package: default_test_package(),
            control_plane_timeout_secs: default_control_plane_timeout(),
        }
    }
}

/// `[ess]` managed stack API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EssConfig {
    #[serde(default = "default_ess_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_ess_region")]
    pub region: String,

    /// Deployment template used by stateful stacks.
    #[serde(default = "default_deployment_template")]
    pub deployment_template: String,

    /// Project type used by serverless stacks.
    #[serde(default = "default_project_type")]
    pub project_type: String,

    /// Bound on waiting for a stack to become ready.
    ///
    /// Default: 600
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_ess_url() -> String {
    "https://cloud.elastic.co".to_string()
}

fn default_ess_region() -> String {
    "gcp-us-central1".to_string()
}

fn default_deployment_template() -> String {
    "gcp-storage-optimized".to_string()
}

fn default_project_type() -> String {
    "observability".to_string()
}

fn default_ready_timeout() -> u64 {
    600
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for EssConfig {
    fn default() -> Self {
        Self {
            base_url: default_ess_url(),
            api_key: String::new(),
            region: default_ess_region(),
            deployment_template: default_deployment_template(),
            project_type: default_project_type(),
            ready_timeout_secs: default_ready_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Time a stack may spend being created before readiness polling starts.
pub const STACK_CREATE_MARGIN: Duration = Duration::from_secs(2 * 60);

impl EssConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Bound on a planning unit waiting for its stack: creation plus the
    /// readiness timeout, so a waiter never gives up before the producer.
    pub fn stack_wait_limit(&self) -> Duration {
        self.ready_timeout() + STACK_CREATE_MARGIN
    }
}
