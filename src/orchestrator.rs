//! The run pipeline.
//!
//! ```text
//!   validate ──► prepare (key pair ∥ source snapshot)
//!                   │
//!                   ├──► start stacks ──► one task per distinct version ──► StackBroker
//!                   │                                                         │ publish
//!                   ▼                                                         ▼
//!               provision (unknown batches only) ──► run instances ──► wait_for(stack)
//!                                                        │
//!                                                        ▼
//!                                                  merge_results
//! ```
//!
//! Per planning unit the order is strict: connect, prepare (first time
//! only), copy, wait for the stack, run, diagnostics. Across units nothing
//! is ordered. A failing unit does not cancel its siblings; every unit runs
//! to completion and the failures are reported together with the merged
//! results of the units that succeeded.
//!
//! # Example
//!
//! ```no_run
//! use integrun::config::load_config;
//! use integrun::define::load_batches;
//! use integrun::orchestrator::Orchestrator;
//! use integrun::planner::{create_batches, supported};
//! use integrun::provider::instance_provisioner;
//! use integrun::stack::stack_provisioner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("integration.toml"))?;
//!     let batches = load_batches(&config.batches_file)?;
//!     let planned = create_batches(&batches, &supported(), &config.plan_options()?)?;
//!
//!     let ip = instance_provisioner(&config.instance_provisioner, &config)?;
//!     let sp = stack_provisioner(&config.stack_provisioner, &config.ess)?;
//!     let orchestrator = Orchestrator::new(config, planned, ip, sp)?;
//!
//!     let result = orchestrator.run().await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod archive;
pub mod broker;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::RunConfig;
use crate::define::{Build, builds_for};
use crate::planner::OsBatch;
use crate::provider::{Instance, InstanceProvisioner, ProvisionerKind, kind};
use crate::report::{RunResult, merge_results};
use crate::runner::{OsRunnerResult, RunContext, RunnerSet};
use crate::stack::{StackProvisioner, StackRequest};
use crate::state::{StateInstance, StateStore};
use crate::transport::{Connector, SshConnector, ensure_key_pair};

pub use broker::{BrokerError, StackBroker, StackOutcome};

/// Bound on dialing one instance.
const CONNECT_LIMIT: Duration = Duration::from_secs(10 * 60);

/// Bound on each teardown call during [`Orchestrator::clean`].
const CLEAN_LIMIT: Duration = Duration::from_secs(10 * 60);

pub type RunOutcome = Result<RunResult, RunError>;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Build artifacts the planned batches need are not on disk.
    #[error("missing required builds: {}", .0.join(", "))]
    MissingArtifacts(Vec<String>),

    /// Some planning units failed; `partial` merges the ones that ran.
    #[error("{} batch(es) failed: {}", .failures.len(), summarize(.failures))]
    Instances {
        partial: Box<RunResult>,
        failures: Vec<BatchFailure>,
    },

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Why one planning unit did not produce results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch_id: String,
    pub error: String,
}

fn summarize(failures: &[BatchFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.batch_id, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct Orchestrator {
    config: RunConfig,
    batches: Vec<OsBatch>,
    ip: Box<dyn InstanceProvisioner>,
    sp: Box<dyn StackProvisioner>,
    state: StateStore,
    broker: StackBroker,
    connector: Option<Arc<dyn Connector>>,
    runners: RunnerSet,
    cancel: CancellationToken,
    progress: Option<indicatif::ProgressBar>,
}

impl Orchestrator {
    /// Loads the state from `config.state_dir` and takes ownership of both
    /// provisioners.
    pub fn new(
        config: RunConfig,
        batches: Vec<OsBatch>,
        mut ip: Box<dyn InstanceProvisioner>,
        mut sp: Box<dyn StackProvisioner>,
    ) -> anyhow::Result<Self> {
        let state = StateStore::load(&config.state_dir)?;
        let ip_span = info_span!("provisioner", name = %ip.name());
        ip.set_logger(ip_span);
        let sp_span = info_span!("stack", name = %sp.name());
        sp.set_logger(sp_span);
        let runners = RunnerSet::builtin(&config.repo_dir);

        Ok(Self {
            config,
            batches,
            ip,
            sp,
            state,
            broker: StackBroker::new(),
            connector: None,
            runners,
            cancel: CancellationToken::new(),
            progress: None,
        })
    }

    /// Replaces the SSH connector built from the state directory's key pair.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_runners(mut self, runners: RunnerSet) -> Self {
        self.runners = runners;
        self
    }

    /// Shows a progress bar over the planning units.
    pub fn with_progress(mut self) -> Self {
        let pb = indicatif::ProgressBar::new(0);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        self.progress = Some(pb);
        self
    }

    /// Token that aborts in-progress waits of this orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn batches(&self) -> &[OsBatch] {
        &self.batches
    }

    fn active_batches(&self) -> impl Iterator<Item = &OsBatch> {
        self.batches.iter().filter(|b| !b.skip)
    }

    fn builds(&self, batch: &OsBatch) -> Vec<Build> {
        builds_for(
            &self.config.build_dir,
            &self.config.binary_name,
            &self.config.agent_version,
            batch.profile.os_type,
            batch.profile.arch,
            &self.config.packages,
        )
    }

    /// Lists every build and checksum file that is not on disk.
    pub fn validate(&self) -> Result<(), RunError> {
        let mut required: Vec<&Path> = Vec::new();
        let builds: Vec<Build> = self.active_batches().flat_map(|b| self.builds(b)).collect();
        for build in &builds {
            for path in [build.path.as_path(), build.sha512_path.as_path()] {
                if !required.contains(&path) {
                    required.push(path);
                }
            }
        }
        let missing: Vec<String> = required
            .into_iter()
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RunError::MissingArtifacts(missing))
        }
    }

    /// Stack version each planning unit depends on, by batch ID.
    fn stack_versions(&self) -> BTreeMap<String, String> {
        self.active_batches()
            .filter_map(|b| {
                b.batch.stack.as_ref().map(|stack| {
                    let version = if stack.version.is_empty() {
                        self.config.stack_version.clone()
                    } else {
                        stack.version.clone()
                    };
                    (b.id.clone(), version)
                })
            })
            .collect()
    }

    /// Executes the whole pipeline once.
    pub async fn run(&self) -> RunOutcome {
        for batch in self.batches.iter().filter(|b| b.skip) {
            warn!(
                "Skipping batch {} (group {}): no supported platform for {}",
                batch.id, batch.batch.group, batch.batch.os
            );
        }
        self.validate()?;

        tokio::fs::create_dir_all(&self.config.state_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create state directory {}",
                    self.config.state_dir.display()
                )
            })?;
        let (keys, archive) = tokio::try_join!(
            async {
                ensure_key_pair(&self.config.state_dir)
                    .await
                    .context("Failed to prepare SSH keys")
            },
            archive::create_repo_archive(&self.config.repo_dir, &self.config.state_dir),
        )?;
        let connector: Arc<dyn Connector> = match &self.connector {
            Some(c) => c.clone(),
            None => Arc::new(SshConnector::new(keys.private_key)),
        };

        let stack_versions = self.stack_versions();
        let (_, pipeline) = tokio::join!(
            self.start_stacks(&stack_versions),
            self.provision_and_run(&stack_versions, connector.as_ref(), &archive),
        );
        let (results, failures) = pipeline;

        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }

        let merged = merge_results(&results)?;
        if failures.is_empty() {
            Ok(merged)
        } else {
            Err(RunError::Instances {
                partial: Box::new(merged),
                failures,
            })
        }
    }

    /// Creates each distinct stack version once and publishes the outcome.
    ///
    /// Returns once every stack task settled, so a created stack is always
    /// recorded in the state file before the run returns.
    async fn start_stacks(&self, stack_versions: &BTreeMap<String, String>) {
        let mut versions: Vec<&String> = stack_versions.values().collect();
        versions.sort();
        versions.dedup();

        let tasks = versions.into_iter().map(|version| async move {
            let outcome = tokio::select! {
                outcome = self.provision_stack(version) => outcome,
                _ = self.cancel.cancelled() => Err("run cancelled".to_string()),
            };
            if let Err(e) = &outcome {
                error!("Stack {} failed: {}", version, e);
            }
            if let Err(e) = self.broker.publish(version, outcome) {
                error!("{}", e);
            }
        });
        join_all(tasks).await;
    }

    async fn provision_stack(&self, version: &str) -> StackOutcome {
        let request = StackRequest::for_version(version);
        let mut stack = match self.state.find_stack(self.sp.name(), &request.id) {
            Some(existing) => {
                info!("Reusing stack {} ({})", existing.id, existing.version);
                existing
            }
            None => {
                info!("Creating stack {}", version);
                let created = self.sp.create(&request).await.map_err(|e| e.to_string())?;
                if let Err(e) = self.state.upsert_stack(created.clone()) {
                    error!("Failed to record stack {}, deleting it: {}", created.id, e);
                    if let Err(e) = self.sp.delete(&created).await {
                        error!("Failed to delete stack {}: {}", created.id, e);
                    }
                    return Err(format!("stack {} could not be recorded: {}", created.id, e));
                }
                created
            }
        };

        if !stack.ready {
            stack = self
                .sp
                .wait_for_ready(stack)
                .await
                .map_err(|e| e.to_string())?;
            self.state
                .upsert_stack(stack.clone())
                .map_err(|e| e.to_string())?;
        }
        info!("Stack {} ready at {}", stack.version, stack.kibana);
        Ok(stack)
    }

    async fn provision_and_run(
        &self,
        stack_versions: &BTreeMap<String, String>,
        connector: &dyn Connector,
        archive: &Path,
    ) -> (BTreeMap<String, OsRunnerResult>, Vec<BatchFailure>) {
        let (instances, mut failures) = self.provision().await;
        if let Some(pb) = &self.progress {
            pb.set_length((instances.len() + failures.len()) as u64);
            pb.set_position(failures.len() as u64);
        }

        let by_id: HashMap<&str, &OsBatch> =
            self.active_batches().map(|b| (b.id.as_str(), b)).collect();
        let tasks = instances.into_iter().map(|instance| {
            let batch = by_id.get(instance.instance.id.as_str()).copied();
            let span = info_span!("batch", id = %instance.instance.id);
            async move {
                let id = instance.instance.id.clone();
                let Some(batch) = batch else {
                    return (id.clone(), Err(anyhow!("no batch with ID {}", id)));
                };
                let version = stack_versions.get(&batch.id).map(String::as_str);
                let result = match self.ip.kind() {
                    ProvisionerKind::Vm => {
                        self.run_instance(batch, instance, version, connector, archive)
                            .await
                    }
                    ProvisionerKind::Cluster => {
                        self.run_cluster_instance(batch, &instance.instance, version)
                            .await
                    }
                };
                if let Some(pb) = &self.progress {
                    pb.inc(1);
                }
                (id, result)
            }
            .instrument(span)
        });

        let mut results = BTreeMap::new();
        for (batch_id, outcome) in join_all(tasks).await {
            match outcome {
                Ok(result) => {
                    results.insert(batch_id, result);
                }
                Err(e) => {
                    error!("Batch {} failed: {:#}", batch_id, e);
                    failures.push(BatchFailure {
                        batch_id,
                        error: format!("{:#}", e),
                    });
                }
            }
        }
        (results, failures)
    }

    /// Reuses known instances and provisions the rest in one call.
    async fn provision(&self) -> (Vec<StateInstance>, Vec<BatchFailure>) {
        let mut instances = Vec::new();
        let mut unknown = Vec::new();
        for batch in self.active_batches() {
            match self.state.find_instance(self.ip.name(), &batch.id) {
                Some(existing) => {
                    info!("Reusing instance {} for {}", existing.instance.name, batch.id);
                    instances.push(existing);
                }
                None => unknown.push(batch.clone()),
            }
        }

        let mut failures = Vec::new();
        if unknown.is_empty() {
            return (instances, failures);
        }

        info!("Provisioning {} instance(s) with {}", unknown.len(), self.ip.name());
        let created = match self.ip.provision(&self.config, &unknown).await {
            Ok(created) => created,
            Err(e) => {
                error!("Provisioning failed: {}", e);
                let error = e.to_string();
                failures.extend(unknown.iter().map(|b| BatchFailure {
                    batch_id: b.id.clone(),
                    error: error.clone(),
                }));
                return (instances, failures);
            }
        };

        let mut unrecorded = Vec::new();
        for batch in &unknown {
            match created.iter().find(|i| i.id == batch.id) {
                Some(instance) => {
                    let record = StateInstance {
                        instance: instance.clone(),
                        prepared: false,
                    };
                    match self.state.upsert_instance(record.clone()) {
                        Ok(()) => instances.push(record),
                        Err(e) => {
                            error!("Failed to record instance {}: {}", instance.name, e);
                            failures.push(BatchFailure {
                                batch_id: batch.id.clone(),
                                error: format!(
                                    "instance {} could not be recorded in the state file: {}",
                                    instance.name, e
                                ),
                            });
                            unrecorded.push(instance.clone());
                        }
                    }
                }
                None => failures.push(BatchFailure {
                    batch_id: batch.id.clone(),
                    error: "no instance was created".to_string(),
                }),
            }
        }

        // Nothing could find these again, so tear them down now.
        if !unrecorded.is_empty() {
            warn!("Cleaning {} unrecorded instance(s)", unrecorded.len());
            if let Err(e) = self.ip.clean(&self.config, &unrecorded).await {
                error!("Failed to clean unrecorded instances: {}", e);
            }
        }
        (instances, failures)
    }

    /// Environment shared by every planning unit, with the stack details
    /// when the unit needs one.
    async fn base_env(
        &self,
        batch: &OsBatch,
        stack_version: Option<&str>,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        let mut env = self.config.extra_env.clone();
        if let Some(version) = stack_version {
            info!("Waiting for stack {}", version);
            let limit = self.config.ess.stack_wait_limit();
            let stack = self
                .broker
                .wait_for(&batch.id, version, limit, &self.cancel)
                .await?;
            env.insert("ELASTICSEARCH_HOST".into(), stack.elasticsearch.clone());
            env.insert("ELASTICSEARCH_USERNAME".into(), stack.username.clone());
            env.insert("ELASTICSEARCH_PASSWORD".into(), stack.password.clone());
            env.insert("KIBANA_HOST".into(), stack.kibana.clone());
            env.insert("KIBANA_USERNAME".into(), stack.username.clone());
            env.insert("KIBANA_PASSWORD".into(), stack.password);
            info!(
                "Using stack with Kibana at {}, credentials in {}",
                stack.kibana,
                self.state.path().display()
            );
        }
        env.insert("GOTEST_FLAGS".into(), self.config.test_flags.clone());
        env.insert("TEST_BINARY_NAME".into(), self.config.binary_name.clone());
        Ok(env)
    }

    async fn run_instance(
        &self,
        batch: &OsBatch,
        mut instance: StateInstance,
        stack_version: Option<&str>,
        connector: &dyn Connector,
        archive: &Path,
    ) -> anyhow::Result<OsRunnerResult> {
        let runner_kind = batch
            .runner
            .ok_or_else(|| anyhow!("batch {} has no runner", batch.id))?;
        let runner = self.runners.get(runner_kind)?;
        let name = instance.instance.name.clone();

        info!(
            "Connecting to {}@{} ({})",
            instance.instance.username, instance.instance.ip, name
        );
        let shell = connector
            .connect(&instance.instance, CONNECT_LIMIT, &self.cancel)
            .await
            .with_context(|| format!("failed to connect to instance {}", name))?;

        let result = async {
            if !instance.prepared {
                info!("Preparing instance");
                runner
                    .prepare(
                        shell.as_ref(),
                        batch.profile.arch,
                        &self.config.go_version,
                        &self.cancel,
                    )
                    .await
                    .with_context(|| format!("failed to prepare instance {}", name))?;
                instance.prepared = true;
                if let Err(e) = self.state.upsert_instance(instance.clone()) {
                    warn!("Failed to record {} as prepared: {}", name, e);
                }
            }

            runner
                .copy(
                    shell.as_ref(),
                    &instance.instance.remote_path,
                    archive,
                    &self.builds(batch),
                )
                .await
                .with_context(|| format!("failed to copy files to instance {}", name))?;

            let env = self.base_env(batch, stack_version).await?;
            let ctx = RunContext {
                verbose: self.config.verbose,
                agent_version: &self.config.agent_version,
                prefix: &batch.id,
                batch: &batch.batch,
                env: &env,
                remote_path: &instance.instance.remote_path,
                cancel: &self.cancel,
            };
            let result = runner
                .run(Some(shell.as_ref()), &ctx)
                .await
                .with_context(|| format!("failed to execute tests on instance {}", name))?;

            match &self.config.diagnostics_dir {
                Some(dir) => {
                    let dest = dir.join(&batch.id);
                    if let Err(e) = runner
                        .diagnostics(shell.as_ref(), &instance.instance.remote_path, &dest)
                        .await
                    {
                        warn!("Failed to fetch diagnostics: {}", e);
                    }
                }
                None => info!("Skipping diagnostics, no diagnostics_dir set"),
            }
            Ok::<_, anyhow::Error>(result)
        }
        .await;

        shell.close().await;
        result
    }

    async fn run_cluster_instance(
        &self,
        batch: &OsBatch,
        instance: &Instance,
        stack_version: Option<&str>,
    ) -> anyhow::Result<OsRunnerResult> {
        let runner_kind = batch
            .runner
            .ok_or_else(|| anyhow!("batch {} has no runner", batch.id))?;
        let runner = self.runners.get(runner_kind)?;
        let internal = |key: &str| {
            instance
                .internal
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("instance {} has no {}", instance.name, key))
        };
        let version = internal(kind::VERSION)?;

        let mut env = self.base_env(batch, stack_version).await?;
        env.insert("KUBECONFIG".into(), internal(kind::KUBECONFIG)?);
        env.insert("K8S_VERSION".into(), version.clone());
        env.insert("AGENT_IMAGE".into(), internal(kind::AGENT_IMAGE)?);

        let prefix = format!("{}-{}", version, batch.id);
        let ctx = RunContext {
            verbose: self.config.verbose,
            agent_version: &self.config.agent_version,
            prefix: &prefix,
            batch: &batch.batch,
            env: &env,
            remote_path: &instance.remote_path,
            cancel: &self.cancel,
        };
        runner
            .run(None, &ctx)
            .await
            .with_context(|| format!("failed to execute tests on cluster {}", instance.name))
    }

    /// Tears down everything the state file records, then forgets it.
    ///
    /// The state is cleared first; instance and stack deletions then run
    /// concurrently, each bounded, and their failures are reported together.
    pub async fn clean(&self) -> anyhow::Result<()> {
        let state = self.state.clear()?;
        let instances: Vec<Instance> = state.instances.into_iter().map(|i| i.instance).collect();
        info!(
            "Cleaning {} instance(s) and {} stack(s)",
            instances.len(),
            state.stacks.len()
        );

        let instances_task = async {
            if instances.is_empty() {
                return Ok(());
            }
            match tokio::time::timeout(CLEAN_LIMIT, self.ip.clean(&self.config, &instances)).await
            {
                Ok(res) => res.map_err(|e| e.to_string()),
                Err(_) => Err(format!("cleaning instances timed out after {:?}", CLEAN_LIMIT)),
            }
        };
        let stack_tasks = state.stacks.iter().map(|stack| async move {
            match tokio::time::timeout(CLEAN_LIMIT, self.sp.delete(stack)).await {
                Ok(res) => res.map_err(|e| format!("stack {}: {}", stack.id, e)),
                Err(_) => Err(format!("deleting stack {} timed out", stack.id)),
            }
        });

        let (instances_res, stack_res) = tokio::join!(instances_task, join_all(stack_tasks));
        let errors: Vec<String> = std::iter::once(instances_res)
            .chain(stack_res)
            .filter_map(Result::err)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("clean failed: {}", errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::define::{Arch, Batch, OsProfile, OsRequirement, OsType, StackRequirement};
    use crate::runner::RunnerKind;

    fn batch(id: &str, stack: Option<&str>, skip: bool) -> OsBatch {
        OsBatch {
            id: id.to_string(),
            profile: OsProfile {
                os_type: OsType::Linux,
                arch: Arch::Amd64,
                distro: "ubuntu".to_string(),
                version: "24.04".to_string(),
                docker_variant: String::new(),
            },
            runner: Some(RunnerKind::Debian),
            batch: Batch {
                group: "default".to_string(),
                os: OsRequirement::new(OsType::Linux),
                stack: stack.map(|v| StackRequirement {
                    version: v.to_string(),
                }),
                tests: Vec::new(),
                sudo_tests: Vec::new(),
            },
            skip,
        }
    }

    fn orchestrator(dir: &Path, batches: Vec<OsBatch>) -> Orchestrator {
        let config = RunConfig {
            state_dir: dir.join("state"),
            build_dir: dir.join("build"),
            binary_name: "elastic-agent".to_string(),
            agent_version: "9.1.0".to_string(),
            stack_version: "9.1.0".to_string(),
            packages: vec!["targz".to_string()],
            ..Default::default()
        };
        let ip = crate::provider::instance_provisioner("multipass", &config).unwrap();
        let sp = crate::stack::stack_provisioner("stateful", &config.ess).unwrap();
        Orchestrator::new(config, batches, ip, sp).unwrap()
    }

    #[test]
    fn test_validate_lists_every_missing_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            dir.path(),
            vec![
                batch("a", None, false),
                batch("b", None, false),
                batch("c", None, true),
            ],
        );
        match o.validate() {
            Err(RunError::MissingArtifacts(missing)) => {
                assert_eq!(missing.len(), 2);
                assert!(missing[0].ends_with("elastic-agent-9.1.0-linux-x86_64.tar.gz"));
                assert!(missing[1].ends_with("elastic-agent-9.1.0-linux-x86_64.tar.gz.sha512"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        for name in [
            "elastic-agent-9.1.0-linux-x86_64.tar.gz",
            "elastic-agent-9.1.0-linux-x86_64.tar.gz.sha512",
        ] {
            std::fs::write(dir.path().join("build").join(name), "x").unwrap();
        }
        assert!(o.validate().is_ok());
    }

    #[test]
    fn test_stack_versions_default_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            dir.path(),
            vec![
                batch("a", Some(""), false),
                batch("b", Some("8.10.0"), false),
                batch("c", None, false),
                batch("d", Some("8.10.0"), true),
            ],
        );
        let versions = o.stack_versions();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions["a"], "9.1.0");
        assert_eq!(versions["b"], "8.10.0");
    }

    #[test]
    fn test_instances_error_lists_failures() {
        let err = RunError::Instances {
            partial: Box::default(),
            failures: vec![
                BatchFailure {
                    batch_id: "a".to_string(),
                    error: "connect refused".to_string(),
                },
                BatchFailure {
                    batch_id: "b".to_string(),
                    error: "no instance was created".to_string(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "2 batch(es) failed: a: connect refused; b: no instance was created"
        );
    }

    #[tokio::test]
    async fn test_clean_with_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(dir.path(), Vec::new());
        o.clean().await.unwrap();
        assert!(o.state().snapshot().instances.is_empty());
    }
}
