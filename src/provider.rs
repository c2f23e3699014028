//! Instance provisioners: bringing compute up and tearing it down.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  InstanceProvisioner                        │
//! │                                                             │
//! │  supported(profile) ──► bool                                │
//! │  provision(config, batches) ──► Vec<Instance>               │
//! │  clean(config, instances)                                   │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │ one Instance per OsBatch (Instance.id == OsBatch.id)
//!                                ▼
//!                  StateStore / Orchestrator / Connector
//! ```
//!
//! # Built-in Provisioners
//!
//! | Name | Module | Kind | Notes |
//! |------|--------|------|-------|
//! | `multipass` | [`multipass`] | VM | local VMs, launches serialized |
//! | `ogc` | [`ogc`] | VM | cloud VMs through a containerized CLI, one `up` for all batches |
//! | `kind` | [`kind`] | Cluster | one kind cluster per batch, no SSH |
//!
//! A provisioner returns the instances it managed to create. Batches that
//! end up without an instance are failed individually by the orchestrator,
//! so one bad launch does not abort its siblings.

pub mod kind;
pub mod multipass;
pub mod ogc;
pub mod process;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::define::OsProfile;
use crate::planner::OsBatch;

pub use process::{Tool, ToolOutput};

/// Result type for provisioner operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors raised by instance provisioners.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The configured provisioner name is not known.
    #[error("unknown instance provisioner: {0}")]
    UnknownProvisioner(String),

    /// An external tool could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// An external tool exited non-zero.
    #[error("`{command}` exited with status {status}: {stderr}")]
    Tool {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    /// Tool output did not have the expected shape.
    #[error("unexpected output: {0}")]
    Parse(String),

    /// The provisioning call produced no resources at all.
    #[error("provisioner {0} created no instances")]
    NoInstances(String),

    /// A planning unit could not be mapped to a created resource.
    #[error("no instance was created for batch {0}")]
    Unmapped(String),

    /// Every batch failed to provision.
    #[error("failed to provision {count} batches: {messages}")]
    Batches { count: usize, messages: String },

    /// One or more resources could not be removed.
    #[error("failed to clean {count} instances: {messages}")]
    Cleanup { count: usize, messages: String },

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("failed to build image {image}: {message}")]
    Image { image: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    /// Folds per-item failures into one error.
    pub(crate) fn cleanup(errors: Vec<String>) -> Self {
        ProvisionError::Cleanup {
            count: errors.len(),
            messages: errors.join("; "),
        }
    }

    pub(crate) fn batches(errors: Vec<String>) -> Self {
        ProvisionError::Batches {
            count: errors.len(),
            messages: errors.join("; "),
        }
    }
}

/// A live compute resource hosting one planning unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Name of the provisioner that owns the resource.
    pub provisioner: String,

    /// Planning unit ID this instance serves.
    pub id: String,

    /// Provider-side display name.
    pub name: String,

    #[serde(default)]
    pub ip: String,

    #[serde(default)]
    pub username: String,

    /// Working directory on the instance.
    #[serde(default)]
    pub remote_path: String,

    /// Provisioner-private metadata.
    #[serde(default)]
    pub internal: BTreeMap<String, String>,
}

/// How tests reach an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerKind {
    /// A machine reachable over SSH.
    Vm,
    /// A Kubernetes cluster driven through its API.
    Cluster,
}

/// Brings up and tears down compute for planning units.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProvisionerKind;

    /// Installs the span used for this provisioner's log lines.
    fn set_logger(&mut self, span: tracing::Span);

    /// Whether this provisioner can host `profile`.
    fn supported(&self, profile: &OsProfile) -> bool;

    /// Creates one instance per batch. May return fewer instances than
    /// batches when some launches fail.
    async fn provision(
        &self,
        config: &RunConfig,
        batches: &[OsBatch],
    ) -> ProvisionResult<Vec<Instance>>;

    /// Removes the given instances.
    async fn clean(&self, config: &RunConfig, instances: &[Instance]) -> ProvisionResult<()>;
}

/// Creates the instance provisioner selected by `name`.
pub fn instance_provisioner(
    name: &str,
    config: &RunConfig,
) -> ProvisionResult<Box<dyn InstanceProvisioner>> {
    match name {
        multipass::NAME => Ok(Box::new(multipass::MultipassProvisioner::new(
            config.multipass.clone(),
        ))),
        ogc::NAME => Ok(Box::new(ogc::OgcProvisioner::new(config.ogc.clone())?)),
        kind::NAME => Ok(Box::new(kind::KindProvisioner::new(config.kind.clone())?)),
        other => Err(ProvisionError::UnknownProvisioner(other.to_string())),
    }
}
