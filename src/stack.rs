//! Stack provisioners: shared backing services that tests talk to.
//!
//! A stack is an Elasticsearch + Kibana deployment created through the
//! managed service API. Many planning units may need the same stack
//! version; the orchestrator creates each distinct version once and
//! broadcasts the outcome, so provisioners here only deal with one stack at
//! a time.
//!
//! | Name | Module | Backing API |
//! |------|--------|-------------|
//! | `stateful` | [`stateful`] | deployments |
//! | `serverless` | [`serverless`] | serverless projects |

pub mod client;
pub mod serverless;
pub mod stateful;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EssConfig;

pub use client::EssClient;

pub type StackResult<T> = Result<T, StackError>;

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("unknown stack provisioner: {0}")]
    UnknownProvisioner(String),

    #[error("ess.api_key is required to provision stacks")]
    MissingApiKey,

    /// The service answered with a non-success status.
    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    /// A response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Parse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A shared backing service deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,

    /// Name of the provisioner that owns the stack.
    pub provisioner: String,

    pub version: String,

    /// Set once the stack answered its readiness check.
    #[serde(default)]
    pub ready: bool,

    /// Elasticsearch endpoint.
    #[serde(default)]
    pub elasticsearch: String,

    /// Kibana endpoint.
    #[serde(default)]
    pub kibana: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Provisioner-private metadata, e.g. the remote deployment ID.
    #[serde(default)]
    pub internal: BTreeMap<String, String>,
}

impl Stack {
    /// Identity used for idempotent upserts.
    pub fn same(&self, other: &Stack) -> bool {
        self.provisioner == other.provisioner && self.id == other.id
    }
}

/// What the orchestrator asks a provisioner to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRequest {
    /// Local identifier, stable across runs for the same version.
    pub id: String,
    pub version: String,
}

impl StackRequest {
    /// Request for `version`, identified by the version with dots removed.
    pub fn for_version(version: &str) -> Self {
        Self {
            id: version.replace('.', ""),
            version: version.to_string(),
        }
    }
}

#[async_trait]
pub trait StackProvisioner: Send + Sync {
    fn name(&self) -> &str;

    /// Installs the span used for this provisioner's log lines.
    fn set_logger(&mut self, span: tracing::Span);

    /// Starts creating a stack. The returned stack is not ready yet.
    async fn create(&self, request: &StackRequest) -> StackResult<Stack>;

    /// Blocks until the stack is usable and returns it with `ready` set and
    /// its endpoints filled in.
    async fn wait_for_ready(&self, stack: Stack) -> StackResult<Stack>;

    async fn delete(&self, stack: &Stack) -> StackResult<()>;
}

/// Calls `check` every `interval` until it yields a value, giving up after
/// `limit`. Errors from `check` are logged and retried, except a missing
/// API key which cannot get better.
pub(crate) async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    limit: Duration,
    mut check: F,
) -> StackResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StackResult<Option<T>>>,
{
    let poll = async {
        loop {
            match check().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(StackError::MissingApiKey) => return Err(StackError::MissingApiKey),
                Err(e) => debug!("{} not ready: {}", what, e),
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(limit, poll)
        .await
        .map_err(|_| StackError::Timeout(format!("{} not ready within {:?}", what, limit)))?
}

/// Creates the stack provisioner selected by `name`.
pub fn stack_provisioner(name: &str, config: &EssConfig) -> StackResult<Box<dyn StackProvisioner>> {
    match name {
        stateful::NAME => Ok(Box::new(stateful::StatefulProvisioner::new(config.clone())?)),
        serverless::NAME => Ok(Box::new(serverless::ServerlessProvisioner::new(
            config.clone(),
        )?)),
        other => Err(StackError::UnknownProvisioner(other.to_string())),
    }
}
