//! Persisted record of provisioned instances and created stacks.
//!
//! The state lives in `{state_dir}/state.yml` and lets repeated runs reuse
//! what a previous run already paid for:
//!
//! ```yaml
//! instances:
//!   - provisioner: ogc
//!     id: linux-amd64-ubuntu-2404-default
//!     name: ogc-linux-amd64-ubuntu-2404-default-1a2b
//!     ip: 34.1.2.3
//!     username: ubuntu
//!     remote_path: /home/ubuntu/agent
//!     internal:
//!       instance_id: "8812"
//!     prepared: true
//! stacks:
//!   - id: "8100"
//!     provisioner: stateful
//!     version: 8.10.0
//!     ready: true
//!     ...
//! ```
//!
//! Every mutation rewrites the file before returning, so a crash loses at
//! most the in-flight item. Entries are keyed by `(provisioner, id)`; upserts
//! replace an existing entry with the same key.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::Instance;
use crate::stack::Stack;

/// File name of the state document inside the state directory.
pub const STATE_FILE: &str = "state.yml";

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// An instance plus the one-time setup checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInstance {
    #[serde(flatten)]
    pub instance: Instance,

    /// Host preparation (toolchain install) has completed.
    #[serde(default)]
    pub prepared: bool,
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub instances: Vec<StateInstance>,
    #[serde(default)]
    pub stacks: Vec<Stack>,
}

/// Lock-protected, file-backed [`State`].
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl StateStore {
    /// Loads the state from `state_dir`, starting empty when no file exists.
    pub fn load(state_dir: &Path) -> StateResult<Self> {
        let path = state_dir.join(STATE_FILE);
        debug!("Loading state from {}", path.display());

        let state = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => State::default(),
            Ok(content) => serde_yaml::from_str(&content).map_err(|source| StateError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file, starting empty");
                State::default()
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: path.clone(),
                    source,
                });
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> State {
        self.lock().clone()
    }

    pub fn find_instance(&self, provisioner: &str, id: &str) -> Option<StateInstance> {
        self.lock()
            .instances
            .iter()
            .find(|i| i.instance.provisioner == provisioner && i.instance.id == id)
            .cloned()
    }

    /// Inserts or replaces the instance with the same `(provisioner, id)`,
    /// then saves.
    pub fn upsert_instance(&self, instance: StateInstance) -> StateResult<()> {
        let mut state = self.lock();
        match state.instances.iter_mut().find(|i| {
            i.instance.provisioner == instance.instance.provisioner
                && i.instance.id == instance.instance.id
        }) {
            Some(existing) => *existing = instance,
            None => state.instances.push(instance),
        }
        self.write(&state)
    }

    pub fn find_stack(&self, provisioner: &str, id: &str) -> Option<Stack> {
        self.lock()
            .stacks
            .iter()
            .find(|s| s.provisioner == provisioner && s.id == id)
            .cloned()
    }

    /// Inserts or replaces the stack with the same `(provisioner, id)`, then
    /// saves.
    pub fn upsert_stack(&self, stack: Stack) -> StateResult<()> {
        let mut state = self.lock();
        match state.stacks.iter_mut().find(|s| s.same(&stack)) {
            Some(existing) => *existing = stack,
            None => state.stacks.push(stack),
        }
        self.write(&state)
    }

    /// Empties the state, saves, and returns what was recorded.
    pub fn clear(&self) -> StateResult<State> {
        let mut state = self.lock();
        let taken = std::mem::take(&mut *state);
        self.write(&state)?;
        Ok(taken)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes to a sibling temp file and renames over the real one.
    fn write(&self, state: &State) -> StateResult<()> {
        let content = serde_yaml::to_string(state)?;
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("yml.tmp");
        fs::write(&tmp, content).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;

        debug!(
            "Saved state: {} instances, {} stacks",
            state.instances.len(),
            state.stacks.len()
        );
        Ok(())
    }
}
