//! integrun: integration test orchestration across VMs and clusters.
//!
//! A run plans batches of Go integration tests onto OS profiles, brings up
//! one instance per planning unit and the managed stacks the tests talk to,
//! ships the source tree and build artifacts, runs the tests remotely and
//! merges every unit's results into one set of report files.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Planner**: Expands batch definitions into planning units (`planner`)
//! - **State**: Persists provisioned instances and stacks between runs (`state`)
//! - **Provisioners**: Multipass and OGC VMs, kind clusters (`provider`)
//!   and managed stacks (`stack`)
//! - **Transport**: SSH execution and file copy (`transport`)
//! - **Runners**: Per-OS preparation and test execution (`runner`)
//! - **Orchestrator**: Drives the whole pipeline (`orchestrator`)
//! - **Report**: Merges raw output, test events and JUnit (`report`)
//!
//! # Example
//!
//! ```no_run
//! use integrun::config::load_config;
//! use integrun::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("integration.toml"))?;
//!     // ... plan batches, pick provisioners ...
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod define;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod report;
pub mod runner;
pub mod stack;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use config::{RunConfig, load_config};
pub use define::{Batch, OsProfile, OsType};
pub use orchestrator::{Orchestrator, RunError, RunOutcome};
pub use planner::{OsBatch, create_batches};
pub use provider::{Instance, InstanceProvisioner};
pub use report::RunResult;
pub use stack::{Stack, StackProvisioner};
