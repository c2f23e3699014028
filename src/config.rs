//! Configuration loading for integration runs.
//!
//! The configuration file is TOML; every field has a default so an empty
//! file parses, but [`RunConfig::validate`] rejects runs that are missing
//! required settings before any resource is touched.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads a [`RunConfig`] from a TOML file and expands `~`/`$VAR` in paths.
///
/// # Example
///
/// ```no_run
/// use integrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("integration.toml"))?;
/// println!("State dir: {}", config.state_dir.display());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: RunConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.expand_paths();

    Ok(config)
}

/// Loads a [`RunConfig`] from a TOML string.
///
/// ```
/// use integrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     binary_name = "metricbeat"
///     instance_provisioner = "multipass"
///
///     [multipass]
///     cpus = 4
/// "#)?;
///
/// assert_eq!(config.multipass.cpus, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<RunConfig> {
    let mut config: RunConfig = toml::from_str(content).context("Failed to parse config")?;
    config.expand_paths();

    Ok(config)
}
