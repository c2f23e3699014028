//! Result aggregation and output generation.
//!
//! Every planning unit yields one [`OsRunnerResult`]. [`merge_results`]
//! folds them into a single [`RunResult`] holding three artifacts:
//!
//! | Artifact | File | Merging rule |
//! |----------|------|--------------|
//! | raw log | `TEST-go-integration.out` | each line prefixed with `>>> {package}({batch}){sudo}: ` |
//! | test events | `TEST-go-integration.out.json` | `Package` suffixed with `({batch}){sudo}` |
//! | JUnit | `TEST-go-integration.xml` | suite name suffixed, `batch` and `sudo` properties added |
//!
//! The suffix keeps the same Go package distinct when it ran on several
//! planning units, or both as a normal and an elevated run.

pub mod events;
pub mod junit;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::runner::{OsRunnerResult, PackageResult};

pub use events::{TestEvent, suffix_events};
pub use junit::{JUnitProperty, JUnitTestSuite, JUnitTestSuites, parse_junit, write_junit};

/// Base name of the merged output files.
pub const OUTPUT_BASENAME: &str = "TEST-go-integration";

const SUDO_SUFFIX: &str = "(sudo)";

/// Aggregated results of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    /// Total number of tests reported by the JUnit reports.
    pub tests: u64,

    /// Failures plus errors reported by the JUnit reports.
    pub failures: u64,

    pub output: Vec<u8>,
    pub json_output: Vec<u8>,
    pub xml_output: Vec<u8>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.failures == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Paths of the files written by [`write_outputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub output: PathBuf,
    pub json_output: PathBuf,
    pub xml_output: PathBuf,
}

/// Merges per-batch results, keyed by batch ID.
pub fn merge_results(results: &BTreeMap<String, OsRunnerResult>) -> Result<RunResult> {
    let mut output = Vec::new();
    let mut json_output = Vec::new();
    let mut suites = JUnitTestSuites::default();

    for (batch_id, result) in results {
        let groups = [(&result.packages, false), (&result.sudo_packages, true)];
        for (packages, sudo) in groups {
            let suffix = if sudo { SUDO_SUFFIX } else { "" };
            for package in packages {
                merge_package(
                    batch_id,
                    suffix,
                    sudo,
                    package,
                    &mut output,
                    &mut json_output,
                    &mut suites,
                )?;
            }
        }
    }

    Ok(RunResult {
        tests: suites.tests(),
        failures: suites.failures() + suites.errors(),
        output,
        json_output,
        xml_output: write_junit(&suites)?,
    })
}

fn merge_package(
    batch_id: &str,
    suffix: &str,
    sudo: bool,
    package: &PackageResult,
    output: &mut Vec<u8>,
    json_output: &mut Vec<u8>,
    suites: &mut JUnitTestSuites,
) -> Result<()> {
    let name = format!("{}({}){}", package.name, batch_id, suffix);

    for line in String::from_utf8_lossy(&package.output).lines() {
        writeln!(output, ">>> {}: {}", name, line)?;
    }

    suffix_events(
        &package.json_output,
        &format!("({}){}", batch_id, suffix),
        json_output,
    );

    let parsed = match parse_junit(&package.xml_output) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Skipping unreadable JUnit report of {}: {}", name, e);
            return Ok(());
        }
    };
    for mut suite in parsed.suites {
        suite.name = format!("{}({}){}", suite.name, batch_id, suffix);
        suite.properties.properties.push(JUnitProperty {
            name: "batch".to_string(),
            value: batch_id.to_string(),
        });
        suite.properties.properties.push(JUnitProperty {
            name: "sudo".to_string(),
            value: sudo.to_string(),
        });
        suites.suites.push(suite);
    }
    Ok(())
}

/// Writes the three merged artifacts into `dir`.
pub fn write_outputs(result: &RunResult, dir: &Path) -> Result<OutputPaths> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let paths = OutputPaths {
        output: dir.join(format!("{}.out", OUTPUT_BASENAME)),
        json_output: dir.join(format!("{}.out.json", OUTPUT_BASENAME)),
        xml_output: dir.join(format!("{}.xml", OUTPUT_BASENAME)),
    };
    for (path, data) in [
        (&paths.output, &result.output),
        (&paths.json_output, &result.json_output),
        (&paths.xml_output, &result.xml_output),
    ] {
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(paths)
}

/// Prints the output locations and a pass/fail summary.
pub fn print_summary(result: &RunResult, paths: &OutputPaths) {
    println!();
    println!("Integration test outputs:");
    println!("  Console: {}", paths.output.display());
    println!("  Events:  {}", paths.json_output.display());
    println!("  JUnit:   {}", paths.xml_output.display());
    println!();
    println!("Test Results:");
    println!("  Total:  {}", result.tests);
    println!(
        "  Passed: {}",
        console::style(result.tests.saturating_sub(result.failures)).green()
    );
    println!("  Failed: {}", console::style(result.failures).red());

    println!();
    if result.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}
