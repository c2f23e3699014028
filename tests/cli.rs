//! Command line behaviour of the `integrun` binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

const OVERRIDE_VARS: [&str; 11] = [
    "INSTANCE_PROVISIONER",
    "STACK_PROVISIONER",
    "PLATFORMS",
    "PACKAGES",
    "GROUPS",
    "TEST_RUN",
    "TEST_MATRIX",
    "TEST_INTEG_CLEAN_ON_EXIT",
    "TEST_RUN_UNTIL_FAILURE",
    "AGENT_VERSION",
    "STACK_VERSION",
];

fn integrun(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("integrun").unwrap();
    cmd.current_dir(dir);
    for var in OVERRIDE_VARS {
        cmd.env_remove(var);
    }
    cmd
}

const BATCHES: &str = r#"[
  {
    "group": "default",
    "os": {"type": "linux", "arch": "amd64"},
    "tests": [
      {
        "name": "github.com/elastic/elastic-agent/testing/integration",
        "tests": [{"name": "TestInstall"}]
      }
    ]
  },
  {
    "group": "fleet",
    "os": {"type": "linux", "arch": "amd64"},
    "stack": {"version": "8.10.0"},
    "tests": [
      {
        "name": "github.com/elastic/elastic-agent/testing/integration",
        "tests": [{"name": "TestEnroll", "stack": true}]
      }
    ]
  }
]"#;

fn write_project(dir: &Path) {
    std::fs::write(dir.join("batches.json"), BATCHES).unwrap();
    std::fs::write(
        dir.join("integration.toml"),
        r#"
binary_name = "elastic-agent"
agent_version = "9.1.0"
stack_version = "9.1.0"
go_version = "1.22.6"
batches_file = "batches.json"
instance_provisioner = "multipass"
"#,
    )
    .unwrap();
}

#[test]
fn test_missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    integrun(dir.path())
        .args(["--config", "nope.toml", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config from nope.toml"));
}

#[test]
fn test_validate_reports_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("integration.toml"), "binary_name = \"metricbeat\"\n").unwrap();
    integrun(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("agent_version"));
}

#[test]
fn test_validate_valid_project() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    integrun(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Batches: 2 planned, 0 skipped"));
}

#[test]
fn test_batches_prints_plan() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    integrun(dir.path())
        .arg("batches")
        .assert()
        .success()
        .stdout(predicate::str::contains("Planned 2 batches:"))
        .stdout(predicate::str::contains("group fleet"))
        .stdout(predicate::str::contains("stack 8.10.0"));
}

#[test]
fn test_group_override_from_env() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    integrun(dir.path())
        .env("GROUPS", "fleet")
        .arg("batches")
        .assert()
        .success()
        .stdout(predicate::str::contains("Planned 1 batches:"))
        .stdout(predicate::str::contains("group default").not());
}

#[test]
fn test_invalid_platform_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    integrun(dir.path())
        .env("PLATFORMS", "linux/amd64/ubuntu/24.04/extra")
        .arg("validate")
        .assert()
        .failure();
}

#[test]
fn test_batches_prints_skipped_requirement_as_written() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    std::fs::write(
        dir.path().join("batches.json"),
        r#"[{"group": "mac", "os": {"type": "darwin", "version": "14"},
             "tests": [{"name": "pkg", "tests": [{"name": "TestA"}]}]}]"#,
    )
    .unwrap();
    integrun(dir.path())
        .arg("batches")
        .assert()
        .success()
        .stdout(predicate::str::contains("(darwin/*/*/14, group mac) [skipped]"));
}
