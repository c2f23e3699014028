//! OS runners: per-platform preparation and test execution.
//!
//! The orchestrator drives every planning unit through the same sequence:
//! `prepare` (once per instance, persisted), `copy` (every run), `run`, then
//! `diagnostics`. What those steps mean depends on the platform, so each
//! profile names a [`RunnerKind`] and the orchestrator looks the runner up
//! in a [`RunnerSet`].
//!
//! Tests are executed with `gotestsum`, one invocation per Go package, and
//! each invocation yields a [`PackageResult`] holding the raw output, the
//! `go test -json` event stream and the JUnit report.
//!
//! | Kind | Module | Reaches the target through |
//! |------|--------|----------------------------|
//! | `Debian`, `Rhel` | [`linux`] | SSH, POSIX shell |
//! | `Windows` | [`windows`] | SSH, PowerShell |
//! | `Kubernetes` | [`kubernetes`] | local process with `KUBECONFIG` |

pub mod kubernetes;
pub mod linux;
pub mod windows;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::define::{Arch, Batch, BatchPackageTest, Build};
use crate::provider::ProvisionError;
use crate::transport::{RemoteShell, TransportError};

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no runner registered for {0:?}")]
    Missing(RunnerKind),

    /// The runner executes over SSH but was handed no shell.
    #[error("runner requires a remote shell")]
    NoShell,

    #[error("remote execution failed: {0}")]
    Transport(#[from] TransportError),

    #[error("local execution failed: {0}")]
    Local(#[from] ProvisionError),

    /// A result file the test run should have produced is missing.
    #[error("failed to read results {path}: {message}")]
    Results { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Selects the runner implementation for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerKind {
    Debian,
    Rhel,
    Windows,
    Kubernetes,
}

/// Results of one Go package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageResult {
    pub name: String,
    pub output: Vec<u8>,
    pub json_output: Vec<u8>,
    pub xml_output: Vec<u8>,
}

/// Results of one planning unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRunnerResult {
    pub packages: Vec<PackageResult>,
    pub sudo_packages: Vec<PackageResult>,
}

/// Everything a runner needs to execute one planning unit's tests.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub verbose: bool,
    pub agent_version: &'a str,
    /// Prefix for result files and test definitions, unique per unit.
    pub prefix: &'a str,
    pub batch: &'a Batch,
    /// Environment exported to the test processes.
    pub env: &'a BTreeMap<String, String>,
    /// Working directory on the target.
    pub remote_path: &'a str,
    pub cancel: &'a CancellationToken,
}

#[async_trait]
pub trait OsRunner: Send + Sync {
    /// One-time setup of a fresh instance (packages, toolchain).
    async fn prepare(
        &self,
        shell: &dyn RemoteShell,
        arch: Arch,
        go_version: &str,
        cancel: &CancellationToken,
    ) -> RunnerResult<()>;

    /// Ships the source snapshot and the build artifacts.
    async fn copy(
        &self,
        shell: &dyn RemoteShell,
        remote_path: &str,
        archive: &Path,
        builds: &[Build],
    ) -> RunnerResult<()>;

    /// Runs the batch's tests. `shell` is `None` for targets reached
    /// without SSH.
    async fn run(
        &self,
        shell: Option<&dyn RemoteShell>,
        ctx: &RunContext<'_>,
    ) -> RunnerResult<OsRunnerResult>;

    /// Fetches diagnostics the tests left on the target into `dest`.
    async fn diagnostics(
        &self,
        shell: &dyn RemoteShell,
        remote_path: &str,
        dest: &Path,
    ) -> RunnerResult<()>;
}

/// Runner lookup by kind.
#[derive(Clone, Default)]
pub struct RunnerSet {
    runners: HashMap<RunnerKind, Arc<dyn OsRunner>>,
}

impl RunnerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in runners. Kubernetes tests run from `repo_dir`.
    pub fn builtin(repo_dir: &Path) -> Self {
        Self::new()
            .with(RunnerKind::Debian, Arc::new(linux::LinuxRunner::debian()))
            .with(RunnerKind::Rhel, Arc::new(linux::LinuxRunner::rhel()))
            .with(RunnerKind::Windows, Arc::new(windows::WindowsRunner::new()))
            .with(
                RunnerKind::Kubernetes,
                Arc::new(kubernetes::KubernetesRunner::new(repo_dir)),
            )
    }

    pub fn with(mut self, kind: RunnerKind, runner: Arc<dyn OsRunner>) -> Self {
        self.runners.insert(kind, runner);
        self
    }

    pub fn get(&self, kind: RunnerKind) -> RunnerResult<Arc<dyn OsRunner>> {
        self.runners
            .get(&kind)
            .cloned()
            .ok_or(RunnerError::Missing(kind))
    }
}

/// `go test -run` pattern matching exactly the given tests.
pub fn run_pattern(tests: &[BatchPackageTest]) -> String {
    let names: Vec<String> = tests.iter().map(|t| regex::escape(&t.name)).collect();
    format!("^(?:{})$", names.join("|"))
}

/// Base name of a package's result files, e.g.
/// `TEST-go-remote-linux-amd64-ubuntu-2404-default-testing_integration`.
pub fn result_name(prefix: &str, package: &str, sudo: bool) -> String {
    let package: String = package
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let package = package.trim_matches('_');
    format!(
        "TEST-go-remote-{}-{}{}",
        prefix,
        package,
        if sudo { "-sudo" } else { "" }
    )
}

/// Comma separated test names, exported as `TEST_DEFINE_TESTS`.
pub fn test_names(tests: &[BatchPackageTest]) -> String {
    tests
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits `GOTEST_FLAGS` into arguments. Unparseable flags are passed as one.
pub(crate) fn test_flags(env: &BTreeMap<String, String>) -> Vec<String> {
    match env.get("GOTEST_FLAGS").map(String::as_str) {
        None | Some("") => Vec::new(),
        Some(flags) => shell_words::split(flags).unwrap_or_else(|_| vec![flags.to_string()]),
    }
}

/// Output of a command whose non-zero exit means failing tests, not a
/// broken run.
pub(crate) fn test_output(
    result: Result<crate::transport::ExecOutput, TransportError>,
) -> RunnerResult<Vec<u8>> {
    match result {
        Ok(out) => Ok(combined(out.stdout, out.stderr)),
        Err(TransportError::CommandFailed { stdout, stderr, .. }) => Ok(combined(stdout, stderr)),
        Err(e) => Err(e.into()),
    }
}

fn combined(mut stdout: Vec<u8>, stderr: Vec<u8>) -> Vec<u8> {
    if !stderr.is_empty() {
        if !stdout.is_empty() && !stdout.ends_with(b"\n") {
            stdout.push(b'\n');
        }
        stdout.extend(stderr);
    }
    stdout
}

/// Reads one result file from the target.
pub(crate) async fn read_result(
    shell: &dyn RemoteShell,
    path: &str,
    read_cmd: &str,
) -> RunnerResult<Vec<u8>> {
    shell
        .get_file_contents(path, read_cmd)
        .await
        .map_err(|e| RunnerError::Results {
            path: path.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test(name: &str) -> BatchPackageTest {
        BatchPackageTest {
            name: name.to_string(),
            stack: false,
        }
    }

    #[test]
    fn test_run_pattern_anchors_and_escapes() {
        assert_eq!(
            run_pattern(&[test("TestA"), test("TestB/sub.case")]),
            r"^(?:TestA|TestB/sub\.case)$"
        );
        let re = regex::Regex::new(&run_pattern(&[test("TestA")])).unwrap();
        assert!(re.is_match("TestA"));
        assert!(!re.is_match("TestAB"));
    }

    #[test]
    fn test_result_name() {
        assert_eq!(
            result_name("linux-amd64-ubuntu-2404-default", "github.com/elastic/beats/v7/x-pack/metricbeat", false),
            "TEST-go-remote-linux-amd64-ubuntu-2404-default-github_com_elastic_beats_v7_x_pack_metricbeat"
        );
        assert!(result_name("p", "./pkg", true).ends_with("-pkg-sudo"));
    }

    #[test]
    fn test_test_flags() {
        let mut env = BTreeMap::new();
        assert!(test_flags(&env).is_empty());
        env.insert("GOTEST_FLAGS".to_string(), "-count=1 -timeout '30m'".to_string());
        assert_eq!(test_flags(&env), vec!["-count=1", "-timeout", "30m"]);
    }

    #[test]
    fn test_failed_command_is_test_output() {
        let out = test_output(Err(TransportError::CommandFailed {
            command: "gotestsum".to_string(),
            status: 1,
            stdout: b"FAIL TestA".to_vec(),
            stderr: b"exit status 1\n".to_vec(),
        }))
        .unwrap();
        assert_eq!(out, b"FAIL TestA\nexit status 1\n");

        let err = test_output(Err(TransportError::Cancelled)).unwrap_err();
        assert!(matches!(err, RunnerError::Transport(TransportError::Cancelled)));
    }

    #[test]
    fn test_runner_set_lookup() {
        let set = RunnerSet::builtin(Path::new("."));
        assert!(set.get(RunnerKind::Debian).is_ok());
        assert!(set.get(RunnerKind::Kubernetes).is_ok());
        assert!(matches!(
            RunnerSet::new().get(RunnerKind::Windows),
            Err(RunnerError::Missing(RunnerKind::Windows))
        ));
    }

    #[test]
    fn test_names_joined() {
        assert_eq!(test_names(&[test("TestA"), test("TestB")]), "TestA,TestB");
    }
}
