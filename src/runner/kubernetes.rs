//! Kubernetes planning units, executed from the local checkout.
//!
//! The cluster was prepared by the provisioner; tests only need its
//! kubeconfig and the test image, both passed in the environment. There is
//! nothing to prepare or copy, and results are read from local files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    OsRunner, OsRunnerResult, PackageResult, RunContext, RunnerError, RunnerResult, result_name,
    run_pattern, test_flags, test_names,
};
use crate::define::{Arch, BatchPackageTests, Build};
use crate::provider::Tool;
use crate::transport::{RemoteShell, TransportError};

pub struct KubernetesRunner {
    repo_dir: PathBuf,
}

impl KubernetesRunner {
    pub fn new(repo_dir: &Path) -> Self {
        Self {
            repo_dir: repo_dir.to_path_buf(),
        }
    }

    fn command(
        &self,
        ctx: &RunContext<'_>,
        package: &BatchPackageTests,
        json_path: &Path,
        xml_path: &Path,
    ) -> Tool {
        let mut tool = Tool::new("gotestsum")
            .args(["--no-color", "-f"])
            .arg(if ctx.verbose { "standard-verbose" } else { "testname" })
            .arg("--jsonfile")
            .arg(json_path.to_string_lossy().into_owned())
            .arg("--junitfile")
            .arg(xml_path.to_string_lossy().into_owned())
            .args(["--", "-tags", "integration,kubernetes", "-run"])
            .arg(run_pattern(&package.tests))
            .arg(package.name.as_str())
            .args(test_flags(ctx.env))
            .current_dir(&self.repo_dir)
            .env("AGENT_VERSION", ctx.agent_version)
            .env("TEST_DEFINE_PREFIX", ctx.prefix)
            .env("TEST_DEFINE_TESTS", test_names(&package.tests));
        for (key, value) in ctx.env {
            tool = tool.env(key.as_str(), value.as_str());
        }
        tool
    }

    async fn run_package(
        &self,
        ctx: &RunContext<'_>,
        package: &BatchPackageTests,
        sudo: bool,
    ) -> RunnerResult<PackageResult> {
        let build_dir = self.repo_dir.join("build");
        tokio::fs::create_dir_all(&build_dir).await?;
        let name = result_name(ctx.prefix, &package.name, sudo);
        let json_path = build_dir.join(format!("{}.out.json", name));
        let xml_path = build_dir.join(format!("{}.xml", name));

        info!("Running {} against {}", package.name, ctx.prefix);
        let (_, out) = self
            .command(ctx, package, &json_path, &xml_path)
            .output_unchecked()
            .await?;
        let mut output = out.stdout.into_bytes();
        output.extend(out.stderr.into_bytes());

        Ok(PackageResult {
            name: package.name.clone(),
            output,
            json_output: read_local(&json_path).await?,
            xml_output: read_local(&xml_path).await?,
        })
    }
}

async fn read_local(path: &Path) -> RunnerResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| RunnerError::Results {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl OsRunner for KubernetesRunner {
    async fn prepare(
        &self,
        _shell: &dyn RemoteShell,
        _arch: Arch,
        _go_version: &str,
        _cancel: &CancellationToken,
    ) -> RunnerResult<()> {
        Ok(())
    }

    async fn copy(
        &self,
        _shell: &dyn RemoteShell,
        _remote_path: &str,
        _archive: &Path,
        _builds: &[Build],
    ) -> RunnerResult<()> {
        Ok(())
    }

    async fn run(
        &self,
        _shell: Option<&dyn RemoteShell>,
        ctx: &RunContext<'_>,
    ) -> RunnerResult<OsRunnerResult> {
        let mut result = OsRunnerResult::default();
        for package in &ctx.batch.tests {
            if ctx.cancel.is_cancelled() {
                return Err(TransportError::Cancelled.into());
            }
            result.packages.push(self.run_package(ctx, package, false).await?);
        }
        for package in &ctx.batch.sudo_tests {
            if ctx.cancel.is_cancelled() {
                return Err(TransportError::Cancelled.into());
            }
            result
                .sudo_packages
                .push(self.run_package(ctx, package, true).await?);
        }
        Ok(result)
    }

    async fn diagnostics(
        &self,
        _shell: &dyn RemoteShell,
        _remote_path: &str,
        _dest: &Path,
    ) -> RunnerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::define::{Batch, BatchPackageTest, OsRequirement, OsType};

    #[test]
    fn test_command_line() {
        let runner = KubernetesRunner::new(Path::new("/src/agent"));
        let batch = Batch {
            group: "kubernetes".to_string(),
            os: OsRequirement::new(OsType::Kubernetes),
            stack: None,
            tests: vec![BatchPackageTests {
                name: "./testing/integration".to_string(),
                tests: vec![BatchPackageTest {
                    name: "TestKubernetesAgentStandalone".to_string(),
                    stack: true,
                }],
            }],
            sudo_tests: Vec::new(),
        };
        let env = BTreeMap::from([("KUBECONFIG".to_string(), "/tmp/k.kubeconfig".to_string())]);
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            verbose: false,
            agent_version: "9.1.0",
            prefix: "1.31.0-kubernetes-amd64-1310-basic-kubernetes",
            batch: &batch,
            env: &env,
            remote_path: "",
            cancel: &cancel,
        };
        let tool = runner.command(
            &ctx,
            &batch.tests[0],
            Path::new("/src/agent/build/x.out.json"),
            Path::new("/src/agent/build/x.xml"),
        );
        let display = tool.display();
        assert!(display.starts_with("gotestsum --no-color -f testname --jsonfile"));
        assert!(display.contains("-tags integration,kubernetes -run"));
        assert!(display.ends_with("./testing/integration"));
    }

    #[tokio::test]
    async fn test_missing_results_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_local(&dir.path().join("nope.xml")).await.unwrap_err();
        assert!(matches!(err, RunnerError::Results { .. }));
    }
}
