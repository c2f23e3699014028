//! Debian and RHEL family instances over SSH.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    OsRunner, OsRunnerResult, PackageResult, RunContext, RunnerError, RunnerResult, read_result,
    result_name, run_pattern, test_flags, test_names, test_output,
};
use crate::define::{Arch, BatchPackageTests, Build};
use crate::transport::{READ_CMD_POSIX, RemoteShell, TransportError, shell_escape};

const RETRY_INTERVAL: Duration = Duration::from_secs(15);
const GOTESTSUM: &str = "gotest.tools/gotestsum@latest";
const SNAPSHOT_NAME: &str = "source.tar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageManager {
    Apt,
    Dnf,
}

pub struct LinuxRunner {
    manager: PackageManager,
}

impl LinuxRunner {
    pub fn debian() -> Self {
        Self {
            manager: PackageManager::Apt,
        }
    }

    pub fn rhel() -> Self {
        Self {
            manager: PackageManager::Dnf,
        }
    }

    fn install_commands(&self) -> Vec<Vec<&'static str>> {
        match self.manager {
            PackageManager::Apt => vec![
                vec!["sudo", "apt-get", "update"],
                vec![
                    "sudo",
                    "DEBIAN_FRONTEND=noninteractive",
                    "apt-get",
                    "install",
                    "-y",
                    "build-essential",
                    "curl",
                    "git",
                    "tar",
                    "unzip",
                ],
            ],
            PackageManager::Dnf => vec![vec![
                "sudo", "dnf", "install", "-y", "make", "gcc", "curl", "git", "tar", "unzip",
            ]],
        }
    }

    async fn run_package(
        &self,
        shell: &dyn RemoteShell,
        ctx: &RunContext<'_>,
        package: &BatchPackageTests,
        sudo: bool,
    ) -> RunnerResult<PackageResult> {
        let name = result_name(ctx.prefix, &package.name, sudo);
        let json_path = format!("build/{}.out.json", name);
        let xml_path = format!("build/{}.xml", name);
        let line = gotestsum_line(ctx, package, sudo, &json_path, &xml_path);

        info!("Running {} {}", package.name, if sudo { "(sudo)" } else { "" });
        debug!("{}", line);
        let output = test_output(shell.exec(&line, &[], None).await)?;

        let json_output = read_result(
            shell,
            &format!("{}/{}", ctx.remote_path, json_path),
            READ_CMD_POSIX,
        )
        .await?;
        let xml_output = read_result(
            shell,
            &format!("{}/{}", ctx.remote_path, xml_path),
            READ_CMD_POSIX,
        )
        .await?;

        Ok(PackageResult {
            name: package.name.clone(),
            output,
            json_output,
            xml_output,
        })
    }
}

/// Full POSIX command line running one package's tests from the working
/// directory.
fn gotestsum_line(
    ctx: &RunContext<'_>,
    package: &BatchPackageTests,
    sudo: bool,
    json_path: &str,
    xml_path: &str,
) -> String {
    let mut env: Vec<String> = ctx
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.push(format!("AGENT_VERSION={}", ctx.agent_version));
    env.push(format!("TEST_DEFINE_PREFIX={}", ctx.prefix));
    env.push(format!("TEST_DEFINE_TESTS={}", test_names(&package.tests)));

    let mut args: Vec<String> = Vec::new();
    if sudo {
        args.extend(["sudo", "-E"].map(String::from));
    }
    args.push("env".to_string());
    args.extend(env);
    args.extend(["/usr/local/bin/gotestsum", "--no-color", "-f"].map(String::from));
    args.push(if ctx.verbose { "standard-verbose" } else { "testname" }.to_string());
    args.extend([
        "--jsonfile".to_string(),
        json_path.to_string(),
        "--junitfile".to_string(),
        xml_path.to_string(),
        "--".to_string(),
        "-tags".to_string(),
        "integration".to_string(),
        "-run".to_string(),
        run_pattern(&package.tests),
        package.name.clone(),
    ]);
    args.extend(test_flags(ctx.env));

    let mut line = format!("cd {} && mkdir -p build && ", shell_escape(ctx.remote_path));
    line.push_str(
        &args
            .iter()
            .map(|a| shell_escape(a))
            .collect::<Vec<_>>()
            .join(" "),
    );
    line
}

fn file_name(path: &Path) -> RunnerResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            ))
        })
}

#[async_trait]
impl OsRunner for LinuxRunner {
    async fn prepare(
        &self,
        shell: &dyn RemoteShell,
        arch: Arch,
        go_version: &str,
        cancel: &CancellationToken,
    ) -> RunnerResult<()> {
        for cmd in self.install_commands() {
            let args: Vec<String> = cmd[1..].iter().map(|s| s.to_string()).collect();
            shell
                .exec_with_retry(cmd[0], &args, RETRY_INTERVAL, cancel)
                .await?;
        }

        info!("Installing Go {}", go_version);
        let url = format!("https://go.dev/dl/go{}.linux-{}.tar.gz", go_version, arch);
        let steps: [&[&str]; 5] = [
            &["curl", "-fsSL", "-o", "/tmp/go.tar.gz", url.as_str()],
            &["sudo", "rm", "-rf", "/usr/local/go"],
            &["sudo", "tar", "-C", "/usr/local", "-xzf", "/tmp/go.tar.gz"],
            &["sudo", "ln", "-sf", "/usr/local/go/bin/go", "/usr/bin/go"],
            &[
                "sudo",
                "env",
                "GOBIN=/usr/local/bin",
                "/usr/local/go/bin/go",
                "install",
                GOTESTSUM,
            ],
        ];
        for step in steps {
            let args: Vec<String> = step[1..].iter().map(|s| s.to_string()).collect();
            shell
                .exec_with_retry(step[0], &args, RETRY_INTERVAL, cancel)
                .await?;
        }
        Ok(())
    }

    async fn copy(
        &self,
        shell: &dyn RemoteShell,
        remote_path: &str,
        archive: &Path,
        builds: &[Build],
    ) -> RunnerResult<()> {
        let dist = format!("{}/build/distributions", remote_path);
        shell
            .exec("rm", &["-rf".to_string(), remote_path.to_string()], None)
            .await?;
        shell
            .exec("mkdir", &["-p".to_string(), dist.clone()], None)
            .await?;

        info!("Copying source snapshot");
        let snapshot = format!("{}/{}", remote_path, SNAPSHOT_NAME);
        shell.copy(archive, &snapshot).await?;
        let extract = [
            "-xf".to_string(),
            snapshot.clone(),
            "-C".to_string(),
            remote_path.to_string(),
        ];
        shell.exec("tar", &extract, None).await?;
        shell.exec("rm", &["-f".to_string(), snapshot], None).await?;

        for build in builds {
            for path in [&build.path, &build.sha512_path] {
                let dest = format!("{}/{}", dist, file_name(path)?);
                info!("Copying {}", path.display());
                shell.copy(path, &dest).await?;
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        shell: Option<&dyn RemoteShell>,
        ctx: &RunContext<'_>,
    ) -> RunnerResult<OsRunnerResult> {
        let shell = shell.ok_or(RunnerError::NoShell)?;
        let mut result = OsRunnerResult::default();
        for package in &ctx.batch.tests {
            if ctx.cancel.is_cancelled() {
                return Err(TransportError::Cancelled.into());
            }
            result
                .packages
                .push(self.run_package(shell, ctx, package, false).await?);
        }
        for package in &ctx.batch.sudo_tests {
            if ctx.cancel.is_cancelled() {
                return Err(TransportError::Cancelled.into());
            }
            result
                .sudo_packages
                .push(self.run_package(shell, ctx, package, true).await?);
        }
        Ok(result)
    }

    async fn diagnostics(
        &self,
        shell: &dyn RemoteShell,
        remote_path: &str,
        dest: &Path,
    ) -> RunnerResult<()> {
        let dir = format!("{}/build/diagnostics", remote_path);
        let listing = shell
            .exec("ls", &["-1".to_string(), dir.clone()], None)
            .await;
        let listing = match listing {
            Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
            Err(e) => {
                warn!("No diagnostics in {}: {}", dir, e);
                return Ok(());
            }
        };

        tokio::fs::create_dir_all(dest).await?;
        for name in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let contents = read_result(shell, &format!("{}/{}", dir, name), READ_CMD_POSIX).await?;
            tokio::fs::write(dest.join(name), contents).await?;
        }
        Ok(())
    }
}
