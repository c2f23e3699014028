//! Windows Server instances over SSH.
//!
//! The instances are expected to use PowerShell as the OpenSSH default
//! shell, so every command is sent as a PowerShell script line. Elevated
//! ("sudo") packages run the same way since the SSH user is an
//! administrator; only their result names differ.

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
use crate::transport::{READ_CMD_WINDOWS, RemoteShell, TransportError};

const RETRY_INTERVAL: Duration = Duration::from_secs(15);
const GO_BIN: &str = "C:\\Program Files\\Go\\bin";
const SNAPSHOT_NAME: &str = "source.tar";

pub struct WindowsRunner;

impl WindowsRunner {
    pub fn new() -> Self {
        Self
    }

    async fn run_package(
        &self,
        shell: &dyn RemoteShell,
        ctx: &RunContext<'_>,
        package: &BatchPackageTests,
        sudo: bool,
    ) -> RunnerResult<PackageResult> {
        let name = result_name(ctx.prefix, &package.name, sudo);
        let json_path = format!("build\\{}.out.json", name);
        let xml_path = format!("build\\{}.xml", name);
        let script = gotestsum_script(ctx, package, &json_path, &xml_path);

        info!("Running {} {}", package.name, if sudo { "(sudo)" } else { "" });
        debug!("{}", script);
        let output = test_output(shell.exec(&script, &[], None).await)?;

        let json_output = read_result(
            shell,
            &format!("{}\\{}", ctx.remote_path, json_path),
            READ_CMD_WINDOWS,
        )
        .await?;
        let xml_output = read_result(
            shell,
            &format!("{}\\{}", ctx.remote_path, xml_path),
            READ_CMD_WINDOWS,
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

impl Default for WindowsRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Quotes a PowerShell string literal.
pub fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Remote path in the form `scp` expects on Windows targets.
fn scp_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn gotestsum_script(
    ctx: &RunContext<'_>,
    package: &BatchPackageTests,
    json_path: &str,
    xml_path: &str,
) -> String {
    let mut lines = vec![
        format!("Set-Location {}", ps_quote(ctx.remote_path)),
        "New-Item -ItemType Directory -Force build | Out-Null".to_string(),
    ];
    let mut env: Vec<(String, String)> = ctx
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.push(("AGENT_VERSION".to_string(), ctx.agent_version.to_string()));
    env.push(("TEST_DEFINE_PREFIX".to_string(), ctx.prefix.to_string()));
    env.push(("TEST_DEFINE_TESTS".to_string(), test_names(&package.tests)));
    for (key, value) in env {
        lines.push(format!("$env:{} = {}", key, ps_quote(&value)));
    }

    let mut args = vec![
        "--no-color".to_string(),
        "-f".to_string(),
        if ctx.verbose { "standard-verbose" } else { "testname" }.to_string(),
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
    ];
    args.extend(test_flags(ctx.env));
    let args: Vec<String> = args.iter().map(|a| ps_quote(a)).collect();
    lines.push(format!(
        "& {} {}",
        ps_quote(&format!("{}\\gotestsum.exe", GO_BIN)),
        args.join(" ")
    ));
    lines.push("exit $LASTEXITCODE".to_string());
    lines.join("; ")
}

#[async_trait]
impl OsRunner for WindowsRunner {
    async fn prepare(
        &self,
        shell: &dyn RemoteShell,
        arch: Arch,
        go_version: &str,
        cancel: &CancellationToken,
    ) -> RunnerResult<()> {
        info!("Installing Go {}", go_version);
        let url = format!("https://go.dev/dl/go{}.windows-{}.msi", go_version, arch);
        let download = format!(
            "Invoke-WebRequest -UseBasicParsing -Uri {} -OutFile $env:TEMP\\go.msi",
            ps_quote(&url)
        );
        let install = "Start-Process msiexec.exe -Wait -ArgumentList '/I', \"$env:TEMP\\go.msi\", '/quiet'"
            .to_string();
        let gotestsum = format!(
            "$env:GOBIN = {}; & {} install gotest.tools/gotestsum@latest",
            ps_quote(GO_BIN),
            ps_quote(&format!("{}\\go.exe", GO_BIN))
        );
        for script in [download, install, gotestsum] {
            shell
                .exec_with_retry(&script, &[], RETRY_INTERVAL, cancel)
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
        let dist = format!("{}\\build\\distributions", remote_path);
        let reset = format!(
            "Remove-Item -Recurse -Force -ErrorAction SilentlyContinue {}; New-Item -ItemType Directory -Force {} | Out-Null",
            ps_quote(remote_path),
            ps_quote(&dist)
        );
        shell.exec(&reset, &[], None).await?;

        info!("Copying source snapshot");
        let snapshot = format!("{}\\{}", remote_path, SNAPSHOT_NAME);
        shell.copy(archive, &scp_path(&snapshot)).await?;
        let extract = format!(
            "tar -xf {} -C {}; Remove-Item -Force {}",
            ps_quote(&snapshot),
            ps_quote(remote_path),
            ps_quote(&snapshot)
        );
        shell.exec(&extract, &[], None).await?;

        for build in builds {
            for path in [&build.path, &build.sha512_path] {
                let Some(name) = path.file_name() else {
                    continue;
                };
                let dest = format!("{}\\{}", dist, name.to_string_lossy());
                info!("Copying {}", path.display());
                shell.copy(path, &scp_path(&dest)).await?;
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
        for (sudo, packages) in [(false, &ctx.batch.tests), (true, &ctx.batch.sudo_tests)] {
            for package in packages {
                if ctx.cancel.is_cancelled() {
                    return Err(TransportError::Cancelled.into());
                }
                let pkg = self.run_package(shell, ctx, package, sudo).await?;
                if sudo {
                    result.sudo_packages.push(pkg);
                } else {
                    result.packages.push(pkg);
                }
            }
        }
        Ok(result)
    }

    async fn diagnostics(
        &self,
        shell: &dyn RemoteShell,
        remote_path: &str,
        dest: &Path,
    ) -> RunnerResult<()> {
        let dir = format!("{}\\build\\diagnostics", remote_path);
        let listing = match shell
            .exec(&format!("Get-ChildItem -Name {}", ps_quote(&dir)), &[], None)
            .await
        {
            Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
            Err(e) => {
                warn!("No diagnostics in {}: {}", dir, e);
                return Ok(());
            }
        };

        tokio::fs::create_dir_all(dest).await?;
        for name in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let contents =
                read_result(shell, &format!("{}\\{}", dir, name), READ_CMD_WINDOWS).await?;
            tokio::fs::write(dest.join(name), contents).await?;
        }
        Ok(())
    }
}
