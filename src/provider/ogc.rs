//! Cloud VMs through the containerized `ogc` CLI.
//!
//! Provisioning is a single `up` for the whole batch set:
//!
//! 1. pull the CLI image (bollard)
//! 2. `layout import`: one layout per batch, YAML on stdin, each labelled
//!    with a fresh run tag
//! 3. `up` with the run tag
//! 4. `ls --as-yaml`, keeping machines carrying our run tag and mapping them
//!    back to batches by layout name
//!
//! Every CLI call is a throwaway container created through the Docker API.
//! The CLI keeps its own database under `state_dir/ogc`, mounted into every
//! container, so `down` in a later invocation finds machines from an
//! earlier one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerConfig,
    CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::{Instance, InstanceProvisioner, ProvisionError, ProvisionResult, ProvisionerKind};
use crate::config::{OgcConfig, RunConfig};
use crate::define::{Arch, OsProfile, OsType};
use crate::planner::OsBatch;
use crate::transport::keys::{PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};

pub const NAME: &str = "ogc";

const RUN_TAG_LABEL: &str = "run_tag";
const INSTANCE_ID: &str = "instance_id";
const CONTAINER_TOKEN: &str = "/root/token.json";
const CONTAINER_KEYS: &str = "/root/.ssh";
const CONTAINER_DB: &str = "/root/.ogc";

pub struct OgcProvisioner {
    config: OgcConfig,
    docker: Docker,
    span: tracing::Span,
}

/// One entry of the layout document fed to `layout import`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub name: String,
    pub provider: String,
    pub instance_size: String,
    pub runs_on: String,
    pub remote_path: String,
    pub username: String,
    pub ssh_private_key: String,
    pub ssh_public_key: String,
    pub ports: Vec<String>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// One record of `ls --as-yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub instance_state: String,
    #[serde(default)]
    pub public_ip: String,
    pub layout: MachineLayout,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineLayout {
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub remote_path: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ServiceToken {
    project_id: String,
}

impl OgcProvisioner {
    pub fn new(config: OgcConfig) -> ProvisionResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            config,
            docker,
            span: tracing::Span::none(),
        })
    }

    async fn pull(&self) -> ProvisionResult<()> {
        info!(parent: &self.span, "Pulling {}", self.config.image);
        let options = CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            if let Some(status) = update?.status {
                debug!(parent: &self.span, "{}", status);
            }
        }
        Ok(())
    }

    /// Runs the CLI with `args` in a fresh container and returns its stdout.
    /// With `echo`, output lines are logged as they arrive.
    async fn cli(
        &self,
        state_dir: &Path,
        project: &str,
        args: &[&str],
        stdin: Option<String>,
        echo: bool,
    ) -> ProvisionResult<String> {
        let command = format!("{} {}", NAME, args.join(" "));
        let config = container_config(&self.config, state_dir, project, args, stdin.is_some());
        let id = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?
            .id;
        debug!(parent: &self.span, "Running `{}` in container {}", command, id);

        let result = self.run_container(&id, &command, stdin, echo).await;

        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(&id, Some(remove)).await {
            warn!(parent: &self.span, "Failed to remove container {}: {}", id, e);
        }
        result
    }

    async fn run_container(
        &self,
        id: &str,
        command: &str,
        stdin: Option<String>,
        echo: bool,
    ) -> ProvisionResult<String> {
        let attach = AttachContainerOptions::<String> {
            stdin: Some(stdin.is_some()),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults {
            mut output,
            mut input,
        } = self.docker.attach_container(id, Some(attach)).await?;
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        if let Some(document) = stdin {
            input.write_all(document.as_bytes()).await?;
            input.shutdown().await?;
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = output.next().await {
            let (buf, message) = match chunk? {
                LogOutput::StdOut { message } => (&mut stdout, message),
                LogOutput::StdErr { message } => (&mut stderr, message),
                _ => continue,
            };
            let text = String::from_utf8_lossy(&message);
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                if echo {
                    info!(parent: &self.span, "{}", line);
                } else {
                    debug!(parent: &self.span, "{}", line);
                }
            }
            buf.push_str(&text);
        }

        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let status = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // Non-zero exits surface as this error rather than a response.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ProvisionError::Parse(format!(
                    "no exit status for `{}`",
                    command
                )));
            }
        };
        if status != 0 {
            return Err(ProvisionError::Tool {
                command: command.to_string(),
                status: status as i32,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }

    async fn project(&self) -> ProvisionResult<String> {
        let raw = tokio::fs::read_to_string(self.config.token_path()).await?;
        let token: ServiceToken = serde_json::from_str(&raw)
            .map_err(|e| ProvisionError::Parse(format!("service token: {}", e)))?;
        Ok(token.project_id)
    }

    async fn state_dir(config: &RunConfig) -> ProvisionResult<PathBuf> {
        let dir = tokio::fs::canonicalize(&config.state_dir).await?;
        tokio::fs::create_dir_all(dir.join(NAME)).await?;
        Ok(dir)
    }
}

#[async_trait]
impl InstanceProvisioner for OgcProvisioner {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::Vm
    }

    fn set_logger(&mut self, span: tracing::Span) {
        self.span = span;
    }

    fn supported(&self, profile: &OsProfile) -> bool {
        matches!(profile.os_type, OsType::Linux | OsType::Windows) && image_for(profile).is_some()
    }

    async fn provision(
        &self,
        config: &RunConfig,
        batches: &[OsBatch],
    ) -> ProvisionResult<Vec<Instance>> {
        if batches.is_empty() {
            return Ok(Vec::new());
        }
        let state_dir = Self::state_dir(config).await?;
        let project = self.project().await?;
        self.pull().await?;

        let run_tag = uuid::Uuid::new_v4().to_string();
        let layouts = batches
            .iter()
            .map(|b| layout_for(b, &run_tag, &self.config.labels))
            .collect::<ProvisionResult<Vec<_>>>()?;
        let document = layouts_yaml(&layouts)?;

        info!(parent: &self.span, "Importing {} layouts (run tag {})", layouts.len(), run_tag);
        self.cli(
            &state_dir,
            &project,
            &["layout", "import", "--file", "-"],
            Some(document),
            false,
        )
        .await?;

        info!(parent: &self.span, "Bringing up {} machines", layouts.len());
        let label = format!("{}={}", RUN_TAG_LABEL, run_tag);
        self.cli(&state_dir, &project, &["up", "--label", &label], None, true)
            .await?;

        let listing = self
            .cli(&state_dir, &project, &["ls", "--as-yaml"], None, false)
            .await?;
        let machines = parse_machines(&listing)?;

        let (instances, unmapped) = map_machines(batches, &machines, &run_tag)?;
        for id in &unmapped {
            error!(parent: &self.span, "{}", ProvisionError::Unmapped(id.clone()));
        }
        Ok(instances)
    }

    async fn clean(&self, config: &RunConfig, instances: &[Instance]) -> ProvisionResult<()> {
        if instances.is_empty() {
            return Ok(());
        }
        let state_dir = Self::state_dir(config).await?;
        let project = self.project().await?;

        let (state_dir, project) = (&state_dir, &project);
        let downs = instances.iter().map(|instance| async move {
            let Some(machine_id) = instance.internal.get(INSTANCE_ID) else {
                return Err(format!("{}: no {} recorded", instance.id, INSTANCE_ID));
            };
            info!(parent: &self.span, "Destroying {} ({})", instance.name, machine_id);
            self.cli(state_dir, project, &["down", machine_id.as_str()], None, false)
                .await
                .map(|_| ())
                .map_err(|e| format!("{}: {}", instance.id, e))
        });
        let errors: Vec<String> = join_all(downs)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::cleanup(errors))
        }
    }
}

/// Container running the CLI with credentials, keys and database mounted.
fn container_config(
    config: &OgcConfig,
    state_dir: &Path,
    project: &str,
    args: &[&str],
    stdin: bool,
) -> ContainerConfig<String> {
    let bind = |host: PathBuf, container: &str, ro: bool| {
        format!(
            "{}:{}{}",
            host.display(),
            container,
            if ro { ":ro" } else { "" }
        )
    };
    let binds = vec![
        bind(config.service_token_path.clone(), CONTAINER_TOKEN, true),
        bind(
            state_dir.join(PRIVATE_KEY_FILE),
            &format!("{}/{}", CONTAINER_KEYS, PRIVATE_KEY_FILE),
            true,
        ),
        bind(
            state_dir.join(PUBLIC_KEY_FILE),
            &format!("{}/{}", CONTAINER_KEYS, PUBLIC_KEY_FILE),
            true,
        ),
        bind(state_dir.join(NAME), CONTAINER_DB, false),
    ];
    let env = vec![
        format!("GOOGLE_APPLICATION_CREDENTIALS={}", CONTAINER_TOKEN),
        format!("GOOGLE_PROJECT={}", project),
        format!("GOOGLE_REGION={}", config.region()),
        format!("GOOGLE_ZONE={}", config.datacenter),
    ];

    ContainerConfig {
        image: Some(config.image.clone()),
        cmd: Some(args.iter().map(|a| a.to_string()).collect()),
        env: Some(env),
        attach_stdin: Some(stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(stdin),
        stdin_once: Some(stdin),
        host_config: Some(HostConfig {
            binds: Some(binds),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cloud image for a profile, `None` when the profile has no image.
fn image_for(profile: &OsProfile) -> Option<String> {
    match (profile.os_type, profile.distro.as_str()) {
        (OsType::Linux, "ubuntu") => {
            let base = format!("ubuntu-os-cloud:ubuntu-{}-lts", profile.version.replace('.', ""));
            Some(match profile.arch {
                Arch::Amd64 => base,
                Arch::Arm64 => format!("{}-arm64", base),
            })
        }
        (OsType::Linux, "rhel") if profile.arch == Arch::Amd64 => {
            Some(format!("rhel-cloud:rhel-{}", profile.version))
        }
        (OsType::Windows, _) if profile.arch == Arch::Amd64 => {
            Some(format!("windows-cloud:windows-{}", profile.version))
        }
        _ => None,
    }
}

fn instance_size(profile: &OsProfile) -> &'static str {
    match (profile.os_type, profile.arch) {
        (OsType::Windows, _) => "e2-standard-4",
        (_, Arch::Arm64) => "t2a-standard-4",
        _ => "e2-standard-4",
    }
}

fn username(profile: &OsProfile) -> &'static str {
    match (profile.os_type, profile.distro.as_str()) {
        (OsType::Windows, _) => "windows",
        (_, "rhel") => "rhel",
        _ => "ubuntu",
    }
}

fn remote_path(profile: &OsProfile) -> String {
    match profile.os_type {
        OsType::Windows => format!("C:\\Users\\{}\\agent", username(profile)),
        _ => format!("/home/{}/agent", username(profile)),
    }
}

/// Layout describing the machine for one batch.
pub fn layout_for(
    batch: &OsBatch,
    run_tag: &str,
    extra_labels: &BTreeMap<String, String>,
) -> ProvisionResult<Layout> {
    let profile = &batch.profile;
    let runs_on = image_for(profile).ok_or_else(|| {
        ProvisionError::Parse(format!("no {} image for {}", NAME, profile))
    })?;
    let mut labels = extra_labels.clone();
    labels.insert(RUN_TAG_LABEL.to_string(), run_tag.to_string());
    labels.insert("division".to_string(), "engineering".to_string());
    labels.insert("os".to_string(), profile.os_type.to_string());
    labels.insert("arch".to_string(), profile.arch.to_string());

    let ports = match profile.os_type {
        OsType::Windows => vec!["22:22".to_string(), "5986:5986".to_string()],
        _ => vec!["22:22".to_string()],
    };

    Ok(Layout {
        name: batch.id.clone(),
        provider: "google".to_string(),
        instance_size: instance_size(profile).to_string(),
        runs_on,
        remote_path: remote_path(profile),
        username: username(profile).to_string(),
        ssh_private_key: format!("{}/{}", CONTAINER_KEYS, PRIVATE_KEY_FILE),
        ssh_public_key: format!("{}/{}", CONTAINER_KEYS, PUBLIC_KEY_FILE),
        ports,
        tags: vec![profile.os_type.to_string(), batch.batch.group.clone()],
        labels,
    })
}

/// Serializes layouts as the `name: layout` mapping `layout import` reads.
pub fn layouts_yaml(layouts: &[Layout]) -> ProvisionResult<String> {
    let map: BTreeMap<&str, &Layout> = layouts.iter().map(|l| (l.name.as_str(), l)).collect();
    serde_yaml::to_string(&map).map_err(|e| ProvisionError::Parse(format!("layouts: {}", e)))
}

pub fn parse_machines(yaml: &str) -> ProvisionResult<Vec<Machine>> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(yaml).map_err(|e| ProvisionError::Parse(format!("{} ls: {}", NAME, e)))
}

/// Maps tagged machines back to batches. Returns the instances and the IDs
/// of batches left without a machine. Zero tagged machines is an error.
pub fn map_machines(
    batches: &[OsBatch],
    machines: &[Machine],
    run_tag: &str,
) -> ProvisionResult<(Vec<Instance>, Vec<String>)> {
    let ours: BTreeMap<&str, &Machine> = machines
        .iter()
        .filter(|m| m.layout.labels.get(RUN_TAG_LABEL).map(String::as_str) == Some(run_tag))
        .map(|m| (m.layout.name.as_str(), m))
        .collect();
    if ours.is_empty() {
        return Err(ProvisionError::NoInstances(NAME.to_string()));
    }

    let mut instances = Vec::new();
    let mut unmapped = Vec::new();
    for batch in batches {
        let Some(machine) = ours.get(batch.id.as_str()) else {
            unmapped.push(batch.id.clone());
            continue;
        };
        let mut internal = BTreeMap::new();
        internal.insert(INSTANCE_ID.to_string(), machine.instance_id.clone());
        instances.push(Instance {
            provisioner: NAME.to_string(),
            id: batch.id.clone(),
            name: machine.instance_name.clone(),
            ip: machine.public_ip.clone(),
            username: machine.layout.username.clone(),
            remote_path: machine.layout.remote_path.clone(),
            internal,
        });
    }
    Ok((instances, unmapped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::define::Batch;

    fn profile(os_type: OsType, arch: Arch, distro: &str, version: &str) -> OsProfile {
        OsProfile {
            os_type,
            arch,
            distro: distro.to_string(),
            version: version.to_string(),
            docker_variant: String::new(),
        }
    }

    fn os_batch(id: &str, profile: OsProfile) -> OsBatch {
        OsBatch {
            id: id.to_string(),
            profile,
            runner: None,
            batch: Batch {
                group: "default".to_string(),
                os: crate::define::OsRequirement::new(OsType::Linux),
                stack: None,
                tests: Vec::new(),
                sudo_tests: Vec::new(),
            },
            skip: false,
        }
    }

    fn machines_yaml(tag: &str) -> String {
        format!(
            r#"
- id: 1
  instance_id: "8812001"
  instance_name: ogc-linux-amd64-ubuntu-2204-default
  instance_state: running
  public_ip: 34.1.2.3
  layout:
    name: linux-amd64-ubuntu-2204-default
    username: ubuntu
    remote_path: /home/ubuntu/agent
    labels:
      run_tag: {tag}
- id: 2
  instance_id: "8812002"
  instance_name: ogc-someone-else
  public_ip: 34.9.9.9
  layout:
    name: linux-amd64-ubuntu-2404-default
    labels:
      run_tag: other
"#
        )
    }

    #[test]
    fn test_layout_for_ubuntu_arm() {
        let batch = os_batch(
            "linux-arm64-ubuntu-2204-default",
            profile(OsType::Linux, Arch::Arm64, "ubuntu", "22.04"),
        );
        let layout = layout_for(&batch, "tag-1", &BTreeMap::new()).unwrap();
        assert_eq!(layout.runs_on, "ubuntu-os-cloud:ubuntu-2204-lts-arm64");
        assert_eq!(layout.instance_size, "t2a-standard-4");
        assert_eq!(layout.remote_path, "/home/ubuntu/agent");
        assert_eq!(layout.labels.get("run_tag").unwrap(), "tag-1");
    }

    #[test]
    fn test_layout_for_windows() {
        let batch = os_batch(
            "windows-amd64-2022-default",
            profile(OsType::Windows, Arch::Amd64, "", "2022"),
        );
        let layout = layout_for(&batch, "t", &BTreeMap::new()).unwrap();
        assert_eq!(layout.username, "windows");
        assert_eq!(layout.remote_path, "C:\\Users\\windows\\agent");
        assert!(layout.ports.contains(&"5986:5986".to_string()));
    }

    #[test]
    fn test_layouts_yaml_keyed_by_name() {
        let batch = os_batch("b1", profile(OsType::Linux, Arch::Amd64, "rhel", "8"));
        let layout = layout_for(&batch, "t", &BTreeMap::new()).unwrap();
        let yaml = layouts_yaml(&[layout.clone()]).unwrap();
        let back: BTreeMap<String, Layout> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.get("b1"), Some(&layout));
    }

    #[test]
    fn test_map_machines_by_tag_and_name() {
        let batches = vec![
            os_batch(
                "linux-amd64-ubuntu-2204-default",
                profile(OsType::Linux, Arch::Amd64, "ubuntu", "22.04"),
            ),
            os_batch(
                "linux-amd64-ubuntu-2404-default",
                profile(OsType::Linux, Arch::Amd64, "ubuntu", "24.04"),
            ),
        ];
        let machines = parse_machines(&machines_yaml("ours")).unwrap();
        let (instances, unmapped) = map_machines(&batches, &machines, "ours").unwrap();

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "linux-amd64-ubuntu-2204-default");
        assert_eq!(instances[0].ip, "34.1.2.3");
        assert_eq!(instances[0].internal.get(INSTANCE_ID).unwrap(), "8812001");
        assert_eq!(unmapped, vec!["linux-amd64-ubuntu-2404-default"]);
    }

    #[test]
    fn test_map_machines_none_tagged_is_error() {
        let batches = vec![os_batch(
            "x",
            profile(OsType::Linux, Arch::Amd64, "ubuntu", "22.04"),
        )];
        let machines = parse_machines(&machines_yaml("ours")).unwrap();
        let err = map_machines(&batches, &machines, "missing").unwrap_err();
        assert!(matches!(err, ProvisionError::NoInstances(_)));
        assert!(parse_machines("").unwrap().is_empty());
    }

    #[test]
    fn test_container_config_mounts_credentials_and_database() {
        let config = OgcConfig {
            service_token_path: PathBuf::from("/secrets/token.json"),
            ..Default::default()
        };
        let c = container_config(
            &config,
            Path::new("/state"),
            "ci-project",
            &["layout", "import", "--file", "-"],
            true,
        );
        assert_eq!(c.image.as_deref(), Some(config.image.as_str()));
        assert_eq!(c.cmd.unwrap(), ["layout", "import", "--file", "-"]);
        assert_eq!(c.open_stdin, Some(true));
        assert_eq!(c.stdin_once, Some(true));

        let binds = c.host_config.unwrap().binds.unwrap();
        assert!(binds.contains(&"/secrets/token.json:/root/token.json:ro".to_string()));
        assert!(binds.contains(&"/state/id_rsa:/root/.ssh/id_rsa:ro".to_string()));
        assert!(binds.contains(&"/state/ogc:/root/.ogc".to_string()));

        let env = c.env.unwrap();
        assert!(env.contains(&"GOOGLE_PROJECT=ci-project".to_string()));
        assert!(env.contains(&"GOOGLE_REGION=us-central1".to_string()));
    }

    #[test]
    fn test_container_config_without_stdin() {
        let c = container_config(
            &OgcConfig::default(),
            Path::new("/state"),
            "p",
            &["ls", "--as-yaml"],
            false,
        );
        assert_eq!(c.attach_stdin, Some(false));
        assert_eq!(c.open_stdin, Some(false));
    }

    #[test]
    fn test_images() {
        assert!(image_for(&profile(OsType::Linux, Arch::Arm64, "rhel", "8")).is_none());
        assert_eq!(
            image_for(&profile(OsType::Windows, Arch::Amd64, "", "2019-core")).unwrap(),
            "windows-cloud:windows-2019-core"
        );
        assert!(image_for(&profile(OsType::Darwin, Arch::Arm64, "", "14")).is_none());
    }
}
