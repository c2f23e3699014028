//! End-to-end runs of the orchestrator against in-memory provisioners,
//! connector and OS runner.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use integrun::config::RunConfig;
use integrun::define::{
    Arch, Batch, BatchPackageTest, BatchPackageTests, Build, OsProfile, OsRequirement, OsType,
    StackRequirement,
};
use integrun::orchestrator::{Orchestrator, RunError};
use integrun::planner::OsBatch;
use integrun::provider::{
    Instance, InstanceProvisioner, ProvisionResult, ProvisionerKind,
};
use integrun::runner::{
    OsRunner, OsRunnerResult, PackageResult, RunContext, RunnerKind, RunnerResult, RunnerSet,
};
use integrun::stack::{Stack, StackError, StackProvisioner, StackRequest, StackResult};
use integrun::state::{StateInstance, StateStore};
use integrun::transport::{Connector, ExecOutput, RemoteShell, TransportResult};

#[derive(Default)]
struct Counters {
    provision_calls: AtomicUsize,
    provisioned: AtomicUsize,
    cleaned_instances: AtomicUsize,
    stack_creates: AtomicUsize,
    stack_deletes: AtomicUsize,
    connects: AtomicUsize,
    prepares: AtomicUsize,
    copies: AtomicUsize,
    runs: AtomicUsize,
    envs: Mutex<Vec<BTreeMap<String, String>>>,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn instance(id: &str) -> Instance {
    Instance {
        provisioner: "mock".to_string(),
        id: id.to_string(),
        name: format!("vm-{}", id),
        ip: "10.0.0.2".to_string(),
        username: "ubuntu".to_string(),
        remote_path: "/home/ubuntu/agent".to_string(),
        internal: BTreeMap::new(),
    }
}

struct MockProvisioner(Arc<Counters>);

#[async_trait]
impl InstanceProvisioner for MockProvisioner {
    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::Vm
    }

    fn set_logger(&mut self, _span: tracing::Span) {}

    fn supported(&self, _profile: &OsProfile) -> bool {
        true
    }

    async fn provision(
        &self,
        _config: &RunConfig,
        batches: &[OsBatch],
    ) -> ProvisionResult<Vec<Instance>> {
        self.0.provision_calls.fetch_add(1, Ordering::SeqCst);
        self.0.provisioned.fetch_add(batches.len(), Ordering::SeqCst);
        Ok(batches.iter().map(|b| instance(&b.id)).collect())
    }

    async fn clean(&self, _config: &RunConfig, instances: &[Instance]) -> ProvisionResult<()> {
        self.0
            .cleaned_instances
            .fetch_add(instances.len(), Ordering::SeqCst);
        Ok(())
    }
}

struct MockStacks {
    counters: Arc<Counters>,
    fail: bool,
    /// How long the stack takes to turn ready after creation.
    ready_after: Duration,
}

#[async_trait]
impl StackProvisioner for MockStacks {
    fn name(&self) -> &str {
        "mock-stack"
    }

    fn set_logger(&mut self, _span: tracing::Span) {}

    async fn create(&self, request: &StackRequest) -> StackResult<Stack> {
        self.counters.stack_creates.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StackError::Other(anyhow::anyhow!("quota exceeded")));
        }
        // Give waiters time to register before the stack becomes ready.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Stack {
            id: request.id.clone(),
            provisioner: "mock-stack".to_string(),
            version: request.version.clone(),
            ready: false,
            elasticsearch: String::new(),
            kibana: String::new(),
            username: String::new(),
            password: String::new(),
            internal: BTreeMap::new(),
        })
    }

    async fn wait_for_ready(&self, mut stack: Stack) -> StackResult<Stack> {
        tokio::time::sleep(self.ready_after).await;
        stack.ready = true;
        stack.elasticsearch = format!("https://es-{}.example", stack.id);
        stack.kibana = format!("https://kb-{}.example", stack.id);
        stack.username = "elastic".to_string();
        stack.password = "changeme".to_string();
        Ok(stack)
    }

    async fn delete(&self, _stack: &Stack) -> StackResult<()> {
        self.counters.stack_deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockShell;

#[async_trait]
impl RemoteShell for MockShell {
    async fn exec(
        &self,
        _cmd: &str,
        _args: &[String],
        _stdin: Option<&[u8]>,
    ) -> TransportResult<ExecOutput> {
        Ok(ExecOutput::default())
    }

    async fn copy(&self, _local: &Path, _dest: &str) -> TransportResult<()> {
        Ok(())
    }
}

struct MockConnector(Arc<Counters>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _instance: &Instance,
        _deadline: Duration,
        _cancel: &CancellationToken,
    ) -> TransportResult<Box<dyn RemoteShell>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockShell))
    }
}

struct MockRunner(Arc<Counters>);

#[async_trait]
impl OsRunner for MockRunner {
    async fn prepare(
        &self,
        _shell: &dyn RemoteShell,
        _arch: Arch,
        _go_version: &str,
        _cancel: &CancellationToken,
    ) -> RunnerResult<()> {
        self.0.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn copy(
        &self,
        _shell: &dyn RemoteShell,
        _remote_path: &str,
        archive: &Path,
        builds: &[Build],
    ) -> RunnerResult<()> {
        assert!(archive.exists());
        assert_eq!(builds.len(), 1);
        self.0.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(
        &self,
        shell: Option<&dyn RemoteShell>,
        ctx: &RunContext<'_>,
    ) -> RunnerResult<OsRunnerResult> {
        assert!(shell.is_some());
        self.0.runs.fetch_add(1, Ordering::SeqCst);
        self.0
            .envs
            .lock()
            .unwrap()
            .push(ctx.env.clone());

        let package = &ctx.batch.tests[0].name;
        Ok(OsRunnerResult {
            packages: vec![PackageResult {
                name: package.clone(),
                output: b"--- PASS: TestA\n".to_vec(),
                json_output: format!("{{\"Action\":\"pass\",\"Package\":\"{}\"}}\n", package)
                    .into_bytes(),
                xml_output: format!(
                    r#"<testsuites><testsuite name="{package}" tests="1" failures="0" errors="0" time="1.0"><testcase classname="{package}" name="TestA" time="1.0"></testcase></testsuite></testsuites>"#
                )
                .into_bytes(),
            }],
            sudo_packages: Vec::new(),
        })
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

fn os_batch(id: &str, stack: Option<&str>) -> OsBatch {
    OsBatch {
        id: id.to_string(),
        profile: OsProfile {
            os_type: OsType::Linux,
            arch: Arch::Amd64,
            distro: "ubuntu".to_string(),
            version: "24.04".to_string(),
            docker_variant: String::new(),
        },
        runner: Some(RunnerKind::Debian),
        batch: Batch {
            group: id.to_string(),
            os: OsRequirement::new(OsType::Linux),
            stack: stack.map(|v| StackRequirement {
                version: v.to_string(),
            }),
            tests: vec![BatchPackageTests {
                name: "github.com/elastic/elastic-agent/testing/integration".to_string(),
                tests: vec![BatchPackageTest {
                    name: "TestA".to_string(),
                    stack: stack.is_some(),
                }],
            }],
            sudo_tests: Vec::new(),
        },
        skip: false,
    }
}

/// Workspace with a repo to snapshot, the build under test and a key pair.
fn workspace(root: &Path) -> RunConfig {
    let repo = root.join("repo");
    std::fs::create_dir_all(repo.join("testing")).unwrap();
    std::fs::write(repo.join("testing/a_test.go"), "package testing").unwrap();

    let build = root.join("build");
    std::fs::create_dir_all(&build).unwrap();
    for name in [
        "elastic-agent-9.1.0-linux-x86_64.tar.gz",
        "elastic-agent-9.1.0-linux-x86_64.tar.gz.sha512",
    ] {
        std::fs::write(build.join(name), "x").unwrap();
    }

    let state = root.join("state");
    std::fs::create_dir_all(&state).unwrap();
    std::fs::write(state.join("id_rsa"), "private").unwrap();
    std::fs::write(state.join("id_rsa.pub"), "ssh-rsa AAAA integrun").unwrap();

    RunConfig {
        state_dir: state,
        build_dir: build,
        repo_dir: repo,
        binary_name: "elastic-agent".to_string(),
        agent_version: "9.1.0".to_string(),
        stack_version: "9.1.0".to_string(),
        go_version: "1.22.6".to_string(),
        packages: vec!["targz".to_string()],
        test_flags: "-v".to_string(),
        ..Default::default()
    }
}

fn orchestrator(
    config: RunConfig,
    batches: Vec<OsBatch>,
    counters: &Arc<Counters>,
    fail_stacks: bool,
) -> Orchestrator {
    let stacks = MockStacks {
        counters: counters.clone(),
        fail: fail_stacks,
        ready_after: Duration::ZERO,
    };
    orchestrator_with_stacks(config, batches, counters, stacks)
}

fn orchestrator_with_stacks(
    config: RunConfig,
    batches: Vec<OsBatch>,
    counters: &Arc<Counters>,
    stacks: MockStacks,
) -> Orchestrator {
    let ip = Box::new(MockProvisioner(counters.clone()));
    Orchestrator::new(config, batches, ip, Box::new(stacks))
        .unwrap()
        .with_connector(Arc::new(MockConnector(counters.clone())))
        .with_runners(RunnerSet::new().with(RunnerKind::Debian, Arc::new(MockRunner(counters.clone()))))
}

#[tokio::test]
async fn test_shared_stack_is_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let counters = Arc::new(Counters::default());
    let o = orchestrator(
        config,
        vec![os_batch("a", Some("8.10.0")), os_batch("b", Some("8.10.0"))],
        &counters,
        false,
    );

    let result = o.run().await.unwrap();
    assert_eq!(result.tests, 2);
    assert!(result.success());

    assert_eq!(Counters::get(&counters.stack_creates), 1);
    assert_eq!(Counters::get(&counters.provision_calls), 1);
    assert_eq!(Counters::get(&counters.provisioned), 2);
    assert_eq!(Counters::get(&counters.prepares), 2);
    assert_eq!(Counters::get(&counters.runs), 2);

    let envs = counters.envs.lock().unwrap();
    for env in envs.iter() {
        assert_eq!(env["KIBANA_HOST"], "https://kb-8100.example");
        assert_eq!(env["ELASTICSEARCH_PASSWORD"], "changeme");
        assert_eq!(env["GOTEST_FLAGS"], "-v");
        assert_eq!(env["TEST_BINARY_NAME"], "elastic-agent");
    }

    let state = o.state().snapshot();
    assert_eq!(state.stacks.len(), 1);
    assert!(state.stacks[0].ready);
    assert_eq!(state.instances.len(), 2);
    assert!(state.instances.iter().all(|i| i.prepared));
}

#[tokio::test]
async fn test_prepared_instance_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    StateStore::load(&config.state_dir)
        .unwrap()
        .upsert_instance(StateInstance {
            instance: instance("a"),
            prepared: true,
        })
        .unwrap();

    let counters = Arc::new(Counters::default());
    let o = orchestrator(config, vec![os_batch("a", None)], &counters, false);
    let result = o.run().await.unwrap();

    assert_eq!(result.tests, 1);
    assert_eq!(Counters::get(&counters.provision_calls), 0);
    assert_eq!(Counters::get(&counters.prepares), 0);
    assert_eq!(Counters::get(&counters.connects), 1);
    assert_eq!(Counters::get(&counters.copies), 1);
    assert_eq!(Counters::get(&counters.runs), 1);
    assert_eq!(Counters::get(&counters.stack_creates), 0);

    let env = &counters.envs.lock().unwrap()[0];
    assert!(!env.contains_key("KIBANA_HOST"));
}

#[tokio::test]
async fn test_stack_failure_only_fails_dependent_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let counters = Arc::new(Counters::default());
    let o = orchestrator(
        config,
        vec![os_batch("a", Some("8.10.0")), os_batch("b", None)],
        &counters,
        true,
    );

    match o.run().await {
        Err(RunError::Instances { partial, failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].batch_id, "a");
            assert!(failures[0].error.contains("quota exceeded"));
            assert_eq!(partial.tests, 1);
        }
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.tests)),
    }
    assert_eq!(Counters::get(&counters.runs), 1);
    assert!(o.state().snapshot().stacks.is_empty());
}

#[tokio::test]
async fn test_missing_build_fails_before_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = workspace(dir.path());
    config.build_dir = dir.path().join("empty");
    let counters = Arc::new(Counters::default());
    let o = orchestrator(config, vec![os_batch("a", None)], &counters, false);

    assert!(matches!(o.run().await, Err(RunError::MissingArtifacts(m)) if m.len() == 2));
    assert_eq!(Counters::get(&counters.provision_calls), 0);
}

#[tokio::test]
async fn test_clean_tears_down_recorded_resources() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let counters = Arc::new(Counters::default());
    let o = orchestrator(
        config.clone(),
        vec![os_batch("a", Some("8.10.0")), os_batch("b", None)],
        &counters,
        false,
    );
    o.run().await.unwrap();
    o.clean().await.unwrap();

    assert_eq!(Counters::get(&counters.cleaned_instances), 2);
    assert_eq!(Counters::get(&counters.stack_deletes), 1);

    let reloaded = StateStore::load(&config.state_dir).unwrap().snapshot();
    assert!(reloaded.instances.is_empty());
    assert!(reloaded.stacks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_stack_within_ready_timeout_is_awaited() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = workspace(dir.path());
    config.ess.ready_timeout_secs = 30 * 60;
    let counters = Arc::new(Counters::default());
    let stacks = MockStacks {
        counters: counters.clone(),
        fail: false,
        ready_after: Duration::from_secs(13 * 60),
    };
    let o = orchestrator_with_stacks(config, vec![os_batch("a", Some("8.10.0"))], &counters, stacks);

    let result = o.run().await.unwrap();
    assert_eq!(result.tests, 1);
    assert_eq!(Counters::get(&counters.runs), 1);
    assert!(o.state().snapshot().stacks[0].ready);
}

#[tokio::test]
async fn test_unwritable_state_fails_only_new_instances() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    StateStore::load(&config.state_dir)
        .unwrap()
        .upsert_instance(StateInstance {
            instance: instance("a"),
            prepared: true,
        })
        .unwrap();
    // A directory in place of the temp file makes every later write fail.
    std::fs::create_dir(config.state_dir.join("state.yml.tmp")).unwrap();

    let counters = Arc::new(Counters::default());
    let o = orchestrator(
        config,
        vec![os_batch("a", None), os_batch("b", None)],
        &counters,
        false,
    );

    match o.run().await {
        Err(RunError::Instances { partial, failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].batch_id, "b");
            assert!(failures[0].error.contains("could not be recorded"));
            assert_eq!(partial.tests, 1);
        }
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.tests)),
    }
    assert_eq!(Counters::get(&counters.provisioned), 1);
    assert_eq!(Counters::get(&counters.cleaned_instances), 1);
    assert_eq!(Counters::get(&counters.runs), 1);
}
