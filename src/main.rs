//! integrun CLI - Integration test orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use integrun::config::{self, RunConfig};
use integrun::define::load_batches;
use integrun::orchestrator::{Orchestrator, RunError};
use integrun::planner::{OsBatch, create_batches, filter_supported, supported};
use integrun::provider::instance_provisioner;
use integrun::report::{print_summary, write_outputs};
use integrun::stack::stack_provisioner;

/// Directory (under the repository) receiving the merged result files.
const OUTPUT_DIR: &str = "build";

#[derive(Parser)]
#[command(name = "integrun")]
#[command(about = "Integration test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "integration.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Instance provisioner (multipass, ogc, kind)
    #[arg(long, env = "INSTANCE_PROVISIONER", global = true)]
    instance_provisioner: Option<String>,

    /// Stack provisioner (stateful, serverless)
    #[arg(long, env = "STACK_PROVISIONER", global = true)]
    stack_provisioner: Option<String>,

    /// Space-separated platform filters, e.g. "linux/amd64 windows"
    #[arg(long, env = "PLATFORMS", global = true)]
    platforms: Option<String>,

    /// Space-separated package formats
    #[arg(long, env = "PACKAGES", global = true)]
    packages: Option<String>,

    /// Space-separated batch groups
    #[arg(long, env = "GROUPS", global = true)]
    groups: Option<String>,

    /// Only run this test
    #[arg(long = "test", env = "TEST_RUN", global = true)]
    single_test: Option<String>,

    /// Run every batch on every matching platform
    #[arg(long, env = "TEST_MATRIX", global = true, value_parser = BoolishValueParser::new())]
    matrix: bool,

    #[arg(long, env = "AGENT_VERSION", global = true)]
    agent_version: Option<String>,

    #[arg(long, env = "STACK_VERSION", global = true)]
    stack_version: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(p) = &self.instance_provisioner {
            config.instance_provisioner = p.clone();
        }
        if let Some(p) = &self.stack_provisioner {
            config.stack_provisioner = p.clone();
        }
        if let Some(list) = &self.platforms {
            config.platforms = words(list);
        }
        if let Some(list) = &self.packages {
            config.packages = words(list);
        }
        if let Some(list) = &self.groups {
            config.groups = words(list);
        }
        if let Some(test) = self.single_test.as_ref().filter(|t| !t.is_empty()) {
            config.single_test = Some(test.clone());
        }
        if self.matrix {
            config.matrix = true;
        }
        if let Some(v) = &self.agent_version {
            config.agent_version = v.clone();
        }
        if let Some(v) = &self.stack_version {
            config.stack_version = v.clone();
        }
    }
}

fn words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

#[derive(Subcommand)]
enum Commands {
    /// Provision instances and stacks, then run the integration tests
    Run {
        /// Tear down everything in the state file when the run ends
        #[arg(long, env = "TEST_INTEG_CLEAN_ON_EXIT", value_parser = BoolishValueParser::new())]
        clean_on_exit: bool,

        /// Repeat the run until it fails
        #[arg(long, env = "TEST_RUN_UNTIL_FAILURE", value_parser = BoolishValueParser::new())]
        until_failure: bool,
    },

    /// Tear down every instance and stack recorded in the state file
    Clean,

    /// Validate the configuration and batch definitions
    Validate,

    /// Print the planned batches
    Batches,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            clean_on_exit,
            until_failure,
        } => {
            let code = run_tests(
                &cli.config,
                &cli.overrides,
                cli.verbose,
                clean_on_exit,
                until_failure,
            )
            .await?;
            std::process::exit(code);
        }
        Commands::Clean => clean(&cli.config, &cli.overrides).await,
        Commands::Validate => validate(&cli.config, &cli.overrides),
        Commands::Batches => print_batches(&cli.config, &cli.overrides),
    }
}

fn load(config_path: &Path, overrides: &Overrides) -> Result<RunConfig> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config);
    Ok(config)
}

fn plan(config: &RunConfig) -> Result<Vec<OsBatch>> {
    let batches = load_batches(&config.batches_file)?;
    let planned = create_batches(&batches, &supported(), &config.plan_options()?)?;
    Ok(planned)
}

async fn run_tests(
    config_path: &Path,
    overrides: &Overrides,
    verbose: bool,
    clean_on_exit: bool,
    until_failure: bool,
) -> Result<i32> {
    let mut config = load(config_path, overrides)?;
    config.verbose |= verbose;
    config.validate()?;
    info!("Loaded configuration from {}", config_path.display());

    let planned = plan(&config)?;
    let mut attempt = 1;
    loop {
        let code = run_once(config.clone(), planned.clone(), clean_on_exit).await?;
        if !until_failure || code != 0 {
            return Ok(code);
        }
        attempt += 1;
        info!("Run passed, starting run {} until a failure", attempt);
    }
}

async fn run_once(config: RunConfig, planned: Vec<OsBatch>, clean_on_exit: bool) -> Result<i32> {
    let ip = instance_provisioner(&config.instance_provisioner, &config)?;
    let sp = stack_provisioner(&config.stack_provisioner, &config.ess)?;
    let planned = filter_supported(planned, ip.name(), |p| ip.supported(p));
    let needs_stack = planned.iter().any(|b| !b.skip && b.batch.stack.is_some());
    config.validate_stack_access(needs_stack)?;

    let output_dir = config.repo_dir.join(OUTPUT_DIR);
    let run_timeout = config.run_timeout();
    let mut orchestrator = Orchestrator::new(config, planned, ip, sp)?;
    if console::Term::stdout().is_term() {
        orchestrator = orchestrator.with_progress();
    }

    let cancel = orchestrator.cancellation_token();
    let watchdog = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("Interrupted, cancelling the run"),
            _ = tokio::time::sleep(run_timeout) => {
                warn!("Run exceeded {:?}, cancelling", run_timeout)
            }
        }
        cancel.cancel();
    });

    let outcome = orchestrator.run().await;
    watchdog.abort();

    let (result, fatal, batches_failed) = match outcome {
        Ok(result) => (Some(result), None, false),
        Err(RunError::Instances { partial, failures }) => {
            for failure in &failures {
                error!("Batch {} failed: {}", failure.batch_id, failure.error);
            }
            (Some(*partial), None, true)
        }
        Err(e) => (None, Some(e), false),
    };

    let code = match &result {
        Some(result) => {
            let paths = write_outputs(result, &output_dir)?;
            print_summary(result, &paths);
            // Results of failed batches are missing, so the run fails.
            if batches_failed { 1 } else { result.exit_code() }
        }
        None => 1,
    };

    if clean_on_exit {
        info!("Cleaning up on exit");
        if let Err(e) = orchestrator.clean().await {
            error!("Cleanup failed: {:#}", e);
        }
    }

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(code),
    }
}

async fn clean(config_path: &Path, overrides: &Overrides) -> Result<()> {
    let config = load(config_path, overrides)?;
    let ip = instance_provisioner(&config.instance_provisioner, &config)?;
    let sp = stack_provisioner(&config.stack_provisioner, &config.ess)?;
    let orchestrator = Orchestrator::new(config, Vec::new(), ip, sp)?;
    orchestrator.clean().await?;
    println!("Cleaned up all recorded instances and stacks.");
    Ok(())
}

fn validate(config_path: &Path, overrides: &Overrides) -> Result<()> {
    let config = load(config_path, overrides)?;
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    }
    let planned = match plan(&config) {
        Ok(planned) => planned,
        Err(e) => {
            eprintln!("Batch error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Binary: {} {}", config.binary_name, config.agent_version);
    println!("  Stack version: {}", config.stack_version);
    println!("  Instance provisioner: {}", config.instance_provisioner);
    println!("  Stack provisioner: {}", config.stack_provisioner);
    println!(
        "  Batches: {} planned, {} skipped",
        planned.iter().filter(|b| !b.skip).count(),
        planned.iter().filter(|b| b.skip).count()
    );
    Ok(())
}

fn print_batches(config_path: &Path, overrides: &Overrides) -> Result<()> {
    let config = load(config_path, overrides)?;
    let planned = plan(&config)?;
    let ip = instance_provisioner(&config.instance_provisioner, &config)?;

    println!("Planned {} batches:", planned.len());
    for batch in &planned {
        let mut notes = Vec::new();
        if let Some(stack) = &batch.batch.stack {
            let version = if stack.version.is_empty() {
                &config.stack_version
            } else {
                &stack.version
            };
            notes.push(format!("stack {}", version));
        }
        if batch.skip {
            notes.push("skipped".to_string());
        } else if !ip.supported(&batch.profile) {
            notes.push(format!("unsupported by {}", ip.name()));
        }
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", notes.join(", "))
        };
        let target = if batch.skip {
            batch.batch.os.to_string()
        } else {
            batch.profile.to_string()
        };
        println!("  {} ({}, group {}){}", batch.id, target, batch.batch.group, notes);
    }
    Ok(())
}
