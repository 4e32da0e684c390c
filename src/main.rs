//! runestack - dependency-aware stack orchestration
//!
//! CLI entry point. `config` and `plan` work on stack files alone; the
//! lifecycle commands run the stack against the in-memory runtime.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use runestack::cancel::CancelToken;
use runestack::compose::{format_duration, ComposeParser};
use runestack::config::OrchestratorConfig;
use runestack::driver::{MemoryRuntime, ProbeStep};
use runestack::orchestrator::{InstanceStatus, Orchestrator, StackHandle};
use runestack::stack::Stack;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// runestack - dependency-aware multi-container orchestration
#[derive(Parser)]
#[command(name = "runestack")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Dependency-aware orchestration of multi-container stacks", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Stack file; repeat to layer files
    #[arg(short, long = "file", global = true)]
    files: Vec<PathBuf>,

    /// Project name
    #[arg(short = 'p', long = "project-name", global = true)]
    project: Option<String>,

    /// Orchestrator settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the stack and print it
    Config {
        /// Print the orchestrator settings instead
        #[arg(long)]
        settings: bool,
    },

    /// Print startup batches
    Plan {
        /// Print shutdown batches instead
        #[arg(long)]
        down: bool,
    },

    /// Bring the stack up
    Up {
        #[command(flatten)]
        sim: SimArgs,
        /// Tear the stack down again afterwards
        #[arg(long)]
        down: bool,
    },

    /// Bring the stack up, then down
    Down {
        #[command(flatten)]
        sim: SimArgs,
        /// Also remove volumes and networks nothing uses
        #[arg(short, long)]
        volumes: bool,
    },

    /// Bring the stack up, then scale a service
    Scale {
        /// Service name
        service: String,
        /// Desired replica count
        replicas: u32,
        #[command(flatten)]
        sim: SimArgs,
    },

    /// Bring the stack up and list its instances
    Ps {
        #[command(flatten)]
        sim: SimArgs,
    },
}

/// Scripting for the in-memory runtime
#[derive(Args, Clone, Default)]
struct SimArgs {
    /// Fail starts of a service: SERVICE or SERVICE=TIMES
    #[arg(long, value_name = "SERVICE[=TIMES]")]
    fail_start: Vec<String>,

    /// Make every health probe of a service fail
    #[arg(long, value_name = "SERVICE")]
    unhealthy: Vec<String>,

    /// Make an image reference unresolvable
    #[arg(long, value_name = "IMAGE")]
    fail_image: Vec<String>,

    /// Compress probe intervals and restart delays to milliseconds
    #[arg(long)]
    fast: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = OrchestratorConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load orchestrator settings")?;

    match &cli.command {
        Commands::Config { settings: true } => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                print!("{}", serde_yaml::to_string(&settings)?);
            }
        }

        Commands::Config { settings: false } => {
            let stack = load_stack(&cli, &settings)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stack)?);
            } else {
                print!("{}", serde_yaml::to_string(&stack)?);
            }
        }

        Commands::Plan { down } => {
            let stack = load_stack(&cli, &settings)?;
            let graph = stack.graph()?;
            let batches = if *down {
                graph.shutdown_batches()
            } else {
                graph.startup_batches()
            };

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&batches)?);
            } else {
                for (i, batch) in batches.iter().enumerate() {
                    println!("{:>3}  {}", i + 1, batch.join(", "));
                }
            }
        }

        Commands::Up { sim, down } => {
            let session = Session::start(&cli, settings, sim)?;
            let result = session.up().await;
            session.print_status(cli.json).await?;
            if *down {
                session.down(false).await?;
            }
            result?;
        }

        Commands::Down { sim, volumes } => {
            let session = Session::start(&cli, settings, sim)?;
            session.up().await?;
            session.down(*volumes).await?;
        }

        Commands::Scale {
            service,
            replicas,
            sim,
        } => {
            let session = Session::start(&cli, settings, sim)?;
            session.up().await?;
            let report = session
                .orchestrator
                .scale(&session.stack, service, *replicas)
                .await;
            match report {
                Ok(report) => println!(
                    "Scaled {} from {} to {} (+{} -{})",
                    report.service,
                    report.from,
                    report.to,
                    report.added.len(),
                    report.removed.len()
                ),
                Err(e) => eprintln!("Scale failed: {}", e),
            }
            session.print_status(cli.json).await?;
        }

        Commands::Ps { sim } => {
            let session = Session::start(&cli, settings, sim)?;
            let result = session.up().await;
            session.print_status(cli.json).await?;
            result?;
        }
    }

    Ok(())
}

/// Load the stack from `-f` files or the default file in the working
/// directory
fn load_stack(cli: &Cli, settings: &OrchestratorConfig) -> Result<Stack> {
    let parser = ComposeParser::from_process_env()
        .probe_defaults(settings.probe_defaults())
        .project(cli.project.clone().or_else(|| settings.project.clone()));

    let stack = if cli.files.is_empty() {
        let working_dir = std::env::current_dir()?;
        parser.load_dir(&working_dir)?
    } else {
        parser.load_files(&cli.files)?
    };
    Ok(stack)
}

/// A stack running against the in-memory runtime
struct Session {
    runtime: MemoryRuntime,
    orchestrator: Orchestrator,
    stack: StackHandle,
    cancel: CancelToken,
}

impl Session {
    fn start(cli: &Cli, mut settings: OrchestratorConfig, sim: &SimArgs) -> Result<Self> {
        let mut stack = load_stack(cli, &settings)?;
        if sim.fast {
            compress(&mut stack, &mut settings);
        }

        let runtime = script(sim)?;
        let runtime_arc = Arc::new(runtime.clone());
        let orchestrator = Orchestrator::new(runtime_arc.clone(), runtime_arc, settings);
        let stack = StackHandle::load(stack)?;

        // Ctrl-C cancels whatever operation is in flight
        let cancel = CancelToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling");
                on_signal.cancel();
            }
        });

        Ok(Self {
            runtime,
            orchestrator,
            stack,
            cancel,
        })
    }

    async fn up(&self) -> Result<()> {
        match self.orchestrator.up(&self.stack, &self.cancel).await {
            Ok(report) => {
                for (i, batch) in report.batches.iter().enumerate() {
                    tracing::debug!(batch = i + 1, services = %batch.join(", "), "batch started");
                }
                println!(
                    "Stack {} is up: {} started, {} unchanged",
                    self.stack.name(),
                    report.started.len(),
                    report.unchanged.len()
                );
                Ok(())
            }
            Err(e) => match e.stack_failure() {
                Some(failure) => {
                    for f in &failure.failures {
                        eprintln!("  {}", f);
                    }
                    bail!(
                        "Failed to bring up {}: {} service failure(s){}",
                        self.stack.name(),
                        failure.failures.len(),
                        if failure.rolled_back { ", rolled back" } else { "" }
                    )
                }
                None => bail!("Failed to bring up {}: {}", self.stack.name(), e),
            },
        }
    }

    async fn down(&self, prune: bool) -> Result<()> {
        let report = self
            .orchestrator
            .down(&self.stack, &self.cancel)
            .await
            .with_context(|| format!("Failed to bring down {}", self.stack.name()))?;
        for instance in &report.stopped {
            println!("Stopped {}", instance);
        }

        if prune {
            for resource in self.orchestrator.prune(&self.stack).await? {
                println!("Removed {}", resource);
            }
        }
        tracing::debug!(running = self.runtime.running_instances().len(), "stack down");
        Ok(())
    }

    async fn print_status(&self, json: bool) -> Result<()> {
        let status = self.orchestrator.status(&self.stack).await;
        if json {
            println!("{}", serde_json::to_string_pretty(&StatusOutput::new(&self.stack, status))?);
            return Ok(());
        }

        println!(
            "{:<30} {:<16} {:<16} {:<9} ERROR",
            "INSTANCE", "SERVICE", "STATE", "RESTARTS"
        );
        for s in status {
            println!(
                "{:<30} {:<16} {:<16} {:<9} {}",
                s.id,
                s.service,
                s.state.to_string(),
                s.restarts,
                s.last_error.unwrap_or_default()
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusOutput {
    project: String,
    instances: Vec<InstanceStatus>,
}

impl StatusOutput {
    fn new(stack: &StackHandle, instances: Vec<InstanceStatus>) -> Self {
        Self {
            project: stack.name().to_string(),
            instances,
        }
    }
}

fn script(sim: &SimArgs) -> Result<MemoryRuntime> {
    let runtime = MemoryRuntime::new();
    for spec in &sim.fail_start {
        match spec.split_once('=') {
            Some((service, times)) => {
                let times: u32 = times
                    .parse()
                    .with_context(|| format!("Invalid --fail-start count in '{}'", spec))?;
                runtime.fail_starts(service, times);
            }
            None => runtime.fail_starts_always(spec),
        }
    }
    for service in &sim.unhealthy {
        runtime.script_probe(service, vec![ProbeStep::Fail; 1024]);
    }
    for image in &sim.fail_image {
        runtime.fail_image(image);
    }
    Ok(runtime)
}

/// Shrink every wait so a simulated run finishes promptly
fn compress(stack: &mut Stack, settings: &mut OrchestratorConfig) {
    const TICK: Duration = Duration::from_millis(10);

    settings.restart_delay = TICK;
    if settings.always_max_attempts.is_none() {
        settings.always_max_attempts = Some(settings.default_max_retries + 1);
    }
    for service in &mut stack.services {
        if let Some(probe) = &mut service.healthcheck {
            tracing::debug!(
                service = %service.name,
                interval = %format_duration(probe.interval),
                "compressing probe interval"
            );
            probe.interval = TICK;
            probe.start_period = Duration::ZERO;
            probe.timeout = probe.timeout.min(Duration::from_millis(100));
        }
    }
}
