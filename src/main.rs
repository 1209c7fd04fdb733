// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreman main entry point - CLI and commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio::sync::watch;

use foreman::config::{self, CliOptions, ResolvedConfig};
use foreman::events::{EventBus, EventPayload, ProgressEvent};
use foreman::process::{Health, ProcessManager};
use foreman::stream::{ServerMessage, StreamServer};
use foreman::telemetry::{init_telemetry, TelemetryConfig};
use foreman::types::{Mode, SUPERVISOR};
use foreman::workflow::{Supervisor, WorkflowDriver, WorkflowState};
use foreman::VERSION;

/// Foreman - supervisor-driven multi-agent orchestrator.
#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about = "Supervisor-driven multi-agent orchestrator", long_about = None)]
struct Cli {
    /// Workspace directory (defaults to the current directory)
    #[arg(short = 'C', long, global = true, env = "FOREMAN_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Maximum supervisor iterations per session
    #[arg(long, global = true, env = "FOREMAN_MAX_ITERATIONS")]
    max_iterations: Option<u32>,

    /// Calls allowed to one worker without progress
    #[arg(long, global = true, env = "FOREMAN_MAX_CALLS_PER_WORKER")]
    max_calls_per_worker: Option<u32>,

    /// Errors tolerated before a session ends
    #[arg(long, global = true, env = "FOREMAN_ERROR_THRESHOLD")]
    error_threshold: Option<usize>,

    /// Session wall-clock limit in seconds
    #[arg(long, global = true, env = "FOREMAN_SESSION_TIMEOUT")]
    session_timeout: Option<u64>,

    /// Route through the approval worker before responding
    #[arg(long, global = true, env = "FOREMAN_REQUIRE_APPROVAL")]
    require_approval: bool,

    /// Socket the stream server listens on
    #[arg(long, global = true, env = "FOREMAN_SOCKET")]
    socket: Option<PathBuf>,

    /// Command used to start every worker's tool server
    #[arg(long, global = true, env = "FOREMAN_WORKER_COMMAND")]
    worker_command: Option<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Workflow modes accepted on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Design, implement and validate something new
    Create,
    /// Answer a question about the workspace
    Explain,
    /// Repair existing code
    Fix,
    /// Review existing code
    Review,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Create => Mode::Create,
            ModeArg::Explain => Mode::Explain,
            ModeArg::Fix => Mode::Fix,
            ModeArg::Review => Mode::Review,
        }
    }
}

/// Subcommands for foreman.
#[derive(Subcommand)]
enum Commands {
    /// Serve clients over the local socket
    Serve,

    /// Run one session in the terminal
    Run {
        /// Workflow mode (inferred from the request when omitted)
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,

        /// Print call metrics when the session ends
        #[arg(long)]
        stats: bool,

        /// The request
        #[arg(required = true, trailing_var_arg = true)]
        query: Vec<String>,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init,

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = match cli.command {
        Commands::Serve if cli.verbose == 0 => TelemetryConfig::server(),
        _ => TelemetryConfig::from_verbosity(cli.verbose),
    };
    let _telemetry = init_telemetry(&telemetry)?;

    let workspace = match cli.workspace {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let cli_options = CliOptions {
        max_iterations: cli.max_iterations,
        max_calls_per_worker: cli.max_calls_per_worker,
        error_threshold: cli.error_threshold,
        session_timeout_secs: cli.session_timeout,
        require_approval: cli.require_approval.then_some(true),
        socket_path: cli.socket.clone(),
        worker_command: cli.worker_command.clone(),
    };

    match cli.command {
        Commands::Serve => {
            let config = config::load_config(&workspace, cli_options)?;
            serve(config).await
        }
        Commands::Run {
            mode,
            json,
            stats,
            query,
        } => {
            let config = config::load_config(&workspace, cli_options)?;
            let query = query.join(" ");
            let mode = mode.map(Mode::from).unwrap_or_else(|| Mode::infer(&query));
            let degraded = run_session(&config, &workspace, mode, &query, json).await?;
            if stats {
                print_stats();
            }
            if degraded {
                std::process::exit(2);
            }
            Ok(())
        }
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                let config = config::load_config(&workspace, cli_options)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        },
        Commands::Init => {
            let path = config::init_config(&workspace, None)?;
            println!("Created config file: {}", path.display());
            Ok(())
        }
        Commands::Version => {
            println!("foreman {}", VERSION);
            Ok(())
        }
    }
}

async fn serve(config: ResolvedConfig) -> anyhow::Result<()> {
    let socket = config.socket_path.clone();
    let mut server = StreamServer::new(&socket, config);
    server.start().await?;
    println!("{} Listening on {}", "→".cyan(), socket.display());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("\n{}", "Shutting down...".dimmed());
        }
    }
    server.stop().await?;
    Ok(())
}

/// Run one session in-process. Returns whether it ended degraded.
async fn run_session(
    config: &ResolvedConfig,
    workspace: &Path,
    mode: Mode,
    query: &str,
    json: bool,
) -> anyhow::Result<bool> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let bus = EventBus::new(session_id.clone(), config.event_capacity);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let manager = ProcessManager::new(bus.clone(), workspace, config.worker_specs())
        .with_policy(config.restart_policy())
        .with_cancel(cancel_rx.clone());
    let state = WorkflowState::new(
        session_id,
        mode,
        query,
        workspace.display().to_string(),
    );
    let mut driver = WorkflowDriver::new(
        Supervisor::new(config.supervisor_policy()),
        Arc::new(manager),
        bus.clone(),
        state,
    )
    .with_cancel(cancel_rx)
    .with_session_timeout(config.session_timeout());

    if !json {
        println!("{} {} {}", "→".cyan(), mode.to_string().bold(), query);
    }

    let printer = tokio::spawn(print_events(bus, json));
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_tx.send_replace(true);
        }
    });

    let outcome = driver.run().await;
    interrupt.abort();
    printer.await?;

    if !json {
        println!();
        if outcome.is_degraded() {
            eprintln!("{} {}", "✗".red(), outcome.termination.to_string().red());
        }
        println!("{}", outcome.final_response);
    }
    Ok(outcome.is_degraded())
}

async fn print_events(bus: EventBus, json: bool) {
    while let Some(event) = bus.next().await {
        if json {
            if let Ok(line) = serde_json::to_string(&ServerMessage::from_event(&event)) {
                println!("{}", line);
            }
        } else if let Some(line) = render_event(&event) {
            println!("{}", line);
        }
    }
}

fn render_event(event: &ProgressEvent) -> Option<String> {
    let agent = &event.agent;
    let line = match &event.payload {
        EventPayload::Decision {
            next,
            confidence,
            iteration,
            ..
        } => {
            let confidence = if *confidence < 1.0 {
                format!(" ({:.0}%)", confidence * 100.0)
            } else {
                String::new()
            };
            format!("{} {}{}", format!("[{}]", iteration).dimmed(), next.cyan().bold(), confidence.dimmed())
        }
        EventPayload::Progress { message, pct } => match pct {
            Some(pct) => format!("    {} {} {}", agent.dimmed(), message, format!("{:.0}%", pct).dimmed()),
            None => format!("    {} {}", agent.dimmed(), message),
        },
        EventPayload::Health { health, restart_count } => match health {
            Health::Unhealthy | Health::Crashed => format!(
                "    {} {} (restarts: {})",
                agent.yellow(),
                health.to_string().yellow(),
                restart_count
            ),
            _ => return None,
        },
        EventPayload::CallFinished { ok: true, duration_ms, .. } => {
            format!("  {} {} {}", "✓".green(), agent, format!("{}ms", duration_ms).dimmed())
        }
        EventPayload::CallFinished { error, .. } => format!(
            "  {} {} {}",
            "✗".red(),
            agent,
            error.as_deref().unwrap_or("failed").red()
        ),
        EventPayload::Log { level, message } if level == "error" || level == "warn" => {
            format!("    {} {}", agent.dimmed(), message.dimmed())
        }
        EventPayload::Error { code, .. } if agent == SUPERVISOR => format!("{} {}", "!".red(), code.red()),
        _ => return None,
    };
    Some(line)
}

#[cfg(feature = "telemetry")]
fn print_stats() {
    println!();
    println!("{}", foreman::telemetry::GLOBAL_METRICS.snapshot().format_report());
}

#[cfg(not(feature = "telemetry"))]
fn print_stats() {
    println!("{}", "Metrics are disabled in this build".dimmed());
}
