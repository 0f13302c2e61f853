use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quarrel_channels::HttpConnector;
use quarrel_core::config::{AppConfig, MalformedPolicy};
use quarrel_core::event::EventBus;
use quarrel_core::settings::SettingsStore;
use quarrel_core::types::{Submission, WorkflowEvent};
use quarrel_engine::workflow::parser::parse_lines;
use quarrel_engine::{
    Diagnostics, HookSink, ParsedLine, SessionOrchestrator, StepPlan, TranscriptLogger,
};
use quarrel_gateway::GatewayServer;

/// Characters of each event shown on the console.
const CONSOLE_PREVIEW_CHARS: usize = 100;

#[derive(Parser)]
#[command(name = "quarrel", version, about = "Run multi-agent workflows across AI chat endpoints")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "quarrel.toml")]
    config: PathBuf,

    /// Transcript session name (defaults to the current time)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one submission file to completion and exit
    Run {
        /// JSON submission: agentSlots, roleDirectives, workflowText, initialTask
        submission: PathBuf,
    },
    /// Parse a workflow file and print the resulting steps
    Parse {
        /// Workflow text file
        file: PathBuf,
        /// Fail on the first malformed line instead of skipping it
        #[arg(long)]
        strict: bool,
    },
    /// Accept submissions over HTTP and run them one at a time
    Serve,
    /// Show the saved agent identities
    Settings,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quarrel=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "quarrel", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    // Only panics and Ctrl-C leave crash records
    Diagnostics::new(config.debug_dir(), config.error_dir()).install_panic_hook();

    dispatch(&cli, config).await
}

async fn dispatch(cli: &Cli, config: AppConfig) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Run { submission } => {
            let content = std::fs::read_to_string(submission)
                .with_context(|| format!("reading {}", submission.display()))?;
            let submission: Submission = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", submission.display()))?;
            run_once(&config, cli.session.clone(), submission).await
        }
        Commands::Parse { file, strict } => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            print_parse(&text, *strict)
        }
        Commands::Serve => serve(&config, cli.session.clone()).await,
        Commands::Settings => {
            let store = SettingsStore::new(config.settings_path());
            match store.load()? {
                Some(saved) => println!("{}", serde_json::to_string_pretty(&saved)?),
                None => println!("No saved settings at {}", store.path().display()),
            }
            Ok(())
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

/// Load the config from `path`, then `~/.quarrel/config.toml`, else defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".quarrel").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

/// Attach the transcript, hook, and console sinks to the bus.
fn start_sinks(
    config: &AppConfig,
    session: Option<String>,
    event_bus: &EventBus,
    cancel: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let transcript = match session {
        Some(name) => TranscriptLogger::new(config.transcript_dir(), name),
        None => TranscriptLogger::for_new_session(config.transcript_dir()),
    };
    info!(path = %transcript.path().display(), "Writing transcript");

    let mut handles = vec![
        transcript.spawn(event_bus, cancel.clone()),
        spawn_console(event_bus, cancel.clone()),
    ];
    if !config.hooks.is_empty() {
        handles.push(HookSink::new(config.hooks.clone()).spawn(event_bus, cancel.clone()));
    }
    handles
}

/// Record the interrupt, then cancel everything.
fn spawn_interrupt_handler(diagnostics: Diagnostics, cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, shutting down");
        if let Err(e) = diagnostics.write_crash_record("signal", "Interrupted", "Ctrl-C received", "") {
            error!(error = %e, "Failed to write interrupt record");
        }
        cancel.cancel();
    });
}

async fn run_once(config: &AppConfig, session: Option<String>, submission: Submission) -> anyhow::Result<()> {
    std::fs::create_dir_all(config.workspace_dir()).ok();
    let event_bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();
    let sinks = start_sinks(config, session, &event_bus, &cancel);
    spawn_interrupt_handler(Diagnostics::new(config.debug_dir(), config.error_dir()), cancel.clone());

    let connector = Arc::new(HttpConnector::new(&config.channel)?);
    let (mut orchestrator, _handle) = SessionOrchestrator::new(config.clone(), connector, event_bus.clone());

    let outcome = tokio::select! {
        report = orchestrator.run_submission(submission) => Some(report),
        _ = cancel.cancelled() => None,
    };

    // Closing the bus lets every sink drain and stop
    drop(orchestrator);
    drop(event_bus);
    for handle in sinks {
        handle.await.ok();
    }

    match outcome {
        Some(Ok(report)) => {
            println!(
                "\nRun {} finished: {} targets, {} timeouts, {:.1}s",
                report.run_id,
                report.results.len(),
                report.timeouts,
                report.elapsed_ms as f64 / 1000.0
            );
            Ok(())
        }
        Some(Err(e)) => Err(e.into()),
        None => anyhow::bail!("run interrupted"),
    }
}

async fn serve(config: &AppConfig, session: Option<String>) -> anyhow::Result<()> {
    std::fs::create_dir_all(config.workspace_dir()).ok();
    let event_bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();
    let sinks = start_sinks(config, session, &event_bus, &cancel);
    spawn_interrupt_handler(Diagnostics::new(config.debug_dir(), config.error_dir()), cancel.clone());

    let settings = SettingsStore::new(config.settings_path());
    match settings.load() {
        Ok(Some(saved)) => info!(agents = saved.agent_slots.len(), "Loaded saved agent identities"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Ignoring unreadable settings"),
    }

    let connector = Arc::new(HttpConnector::new(&config.channel)?);
    let (orchestrator, handle) = SessionOrchestrator::new(config.clone(), connector, event_bus.clone());
    let orchestrator_task = tokio::spawn(orchestrator.run(cancel.clone()));

    event_bus.publish(WorkflowEvent::Notice {
        message: "Engine started".to_string(),
    });

    let server = GatewayServer::new(
        config.gateway.clone(),
        config.engine.malformed_lines,
        handle,
        settings,
    );
    let served = server.run(cancel.clone()).await;

    cancel.cancel();
    orchestrator_task.await.ok();
    for handle in sinks {
        handle.await.ok();
    }
    served
}

fn print_parse(text: &str, strict: bool) -> anyhow::Result<()> {
    let policy = if strict {
        MalformedPolicy::Fail
    } else {
        MalformedPolicy::Skip
    };

    for parsed in parse_lines(text) {
        match parsed {
            ParsedLine::Step { line_no, step } => println!("{:>4}  {}", line_no, step),
            ParsedLine::Malformed {
                line_no,
                text,
                reason,
            } => println!("{:>4}  !! {:?}: {}", line_no, text, reason),
        }
    }

    let plan = StepPlan::parse_with(text, policy)?;
    println!("\n{} steps", plan.len());
    for (step, agent) in plan.unproduced_sources() {
        println!(
            "warning: step {} reads agent {} before any earlier step targets it",
            step + 1,
            agent + 1
        );
    }
    Ok(())
}

/// Print a one-line preview of each event, like a live log tail.
fn spawn_console(event_bus: &EventBus, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(event) => {
                        if let Some((speaker, text)) = console_line(&event) {
                            println!("\n{}: {}...", speaker, preview(&text, CONSOLE_PREVIEW_CHARS));
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn console_line(event: &WorkflowEvent) -> Option<(String, String)> {
    let sys = |text: String| Some(("SYS".to_string(), text));
    match event {
        WorkflowEvent::RunStarted { initial_task, .. } => sys(format!("TASK: {}", initial_task)),
        WorkflowEvent::AgentPreparing { name, address, .. } => {
            sys(format!("Navigating {} to {}", name, address))
        }
        WorkflowEvent::StepStarted { step, total, sources, .. } => {
            sys(format!("Step {}/{} from {}", step, total, sources))
        }
        WorkflowEvent::DispatchFailed { name, error, .. } => sys(format!("{} unreachable: {}", name, error)),
        WorkflowEvent::AgentReplied { name, text, .. } => Some((name.clone(), text.clone())),
        WorkflowEvent::AgentTimedOut { name, .. } => sys(format!("{} timed out", name)),
        WorkflowEvent::RunComplete { .. } => sys("DONE".to_string()),
        WorkflowEvent::StatusChanged { status } => sys(format!("Status {}", status)),
        WorkflowEvent::Notice { message } => sys(message.clone()),
        WorkflowEvent::PromptDispatched { .. } | WorkflowEvent::StepComplete { .. } => None,
    }
}

fn preview(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    use quarrel_test_utils::test_config;

    #[tokio::test]
    async fn test_user_errors_leave_no_crash_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let error_dir = config.error_dir();

        let missing = dir.path().join("missing.json");
        let cli = Cli::try_parse_from(["quarrel", "run", missing.to_str().unwrap()]).unwrap();
        let err = dispatch(&cli, config.clone()).await.unwrap_err();
        assert!(err.to_string().contains("missing.json"));

        let workflow = dir.path().join("bad.wdl");
        std::fs::write(&workflow, "USER -> 0").unwrap();
        let cli = Cli::try_parse_from(["quarrel", "parse", "--strict", workflow.to_str().unwrap()]).unwrap();
        assert!(dispatch(&cli, config).await.is_err());

        assert!(!error_dir.exists() || std::fs::read_dir(&error_dir).unwrap().next().is_none());
    }

    #[test]
    fn test_console_preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("hi", 100), "hi");
    }
}
