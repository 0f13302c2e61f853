use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quarrel_core::event::EventBus;
use quarrel_core::types::WorkflowEvent;

/// Markdown transcript writer.
///
/// Subscribes to the EventBus and appends one human-readable entry per
/// lifecycle event to `{dir}/{session}.md`. System lines are quoted
/// (`> text`), agent replies are attributed (`**Name**: text`). Every entry
/// is flushed as it is written, so a crash loses nothing already logged.
pub struct TranscriptLogger {
    dir: PathBuf,
    session: String,
}

impl TranscriptLogger {
    pub fn new(dir: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            session: session.into(),
        }
    }

    /// A logger for a session named after the current local time.
    pub fn for_new_session(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, Local::now().format("%Y%m%d-%H%M%S").to_string())
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.md", self.session))
    }

    /// Subscribe now and write in a background task. Subscribing before the
    /// spawn means no event published after this call is missed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    /// Write entries until cancelled or the bus closes. Events already
    /// queued when cancellation arrives are still written.
    pub async fn run(self, mut rx: broadcast::Receiver<WorkflowEvent>, cancel: CancellationToken) {
        let path = self.path();
        let mut writer = match self.open(&path).await {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open transcript");
                return;
            }
        };
        info!(path = %path.display(), "Transcript started");

        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Transcript cancelled, draining queued events");
                    while let Ok(event) = rx.try_recv() {
                        if let Some(entry) = transcript_entry(&event) {
                            writer.write_all(entry.as_bytes()).await.ok();
                        }
                    }
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => transcript_entry(&event),
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Transcript lagged, events lost");
                        Some(system_line(format!("{} events skipped", n)))
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, transcript stopping");
                        break;
                    }
                },
            };

            let Some(entry) = entry else {
                continue;
            };
            if let Err(e) = writer.write_all(entry.as_bytes()).await {
                error!(error = %e, "Failed to write transcript entry");
                break;
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush transcript");
            }
        }

        writer.flush().await.ok();
        debug!(path = %path.display(), "Transcript finished");
    }

    async fn open(&self, path: &Path) -> std::io::Result<tokio::io::BufWriter<tokio::fs::File>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let is_new = !tokio::fs::try_exists(path).await.unwrap_or(false);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut writer = tokio::io::BufWriter::new(file);
        if is_new {
            writer
                .write_all(format!("# Quarrel Workflow Log - {}\n\n", self.session).as_bytes())
                .await?;
            writer.flush().await?;
        }
        Ok(writer)
    }
}

fn system_line(text: impl AsRef<str>) -> String {
    format!("> {}\n\n", text.as_ref())
}

fn agent_line(name: &str, text: &str) -> String {
    format!("**{}**: {}\n\n", name, text)
}

/// Render one event as a transcript entry. Bookkeeping events produce
/// nothing.
pub fn transcript_entry(event: &WorkflowEvent) -> Option<String> {
    let entry = match event {
        WorkflowEvent::RunStarted { initial_task, .. } => system_line(format!("TASK: {}", initial_task)),
        WorkflowEvent::AgentPreparing { index, name, address } => {
            system_line(format!("Preparing agent {} ({}) at {}", index + 1, name, address))
        }
        WorkflowEvent::StepStarted {
            step,
            total,
            sources,
            targets,
        } => {
            let targets = targets
                .iter()
                .map(|t| (t + 1).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            system_line(format!("Step {}/{}: {} -> {}", step, total, sources, targets))
        }
        WorkflowEvent::DispatchFailed { name, error, .. } => {
            system_line(format!("Could not reach {}: {}", name, error))
        }
        WorkflowEvent::AgentReplied { name, text, .. } => agent_line(name, text),
        WorkflowEvent::AgentTimedOut { name, snapshot, .. } => match snapshot {
            Some(path) => system_line(format!(
                "{} did not settle in time (snapshot: {})",
                name,
                path.display()
            )),
            None => system_line(format!("{} did not settle in time", name)),
        },
        WorkflowEvent::RunComplete {
            steps,
            timeouts,
            elapsed_ms,
            ..
        } => system_line(format!(
            "DONE ({} steps, {} timeouts, {:.1}s)",
            steps,
            timeouts,
            *elapsed_ms as f64 / 1000.0
        )),
        WorkflowEvent::Notice { message } => system_line(message),
        WorkflowEvent::PromptDispatched { .. }
        | WorkflowEvent::StepComplete { .. }
        | WorkflowEvent::StatusChanged { .. } => return None,
    };
    Some(entry)
}
