use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quarrel_core::config::HooksConfig;
use quarrel_core::event::EventBus;
use quarrel_core::hooks::run_hooks;
use quarrel_core::types::WorkflowEvent;

/// Max characters handed to narration hooks through `QUARREL_SPOKEN`.
const SPOKEN_MAX_CHARS: usize = 150;

/// Runs the configured `[hooks]` commands for lifecycle events.
///
/// Hooks for one event run to completion before the next event is handled,
/// so narration never talks over itself.
pub struct HookSink {
    config: HooksConfig,
}

impl HookSink {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    pub async fn run(self, mut rx: broadcast::Receiver<WorkflowEvent>, cancel: CancellationToken) {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        info!("Hook sink started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(event) => {
                        let Some((commands, env)) = self.hooks_for(&event) else {
                            continue;
                        };
                        let env_refs: Vec<(&str, &str)> =
                            env.iter().map(|(k, v)| (*k, v.as_str())).collect();
                        let failures = run_hooks(commands, &env_refs, timeout).await;
                        if failures > 0 {
                            debug!(failures, "Some hooks failed");
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Hook sink lagged, hooks not run for skipped events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Hook sink stopped");
    }

    /// Commands and environment for one event, if any hooks are configured
    /// for it.
    fn hooks_for(&self, event: &WorkflowEvent) -> Option<(&[String], Vec<(&'static str, String)>)> {
        let (commands, env) = match event {
            WorkflowEvent::RunStarted {
                run_id,
                initial_task,
            } => (
                &self.config.on_run_start,
                vec![
                    ("QUARREL_EVENT", "run_start".to_string()),
                    ("QUARREL_RUN_ID", run_id.to_string()),
                    ("QUARREL_TEXT", initial_task.clone()),
                    ("QUARREL_SPOKEN", spoken(initial_task)),
                ],
            ),
            WorkflowEvent::AgentReplied { name, text, .. } => (
                &self.config.on_reply,
                vec![
                    ("QUARREL_EVENT", "reply".to_string()),
                    ("QUARREL_AGENT", name.clone()),
                    ("QUARREL_TEXT", text.clone()),
                    ("QUARREL_SPOKEN", spoken(text)),
                ],
            ),
            WorkflowEvent::AgentTimedOut { name, snapshot, .. } => (
                &self.config.on_timeout,
                vec![
                    ("QUARREL_EVENT", "timeout".to_string()),
                    ("QUARREL_AGENT", name.clone()),
                    (
                        "QUARREL_SNAPSHOT",
                        snapshot
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                    ),
                ],
            ),
            WorkflowEvent::RunComplete {
                run_id,
                steps,
                timeouts,
                ..
            } => (
                &self.config.on_run_complete,
                vec![
                    ("QUARREL_EVENT", "run_complete".to_string()),
                    ("QUARREL_RUN_ID", run_id.to_string()),
                    ("QUARREL_STEPS", steps.to_string()),
                    ("QUARREL_TIMEOUTS", timeouts.to_string()),
                ],
            ),
            _ => return None,
        };
        if commands.is_empty() {
            None
        } else {
            Some((commands.as_slice(), env))
        }
    }
}

/// Strip Markdown emphasis and mention/heading marks, then cap the length.
fn spoken(text: &str) -> String {
    text.replace("**", "")
        .chars()
        .filter(|c| *c != '@' && *c != '#')
        .take(SPOKEN_MAX_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spoken_text_is_cleaned() {
        assert_eq!(spoken("**Plan**: see #3 @Bob"), "Plan: see 3 Bob");
        assert_eq!(spoken(&"a".repeat(400)).len(), SPOKEN_MAX_CHARS);
    }

    #[test]
    fn test_unconfigured_events_have_no_hooks() {
        let sink = HookSink::new(HooksConfig {
            on_reply: vec!["true".into()],
            ..HooksConfig::default()
        });
        let started = WorkflowEvent::Notice {
            message: "hi".into(),
        };
        assert!(sink.hooks_for(&started).is_none());

        let reply = WorkflowEvent::AgentReplied {
            index: 0,
            name: "A".into(),
            text: "**ok**".into(),
            elapsed_ms: 1,
        };
        let (commands, env) = sink.hooks_for(&reply).unwrap();
        assert_eq!(commands, ["true".to_string()]);
        assert!(env.contains(&("QUARREL_SPOKEN", "ok".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reply_hook_receives_text() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("said.txt");
        let sink = HookSink::new(HooksConfig {
            on_reply: vec![format!("printf '%s:%s' \"$QUARREL_AGENT\" \"$QUARREL_TEXT\" > {}", out.display())],
            ..HooksConfig::default()
        });

        let bus = EventBus::new(8);
        let handle = sink.spawn(&bus, CancellationToken::new());
        bus.publish(WorkflowEvent::AgentReplied {
            index: 1,
            name: "Critic".into(),
            text: "Too long".into(),
            elapsed_ms: 3,
        });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(std::fs::read_to_string(out).unwrap(), "Critic:Too long");
    }
}
