use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use quarrel_core::config::PollerConfig;
use quarrel_core::routing::RouteResolver;
use quarrel_core::traits::AgentChannel;

use crate::diagnostics::Diagnostics;

/// Result of waiting on one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Output stopped changing. Holds the trimmed text.
    Reply(String),
    /// The wait budget ran out first.
    TimedOut {
        sentinel: String,
        snapshot: Option<PathBuf>,
    },
}

impl ReplyOutcome {
    /// Text recorded as the agent's output: the reply or the sentinel.
    pub fn text(&self) -> &str {
        match self {
            Self::Reply(text) => text,
            Self::TimedOut { sentinel, .. } => sentinel,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Reply(text) => text,
            Self::TimedOut { sentinel, .. } => sentinel,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Consecutive-unchanged counter over a stream of samples.
///
/// A non-empty sample that differs from the previous one resets the count.
/// Anything else, including an empty sample, counts as unchanged.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    last: String,
    same: usize,
    threshold: usize,
}

impl StabilityTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            last: String::new(),
            same: 0,
            threshold: threshold.max(1),
        }
    }

    /// Feed one sample. Returns the trimmed stable text once the threshold
    /// of consecutive unchanged samples is reached.
    pub fn observe(&mut self, sample: &str) -> Option<String> {
        if !sample.is_empty() && sample != self.last {
            self.last = sample.to_string();
            self.same = 0;
            return None;
        }
        self.same += 1;
        (self.same >= self.threshold).then(|| self.last.trim().to_string())
    }

    pub fn unchanged(&self) -> usize {
        self.same
    }

    pub fn last(&self) -> &str {
        &self.last
    }
}

/// Waits for an agent's output to stabilize by sampling it on a fixed
/// interval.
pub struct ReplyPoller {
    config: PollerConfig,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl ReplyPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            diagnostics: None,
        }
    }

    /// Write a snapshot of the agent's surface whenever a wait times out.
    pub fn with_diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Sample `channel` until its output stabilizes or the wait budget runs
    /// out. Never fails: sampling errors count as empty samples and a
    /// timeout yields the sentinel.
    pub async fn wait(
        &self,
        channel: &dyn AgentChannel,
        resolver: &RouteResolver,
        name: &str,
    ) -> ReplyOutcome {
        let start = Instant::now();
        let max_wait = self.config.max_wait();
        let mut tracker = StabilityTracker::new(self.config.stable_samples);

        while start.elapsed() < max_wait {
            // Routing edits apply to the next poll
            let route = resolver.resolve(name);
            let sample = match channel.sample(route).await {
                Ok(text) => text,
                Err(e) => {
                    debug!(agent = %name, error = %e, "Sample failed, treating as empty");
                    String::new()
                }
            };

            if let Some(text) = tracker.observe(&sample) {
                debug!(
                    agent = %name,
                    chars = text.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Reply stabilized"
                );
                return ReplyOutcome::Reply(text);
            }

            sleep(self.config.interval()).await;
        }

        warn!(
            agent = %name,
            max_wait_secs = self.config.max_wait_secs,
            unchanged = tracker.unchanged(),
            "Reply never stabilized"
        );
        let snapshot = self.capture_snapshot(channel, name).await;
        ReplyOutcome::TimedOut {
            sentinel: self.config.timeout_sentinel.clone(),
            snapshot,
        }
    }

    async fn capture_snapshot(&self, channel: &dyn AgentChannel, name: &str) -> Option<PathBuf> {
        let diagnostics = self.diagnostics.as_ref()?;
        let content = match channel.snapshot().await {
            Ok(content) => content,
            Err(e) => {
                warn!(agent = %name, error = %e, "Could not capture timeout snapshot");
                return None;
            }
        };
        match diagnostics.write_snapshot(name, &content).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(agent = %name, error = %e, "Could not write timeout snapshot");
                None
            }
        }
    }
}
