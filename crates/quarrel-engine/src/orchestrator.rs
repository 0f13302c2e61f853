use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use quarrel_core::config::AppConfig;
use quarrel_core::error::{QuarrelError, Result};
use quarrel_core::event::EventBus;
use quarrel_core::settings::{SavedSettings, SettingsStore};
use quarrel_core::traits::{AgentChannel, AgentConnector};
use quarrel_core::types::{AgentSlot, RunStatus, Submission, WorkflowEvent};

use crate::diagnostics::Diagnostics;
use crate::executor::{RunReport, StepExecutor};
use crate::poller::ReplyPoller;
use crate::workflow::StepPlan;

/// Submissions that may wait while a run is active.
const INTAKE_CAPACITY: usize = 1;

/// Cloneable front door to a running [`SessionOrchestrator`].
#[derive(Clone)]
pub struct SubmissionHandle {
    tx: mpsc::Sender<Submission>,
    status: watch::Receiver<RunStatus>,
}

impl SubmissionHandle {
    /// Queue a submission without waiting for it to run.
    ///
    /// Fails with [`QuarrelError::Busy`] when a submission is already
    /// waiting, so nothing is ever silently overwritten.
    pub fn submit(&self, submission: Submission) -> Result<()> {
        self.tx.try_send(submission).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QuarrelError::Busy,
            mpsc::error::TrySendError::Closed(_) => QuarrelError::OrchestratorClosed,
        })
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }
}

/// Long-lived loop running one submission at a time.
///
/// On each accepted submission: persist the agent identities, reuse or
/// reconnect each slot's channel, execute the plan, and mirror the run
/// status outward.
pub struct SessionOrchestrator {
    config: AppConfig,
    connector: Arc<dyn AgentConnector>,
    event_bus: Arc<EventBus>,
    settings: SettingsStore,
    diagnostics: Arc<Diagnostics>,
    intake: mpsc::Receiver<Submission>,
    status: watch::Sender<RunStatus>,
    /// Open channel per slot index, with the address it was opened for.
    channels: HashMap<usize, (String, Arc<dyn AgentChannel>)>,
}

impl SessionOrchestrator {
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn AgentConnector>,
        event_bus: Arc<EventBus>,
    ) -> (Self, SubmissionHandle) {
        let (tx, intake) = mpsc::channel(INTAKE_CAPACITY);
        let (status, status_rx) = watch::channel(RunStatus::Ready);
        let settings = SettingsStore::new(config.settings_path());
        let diagnostics = Arc::new(Diagnostics::new(config.debug_dir(), config.error_dir()));

        let orchestrator = Self {
            config,
            connector,
            event_bus,
            settings,
            diagnostics,
            intake,
            status,
            channels: HashMap::new(),
        };
        let handle = SubmissionHandle {
            tx,
            status: status_rx,
        };
        (orchestrator, handle)
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Wait for submissions and run them one by one until cancelled or every
    /// handle is dropped. Cancelling also abandons the run in progress.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Session orchestrator waiting for submissions");

        loop {
            let submission = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Session orchestrator shutting down");
                    break;
                }
                next = self.intake.recv() => match next {
                    Some(submission) => submission,
                    None => {
                        info!("All submission handles dropped, orchestrator stopping");
                        break;
                    }
                },
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.run_submission(submission) => Some(result),
            };
            match outcome {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Submission rejected");
                    self.event_bus.publish(WorkflowEvent::Notice {
                        message: format!("Submission rejected: {}", e),
                    });
                }
                None => {
                    warn!("Run interrupted, session orchestrator shutting down");
                    self.event_bus.publish(WorkflowEvent::Notice {
                        message: "Run interrupted".to_string(),
                    });
                    break;
                }
            }
        }
    }

    /// Run one submission to completion.
    ///
    /// Errors when the submission is unusable (no agents, bad workflow text,
    /// invalid plan) or a slot cannot be connected; the status is left
    /// untouched then.
    pub async fn run_submission(&mut self, submission: Submission) -> Result<RunReport> {
        let slots = submission.slots();
        if slots.is_empty() {
            return Err(QuarrelError::Plan("no agents configured".to_string()));
        }

        self.persist_identities(&submission);

        let plan = StepPlan::parse_with(&submission.workflow_text, self.config.engine.malformed_lines)?;
        if plan.is_empty() {
            return Err(QuarrelError::Plan("workflow has no steps".to_string()));
        }

        let channels = self.channels_for(&slots)?;
        let poller = ReplyPoller::new(self.config.poller.clone()).with_diagnostics(self.diagnostics.clone());
        let executor = StepExecutor::new(
            slots,
            channels,
            self.config.route_resolver(),
            poller,
            self.event_bus.clone(),
            self.config.engine.clone(),
        )?;
        executor.check_plan(&plan)?;

        self.set_status(RunStatus::Running);
        let report = executor.execute_checked(&plan, &submission.initial_task).await;
        self.set_status(RunStatus::Done);
        Ok(report)
    }

    fn persist_identities(&self, submission: &Submission) {
        let settings = SavedSettings {
            agent_slots: submission.agent_slots.clone(),
        };
        if let Err(e) = self.settings.save(&settings) {
            warn!(path = %self.settings.path().display(), error = %e, "Failed to save settings");
        }
    }

    /// Channel per slot, reconnecting any slot whose address changed since
    /// it was last opened.
    fn channels_for(&mut self, slots: &[AgentSlot]) -> Result<Vec<Arc<dyn AgentChannel>>> {
        let mut channels = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.channels.get(&slot.index) {
                Some((address, channel)) if *address == slot.endpoint_address => {
                    channels.push(channel.clone());
                }
                _ => {
                    info!(agent = %slot.name, address = %slot.endpoint_address, "Connecting agent");
                    let channel = self.connector.connect(slot)?;
                    self.channels
                        .insert(slot.index, (slot.endpoint_address.clone(), channel.clone()));
                    channels.push(channel);
                }
            }
        }
        Ok(channels)
    }

    fn set_status(&self, status: RunStatus) {
        self.status.send_replace(status);
        self.event_bus.publish(WorkflowEvent::StatusChanged { status });
    }
}
