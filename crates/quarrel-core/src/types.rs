use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one agent as entered on the configuration surface.
///
/// This is the only part of a submission that is persisted between sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotConfig {
    #[serde(default)]
    pub name: String,
    /// Older settings files store the address under `url`.
    #[serde(default, alias = "url")]
    pub endpoint_address: String,
}

impl SlotConfig {
    pub fn new(name: impl Into<String>, endpoint_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint_address: endpoint_address.into(),
        }
    }
}

/// One participant of a run. Immutable for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSlot {
    /// 0-based position; WDL refers to it as `index + 1`.
    pub index: usize,
    pub name: String,
    pub endpoint_address: String,
    /// Persona text prefixed to every prompt sent to this agent.
    pub role_directive: Option<String>,
}

impl AgentSlot {
    /// Build a slot. A blank name falls back to `Agent{index + 1}`.
    pub fn new(index: usize, name: impl Into<String>, endpoint_address: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.trim().is_empty() {
            format!("Agent{}", index + 1)
        } else {
            name.trim().to_string()
        };
        Self {
            index,
            name,
            endpoint_address: endpoint_address.into().trim().to_string(),
            role_directive: None,
        }
    }

    /// Set the role directive. Blank text clears it.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        let role = role.into();
        self.role_directive = if role.trim().is_empty() {
            None
        } else {
            Some(role)
        };
        self
    }

    pub fn has_address(&self) -> bool {
        !self.endpoint_address.is_empty()
    }
}

/// A complete workflow submission from the configuration surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(default, alias = "aiSlots")]
    pub agent_slots: Vec<SlotConfig>,
    #[serde(default, alias = "roles")]
    pub role_directives: Vec<String>,
    #[serde(default, alias = "workflow")]
    pub workflow_text: String,
    #[serde(default)]
    pub initial_task: String,
}

impl Submission {
    /// Materialize the agent slots for a run, pairing each slot with its
    /// role directive by position.
    pub fn slots(&self) -> Vec<AgentSlot> {
        self.agent_slots
            .iter()
            .enumerate()
            .map(|(i, cfg)| {
                let role = self.role_directives.get(i).cloned().unwrap_or_default();
                AgentSlot::new(i, cfg.name.clone(), cfg.endpoint_address.clone()).with_role(role)
            })
            .collect()
    }
}

/// Live status of the orchestrator, mirrored to the configuration surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    #[default]
    Ready,
    Running,
    Done,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::Running => write!(f, "RUNNING"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

/// Lifecycle event broadcast to all sinks (transcript, console, hooks).
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A submission was accepted and a run started.
    RunStarted { run_id: RunId, initial_task: String },
    /// A slot is being pointed at its endpoint before the first step.
    AgentPreparing { index: usize, name: String, address: String },
    /// A step began executing.
    StepStarted {
        step: usize,
        total: usize,
        sources: String,
        targets: Vec<usize>,
    },
    /// A prompt was delivered to an agent.
    PromptDispatched { index: usize, name: String, prompt_chars: usize },
    /// Delivering a prompt or preparing a slot failed. The run continues.
    DispatchFailed { index: usize, name: String, error: String },
    /// An agent's output stabilized.
    AgentReplied {
        index: usize,
        name: String,
        text: String,
        elapsed_ms: u64,
    },
    /// An agent never stabilized within the wait budget.
    AgentTimedOut {
        index: usize,
        name: String,
        snapshot: Option<PathBuf>,
    },
    /// Every target of a step finished (reply or timeout).
    StepComplete { step: usize, elapsed_ms: u64 },
    /// Every step executed.
    RunComplete {
        run_id: RunId,
        steps: usize,
        timeouts: usize,
        elapsed_ms: u64,
    },
    /// Status mirrored outward.
    StatusChanged { status: RunStatus },
    /// Free-form system line for the transcript.
    Notice { message: String },
}
