use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuarrelError {
    // Workflow errors
    #[error("Malformed workflow line {line_no}: {text:?} ({reason})")]
    Workflow {
        line_no: usize,
        text: String,
        reason: String,
    },

    #[error("Invalid step plan: {0}")]
    Plan(String),

    // Orchestrator errors
    #[error("A submission is already waiting to run")]
    Busy,

    #[error("Orchestrator is not running")]
    OrchestratorClosed,

    // Agent channel errors
    #[error("Channel error: {agent}: {message}")]
    Channel { agent: String, message: String },

    // Routing errors
    #[error("Routing table error: {0}")]
    Routing(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Settings errors
    #[error("Settings error: {0}")]
    Settings(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QuarrelError {
    /// Build a [`QuarrelError::Channel`] for the named agent.
    pub fn channel(agent: impl Into<String>, message: impl ToString) -> Self {
        Self::Channel {
            agent: agent.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QuarrelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_error_display() {
        let err = QuarrelError::Workflow {
            line_no: 3,
            text: "1 -> x".into(),
            reason: "non-numeric token 'x'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed workflow line 3: \"1 -> x\" (non-numeric token 'x')"
        );
    }

    #[test]
    fn channel_constructor() {
        let err = QuarrelError::channel("Claude", "connection refused");
        assert!(matches!(
            err,
            QuarrelError::Channel { ref agent, ref message }
                if agent == "Claude" && message == "connection refused"
        ));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: QuarrelError = io_err.into();
        assert!(err.to_string().contains("missing"));
    }
}
