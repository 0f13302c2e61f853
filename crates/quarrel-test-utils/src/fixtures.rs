use std::path::Path;

use quarrel_core::config::AppConfig;
use quarrel_core::types::{SlotConfig, Submission};

/// A config rooted at `dir`, with every other setting at its default.
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.workspace.dir = dir.display().to_string();
    config
}

/// A submission with one slot per name, no role directives, and local
/// placeholder addresses.
pub fn submission(names: &[&str], workflow: &str, task: &str) -> Submission {
    Submission {
        agent_slots: names
            .iter()
            .enumerate()
            .map(|(i, name)| SlotConfig::new(*name, format!("http://127.0.0.1:{}", 9100 + i)))
            .collect(),
        role_directives: Vec::new(),
        workflow_text: workflow.to_string(),
        initial_task: task.to_string(),
    }
}
