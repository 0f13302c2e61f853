use std::collections::HashMap;

use quarrel_core::types::AgentSlot;

use super::step::{Sources, WorkflowStep};

/// Mutable state of one run: the seed task and the latest output of every
/// agent that has produced one.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    initial_task: String,
    outputs: HashMap<usize, String>,
}

impl RunState {
    pub fn new(initial_task: impl Into<String>) -> Self {
        Self {
            initial_task: initial_task.into(),
            outputs: HashMap::new(),
        }
    }

    pub fn initial_task(&self) -> &str {
        &self.initial_task
    }

    /// Latest output of an agent, if it ever produced one.
    pub fn output(&self, index: usize) -> Option<&str> {
        self.outputs.get(&index).map(|s| s.as_str())
    }

    /// Record an agent's output, replacing any earlier one.
    pub fn record(&mut self, index: usize, output: impl Into<String>) {
        self.outputs.insert(index, output.into());
    }

    pub fn outputs(&self) -> &HashMap<usize, String> {
        &self.outputs
    }

    pub fn into_outputs(self) -> HashMap<usize, String> {
        self.outputs
    }

    /// Build the context string for a step.
    ///
    /// `USER` sources yield the initial task verbatim. Agent sources yield one
    /// `[name]: output` line per source, in source-list order; an agent that
    /// has not produced anything contributes an empty output.
    pub fn build_context(&self, step: &WorkflowStep, slots: &[AgentSlot]) -> String {
        match step.sources {
            Sources::User => self.initial_task.clone(),
            Sources::Agents(ref indices) => indices
                .iter()
                .map(|&i| {
                    let name = slots
                        .get(i)
                        .map(|s| s.name.clone())
                        .unwrap_or_else(|| format!("Agent{}", i + 1));
                    format!("[{}]: {}", name, self.output(i).unwrap_or_default())
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Assemble the full prompt sent to one target agent.
pub fn build_prompt(slot: &AgentSlot, context: &str, closing_directive: &str) -> String {
    let mut prompt = String::new();
    if let Some(ref role) = slot.role_directive {
        prompt.push_str("ROLE:");
        prompt.push_str(role);
        prompt.push('\n');
    }
    prompt.push_str("CTX:\n");
    prompt.push_str(context);
    prompt.push_str("\n\n");
    prompt.push_str(closing_directive);
    prompt
}
