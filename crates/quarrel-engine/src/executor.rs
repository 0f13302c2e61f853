use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use quarrel_core::config::EngineConfig;
use quarrel_core::error::{QuarrelError, Result};
use quarrel_core::event::EventBus;
use quarrel_core::routing::RouteResolver;
use quarrel_core::traits::AgentChannel;
use quarrel_core::types::{AgentSlot, RunId, WorkflowEvent};

use crate::poller::{ReplyOutcome, ReplyPoller};
use crate::workflow::context::build_prompt;
use crate::workflow::{RunState, StepPlan};

/// Result of dispatching to one target within a step.
#[derive(Debug, Clone)]
pub struct TargetResult {
    /// 1-based step position.
    pub step: usize,
    /// 0-based agent index.
    pub index: usize,
    pub name: String,
    /// The stabilized reply, or the timeout sentinel.
    pub output: String,
    pub timed_out: bool,
    /// Whether the prompt reached the agent.
    pub dispatched: bool,
    pub elapsed_ms: u64,
}

/// Result of executing a whole plan.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    /// Final output per agent index. Agents never targeted are absent.
    pub outputs: HashMap<usize, String>,
    /// Per-target results in step order, then target order.
    pub results: Vec<TargetResult>,
    pub timeouts: usize,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn output(&self, index: usize) -> Option<&str> {
        self.outputs.get(&index).map(|s| s.as_str())
    }
}

/// Drives a step plan against a fixed set of agents.
///
/// Steps run strictly in declaration order. Within a step every target is
/// dispatched and awaited concurrently, and the next step starts only once
/// all of them have replied or timed out. Outputs are merged into the run
/// state after that barrier, so concurrent targets never share state.
pub struct StepExecutor {
    slots: Vec<AgentSlot>,
    channels: Vec<Arc<dyn AgentChannel>>,
    resolver: RouteResolver,
    poller: ReplyPoller,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl StepExecutor {
    /// `channels[i]` must be the channel for `slots[i]`.
    pub fn new(
        slots: Vec<AgentSlot>,
        channels: Vec<Arc<dyn AgentChannel>>,
        resolver: RouteResolver,
        poller: ReplyPoller,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Result<Self> {
        if slots.len() != channels.len() {
            return Err(QuarrelError::Plan(format!(
                "{} agent slots but {} channels",
                slots.len(),
                channels.len()
            )));
        }
        Ok(Self {
            slots,
            channels,
            resolver,
            poller,
            event_bus,
            config,
        })
    }

    pub fn slots(&self) -> &[AgentSlot] {
        &self.slots
    }

    /// Check the plan against the configured agents before anything is
    /// dispatched.
    pub fn check_plan(&self, plan: &StepPlan) -> Result<()> {
        plan.validate(self.slots.len())?;

        for (step, agent) in plan.unproduced_sources() {
            let name = &self.slots[agent].name;
            if self.config.strict_sources {
                return Err(QuarrelError::Plan(format!(
                    "step {} ({}) reads from {} (agent {}) before any step produced its output",
                    step + 1,
                    plan.steps[step],
                    name,
                    agent + 1
                )));
            }
            warn!(
                step = step + 1,
                agent = %name,
                "Step reads an agent with no output yet, using empty text"
            );
        }
        Ok(())
    }

    /// Execute every step of `plan`, seeded with `initial_task`.
    ///
    /// Only plan validation can fail. Unreachable agents and timeouts are
    /// recorded and the run carries on.
    pub async fn execute(&self, plan: &StepPlan, initial_task: &str) -> Result<RunReport> {
        self.check_plan(plan)?;
        Ok(self.execute_checked(plan, initial_task).await)
    }

    /// Execute a plan that already passed [`StepExecutor::check_plan`].
    pub async fn execute_checked(&self, plan: &StepPlan, initial_task: &str) -> RunReport {
        let start = Instant::now();
        let run_id = RunId::new();
        info!(run_id = %run_id, steps = plan.len(), agents = self.slots.len(), "Run started");
        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            initial_task: initial_task.to_string(),
        });

        self.prepare_agents().await;

        let mut state = RunState::new(initial_task);
        let mut results = Vec::new();
        let total = plan.len();

        for (i, step) in plan.steps.iter().enumerate() {
            let step_no = i + 1;
            let step_start = Instant::now();
            info!(step = step_no, total, plan_line = %step, "Executing step");
            self.event_bus.publish(WorkflowEvent::StepStarted {
                step: step_no,
                total,
                sources: step.sources.to_string(),
                targets: step.targets.clone(),
            });

            let context = state.build_context(step, &self.slots);
            let step_results = join_all(
                step.targets
                    .iter()
                    .map(|&target| self.run_target(step_no, target, &context)),
            )
            .await;

            for result in step_results {
                state.record(result.index, result.output.clone());
                results.push(result);
            }

            let elapsed_ms = step_start.elapsed().as_millis() as u64;
            debug!(step = step_no, elapsed_ms, "Step complete");
            self.event_bus.publish(WorkflowEvent::StepComplete {
                step: step_no,
                elapsed_ms,
            });
        }

        let timeouts = results.iter().filter(|r| r.timed_out).count();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(run_id = %run_id, timeouts, elapsed_ms, "Run complete");
        self.event_bus.publish(WorkflowEvent::RunComplete {
            run_id: run_id.clone(),
            steps: total,
            timeouts,
            elapsed_ms,
        });

        RunReport {
            run_id,
            outputs: state.into_outputs(),
            results,
            timeouts,
            elapsed_ms,
        }
    }

    /// Point every addressed slot at its endpoint. Failures are logged and
    /// left for the poller to surface as timeouts.
    async fn prepare_agents(&self) {
        for (slot, channel) in self.slots.iter().zip(&self.channels) {
            if !slot.has_address() {
                continue;
            }
            self.event_bus.publish(WorkflowEvent::AgentPreparing {
                index: slot.index,
                name: slot.name.clone(),
                address: slot.endpoint_address.clone(),
            });
            if let Err(e) = channel.prepare().await {
                warn!(agent = %slot.name, error = %e, "Failed to prepare agent");
                self.event_bus.publish(WorkflowEvent::DispatchFailed {
                    index: slot.index,
                    name: slot.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn run_target(&self, step: usize, index: usize, context: &str) -> TargetResult {
        let slot = &self.slots[index];
        let channel = &self.channels[index];
        let start = Instant::now();

        let prompt = build_prompt(slot, context, &self.config.closing_directive);
        let prompt_chars = prompt.chars().count();
        let route = self.resolver.resolve(&slot.name);

        let dispatched = match channel.submit(route, prompt).await {
            Ok(()) => {
                debug!(agent = %slot.name, prompt_chars, "Prompt dispatched");
                self.event_bus.publish(WorkflowEvent::PromptDispatched {
                    index,
                    name: slot.name.clone(),
                    prompt_chars,
                });
                true
            }
            Err(e) => {
                warn!(agent = %slot.name, error = %e, "Dispatch failed, waiting anyway");
                self.event_bus.publish(WorkflowEvent::DispatchFailed {
                    index,
                    name: slot.name.clone(),
                    error: e.to_string(),
                });
                false
            }
        };

        let outcome = self
            .poller
            .wait(channel.as_ref(), &self.resolver, &slot.name)
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            ReplyOutcome::Reply(ref text) => {
                self.event_bus.publish(WorkflowEvent::AgentReplied {
                    index,
                    name: slot.name.clone(),
                    text: text.clone(),
                    elapsed_ms,
                });
            }
            ReplyOutcome::TimedOut { ref snapshot, .. } => {
                self.event_bus.publish(WorkflowEvent::AgentTimedOut {
                    index,
                    name: slot.name.clone(),
                    snapshot: snapshot.clone(),
                });
            }
        }

        TargetResult {
            step,
            index,
            name: slot.name.clone(),
            timed_out: outcome.is_timeout(),
            output: outcome.into_text(),
            dispatched,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarrel_core::config::PollerConfig;
    use quarrel_core::routing::Route;
    use quarrel_test_utils::ScriptedChannel;

    fn executor(slots: Vec<AgentSlot>, channels: Vec<Arc<ScriptedChannel>>, bus: Arc<EventBus>) -> StepExecutor {
        let channels = channels
            .into_iter()
            .map(|c| c as Arc<dyn AgentChannel>)
            .collect();
        StepExecutor::new(
            slots,
            channels,
            RouteResolver::fixed(Route::new("prompt", "reply")),
            ReplyPoller::new(PollerConfig::default()),
            bus,
            EngineConfig::default(),
        )
        .unwrap()
    }

    fn unnamed_slots(n: usize) -> Vec<AgentSlot> {
        (0..n).map(|i| AgentSlot::new(i, "", "")).collect()
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_agent_relay() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let first = ScriptedChannel::fixed("Itinerary").into_arc();
        let second = ScriptedChannel::fixed("Approved").into_arc();
        let exec = executor(unnamed_slots(2), vec![first.clone(), second.clone()], bus);

        let plan = StepPlan::parse("USER -> 1\n1 -> 2").unwrap();
        let report = exec.execute(&plan, "Plan a trip").await.unwrap();

        assert_eq!(report.output(0), Some("Itinerary"));
        assert_eq!(report.output(1), Some("Approved"));
        assert_eq!(report.timeouts, 0);
        assert_eq!(first.prompts(), vec!["CTX:\nPlan a trip\n\nREPLY:".to_string()]);
        assert!(second.prompts()[0].contains("[Agent1]: Itinerary"));

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(WorkflowEvent::RunComplete { steps: 2, timeouts: 0, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_waits_for_slowest_target() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let reviewer = ScriptedChannel::fixed("Summary").into_arc();
        let exec = executor(
            unnamed_slots(4),
            vec![
                ScriptedChannel::fixed("A").into_arc(),
                ScriptedChannel::never_settles().into_arc(),
                ScriptedChannel::fixed("C").into_arc(),
                reviewer.clone(),
            ],
            bus,
        );

        let plan = StepPlan::parse("USER -> (1,2,3)\n(1,2,3) -> 4").unwrap();
        let start = Instant::now();
        let report = exec.execute(&plan, "task").await.unwrap();

        // Step two cannot start before agent 2's full wait budget
        assert!(start.elapsed().as_secs() >= 120);
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.output(1), Some("(TIMEOUT)"));
        assert_eq!(
            reviewer.prompts()[0],
            "CTX:\n[Agent1]: A\n[Agent2]: (TIMEOUT)\n[Agent3]: C\n\nREPLY:"
        );

        let events = drain(&mut rx);
        let timed_out_at = events
            .iter()
            .position(|e| matches!(e, WorkflowEvent::AgentTimedOut { index: 1, .. }))
            .unwrap();
        let second_step_at = events
            .iter()
            .position(|e| matches!(e, WorkflowEvent::StepStarted { step: 2, .. }))
            .unwrap();
        assert!(timed_out_at < second_step_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_is_swallowed() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let exec = executor(
            unnamed_slots(1),
            vec![ScriptedChannel::fixed("stale page text").failing_submit().into_arc()],
            bus,
        );

        let plan = StepPlan::parse("USER -> 1").unwrap();
        let report = exec.execute(&plan, "task").await.unwrap();

        assert!(!report.results[0].dispatched);
        assert_eq!(report.output(0), Some("stale page text"));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WorkflowEvent::DispatchFailed { index: 0, .. })));
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_plan() {
        let exec = executor(
            unnamed_slots(2),
            vec![
                ScriptedChannel::fixed("a").into_arc(),
                ScriptedChannel::fixed("b").into_arc(),
            ],
            Arc::new(EventBus::default()),
        );
        let plan = StepPlan::parse("USER -> 1\n1 -> 3").unwrap();
        let err = exec.execute(&plan, "task").await.unwrap_err();
        assert!(matches!(err, QuarrelError::Plan(_)));
    }

    #[tokio::test]
    async fn test_strict_sources_rejects_unproduced_input() {
        let channels: Vec<Arc<dyn AgentChannel>> = vec![
            ScriptedChannel::fixed("a").into_arc(),
            ScriptedChannel::fixed("b").into_arc(),
        ];
        let exec = StepExecutor::new(
            unnamed_slots(2),
            channels,
            RouteResolver::fixed(Route::new("prompt", "reply")),
            ReplyPoller::new(PollerConfig::default()),
            Arc::new(EventBus::default()),
            EngineConfig {
                strict_sources: true,
                ..EngineConfig::default()
            },
        )
        .unwrap();

        let plan = StepPlan::parse("2 -> 1").unwrap();
        let err = exec.check_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("before any step produced"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_checked_trusts_caller_check() {
        let reader = ScriptedChannel::fixed("a").into_arc();
        let channels: Vec<Arc<dyn AgentChannel>> =
            vec![reader.clone(), ScriptedChannel::fixed("b").into_arc()];
        let exec = StepExecutor::new(
            unnamed_slots(2),
            channels,
            RouteResolver::fixed(Route::new("prompt", "reply")),
            ReplyPoller::new(PollerConfig::default()),
            Arc::new(EventBus::default()),
            EngineConfig {
                strict_sources: true,
                ..EngineConfig::default()
            },
        )
        .unwrap();

        let plan = StepPlan::parse("2 -> 1").unwrap();
        assert!(exec.execute(&plan, "t").await.is_err());
        assert!(reader.prompts().is_empty());

        let report = exec.execute_checked(&plan, "t").await;
        assert_eq!(report.output(0), Some("a"));
        assert_eq!(reader.prompts(), vec!["CTX:\n[Agent2]: \n\nREPLY:".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepares_only_addressed_slots() {
        let addressed = ScriptedChannel::fixed("x").into_arc();
        let bare = ScriptedChannel::fixed("y").into_arc();
        let slots = vec![
            AgentSlot::new(0, "Web", "http://127.0.0.1:9100"),
            AgentSlot::new(1, "Local", ""),
        ];
        let exec = executor(slots, vec![addressed.clone(), bare.clone()], Arc::new(EventBus::default()));

        exec.execute(&StepPlan::parse("USER -> (1,2)").unwrap(), "t")
            .await
            .unwrap();
        assert_eq!(addressed.prepares(), 1);
        assert_eq!(bare.prepares(), 0);
    }

    #[test]
    fn test_mismatched_channels_rejected() {
        let result = StepExecutor::new(
            unnamed_slots(2),
            vec![ScriptedChannel::fixed("a").into_arc() as Arc<dyn AgentChannel>],
            RouteResolver::fixed(Route::new("prompt", "reply")),
            ReplyPoller::new(PollerConfig::default()),
            Arc::new(EventBus::default()),
            EngineConfig::default(),
        );
        assert!(result.is_err());
    }
}
