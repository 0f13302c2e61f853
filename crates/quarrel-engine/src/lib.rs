pub mod diagnostics;
pub mod executor;
pub mod hook_sink;
pub mod orchestrator;
pub mod poller;
pub mod transcript;
pub mod workflow;

pub use diagnostics::Diagnostics;
pub use executor::{RunReport, StepExecutor, TargetResult};
pub use hook_sink::HookSink;
pub use orchestrator::{SessionOrchestrator, SubmissionHandle};
pub use poller::{ReplyOutcome, ReplyPoller, StabilityTracker};
pub use transcript::TranscriptLogger;
pub use workflow::{ParsedLine, RunState, Sources, StepPlan, WorkflowStep};
