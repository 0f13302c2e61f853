//! Workflow description (WDL) handling.
//!
//! A workflow is a list of `SRC -> DST` lines. Each line becomes one
//! [`WorkflowStep`]; the resulting [`StepPlan`] is executed strictly in line
//! order. [`RunState`] holds the outputs produced so far and builds the
//! context string each step feeds to its targets.

pub mod context;
pub mod parser;
pub mod step;

pub use context::RunState;
pub use parser::{ParsedLine, StepPlan};
pub use step::{Sources, WorkflowStep};
