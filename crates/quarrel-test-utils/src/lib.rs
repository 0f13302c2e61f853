//! Scripted agents and fixtures shared by the Quarrel test suites.

mod channel;
mod fixtures;

pub use channel::{ScriptedChannel, ScriptedConnector};
pub use fixtures::{submission, test_config};
