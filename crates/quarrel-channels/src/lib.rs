//! Agent channels: how prompts reach an agent and how its output is observed.

pub mod http;

pub use http::{HttpAgentChannel, HttpConnector};
