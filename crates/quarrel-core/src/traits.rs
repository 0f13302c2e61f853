use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::routing::Route;
use crate::types::AgentSlot;

/// Injection + observation channel for one agent slot.
///
/// The engine only assumes that `sample` is idempotent, cheap, and safe to
/// call on a fixed interval. How prompts are delivered and output observed
/// (HTTP, IPC, a remote UI) is up to the implementation.
pub trait AgentChannel: Send + Sync + 'static {
    /// Point the channel at its endpoint before the first step of a run.
    fn prepare(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Deliver a prompt using the route's input operation.
    fn submit(&self, route: Route, prompt: String) -> BoxFuture<'_, Result<()>>;

    /// Read the agent's current output using the route's reply operation.
    fn sample(&self, route: Route) -> BoxFuture<'_, Result<String>>;

    /// Dump the full observed surface, for postmortem debugging.
    fn snapshot(&self) -> BoxFuture<'_, Result<String>>;
}

/// Builds a channel for a slot. Called once per slot, and again whenever the
/// slot's endpoint address changes between runs.
pub trait AgentConnector: Send + Sync + 'static {
    fn connect(&self, slot: &AgentSlot) -> Result<Arc<dyn AgentChannel>>;
}
