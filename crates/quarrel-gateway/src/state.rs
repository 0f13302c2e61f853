use quarrel_core::config::{GatewayConfig, MalformedPolicy};
use quarrel_core::settings::SettingsStore;
use quarrel_engine::SubmissionHandle;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    /// How workflow text is checked before a submission is queued.
    pub malformed_lines: MalformedPolicy,
    pub handle: SubmissionHandle,
    pub settings: SettingsStore,
}
