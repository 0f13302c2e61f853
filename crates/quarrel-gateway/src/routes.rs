use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::{info, warn};

use quarrel_core::error::QuarrelError;
use quarrel_core::settings::SavedSettings;
use quarrel_core::types::Submission;
use quarrel_engine::StepPlan;

use crate::state::AppState;

type ApiResult = Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)>;

fn error_body(status: StatusCode, message: impl ToString) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.to_string() })))
}

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /api/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": state.handle.status() }))
}

// GET /api/settings: last saved agent identities, empty when none
pub async fn settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SavedSettings>, (StatusCode, Json<serde_json::Value>)> {
    match state.settings.load() {
        Ok(saved) => Ok(Json(saved.unwrap_or_default())),
        Err(e) => {
            warn!(error = %e, "Failed to load settings");
            Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

// POST /api/submit: queue a run, 409 while another submission is waiting
pub async fn submit(State(state): State<Arc<AppState>>, Json(submission): Json<Submission>) -> ApiResult {
    if submission.agent_slots.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "no agents configured"));
    }

    let plan = StepPlan::parse_with(&submission.workflow_text, state.malformed_lines)
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, e))?;
    if plan.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "workflow has no steps"));
    }
    plan.validate(submission.agent_slots.len())
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, e))?;

    let agents = submission.agent_slots.len();
    match state.handle.submit(submission) {
        Ok(()) => {
            info!(agents, steps = plan.len(), "Submission queued");
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "accepted": true, "steps": plan.len() })),
            ))
        }
        Err(QuarrelError::Busy) => Err(error_body(StatusCode::CONFLICT, QuarrelError::Busy)),
        Err(e) => Err(error_body(StatusCode::SERVICE_UNAVAILABLE, e)),
    }
}
