//! Saga audit trail endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};
use saga_store::{FailureInfo, SagaData, SagaStepMetadata, SagaStore};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

/// Overall state of a saga as seen from its saga data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SagaState {
    Running,
    Completed,
    Failed,
}

impl SagaState {
    fn of(data: Option<&SagaData>) -> Self {
        match data {
            Some(data) if data.has_failed() => SagaState::Failed,
            Some(data) if data.is_completed => SagaState::Completed,
            _ => SagaState::Running,
        }
    }
}

#[derive(Serialize)]
pub struct StepResponse {
    pub step_type: String,
    pub handler_type: String,
    pub status: String,
    pub message_id: MessageId,
    pub parent_message_id: Option<MessageId>,
    pub application_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl From<SagaStepMetadata> for StepResponse {
    fn from(step: SagaStepMetadata) -> Self {
        Self {
            step_type: step.step_type,
            handler_type: step.handler_type,
            status: step.status.to_string(),
            message_id: step.message_id,
            parent_message_id: step.parent_message_id,
            application_id: step.application_id,
            recorded_at: step.recorded_at,
            failure: step.failure_info,
        }
    }
}

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: SagaId,
    pub state: SagaState,
    pub failed_step_type: Option<String>,
    pub failed_handler_type: Option<String>,
    pub data: Option<serde_json::Value>,
    pub steps: Vec<StepResponse>,
}

/// GET /sagas/{id}: latest record of every step plus the saga data.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = SagaId::parse(&id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id '{id}': {e}")))?;

    let store = state.runtime.store();
    let steps = store.get_saga_steps(saga_id).await?;
    let data = store.load_saga_data_raw(saga_id).await?;
    if steps.is_empty() && data.is_none() {
        return Err(ApiError::NotFound(format!("Saga {saga_id} not found")));
    }

    let saga_state = SagaState::of(data.as_ref());
    let (failed_step_type, failed_handler_type, data) = match data {
        Some(data) => (
            data.failed_step_type,
            data.failed_handler_type,
            Some(data.data),
        ),
        None => (None, None, None),
    };

    Ok(Json(SagaResponse {
        saga_id,
        state: saga_state,
        failed_step_type,
        failed_handler_type,
        data,
        steps: steps.into_iter().map(StepResponse::from).collect(),
    }))
}
