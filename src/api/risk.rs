//! Risk score query and recalculation endpoints (spec.md §4.10).

use crate::api::JobAccepted;
use crate::error::AppError;
use crate::jobs::JobKind;
use crate::models::RiskScore;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

pub async fn get_latest(
    State(state): State<AppState>,
    Path(claim_id): Path<Uuid>,
) -> Result<Json<RiskScore>, AppError> {
    let score = state.scorer.latest(claim_id)?.ok_or(AppError::NotFound)?;
    Ok(Json(score))
}

pub async fn recalculate(
    State(state): State<AppState>,
    Path(claim_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let job_id = state.jobs.submit(JobKind::RecalculateRisk { claim_id })?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}
