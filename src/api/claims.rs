//! Claim upload and query endpoints.

use crate::api::{default_limit, default_skip, read_upload_field, Page, JobAccepted};
use crate::error::AppError;
use crate::jobs::JobKind;
use crate::models::{Claim, ClaimStatus, RiskScore};
use crate::state::AppState;
use crate::storage::ClaimFilter;
use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(axum::http::StatusCode, Json<JobAccepted>), AppError> {
    let (filename, source) =
        read_upload_field(&mut multipart, state.config.streaming_threshold_bytes).await?;
    let job_id = state.jobs.submit(JobKind::ProcessClaimFile { filename, source })?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

#[derive(Debug, Serialize)]
pub struct ClaimDetail {
    #[serde(flatten)]
    pub claim: Claim,
    pub risk_score: Option<RiskScore>,
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClaimDetail>, AppError> {
    let claim = state.storage.get_claim(id)?.ok_or(AppError::NotFound)?;
    let risk_score = state.scorer.latest(id)?;
    Ok(Json(ClaimDetail { claim, risk_score }))
}

fn parse_status(s: &str) -> Option<ClaimStatus> {
    match s.to_lowercase().as_str() {
        "submitted" => Some(ClaimStatus::Submitted),
        "processing" => Some(ClaimStatus::Processing),
        "adjudicated" => Some(ClaimStatus::Adjudicated),
        "error" => Some(ClaimStatus::Error),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct ListClaimsQuery {
    #[serde(default = "default_skip")]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub payer_id: Option<Uuid>,
    pub status: Option<String>,
    pub service_date_from: Option<NaiveDate>,
    pub service_date_to: Option<NaiveDate>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListClaimsQuery>,
) -> Result<Json<Page<Claim>>, AppError> {
    let status = match &q.status {
        Some(s) => Some(parse_status(s).ok_or_else(|| {
            AppError::input("invalid_status", format!("unknown claim status '{s}'"))
        })?),
        None => None,
    };
    let filter = ClaimFilter {
        payer_id: q.payer_id,
        status,
        service_date_from: q.service_date_from,
        service_date_to: q.service_date_to,
    };
    let (items, total) = state.storage.list_claims(&filter, q.skip, q.limit)?;
    Ok(Json(Page {
        items,
        total,
        skip: q.skip,
        limit: q.limit,
    }))
}
