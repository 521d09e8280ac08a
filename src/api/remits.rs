//! Remittance upload and query endpoints.

use crate::api::{default_limit, default_skip, read_upload_field, Page, JobAccepted};
use crate::error::AppError;
use crate::jobs::JobKind;
use crate::models::Remittance;
use crate::state::AppState;
use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(axum::http::StatusCode, Json<JobAccepted>), AppError> {
    let (filename, source) =
        read_upload_field(&mut multipart, state.config.streaming_threshold_bytes).await?;
    let job_id = state
        .jobs
        .submit(JobKind::ProcessRemittanceFile { filename, source })?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Remittance>, AppError> {
    let remittance = state.storage.get_remittance(id)?.ok_or(AppError::NotFound)?;
    Ok(Json(remittance))
}

#[derive(Debug, Deserialize)]
pub struct ListRemitsQuery {
    #[serde(default = "default_skip")]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub payer_id: Option<Uuid>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListRemitsQuery>,
) -> Result<Json<Page<Remittance>>, AppError> {
    let (items, total) = state.storage.list_remittances(q.payer_id, q.skip, q.limit)?;
    Ok(Json(Page {
        items,
        total,
        skip: q.skip,
        limit: q.limit,
    }))
}
