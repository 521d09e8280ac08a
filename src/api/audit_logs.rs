//! Audit log query endpoints. Access is restricted to `role ∈ {admin, audit}`
//! (spec.md §6); everything else is read straight off C16's storage.

use crate::api::{default_limit, default_skip, Page};
use crate::auth::middleware::extract_claims;
use crate::error::AppError;
use crate::models::AuditLog;
use crate::state::AppState;
use crate::storage::queries::AuditStats;
use crate::storage::AuditFilter;
use axum::extract::{Query, Request, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

fn require_audit_access(request: &Request) -> Result<(), AppError> {
    let claims = extract_claims(request).ok_or(AppError::Unauthorized)?;
    if claims.role.can_view_audit_logs() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

#[derive(Debug, Deserialize)]
pub struct ListAuditLogsQuery {
    #[serde(default = "default_skip")]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status_code: Option<u16>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListAuditLogsQuery>,
    request: Request,
) -> Result<Json<Page<AuditLog>>, AppError> {
    require_audit_access(&request)?;
    let filter = AuditFilter {
        method: q.method.clone(),
        path: q.path.clone(),
        status_code: q.status_code,
        start_date: q.start_date,
        end_date: q.end_date,
    };
    let (items, total) = state.storage.list_audit_logs(&filter, q.skip, q.limit)?;
    Ok(Json(Page {
        items,
        total,
        skip: q.skip,
        limit: q.limit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    7
}

pub async fn stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
    request: Request,
) -> Result<Json<AuditStats>, AppError> {
    require_audit_access(&request)?;
    let stats = state.storage.audit_stats(q.days)?;
    Ok(Json(stats))
}
