//! Liveness and component health endpoints (spec.md §6).

use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

pub async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DetailedHealth {
    pub status: &'static str,
    pub database: ComponentStatus,
    pub jobs_queued_or_running: usize,
}

pub async fn health_detailed(State(state): State<AppState>) -> Json<DetailedHealth> {
    let database = match state.storage.audit_stats(1) {
        Ok(_) => ComponentStatus {
            ok: true,
            detail: None,
        },
        Err(e) => ComponentStatus {
            ok: false,
            detail: Some(e.to_string()),
        },
    };
    let status = if database.ok { "ok" } else { "degraded" };
    Json(DetailedHealth {
        status,
        database,
        jobs_queued_or_running: 0,
    })
}
