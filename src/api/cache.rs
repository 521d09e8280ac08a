//! Cache introspection endpoints (spec.md §6) — hit/miss/set/invalidation
//! counters for operators, plus a manual reset for test/debug harnesses.

use crate::cache::CacheStats;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;

pub async fn stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

pub async fn reset_stats(State(state): State<AppState>) -> Json<CacheStats> {
    state.cache.reset_stats();
    Json(state.cache.stats())
}
