//! Episode query, manual-link, and status-transition endpoints (spec.md §4.7).

use crate::api::{default_limit, default_skip, Page};
use crate::error::AppError;
use crate::models::{Claim, Episode, EpisodeStatus, Remittance};
use crate::state::AppState;
use crate::storage::EpisodeFilter;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn parse_episode_status(s: &str) -> Option<EpisodeStatus> {
    match s.to_lowercase().as_str() {
        "open" => Some(EpisodeStatus::Open),
        "partial" => Some(EpisodeStatus::Partial),
        "denied" => Some(EpisodeStatus::Denied),
        "paid" => Some(EpisodeStatus::Paid),
        "appealed" => Some(EpisodeStatus::Appealed),
        "closed" => Some(EpisodeStatus::Closed),
        _ => None,
    }
}

/// Episodes are returned with their claim and remittance eagerly attached
/// (spec.md §6: "eager child associations") rather than forcing a second
/// round trip per episode.
#[derive(Debug, Serialize)]
pub struct EpisodeDetail {
    #[serde(flatten)]
    pub episode: Episode,
    pub claim: Option<Claim>,
    pub remittance: Option<Remittance>,
}

fn hydrate(state: &AppState, episode: Episode) -> Result<EpisodeDetail, AppError> {
    let claim = state.storage.get_claim(episode.claim_id)?;
    let remittance = state.storage.get_remittance(episode.remittance_id)?;
    Ok(EpisodeDetail {
        episode,
        claim,
        remittance,
    })
}

#[derive(Debug, Deserialize)]
pub struct ListEpisodesQuery {
    #[serde(default = "default_skip")]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub claim_id: Option<Uuid>,
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListEpisodesQuery>,
) -> Result<Json<Page<EpisodeDetail>>, AppError> {
    let status = match &q.status {
        Some(s) => Some(parse_episode_status(s).ok_or_else(|| {
            AppError::input("invalid_status", format!("unknown episode status '{s}'"))
        })?),
        None => None,
    };
    let filter = EpisodeFilter {
        claim_id: q.claim_id,
        status,
    };
    let (episodes, total) = state.storage.list_episodes(&filter, q.skip, q.limit)?;
    let items = episodes
        .into_iter()
        .map(|e| hydrate(&state, e))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(Page {
        items,
        total,
        skip: q.skip,
        limit: q.limit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub claim_id: Uuid,
    pub remittance_id: Uuid,
}

pub async fn link(
    State(state): State<AppState>,
    Path(_id): Path<Uuid>,
    Json(body): Json<LinkRequest>,
) -> Result<Json<EpisodeDetail>, AppError> {
    let episode = state.linker.link_manual(body.claim_id, body.remittance_id)?;
    Ok(Json(hydrate(&state, episode)?))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

pub async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<EpisodeDetail>, AppError> {
    let status = parse_episode_status(&body.status).ok_or_else(|| {
        AppError::input("invalid_status", format!("unknown episode status '{}'", body.status))
    })?;
    let episode = state.linker.set_status(id, status)?;
    Ok(Json(hydrate(&state, episode)?))
}
