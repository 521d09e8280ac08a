//! Shared application state handed to every protected and public route.
//! Mission: one place collecting the collaborators C6–C14 already build
//! independently, the way the teacher's `AppState` collects its engines.

use crate::cache::Cache;
use crate::config::AppConfig;
use crate::episodes::EpisodeLinker;
use crate::jobs::JobDispatcher;
use crate::patterns::PatternDetector;
use crate::push::PushChannel;
use crate::risk::scorer::RiskScorer;
use crate::storage::Storage;
use crate::transform::Transformer;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Arc<Storage>,
    pub cache: Arc<Cache>,
    pub transformer: Arc<Transformer>,
    pub scorer: Arc<RiskScorer>,
    pub linker: Arc<EpisodeLinker>,
    pub patterns: Arc<PatternDetector>,
    pub push: Arc<PushChannel>,
    pub jobs: Arc<JobDispatcher>,
}
