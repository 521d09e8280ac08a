//! claimguard API server bootstrap.
//! Mission: wire up storage, cache, job dispatch, and the REST/WebSocket
//! surface the way the teacher's `main` wires up its collaborators, then
//! serve behind auth + audit + rate-limit + CORS + request-logging layers.

use anyhow::{Context, Result};
use axum::routing::{get, post, put};
use axum::Router;
use claimguard::api::{audit_logs, cache as cache_api, claims, episodes, health, remits, risk, ws};
use claimguard::audit::{audit_middleware, AuditState};
use claimguard::auth::api as auth_api;
use claimguard::auth::middleware::auth_middleware;
use claimguard::auth::{AuthState, JwtHandler, UserStore};
use claimguard::cache::Cache;
use claimguard::config::AppConfig;
use claimguard::episodes::EpisodeLinker;
use claimguard::jobs::JobDispatcher;
use claimguard::middleware::rate_limit::{build_rate_limiter, rate_limit_middleware, RateLimitConfig};
use claimguard::middleware::request_logging_simple;
use claimguard::patterns::PatternDetector;
use claimguard::push::PushChannel;
use claimguard::risk::scorer::RiskScorer;
use claimguard::state::AppState;
use claimguard::storage::Storage;
use claimguard::transform::Transformer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

const PUSH_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("claimguard starting");

    let config = Arc::new(AppConfig::from_env().context("failed to load configuration")?);

    let storage = Arc::new(Storage::new(&config.database_path).context("failed to open storage")?);
    let cache = Cache::new();
    let push = PushChannel::new(PUSH_CHANNEL_CAPACITY);

    let transformer = Arc::new(Transformer::new(
        storage.clone(),
        cache.clone(),
        config.phi_hash_salt.clone(),
    ));
    let scorer = Arc::new(RiskScorer::new(storage.clone(), cache.clone(), push.clone()));
    let linker = Arc::new(EpisodeLinker::new(storage.clone(), cache.clone()));
    let patterns = Arc::new(PatternDetector::new(storage.clone()));

    let jobs = JobDispatcher::new(
        storage.clone(),
        transformer.clone(),
        scorer.clone(),
        linker.clone(),
        patterns.clone(),
        push.clone(),
        config.worker_pool_size,
        Duration::from_secs(config.job_soft_deadline_secs),
        Duration::from_secs(config.job_hard_deadline_secs),
    );

    let state = AppState {
        config: config.clone(),
        storage: storage.clone(),
        cache: cache.clone(),
        transformer,
        scorer,
        linker,
        patterns,
        push,
        jobs,
    };

    let user_store = Arc::new(UserStore::new(&format!("{}.users", config.database_path))?);
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret_key.clone()));
    let auth_state = AuthState::new(user_store, jwt_handler.clone());

    let audit_state = AuditState::new(storage.clone(), config.phi_hash_salt.clone());

    let rate_limit_config = RateLimitConfig::default();
    let rate_limiter = build_rate_limiter(&config, rate_limit_config).await?;

    let auth_router = Router::new()
        .route("/api/v1/auth/login", post(auth_api::login))
        .with_state(auth_state.clone());

    let mut admin_routes = Router::new()
        .route("/api/v1/admin/users", get(auth_api::list_users).post(auth_api::create_user))
        .route("/api/v1/admin/users/:id", axum::routing::delete(auth_api::delete_user));
    if config.require_auth {
        admin_routes = admin_routes.route_layer(axum::middleware::from_fn_with_state(
            jwt_handler.clone(),
            auth_middleware,
        ));
    }
    let admin_routes = admin_routes.with_state(auth_state);

    let mut protected_routes = Router::new()
        .route("/api/v1/claims", get(claims::list).post(claims::upload))
        .route("/api/v1/claims/:id", get(claims::get_one))
        .route("/api/v1/remittances", get(remits::list).post(remits::upload))
        .route("/api/v1/remittances/:id", get(remits::get_one))
        .route("/api/v1/episodes", get(episodes::list))
        .route("/api/v1/episodes/:id/link", put(episodes::link))
        .route("/api/v1/episodes/:id/status", put(episodes::set_status))
        .route("/api/v1/claims/:id/risk", get(risk::get_latest))
        .route("/api/v1/claims/:id/risk/recalculate", post(risk::recalculate))
        .route("/api/v1/audit-logs", get(audit_logs::list))
        .route("/api/v1/audit-logs/stats", get(audit_logs::stats))
        .route("/api/v1/cache/stats", get(cache_api::stats))
        .route("/api/v1/cache/stats/reset", post(cache_api::reset_stats))
        .route("/api/auth/me", get(auth_api::get_current_user))
        .route("/ws/notifications", get(ws::notifications));

    if config.require_auth {
        protected_routes = protected_routes.route_layer(axum::middleware::from_fn_with_state(
            jwt_handler.clone(),
            auth_middleware,
        ));
    }
    let protected_routes = protected_routes.with_state(state.clone());

    let public_routes = Router::new()
        .route("/api/v1/health", get(health::health))
        .route("/api/v1/health/detailed", get(health::health_detailed))
        .with_state(state.clone());

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
        .merge(auth_router)
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            audit_state,
            audit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging_simple))
        .into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "claimguard listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claimguard=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR"));
    for candidate in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if candidate.exists() {
            let _ = dotenv::from_path(&candidate);
        }
    }
}
