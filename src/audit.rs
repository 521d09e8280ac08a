//! Audit Middleware (C16)
//! Mission: record request metadata with hashed identifiers, append-only,
//! without ever blocking the request on a write failure (spec.md §5: "the
//! audit log writer is append-only and MUST NOT block the request on
//! failure — drop the record and log the drop").

use crate::auth::middleware::extract_claims;
use crate::models::AuditLog;
use crate::storage::Storage;
use crate::transform::hash_phi;
use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AuditState {
    storage: Arc<Storage>,
    salt: String,
}

impl AuditState {
    pub fn new(storage: Arc<Storage>, salt: String) -> Self {
        Self { storage, salt }
    }
}

/// Records one `AuditLog` row per request, firing the write on a detached
/// task so a slow or failing persistence layer never adds latency to the
/// response already sent to the caller.
pub async fn audit_middleware(
    State(state): State<AuditState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4();
    let principal_hash = extract_claims(&request).map(|c| hash_phi(&state.salt, &c.sub));

    let start = Instant::now();
    let response = next.run(request).await;
    let duration_ms = start.elapsed().as_millis() as u64;
    let status_code = response.status().as_u16();

    let log = AuditLog {
        id: request_id,
        timestamp: Utc::now(),
        request_id: request_id.to_string(),
        method,
        path,
        status_code,
        principal_hash,
        duration_ms,
    };

    let storage = state.storage.clone();
    tokio::spawn(async move {
        if let Err(e) = storage.insert_audit_log(&log) {
            warn!(error = %e, request_id = %log.request_id, "dropped audit log record");
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[tokio::test]
    async fn insert_and_query_roundtrip() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let log = AuditLog {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request_id: Uuid::new_v4().to_string(),
            method: "GET".to_string(),
            path: "/api/v1/claims".to_string(),
            status_code: 200,
            principal_hash: Some(hash_phi("salt", "user-1")),
            duration_ms: 12,
        };
        storage.insert_audit_log(&log).unwrap();

        let (rows, total) = storage
            .list_audit_logs(&crate::storage::AuditFilter::default(), 0, 10)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].path, "/api/v1/claims");
    }

    #[test]
    fn principal_hash_never_carries_plaintext() {
        let hashed = hash_phi("salt", "user-42");
        assert_ne!(hashed, "user-42");
        assert_eq!(hashed.len(), 64); // hex-encoded SHA-256
    }
}
