//! REST API surface (C15).
//! Mission: expose the upload/query/link/recalculate endpoints of spec.md
//! §6 over the collaborators already built in C6–C14, in the teacher's
//! `auth_router` / `protected_routes` / `public_routes` router-merge shape.

pub mod audit_logs;
pub mod cache;
pub mod claims;
pub mod episodes;
pub mod health;
pub mod remits;
pub mod risk;
pub mod ws;

use crate::error::AppError;
use crate::jobs::FileSource;
use axum::extract::Multipart;
use serde::Serialize;

/// Uniform pagination envelope for every list endpoint.
#[derive(Debug, Serialize)]
pub struct Page<T: Serialize> {
    pub items: Vec<T>,
    pub total: usize,
    pub skip: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: uuid::Uuid,
}

pub(crate) fn default_skip() -> usize {
    0
}

pub(crate) fn default_limit() -> usize {
    50
}

/// Buffers one multipart field to memory, spilling to a temp file above
/// `streaming_threshold_bytes` (spec.md §6) so large 837/835 files don't
/// balloon process memory. Returns the original filename plus a `FileSource`
/// the job dispatcher can hand to the streaming parser unmodified.
pub(crate) async fn read_upload_field(
    multipart: &mut Multipart,
    streaming_threshold_bytes: u64,
) -> Result<(String, FileSource), AppError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::input("bad_multipart", e.to_string()))?
        .ok_or_else(|| AppError::input("missing_file", "multipart body has no file field"))?;

    let filename = field
        .file_name()
        .map(str::to_string)
        .unwrap_or_else(|| "upload.edi".to_string());

    let bytes = field
        .bytes()
        .await
        .map_err(|e| AppError::input("bad_multipart", e.to_string()))?;

    if (bytes.len() as u64) <= streaming_threshold_bytes {
        return Ok((filename, FileSource::Memory(bytes.to_vec())));
    }

    let path = std::env::temp_dir().join(format!("claimguard-upload-{}.edi", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| AppError::InvariantViolation(format!("failed to spill upload to disk: {e}")))?;
    Ok((filename, FileSource::Path(path)))
}
