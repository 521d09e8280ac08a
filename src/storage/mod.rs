//! Persistence layer (C7)
//! Mission: a transactional SQLite store for claims, remittances, episodes,
//! patterns, risk scores, and audit logs, in the teacher's
//! `DbSignalStorage` idiom (WAL mode, `rusqlite` + `parking_lot::Mutex`,
//! one connection shared behind a lock).
//!
//! Nested per-claim/per-remittance collections (lines, diagnoses,
//! adjustments, service lines) are stored as JSON columns on the owning
//! row — the relational surface that needs indexes (§6) is the flat
//! columns, and those get real SQLite indexes; the nested detail is
//! read-modify-write as a unit, matching how the parser/transformer
//! produce it.

pub mod queries;

use crate::error::AppError;
use crate::models::*;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS payers (
    id TEXT PRIMARY KEY,
    payer_id_external TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS providers (
    id TEXT PRIMARY KEY,
    npi TEXT UNIQUE,
    name TEXT NOT NULL,
    taxonomy_code TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY,
    payer_id TEXT NOT NULL REFERENCES payers(id),
    provider_id TEXT NOT NULL REFERENCES providers(id),
    claim_control_number TEXT NOT NULL,
    patient_control_number_hash TEXT NOT NULL,
    total_charge_amount TEXT NOT NULL,
    service_date_start TEXT,
    service_date_end TEXT,
    status TEXT NOT NULL,
    lines_json TEXT NOT NULL,
    diagnoses_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_claims_payer_id ON claims(payer_id);
CREATE INDEX IF NOT EXISTS idx_claims_provider_id ON claims(provider_id);
CREATE INDEX IF NOT EXISTS idx_claims_service_date ON claims(service_date_start);
CREATE INDEX IF NOT EXISTS idx_claims_created_at ON claims(created_at);
CREATE INDEX IF NOT EXISTS idx_claims_updated_at ON claims(updated_at);
CREATE INDEX IF NOT EXISTS idx_claims_payer_status ON claims(payer_id, status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_control_number ON claims(claim_control_number);

CREATE TABLE IF NOT EXISTS remittances (
    id TEXT PRIMARY KEY,
    payer_id TEXT NOT NULL REFERENCES payers(id),
    remittance_control_number TEXT NOT NULL,
    payment_amount TEXT NOT NULL,
    payment_date TEXT,
    payment_method TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_remittances_payment_date ON remittances(payment_date);
CREATE INDEX IF NOT EXISTS idx_remittances_created_at ON remittances(created_at);
CREATE INDEX IF NOT EXISTS idx_remittances_payer_created ON remittances(payer_id, created_at);

CREATE TABLE IF NOT EXISTS remittance_claims (
    id TEXT PRIMARY KEY,
    remittance_id TEXT NOT NULL REFERENCES remittances(id),
    claim_control_number TEXT NOT NULL,
    claim_status_code TEXT NOT NULL,
    paid_amount TEXT NOT NULL,
    charge_amount TEXT NOT NULL,
    patient_responsibility TEXT NOT NULL,
    adjustments_json TEXT NOT NULL,
    service_lines_json TEXT NOT NULL,
    patient_control_number_hash TEXT,
    service_date TEXT
);

CREATE INDEX IF NOT EXISTS idx_remit_claims_remittance ON remittance_claims(remittance_id);
CREATE INDEX IF NOT EXISTS idx_remit_claims_control_number ON remittance_claims(claim_control_number);

CREATE TABLE IF NOT EXISTS claim_episodes (
    id TEXT PRIMARY KEY,
    claim_id TEXT NOT NULL UNIQUE REFERENCES claims(id),
    remittance_id TEXT NOT NULL REFERENCES remittances(id),
    status TEXT NOT NULL,
    denial_count INTEGER NOT NULL,
    total_paid TEXT NOT NULL,
    total_adjustment TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_episodes_status_denials ON claim_episodes(status, denial_count);
CREATE INDEX IF NOT EXISTS idx_episodes_remittance_status ON claim_episodes(remittance_id, status);

CREATE TABLE IF NOT EXISTS episode_remittance_applications (
    claim_id TEXT NOT NULL REFERENCES claims(id),
    signature TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    PRIMARY KEY (claim_id, signature)
);

CREATE TABLE IF NOT EXISTS denial_patterns (
    id TEXT PRIMARY KEY,
    payer_id TEXT NOT NULL REFERENCES payers(id),
    denial_reason_code TEXT NOT NULL,
    procedure_code TEXT,
    diagnosis_code TEXT,
    frequency REAL NOT NULL,
    confidence REAL NOT NULL,
    occurrence_count INTEGER NOT NULL,
    first_observed TEXT NOT NULL,
    last_observed TEXT NOT NULL,
    UNIQUE(payer_id, denial_reason_code, procedure_code, diagnosis_code)
);

CREATE INDEX IF NOT EXISTS idx_patterns_payer_reason ON denial_patterns(payer_id, denial_reason_code);

CREATE TABLE IF NOT EXISTS risk_scores (
    id TEXT PRIMARY KEY,
    claim_id TEXT NOT NULL REFERENCES claims(id),
    calculated_at TEXT NOT NULL,
    overall_score INTEGER NOT NULL,
    level TEXT NOT NULL,
    factors_json TEXT NOT NULL,
    rationale TEXT
);

CREATE INDEX IF NOT EXISTS idx_risk_scores_claim_calculated ON risk_scores(claim_id, calculated_at);

CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    request_id TEXT NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    principal_hash TEXT,
    duration_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_method_path ON audit_logs(method, path);
CREATE INDEX IF NOT EXISTS idx_audit_status ON audit_logs(status_code);
"#;

pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub payer_id: Option<Uuid>,
    pub status: Option<ClaimStatus>,
    pub service_date_from: Option<NaiveDate>,
    pub service_date_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct EpisodeFilter {
    pub claim_id: Option<Uuid>,
    pub status: Option<EpisodeStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub method: Option<String>,
    pub path: Option<String>,
    pub status_code: Option<u16>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl Storage {
    pub fn new(db_path: &str) -> Result<Self, AppError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| AppError::from(e))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -- Payer / Provider identity resolution (upsert-returning, §4.6/§5) --

    pub fn upsert_payer(&self, payer_id_external: &str, name: &str) -> Result<Payer, AppError> {
        let conn = self.conn.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO payers (id, payer_id_external, name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(payer_id_external) DO UPDATE SET name = excluded.name
             WHERE payers.name != excluded.name",
            params![
                Uuid::new_v4().to_string(),
                payer_id_external,
                name,
                now.to_rfc3339()
            ],
        )?;
        queries::fetch_payer_by_external_id(&conn, payer_id_external)?
            .ok_or_else(|| AppError::InvariantViolation("payer upsert did not produce a row".into()))
    }

    pub fn upsert_provider(
        &self,
        npi: Option<&str>,
        name: &str,
        taxonomy_code: Option<&str>,
    ) -> Result<Provider, AppError> {
        let conn = self.conn.lock();
        let now = Utc::now();
        match npi {
            Some(npi) => {
                conn.execute(
                    "INSERT INTO providers (id, npi, name, taxonomy_code, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(npi) DO UPDATE SET name = excluded.name
                     WHERE providers.name != excluded.name",
                    params![Uuid::new_v4().to_string(), npi, name, taxonomy_code, now.to_rfc3339()],
                )?;
                queries::fetch_provider_by_npi(&conn, npi)?.ok_or_else(|| {
                    AppError::InvariantViolation("provider upsert did not produce a row".into())
                })
            }
            None => {
                // No NPI to key on: always insert a fresh row (can't content-address).
                let id = Uuid::new_v4();
                conn.execute(
                    "INSERT INTO providers (id, npi, name, taxonomy_code, created_at)
                     VALUES (?1, NULL, ?2, ?3, ?4)",
                    params![id.to_string(), name, taxonomy_code, now.to_rfc3339()],
                )?;
                Ok(Provider {
                    id,
                    npi: None,
                    name: name.to_string(),
                    taxonomy_code: taxonomy_code.map(String::from),
                    created_at: now,
                })
            }
        }
    }

    // -- Claims --

    /// Writes claims in batches (default 50, §4.6) to bound transaction size.
    pub fn insert_claims_batch(&self, claims: &[Claim]) -> Result<(), AppError> {
        const BATCH_SIZE: usize = 50;
        for chunk in claims.chunks(BATCH_SIZE) {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for claim in chunk {
                queries::insert_claim(&tx, claim)?;
            }
            tx.commit()?;
        }
        Ok(())
    }

    pub fn get_claim(&self, id: Uuid) -> Result<Option<Claim>, AppError> {
        let conn = self.conn.lock();
        queries::fetch_claim_by_id(&conn, id)
    }

    pub fn get_provider(&self, id: Uuid) -> Result<Option<Provider>, AppError> {
        let conn = self.conn.lock();
        queries::fetch_provider_by_id(&conn, id)
    }

    pub fn get_claim_by_control_number(
        &self,
        claim_control_number: &str,
    ) -> Result<Option<Claim>, AppError> {
        let conn = self.conn.lock();
        queries::fetch_claim_by_control_number(&conn, claim_control_number)
    }

    pub fn list_claims(
        &self,
        filter: &ClaimFilter,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<Claim>, usize), AppError> {
        let conn = self.conn.lock();
        queries::list_claims(&conn, filter, skip, limit)
    }

    pub fn update_risk_score_ref(&self, _claim_id: Uuid) {
        // Hook kept for symmetry with the cache-invalidation contract; the
        // scorer invalidates `risk_score:{claim_id}` itself (§4.10).
    }

    // -- Remittances --

    pub fn insert_remittance(&self, remittance: &Remittance) -> Result<(), AppError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        queries::insert_remittance(&tx, remittance)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_remittance(&self, id: Uuid) -> Result<Option<Remittance>, AppError> {
        let conn = self.conn.lock();
        queries::fetch_remittance_by_id(&conn, id)
    }

    pub fn list_remittances(
        &self,
        payer_id: Option<Uuid>,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<Remittance>, usize), AppError> {
        let conn = self.conn.lock();
        queries::list_remittances(&conn, payer_id, skip, limit)
    }

    // -- Episodes --

    pub fn get_episode_by_claim(&self, claim_id: Uuid) -> Result<Option<Episode>, AppError> {
        let conn = self.conn.lock();
        queries::fetch_episode_by_claim(&conn, claim_id)
    }

    pub fn get_episode(&self, id: Uuid) -> Result<Option<Episode>, AppError> {
        let conn = self.conn.lock();
        queries::fetch_episode_by_id(&conn, id)
    }

    pub fn upsert_episode(&self, episode: &Episode) -> Result<(), AppError> {
        let conn = self.conn.lock();
        queries::upsert_episode(&conn, episode)
    }

    pub fn list_episodes(
        &self,
        filter: &EpisodeFilter,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<Episode>, usize), AppError> {
        let conn = self.conn.lock();
        queries::list_episodes(&conn, filter, skip, limit)
    }

    /// Has this exact remittance-claim signature already been applied to
    /// this claim's episode (§8: re-linking the same remittance must not
    /// double-count)?
    pub fn has_applied_remittance(&self, claim_id: Uuid, signature: &str) -> Result<bool, AppError> {
        let conn = self.conn.lock();
        queries::has_applied_remittance(&conn, claim_id, signature)
    }

    pub fn record_applied_remittance(&self, claim_id: Uuid, signature: &str) -> Result<(), AppError> {
        let conn = self.conn.lock();
        queries::record_applied_remittance(&conn, claim_id, signature)
    }

    // -- Denial patterns --

    pub fn upsert_denial_pattern(&self, pattern: &DenialPattern) -> Result<DenialPattern, AppError> {
        let conn = self.conn.lock();
        queries::upsert_denial_pattern(&conn, pattern)
    }

    pub fn list_denial_patterns(&self, payer_id: Option<Uuid>) -> Result<Vec<DenialPattern>, AppError> {
        let conn = self.conn.lock();
        queries::list_denial_patterns(&conn, payer_id)
    }

    // -- Risk scores --

    pub fn insert_risk_score(&self, score: &RiskScore) -> Result<(), AppError> {
        let conn = self.conn.lock();
        queries::insert_risk_score(&conn, score)
    }

    /// Latest-per-claim resolves by max `calculated_at`, ties broken by row id (§5).
    pub fn latest_risk_score(&self, claim_id: Uuid) -> Result<Option<RiskScore>, AppError> {
        let conn = self.conn.lock();
        queries::latest_risk_score(&conn, claim_id)
    }

    // -- Audit logs --

    pub fn insert_audit_log(&self, log: &AuditLog) -> Result<(), AppError> {
        let conn = self.conn.lock();
        queries::insert_audit_log(&conn, log)
    }

    pub fn list_audit_logs(
        &self,
        filter: &AuditFilter,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<AuditLog>, usize), AppError> {
        let conn = self.conn.lock();
        queries::list_audit_logs(&conn, filter, skip, limit)
    }

    pub fn audit_stats(&self, days: i64) -> Result<queries::AuditStats, AppError> {
        let conn = self.conn.lock();
        queries::audit_stats(&conn, days)
    }

    // -- Payer denial-rate lookup, used by the payer risk factor (§4.9) --

    pub fn payer_denial_rate(&self, payer_id: Uuid, window_days: i64) -> Result<f64, AppError> {
        let conn = self.conn.lock();
        queries::payer_denial_rate(&conn, payer_id, window_days)
    }

    // -- Denial observations, feeds the pattern detector (C10) --

    pub fn fetch_denial_observations(
        &self,
        payer_id: Option<Uuid>,
        window_days: i64,
    ) -> Result<Vec<crate::patterns::DenialObservation>, AppError> {
        let conn = self.conn.lock();
        queries::fetch_denial_observations(&conn, payer_id, window_days)
    }
}

pub(crate) fn money_to_text(m: Decimal) -> String {
    m.to_string()
}

pub(crate) fn money_from_text(s: &str) -> Result<Decimal, AppError> {
    Decimal::from_str(s)
        .map_err(|e| AppError::InvariantViolation(format!("bad decimal in storage: {e}")))
}
