//! Row <-> domain-model mapping and hand-written SQL for the storage layer.
//! Kept separate from `mod.rs` so the `Storage` API surface stays readable.

use super::{money_from_text, money_to_text, AuditFilter, ClaimFilter, EpisodeFilter};
use crate::error::AppError;
use crate::models::*;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn parse_uuid(s: String) -> Result<Uuid, AppError> {
    Uuid::parse_str(&s).map_err(|e| AppError::InvariantViolation(format!("bad uuid in storage: {e}")))
}

fn parse_dt(s: String) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::InvariantViolation(format!("bad timestamp in storage: {e}")))
}

fn parse_date_opt(s: Option<String>) -> Result<Option<NaiveDate>, AppError> {
    s.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|e| AppError::InvariantViolation(format!("bad date in storage: {e}")))
    })
    .transpose()
}

// -- Payer / Provider --

pub fn fetch_payer_by_external_id(
    conn: &Connection,
    payer_id_external: &str,
) -> Result<Option<Payer>, AppError> {
    conn.query_row(
        "SELECT id, payer_id_external, name, created_at FROM payers WHERE payer_id_external = ?1",
        params![payer_id_external],
        row_to_payer,
    )
    .optional()
    .map_err(AppError::from)?
    .transpose()
}

fn row_to_payer(row: &Row) -> rusqlite::Result<Result<Payer, AppError>> {
    Ok((|| {
        Ok(Payer {
            id: parse_uuid(row.get(0)?)?,
            payer_id_external: row.get(1)?,
            name: row.get(2)?,
            created_at: parse_dt(row.get(3)?)?,
        })
    })())
}

pub fn fetch_provider_by_npi(conn: &Connection, npi: &str) -> Result<Option<Provider>, AppError> {
    conn.query_row(
        "SELECT id, npi, name, taxonomy_code, created_at FROM providers WHERE npi = ?1",
        params![npi],
        row_to_provider,
    )
    .optional()
    .map_err(AppError::from)?
    .transpose()
}

pub fn fetch_provider_by_id(conn: &Connection, id: Uuid) -> Result<Option<Provider>, AppError> {
    conn.query_row(
        "SELECT id, npi, name, taxonomy_code, created_at FROM providers WHERE id = ?1",
        params![id.to_string()],
        row_to_provider,
    )
    .optional()
    .map_err(AppError::from)?
    .transpose()
}

fn row_to_provider(row: &Row) -> rusqlite::Result<Result<Provider, AppError>> {
    Ok((|| {
        Ok(Provider {
            id: parse_uuid(row.get(0)?)?,
            npi: row.get(1)?,
            name: row.get(2)?,
            taxonomy_code: row.get(3)?,
            created_at: parse_dt(row.get(4)?)?,
        })
    })())
}

// -- Claims --

pub fn insert_claim(conn: &Connection, claim: &Claim) -> Result<(), AppError> {
    let lines_json = serde_json::to_string(&claim.lines)
        .map_err(|e| AppError::InvariantViolation(format!("claim lines serialize: {e}")))?;
    let diagnoses_json = serde_json::to_string(&claim.diagnoses)
        .map_err(|e| AppError::InvariantViolation(format!("claim diagnoses serialize: {e}")))?;
    conn.execute(
        "INSERT INTO claims (
            id, payer_id, provider_id, claim_control_number, patient_control_number_hash,
            total_charge_amount, service_date_start, service_date_end, status,
            lines_json, diagnoses_json, created_at, updated_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
         ON CONFLICT(claim_control_number) DO UPDATE SET
            total_charge_amount = excluded.total_charge_amount,
            status = excluded.status,
            lines_json = excluded.lines_json,
            diagnoses_json = excluded.diagnoses_json,
            updated_at = excluded.updated_at",
        params![
            claim.id.to_string(),
            claim.payer_id.to_string(),
            claim.provider_id.to_string(),
            claim.claim_control_number,
            claim.patient_control_number_hash,
            money_to_text(claim.total_charge_amount),
            claim.service_date_start.map(|d| d.to_string()),
            claim.service_date_end.map(|d| d.to_string()),
            status_to_text(claim.status),
            lines_json,
            diagnoses_json,
            claim.created_at.to_rfc3339(),
            claim.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn status_to_text(s: ClaimStatus) -> &'static str {
    match s {
        ClaimStatus::Submitted => "submitted",
        ClaimStatus::Processing => "processing",
        ClaimStatus::Adjudicated => "adjudicated",
        ClaimStatus::Error => "error",
    }
}

fn status_from_text(s: &str) -> Result<ClaimStatus, AppError> {
    Ok(match s {
        "submitted" => ClaimStatus::Submitted,
        "processing" => ClaimStatus::Processing,
        "adjudicated" => ClaimStatus::Adjudicated,
        "error" => ClaimStatus::Error,
        other => {
            return Err(AppError::InvariantViolation(format!(
                "unknown claim status in storage: {other}"
            )))
        }
    })
}

fn row_to_claim(row: &Row) -> rusqlite::Result<Result<Claim, AppError>> {
    Ok((|| {
        let lines_json: String = row.get(9)?;
        let diagnoses_json: String = row.get(10)?;
        Ok(Claim {
            id: parse_uuid(row.get(0)?)?,
            payer_id: parse_uuid(row.get(1)?)?,
            provider_id: parse_uuid(row.get(2)?)?,
            claim_control_number: row.get(3)?,
            patient_control_number_hash: row.get(4)?,
            total_charge_amount: money_from_text(&row.get::<_, String>(5)?)?,
            service_date_start: parse_date_opt(row.get(6)?)?,
            service_date_end: parse_date_opt(row.get(7)?)?,
            status: status_from_text(&row.get::<_, String>(8)?)?,
            lines: serde_json::from_str(&lines_json)
                .map_err(|e| AppError::InvariantViolation(format!("claim lines parse: {e}")))?,
            diagnoses: serde_json::from_str(&diagnoses_json)
                .map_err(|e| AppError::InvariantViolation(format!("claim diagnoses parse: {e}")))?,
            created_at: parse_dt(row.get(11)?)?,
            updated_at: parse_dt(row.get(12)?)?,
        })
    })())
}

const CLAIM_COLUMNS: &str = "id, payer_id, provider_id, claim_control_number, patient_control_number_hash,
     total_charge_amount, service_date_start, service_date_end, status,
     lines_json, diagnoses_json, created_at, updated_at";

pub fn fetch_claim_by_id(conn: &Connection, id: Uuid) -> Result<Option<Claim>, AppError> {
    conn.query_row(
        &format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE id = ?1"),
        params![id.to_string()],
        row_to_claim,
    )
    .optional()
    .map_err(AppError::from)?
    .transpose()
}

pub fn fetch_claim_by_control_number(
    conn: &Connection,
    claim_control_number: &str,
) -> Result<Option<Claim>, AppError> {
    conn.query_row(
        &format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE claim_control_number = ?1"),
        params![claim_control_number],
        row_to_claim,
    )
    .optional()
    .map_err(AppError::from)?
    .transpose()
}

pub fn list_claims(
    conn: &Connection,
    filter: &ClaimFilter,
    skip: usize,
    limit: usize,
) -> Result<(Vec<Claim>, usize), AppError> {
    let mut where_clauses = Vec::new();
    let mut bind: Vec<String> = Vec::new();

    if let Some(payer_id) = filter.payer_id {
        where_clauses.push(format!("payer_id = ?{}", bind.len() + 1));
        bind.push(payer_id.to_string());
    }
    if let Some(status) = filter.status {
        where_clauses.push(format!("status = ?{}", bind.len() + 1));
        bind.push(status_to_text(status).to_string());
    }
    if let Some(from) = filter.service_date_from {
        where_clauses.push(format!("service_date_start >= ?{}", bind.len() + 1));
        bind.push(from.to_string());
    }
    if let Some(to) = filter.service_date_to {
        where_clauses.push(format!("service_date_start <= ?{}", bind.len() + 1));
        bind.push(to.to_string());
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM claims {where_sql}");
    let total: usize = conn.query_row(&count_sql, rusqlite::params_from_iter(bind.iter()), |r| {
        r.get::<_, i64>(0)
    })? as usize;

    let list_sql = format!(
        "SELECT {CLAIM_COLUMNS} FROM claims {where_sql} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
        bind.len() + 1,
        bind.len() + 2
    );
    let mut stmt = conn.prepare(&list_sql)?;
    let mut all_bind: Vec<String> = bind.clone();
    all_bind.push(limit.to_string());
    all_bind.push(skip.to_string());

    let rows = stmt
        .query_map(rusqlite::params_from_iter(all_bind.iter()), row_to_claim)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .collect::<Result<Vec<Claim>, AppError>>()?;

    Ok((rows, total))
}

// -- Remittances --

pub fn insert_remittance(conn: &Connection, remittance: &Remittance) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO remittances (id, payer_id, remittance_control_number, payment_amount, payment_date, payment_method, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            remittance.id.to_string(),
            remittance.payer_id.to_string(),
            remittance.remittance_control_number,
            money_to_text(remittance.payment_amount),
            remittance.payment_date.map(|d| d.to_string()),
            remittance.payment_method,
            remittance.created_at.to_rfc3339(),
        ],
    )?;

    for claim in &remittance.claims {
        let adjustments_json = serde_json::to_string(&claim.adjustments)
            .map_err(|e| AppError::InvariantViolation(format!("adjustments serialize: {e}")))?;
        let service_lines_json = serde_json::to_string(&claim.service_lines)
            .map_err(|e| AppError::InvariantViolation(format!("service lines serialize: {e}")))?;
        conn.execute(
            "INSERT INTO remittance_claims (
                id, remittance_id, claim_control_number, claim_status_code, paid_amount,
                charge_amount, patient_responsibility, adjustments_json, service_lines_json,
                patient_control_number_hash, service_date
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                claim.id.to_string(),
                claim.remittance_id.to_string(),
                claim.claim_control_number,
                claim.claim_status_code,
                money_to_text(claim.paid_amount),
                money_to_text(claim.charge_amount),
                money_to_text(claim.patient_responsibility),
                adjustments_json,
                service_lines_json,
                claim.patient_control_number_hash,
                claim.service_date.map(|d| d.to_string()),
            ],
        )?;
    }
    Ok(())
}

fn row_to_remittance_claim(row: &Row) -> rusqlite::Result<Result<RemittanceClaim, AppError>> {
    Ok((|| {
        let adjustments_json: String = row.get(7)?;
        let service_lines_json: String = row.get(8)?;
        Ok(RemittanceClaim {
            id: parse_uuid(row.get(0)?)?,
            remittance_id: parse_uuid(row.get(1)?)?,
            claim_control_number: row.get(2)?,
            claim_status_code: row.get(3)?,
            paid_amount: money_from_text(&row.get::<_, String>(4)?)?,
            charge_amount: money_from_text(&row.get::<_, String>(5)?)?,
            patient_responsibility: money_from_text(&row.get::<_, String>(6)?)?,
            adjustments: serde_json::from_str(&adjustments_json)
                .map_err(|e| AppError::InvariantViolation(format!("adjustments parse: {e}")))?,
            service_lines: serde_json::from_str(&service_lines_json)
                .map_err(|e| AppError::InvariantViolation(format!("service lines parse: {e}")))?,
            patient_control_number_hash: row.get(9)?,
            service_date: parse_date_opt(row.get(10)?)?,
        })
    })())
}

const REMIT_CLAIM_COLUMNS: &str = "id, remittance_id, claim_control_number, claim_status_code, paid_amount,
     charge_amount, patient_responsibility, adjustments_json, service_lines_json,
     patient_control_number_hash, service_date";

fn fetch_remittance_claims(
    conn: &Connection,
    remittance_id: Uuid,
) -> Result<Vec<RemittanceClaim>, AppError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REMIT_CLAIM_COLUMNS} FROM remittance_claims WHERE remittance_id = ?1"
    ))?;
    let rows = stmt
        .query_map(params![remittance_id.to_string()], row_to_remittance_claim)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .collect::<Result<Vec<RemittanceClaim>, AppError>>()?;
    Ok(rows)
}

const REMIT_COLUMNS: &str =
    "id, payer_id, remittance_control_number, payment_amount, payment_date, payment_method, created_at";

fn row_to_remittance_header(
    row: &Row,
) -> rusqlite::Result<Result<(Uuid, Uuid, String, String, Option<String>, String, String), AppError>> {
    Ok((|| {
        Ok((
            parse_uuid(row.get(0)?)?,
            parse_uuid(row.get(1)?)?,
            row.get(2)?,
            row.get::<_, String>(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    })())
}

pub fn fetch_remittance_by_id(conn: &Connection, id: Uuid) -> Result<Option<Remittance>, AppError> {
    let header = conn
        .query_row(
            &format!("SELECT {REMIT_COLUMNS} FROM remittances WHERE id = ?1"),
            params![id.to_string()],
            row_to_remittance_header,
        )
        .optional()
        .map_err(AppError::from)?
        .transpose()?;

    let Some((id, payer_id, remittance_control_number, payment_amount, payment_date, payment_method, created_at)) =
        header
    else {
        return Ok(None);
    };

    let claims = fetch_remittance_claims(conn, id)?;
    Ok(Some(Remittance {
        id,
        payer_id,
        remittance_control_number,
        payment_amount: money_from_text(&payment_amount)?,
        payment_date: parse_date_opt(payment_date)?,
        payment_method,
        claims,
        created_at: parse_dt(created_at)?,
    }))
}

pub fn list_remittances(
    conn: &Connection,
    payer_id: Option<Uuid>,
    skip: usize,
    limit: usize,
) -> Result<(Vec<Remittance>, usize), AppError> {
    let (where_sql, bind): (&str, Vec<String>) = match payer_id {
        Some(id) => ("WHERE payer_id = ?1", vec![id.to_string()]),
        None => ("", vec![]),
    };

    let count_sql = format!("SELECT COUNT(*) FROM remittances {where_sql}");
    let total: usize = conn.query_row(&count_sql, rusqlite::params_from_iter(bind.iter()), |r| {
        r.get::<_, i64>(0)
    })? as usize;

    let ids_sql = format!(
        "SELECT id FROM remittances {where_sql} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
        bind.len() + 1,
        bind.len() + 2
    );
    let mut all_bind = bind.clone();
    all_bind.push(limit.to_string());
    all_bind.push(skip.to_string());

    let mut stmt = conn.prepare(&ids_sql)?;
    let ids: Vec<String> = stmt
        .query_map(rusqlite::params_from_iter(all_bind.iter()), |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(ids.len());
    for id_str in ids {
        let id = parse_uuid(id_str)?;
        if let Some(r) = fetch_remittance_by_id(conn, id)? {
            out.push(r);
        }
    }
    Ok((out, total))
}

// -- Episodes --

fn episode_status_to_text(s: EpisodeStatus) -> &'static str {
    match s {
        EpisodeStatus::Open => "open",
        EpisodeStatus::Partial => "partial",
        EpisodeStatus::Denied => "denied",
        EpisodeStatus::Paid => "paid",
        EpisodeStatus::Appealed => "appealed",
        EpisodeStatus::Closed => "closed",
    }
}

fn episode_status_from_text(s: &str) -> Result<EpisodeStatus, AppError> {
    Ok(match s {
        "open" => EpisodeStatus::Open,
        "partial" => EpisodeStatus::Partial,
        "denied" => EpisodeStatus::Denied,
        "paid" => EpisodeStatus::Paid,
        "appealed" => EpisodeStatus::Appealed,
        "closed" => EpisodeStatus::Closed,
        other => {
            return Err(AppError::InvariantViolation(format!(
                "unknown episode status in storage: {other}"
            )))
        }
    })
}

const EPISODE_COLUMNS: &str =
    "id, claim_id, remittance_id, status, denial_count, total_paid, total_adjustment, first_seen_at, last_updated_at";

fn row_to_episode(row: &Row) -> rusqlite::Result<Result<Episode, AppError>> {
    Ok((|| {
        Ok(Episode {
            id: parse_uuid(row.get(0)?)?,
            claim_id: parse_uuid(row.get(1)?)?,
            remittance_id: parse_uuid(row.get(2)?)?,
            status: episode_status_from_text(&row.get::<_, String>(3)?)?,
            denial_count: row.get::<_, i64>(4)? as u32,
            total_paid: money_from_text(&row.get::<_, String>(5)?)?,
            total_adjustment: money_from_text(&row.get::<_, String>(6)?)?,
            first_seen_at: parse_dt(row.get(7)?)?,
            last_updated_at: parse_dt(row.get(8)?)?,
        })
    })())
}

pub fn fetch_episode_by_claim(conn: &Connection, claim_id: Uuid) -> Result<Option<Episode>, AppError> {
    conn.query_row(
        &format!("SELECT {EPISODE_COLUMNS} FROM claim_episodes WHERE claim_id = ?1"),
        params![claim_id.to_string()],
        row_to_episode,
    )
    .optional()
    .map_err(AppError::from)?
    .transpose()
}

pub fn fetch_episode_by_id(conn: &Connection, id: Uuid) -> Result<Option<Episode>, AppError> {
    conn.query_row(
        &format!("SELECT {EPISODE_COLUMNS} FROM claim_episodes WHERE id = ?1"),
        params![id.to_string()],
        row_to_episode,
    )
    .optional()
    .map_err(AppError::from)?
    .transpose()
}

pub fn upsert_episode(conn: &Connection, episode: &Episode) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO claim_episodes (
            id, claim_id, remittance_id, status, denial_count, total_paid, total_adjustment,
            first_seen_at, last_updated_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
         ON CONFLICT(claim_id) DO UPDATE SET
            remittance_id = excluded.remittance_id,
            status = excluded.status,
            denial_count = excluded.denial_count,
            total_paid = excluded.total_paid,
            total_adjustment = excluded.total_adjustment,
            last_updated_at = excluded.last_updated_at",
        params![
            episode.id.to_string(),
            episode.claim_id.to_string(),
            episode.remittance_id.to_string(),
            episode_status_to_text(episode.status),
            episode.denial_count,
            money_to_text(episode.total_paid),
            money_to_text(episode.total_adjustment),
            episode.first_seen_at.to_rfc3339(),
            episode.last_updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn has_applied_remittance(conn: &Connection, claim_id: Uuid, signature: &str) -> Result<bool, AppError> {
    conn.query_row(
        "SELECT 1 FROM episode_remittance_applications WHERE claim_id = ?1 AND signature = ?2",
        params![claim_id.to_string(), signature],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(AppError::from)
}

pub fn record_applied_remittance(conn: &Connection, claim_id: Uuid, signature: &str) -> Result<(), AppError> {
    conn.execute(
        "INSERT OR IGNORE INTO episode_remittance_applications (claim_id, signature, applied_at)
         VALUES (?1, ?2, ?3)",
        params![claim_id.to_string(), signature, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn list_episodes(
    conn: &Connection,
    filter: &EpisodeFilter,
    skip: usize,
    limit: usize,
) -> Result<(Vec<Episode>, usize), AppError> {
    let mut where_clauses = Vec::new();
    let mut bind: Vec<String> = Vec::new();

    if let Some(claim_id) = filter.claim_id {
        where_clauses.push(format!("claim_id = ?{}", bind.len() + 1));
        bind.push(claim_id.to_string());
    }
    if let Some(status) = filter.status {
        where_clauses.push(format!("status = ?{}", bind.len() + 1));
        bind.push(episode_status_to_text(status).to_string());
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM claim_episodes {where_sql}");
    let total: usize = conn.query_row(&count_sql, rusqlite::params_from_iter(bind.iter()), |r| {
        r.get::<_, i64>(0)
    })? as usize;

    let list_sql = format!(
        "SELECT {EPISODE_COLUMNS} FROM claim_episodes {where_sql} ORDER BY last_updated_at DESC LIMIT ?{} OFFSET ?{}",
        bind.len() + 1,
        bind.len() + 2
    );
    let mut all_bind = bind.clone();
    all_bind.push(limit.to_string());
    all_bind.push(skip.to_string());

    let mut stmt = conn.prepare(&list_sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(all_bind.iter()), row_to_episode)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .collect::<Result<Vec<Episode>, AppError>>()?;

    Ok((rows, total))
}

// -- Denial patterns --

const PATTERN_COLUMNS: &str = "id, payer_id, denial_reason_code, procedure_code, diagnosis_code,
     frequency, confidence, occurrence_count, first_observed, last_observed";

fn row_to_pattern(row: &Row) -> rusqlite::Result<Result<DenialPattern, AppError>> {
    Ok((|| {
        Ok(DenialPattern {
            id: parse_uuid(row.get(0)?)?,
            payer_id: parse_uuid(row.get(1)?)?,
            denial_reason_code: row.get(2)?,
            procedure_code: row.get(3)?,
            diagnosis_code: row.get(4)?,
            frequency: row.get(5)?,
            confidence: row.get(6)?,
            occurrence_count: row.get::<_, i64>(7)? as u32,
            first_observed: parse_dt(row.get(8)?)?,
            last_observed: parse_dt(row.get(9)?)?,
        })
    })())
}

pub fn upsert_denial_pattern(
    conn: &Connection,
    pattern: &DenialPattern,
) -> Result<DenialPattern, AppError> {
    conn.execute(
        "INSERT INTO denial_patterns (
            id, payer_id, denial_reason_code, procedure_code, diagnosis_code,
            frequency, confidence, occurrence_count, first_observed, last_observed
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
         ON CONFLICT(payer_id, denial_reason_code, procedure_code, diagnosis_code) DO UPDATE SET
            frequency = excluded.frequency,
            confidence = excluded.confidence,
            occurrence_count = excluded.occurrence_count,
            last_observed = excluded.last_observed",
        params![
            pattern.id.to_string(),
            pattern.payer_id.to_string(),
            pattern.denial_reason_code,
            pattern.procedure_code,
            pattern.diagnosis_code,
            pattern.frequency,
            pattern.confidence,
            pattern.occurrence_count,
            pattern.first_observed.to_rfc3339(),
            pattern.last_observed.to_rfc3339(),
        ],
    )?;

    conn.query_row(
        &format!(
            "SELECT {PATTERN_COLUMNS} FROM denial_patterns
             WHERE payer_id = ?1 AND denial_reason_code = ?2
               AND procedure_code IS ?3 AND diagnosis_code IS ?4"
        ),
        params![
            pattern.payer_id.to_string(),
            pattern.denial_reason_code,
            pattern.procedure_code,
            pattern.diagnosis_code,
        ],
        row_to_pattern,
    )?
    .map_err(AppError::from)
}

pub fn list_denial_patterns(
    conn: &Connection,
    payer_id: Option<Uuid>,
) -> Result<Vec<DenialPattern>, AppError> {
    let (where_sql, bind): (&str, Vec<String>) = match payer_id {
        Some(id) => ("WHERE payer_id = ?1", vec![id.to_string()]),
        None => ("", vec![]),
    };
    let sql = format!(
        "SELECT {PATTERN_COLUMNS} FROM denial_patterns {where_sql} ORDER BY confidence DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind.iter()), row_to_pattern)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .collect::<Result<Vec<DenialPattern>, AppError>>()?;
    Ok(rows)
}

// -- Risk scores --

fn risk_level_to_text(l: RiskLevel) -> &'static str {
    match l {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
        RiskLevel::Critical => "critical",
    }
}

fn risk_level_from_text(s: &str) -> Result<RiskLevel, AppError> {
    Ok(match s {
        "low" => RiskLevel::Low,
        "medium" => RiskLevel::Medium,
        "high" => RiskLevel::High,
        "critical" => RiskLevel::Critical,
        other => {
            return Err(AppError::InvariantViolation(format!(
                "unknown risk level in storage: {other}"
            )))
        }
    })
}

pub fn insert_risk_score(conn: &Connection, score: &RiskScore) -> Result<(), AppError> {
    let factors_json = serde_json::to_string(&score.factors)
        .map_err(|e| AppError::InvariantViolation(format!("factors serialize: {e}")))?;
    conn.execute(
        "INSERT INTO risk_scores (id, claim_id, calculated_at, overall_score, level, factors_json, rationale)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            score.id.to_string(),
            score.claim_id.to_string(),
            score.calculated_at.to_rfc3339(),
            score.overall_score,
            risk_level_to_text(score.level),
            factors_json,
            score.rationale,
        ],
    )?;
    Ok(())
}

fn row_to_risk_score(row: &Row) -> rusqlite::Result<Result<RiskScore, AppError>> {
    Ok((|| {
        let factors_json: String = row.get(5)?;
        Ok(RiskScore {
            id: parse_uuid(row.get(0)?)?,
            claim_id: parse_uuid(row.get(1)?)?,
            calculated_at: parse_dt(row.get(2)?)?,
            overall_score: row.get(3)?,
            level: risk_level_from_text(&row.get::<_, String>(4)?)?,
            factors: serde_json::from_str(&factors_json)
                .map_err(|e| AppError::InvariantViolation(format!("factors parse: {e}")))?,
            rationale: row.get(6)?,
        })
    })())
}

pub fn latest_risk_score(conn: &Connection, claim_id: Uuid) -> Result<Option<RiskScore>, AppError> {
    conn.query_row(
        "SELECT id, claim_id, calculated_at, overall_score, level, factors_json, rationale
         FROM risk_scores WHERE claim_id = ?1 ORDER BY calculated_at DESC, rowid DESC LIMIT 1",
        params![claim_id.to_string()],
        row_to_risk_score,
    )
    .optional()
    .map_err(AppError::from)?
    .transpose()
}

// -- Audit logs --

pub fn insert_audit_log(conn: &Connection, log: &AuditLog) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO audit_logs (id, timestamp, request_id, method, path, status_code, principal_hash, duration_ms)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            log.id.to_string(),
            log.timestamp.to_rfc3339(),
            log.request_id,
            log.method,
            log.path,
            log.status_code,
            log.principal_hash,
            log.duration_ms as i64,
        ],
    )?;
    Ok(())
}

fn row_to_audit_log(row: &Row) -> rusqlite::Result<Result<AuditLog, AppError>> {
    Ok((|| {
        Ok(AuditLog {
            id: parse_uuid(row.get(0)?)?,
            timestamp: parse_dt(row.get(1)?)?,
            request_id: row.get(2)?,
            method: row.get(3)?,
            path: row.get(4)?,
            status_code: row.get::<_, i64>(5)? as u16,
            principal_hash: row.get(6)?,
            duration_ms: row.get::<_, i64>(7)? as u64,
        })
    })())
}

pub fn list_audit_logs(
    conn: &Connection,
    filter: &AuditFilter,
    skip: usize,
    limit: usize,
) -> Result<(Vec<AuditLog>, usize), AppError> {
    let mut where_clauses = Vec::new();
    let mut bind: Vec<String> = Vec::new();

    if let Some(method) = &filter.method {
        where_clauses.push(format!("method = ?{}", bind.len() + 1));
        bind.push(method.clone());
    }
    if let Some(path) = &filter.path {
        where_clauses.push(format!("path = ?{}", bind.len() + 1));
        bind.push(path.clone());
    }
    if let Some(status_code) = filter.status_code {
        where_clauses.push(format!("status_code = ?{}", bind.len() + 1));
        bind.push(status_code.to_string());
    }
    if let Some(start) = filter.start_date {
        where_clauses.push(format!("timestamp >= ?{}", bind.len() + 1));
        bind.push(start.to_rfc3339());
    }
    if let Some(end) = filter.end_date {
        where_clauses.push(format!("timestamp <= ?{}", bind.len() + 1));
        bind.push(end.to_rfc3339());
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM audit_logs {where_sql}");
    let total: usize = conn.query_row(&count_sql, rusqlite::params_from_iter(bind.iter()), |r| {
        r.get::<_, i64>(0)
    })? as usize;

    let list_sql = format!(
        "SELECT id, timestamp, request_id, method, path, status_code, principal_hash, duration_ms
         FROM audit_logs {where_sql} ORDER BY timestamp DESC LIMIT ?{} OFFSET ?{}",
        bind.len() + 1,
        bind.len() + 2
    );
    let mut all_bind = bind.clone();
    all_bind.push(limit.to_string());
    all_bind.push(skip.to_string());

    let mut stmt = conn.prepare(&list_sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(all_bind.iter()), row_to_audit_log)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .collect::<Result<Vec<AuditLog>, AppError>>()?;

    Ok((rows, total))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditStats {
    pub total_requests: u64,
    pub error_requests: u64,
    pub avg_duration_ms: f64,
}

pub fn audit_stats(conn: &Connection, days: i64) -> Result<AuditStats, AppError> {
    let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    conn.query_row(
        "SELECT COUNT(*), SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END), AVG(duration_ms)
         FROM audit_logs WHERE timestamp >= ?1",
        params![cutoff],
        |row| {
            Ok(AuditStats {
                total_requests: row.get::<_, i64>(0)? as u64,
                error_requests: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                avg_duration_ms: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
            })
        },
    )
    .map_err(AppError::from)
}

// -- Payer denial rate (feeds the payer risk factor, §4.9) --

pub fn payer_denial_rate(conn: &Connection, payer_id: Uuid, window_days: i64) -> Result<f64, AppError> {
    let cutoff = (Utc::now() - chrono::Duration::days(window_days)).to_rfc3339();
    let (total, denied): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), SUM(CASE WHEN ce.status = 'denied' THEN 1 ELSE 0 END)
         FROM claim_episodes ce
         JOIN claims c ON c.id = ce.claim_id
         WHERE c.payer_id = ?1 AND ce.last_updated_at >= ?2",
        params![payer_id.to_string(), cutoff],
        |row| Ok((row.get(0)?, row.get::<_, Option<i64>>(1)?.unwrap_or(0))),
    )?;
    if total == 0 {
        Ok(0.0)
    } else {
        Ok(denied as f64 / total as f64)
    }
}

// -- Denial observations (feeds the pattern detector, C10) --

/// One row per adjustment on a denied episode's remittance claim, carrying
/// the procedure/diagnosis codes from the *original* claim (the remittance
/// only carries the reason code). `window_days` bounds on `last_updated_at`;
/// `payer_id` narrows to a single payer when set.
pub fn fetch_denial_observations(
    conn: &Connection,
    payer_id: Option<Uuid>,
    window_days: i64,
) -> Result<Vec<crate::patterns::DenialObservation>, AppError> {
    let cutoff = (Utc::now() - chrono::Duration::days(window_days)).to_rfc3339();

    let mut where_clauses = vec!["ce.status = 'denied'".to_string(), "ce.last_updated_at >= ?1".to_string()];
    let mut bind: Vec<String> = vec![cutoff];
    if let Some(payer_id) = payer_id {
        where_clauses.push(format!("c.payer_id = ?{}", bind.len() + 1));
        bind.push(payer_id.to_string());
    }
    let where_sql = where_clauses.join(" AND ");

    let sql = format!(
        "SELECT c.payer_id, c.lines_json, c.diagnoses_json, rc.adjustments_json
         FROM claim_episodes ce
         JOIN claims c ON c.id = ce.claim_id
         JOIN remittance_claims rc
           ON rc.remittance_id = ce.remittance_id AND rc.claim_control_number = c.claim_control_number
         WHERE {where_sql}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind.iter()), |row| {
            let payer_id: String = row.get(0)?;
            let lines_json: String = row.get(1)?;
            let diagnoses_json: String = row.get(2)?;
            let adjustments_json: String = row.get(3)?;
            Ok((payer_id, lines_json, diagnoses_json, adjustments_json))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut observations = Vec::new();
    for (payer_id, lines_json, diagnoses_json, adjustments_json) in rows {
        let payer_id = parse_uuid(payer_id)?;
        let lines: Vec<ClaimLine> = serde_json::from_str(&lines_json)
            .map_err(|e| AppError::InvariantViolation(format!("claim lines parse: {e}")))?;
        let diagnoses: Vec<Diagnosis> = serde_json::from_str(&diagnoses_json)
            .map_err(|e| AppError::InvariantViolation(format!("claim diagnoses parse: {e}")))?;
        let adjustments: Vec<Adjustment> = serde_json::from_str(&adjustments_json)
            .map_err(|e| AppError::InvariantViolation(format!("adjustments parse: {e}")))?;

        let procedure_code = lines.first().map(|l| l.procedure_code.clone());
        let diagnosis_code = diagnoses
            .iter()
            .find(|d| d.principal)
            .or_else(|| diagnoses.first())
            .map(|d| d.code.clone());

        for adjustment in adjustments {
            observations.push(crate::patterns::DenialObservation {
                payer_id,
                reason_code: adjustment.reason_code,
                procedure_code: procedure_code.clone(),
                diagnosis_code: diagnosis_code.clone(),
            });
        }
    }

    Ok(observations)
}
