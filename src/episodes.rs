//! Episode linker (C9)
//! Mission: match remittance-claims back to claims and create/update
//! episodes, per the matching and status-transition rules of spec.md §4.7.

use crate::cache::Cache;
use crate::error::AppError;
use crate::models::{Claim, Episode, EpisodeStatus, RemittanceClaim};
use crate::storage::Storage;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Claim-status codes treated as paid/denied/partial for episode status
/// derivation (CLP02 per the 835 implementation guide).
fn status_from_claim_status_code(code: &str, paid_amount: Decimal, charge_amount: Decimal) -> EpisodeStatus {
    match code {
        "1" | "19" | "20" | "21" => {
            if paid_amount >= charge_amount - Decimal::new(1, 2) {
                EpisodeStatus::Paid
            } else if paid_amount > Decimal::ZERO {
                EpisodeStatus::Partial
            } else {
                EpisodeStatus::Denied
            }
        }
        "4" | "5" => EpisodeStatus::Denied,
        "2" | "3" => EpisodeStatus::Partial,
        _ => EpisodeStatus::Open,
    }
}

fn is_denial(code: &str) -> bool {
    matches!(code, "4" | "5")
}

/// Identifies one remittance's statement about one claim, so re-linking the
/// same remittance (a retried job, a re-uploaded file) is a no-op rather
/// than a second accumulation (§8).
fn remittance_signature(remittance_id: Uuid, remit_claim: &RemittanceClaim) -> String {
    format!(
        "{remittance_id}:{}:{}:{}:{}",
        remit_claim.claim_control_number,
        remit_claim.claim_status_code,
        remit_claim.paid_amount,
        remit_claim.charge_amount,
    )
}

pub struct EpisodeLinker {
    storage: Arc<Storage>,
    cache: Arc<Cache>,
}

impl EpisodeLinker {
    pub fn new(storage: Arc<Storage>, cache: Arc<Cache>) -> Self {
        Self { storage, cache }
    }

    /// Exact-match by `claim_control_number`, falling back to
    /// patient+date-window when the remittance carries those hints
    /// (spec.md §4.7 rules 1–2). Manual linking (rule 3) is handled
    /// separately by `link_manual`.
    pub fn find_claim(&self, remit_claim: &RemittanceClaim) -> Result<Option<Claim>, AppError> {
        if let Some(claim) = self
            .storage
            .get_claim_by_control_number(&remit_claim.claim_control_number)?
        {
            return Ok(Some(claim));
        }

        let (Some(patient_hash), Some(service_date)) = (
            remit_claim.patient_control_number_hash.as_deref(),
            remit_claim.service_date,
        ) else {
            return Ok(None);
        };

        let window_from = service_date - chrono::Duration::days(7);
        let window_to = service_date + chrono::Duration::days(7);
        let filter = crate::storage::ClaimFilter {
            service_date_from: Some(window_from),
            service_date_to: Some(window_to),
            ..Default::default()
        };
        let (candidates, _) = self.storage.list_claims(&filter, 0, 1000)?;

        let mut best: Option<(Claim, i64)> = None;
        for candidate in candidates {
            if candidate.patient_control_number_hash != patient_hash {
                continue;
            }
            let Some(candidate_date) = candidate.service_date_start else {
                continue;
            };
            let delta = (candidate_date - service_date).num_days().abs();
            match &best {
                Some((current, current_delta)) if *current_delta < delta => {}
                Some((current, current_delta)) if *current_delta == delta => {
                    if candidate.created_at < current.created_at {
                        best = Some((candidate, delta));
                    }
                }
                _ => best = Some((candidate, delta)),
            }
        }
        Ok(best.map(|(claim, _)| claim))
    }

    /// Applies the episode update rules for one remittance-claim against
    /// its matched claim, returning the resulting episode (or `None` if
    /// no claim could be matched).
    pub fn link(&self, remit_claim: &RemittanceClaim, remittance_id: Uuid) -> Result<Option<Episode>, AppError> {
        let Some(claim) = self.find_claim(remit_claim)? else {
            return Ok(None);
        };

        let new_status = status_from_claim_status_code(
            &remit_claim.claim_status_code,
            remit_claim.paid_amount,
            remit_claim.charge_amount,
        );
        let adjustment_total: Decimal = remit_claim.adjustments.iter().map(|a| a.amount).sum();
        let now = Utc::now();

        let signature = remittance_signature(remittance_id, remit_claim);
        let already_applied = self.storage.has_applied_remittance(claim.id, &signature)?;

        let episode = match self.storage.get_episode_by_claim(claim.id)? {
            None => Episode {
                id: Uuid::new_v4(),
                claim_id: claim.id,
                remittance_id,
                status: new_status,
                denial_count: if is_denial(&remit_claim.claim_status_code) { 1 } else { 0 },
                total_paid: remit_claim.paid_amount,
                total_adjustment: adjustment_total,
                first_seen_at: now,
                last_updated_at: now,
            },
            Some(mut existing) => {
                if already_applied {
                    existing
                } else {
                    if is_denial(&remit_claim.claim_status_code) {
                        existing.denial_count += 1;
                    }
                    existing.total_paid += remit_claim.paid_amount;
                    existing.total_adjustment += adjustment_total;
                    existing.last_updated_at = now;

                    // A payment observed on a previously-denied episode
                    // downgrades it to paid/partial based on what's actually
                    // been paid so far, not on this remittance's own status
                    // code in isolation (§4.7): a denial can be followed by
                    // a later remittance that only partially covers the
                    // charge, which the per-remittance status code alone
                    // would otherwise resolve no higher than `Partial`.
                    existing.status = if existing.status == EpisodeStatus::Denied
                        && !is_denial(&remit_claim.claim_status_code)
                        && remit_claim.paid_amount > Decimal::ZERO
                    {
                        if existing.total_paid >= remit_claim.charge_amount - Decimal::new(1, 2) {
                            EpisodeStatus::Paid
                        } else {
                            EpisodeStatus::Partial
                        }
                    } else if new_status.at_least(existing.status) {
                        new_status
                    } else {
                        existing.status
                    };
                    existing
                }
            }
        };

        if !already_applied {
            self.storage.record_applied_remittance(claim.id, &signature)?;
        }
        self.storage.upsert_episode(&episode)?;
        self.cache.invalidate_prefix(&format!("episode:{}", episode.id));
        self.cache.invalidate_prefix("count:episode");
        Ok(Some(episode))
    }

    /// Manual linking via the API bypasses matching entirely (rule 3).
    pub fn link_manual(&self, claim_id: Uuid, remittance_id: Uuid) -> Result<Episode, AppError> {
        let now = Utc::now();
        let episode = match self.storage.get_episode_by_claim(claim_id)? {
            Some(mut existing) => {
                existing.remittance_id = remittance_id;
                existing.last_updated_at = now;
                existing
            }
            None => Episode {
                id: Uuid::new_v4(),
                claim_id,
                remittance_id,
                status: EpisodeStatus::Open,
                denial_count: 0,
                total_paid: Decimal::ZERO,
                total_adjustment: Decimal::ZERO,
                first_seen_at: now,
                last_updated_at: now,
            },
        };
        self.storage.upsert_episode(&episode)?;
        self.cache.invalidate_prefix(&format!("episode:{}", episode.id));
        self.cache.invalidate_prefix("count:episode");
        Ok(episode)
    }

    pub fn set_status(&self, episode_id: Uuid, status: EpisodeStatus) -> Result<Episode, AppError> {
        let mut episode = self
            .storage
            .get_episode(episode_id)?
            .ok_or(AppError::NotFound)?;
        episode.status = status;
        episode.last_updated_at = Utc::now();
        self.storage.upsert_episode(&episode)?;
        self.cache.invalidate_prefix(&format!("episode:{}", episode.id));
        self.cache.invalidate_prefix("count:episode");
        Ok(episode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClaimStatus, RemittanceServiceLine};

    fn linker() -> EpisodeLinker {
        EpisodeLinker::new(Arc::new(Storage::in_memory().unwrap()), Cache::new())
    }

    fn seed_claim(linker: &EpisodeLinker, control_number: &str, total: &str) -> Claim {
        let payer = linker.storage.upsert_payer("PAYER1", "Acme Payer").unwrap();
        let provider = linker
            .storage
            .upsert_provider(Some("1234567890"), "Acme Clinic", None)
            .unwrap();
        let claim = Claim {
            id: Uuid::new_v4(),
            payer_id: payer.id,
            provider_id: provider.id,
            claim_control_number: control_number.to_string(),
            patient_control_number_hash: "hash".into(),
            total_charge_amount: total.parse().unwrap(),
            service_date_start: None,
            service_date_end: None,
            status: ClaimStatus::Submitted,
            lines: vec![],
            diagnoses: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        linker.storage.insert_claims_batch(&[claim.clone()]).unwrap();
        claim
    }

    fn remit_claim(control_number: &str, status_code: &str, charge: &str, paid: &str) -> RemittanceClaim {
        RemittanceClaim {
            id: Uuid::new_v4(),
            remittance_id: Uuid::new_v4(),
            claim_control_number: control_number.to_string(),
            claim_status_code: status_code.to_string(),
            paid_amount: paid.parse().unwrap(),
            charge_amount: charge.parse().unwrap(),
            patient_responsibility: Decimal::ZERO,
            adjustments: vec![],
            service_lines: Vec::<RemittanceServiceLine>::new(),
            patient_control_number_hash: None,
            service_date: None,
        }
    }

    #[test]
    fn s3_paid_in_full_creates_paid_episode() {
        let linker = linker();
        let claim = seed_claim(&linker, "CTRL1", "1000.00");
        let rc = remit_claim("CTRL1", "1", "1000.00", "1000.00");
        let episode = linker.link(&rc, Uuid::new_v4()).unwrap().unwrap();
        assert_eq!(episode.claim_id, claim.id);
        assert_eq!(episode.status, EpisodeStatus::Paid);
        assert_eq!(episode.denial_count, 0);
    }

    #[test]
    fn s4_then_s5_denial_then_partial_payment() {
        let linker = linker();
        seed_claim(&linker, "CTRL1", "1000.00");
        let remittance_id = Uuid::new_v4();

        let denied = remit_claim("CTRL1", "4", "1000.00", "0.00");
        let episode = linker.link(&denied, remittance_id).unwrap().unwrap();
        assert_eq!(episode.status, EpisodeStatus::Denied);
        assert_eq!(episode.denial_count, 1);

        let partial = remit_claim("CTRL1", "1", "1000.00", "200.00");
        let episode = linker.link(&partial, remittance_id).unwrap().unwrap();
        assert_eq!(episode.status, EpisodeStatus::Partial);
        assert_eq!(episode.denial_count, 1);
        assert_eq!(episode.total_paid, "200.00".parse().unwrap());
    }

    #[test]
    fn relinking_same_remittance_does_not_duplicate_episode() {
        let linker = linker();
        seed_claim(&linker, "CTRL1", "1000.00");
        let remittance_id = Uuid::new_v4();
        let rc = remit_claim("CTRL1", "1", "1000.00", "1000.00");
        let first = linker.link(&rc, remittance_id).unwrap().unwrap();
        let second = linker.link(&rc, remittance_id).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.total_paid, "1000.00".parse().unwrap());
        assert_eq!(second.denial_count, 0);
    }

    #[test]
    fn relinking_same_denial_does_not_double_count() {
        let linker = linker();
        seed_claim(&linker, "CTRL1", "1000.00");
        let remittance_id = Uuid::new_v4();
        let rc = remit_claim("CTRL1", "4", "1000.00", "0.00");
        linker.link(&rc, remittance_id).unwrap().unwrap();
        let second = linker.link(&rc, remittance_id).unwrap().unwrap();
        assert_eq!(second.denial_count, 1);
        assert_eq!(second.status, EpisodeStatus::Denied);
    }

    #[test]
    fn no_matching_claim_returns_none() {
        let linker = linker();
        let rc = remit_claim("UNKNOWN", "1", "1000.00", "1000.00");
        assert!(linker.link(&rc, Uuid::new_v4()).unwrap().is_none());
    }
}
