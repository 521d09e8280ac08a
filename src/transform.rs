//! Transformer (C6)
//! Mission: turn parsed EDI records into persisted entities, resolving
//! payer/provider identity through the cache with a storage fallback, and
//! hashing PHI-bearing fields before they can reach a log line.

use crate::cache::Cache;
use crate::edi::{ParsedClaim, ParsedRemittanceClaim, ParsedRemittanceHeader};
use crate::error::AppError;
use crate::models::{Claim, ClaimLine, ClaimStatus, Payer, Provider, Remittance, RemittanceClaim};
use crate::storage::Storage;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const PAYER_CACHE_TTL_SECS: u64 = 86_400;

/// Salted one-way hash for PHI identifiers crossing into logs/audit
/// (spec.md §4.6). Plaintext is retained only on the claim row itself.
pub fn hash_phi(salt: &str, value: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes()).expect("hmac accepts any key length");
    mac.update(value.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub struct Transformer {
    storage: Arc<Storage>,
    cache: Arc<Cache>,
    phi_salt: String,
}

impl Transformer {
    pub fn new(storage: Arc<Storage>, cache: Arc<Cache>, phi_salt: String) -> Self {
        Self {
            storage,
            cache,
            phi_salt,
        }
    }

    /// Resolves a payer by its external EDI id, reading through the cache
    /// and falling back to an upsert-returning insert on miss (§4.6).
    pub fn resolve_payer(&self, payer_id_external: &str, name: &str) -> Result<Payer, AppError> {
        let cache_key = format!("payer:ext:{payer_id_external}");
        if let Some(payer) = self.cache.get_json::<Payer>(&cache_key) {
            return Ok(payer);
        }
        let payer = self.storage.upsert_payer(payer_id_external, name)?;
        self.cache.set_json(
            &cache_key,
            &payer,
            std::time::Duration::from_secs(PAYER_CACHE_TTL_SECS),
        );
        Ok(payer)
    }

    pub fn resolve_provider(
        &self,
        npi: Option<&str>,
        name: &str,
    ) -> Result<Provider, AppError> {
        if let Some(npi) = npi {
            let cache_key = format!("provider:npi:{npi}");
            if let Some(provider) = self.cache.get_json::<Provider>(&cache_key) {
                return Ok(provider);
            }
            let provider = self.storage.upsert_provider(Some(npi), name, None)?;
            self.cache.set_json(
                &cache_key,
                &provider,
                std::time::Duration::from_secs(PAYER_CACHE_TTL_SECS),
            );
            Ok(provider)
        } else {
            self.storage.upsert_provider(None, name, None)
        }
    }

    /// Converts one parsed claim into a persisted `Claim`, resolving its
    /// payer/provider and hashing the patient identifier.
    pub fn transform_claim(&self, parsed: ParsedClaim) -> Result<Claim, AppError> {
        let payer = self.resolve_payer(
            parsed.payer_id_external.as_deref().unwrap_or("UNKNOWN"),
            parsed.payer_id_external.as_deref().unwrap_or("Unknown Payer"),
        )?;
        let provider = self.resolve_provider(
            parsed.provider_npi.as_deref(),
            parsed.provider_name.as_deref().unwrap_or("Unknown Provider"),
        )?;

        let claim_id = Uuid::new_v4();
        let now = Utc::now();
        let patient_control_number_hash = parsed
            .patient_control_number
            .as_deref()
            .map(|pcn| hash_phi(&self.phi_salt, pcn))
            .unwrap_or_default();

        let lines = parsed
            .lines
            .into_iter()
            .map(|l| ClaimLine {
                id: Uuid::new_v4(),
                claim_id,
                line_number: l.line_number,
                procedure_code: l.procedure_code,
                modifiers: l.modifiers,
                charge_amount: l.charge_amount,
                units: l.units,
                service_date: l.service_date,
                revenue_code: l.revenue_code,
                procedure_code_valid: l.procedure_code_valid,
            })
            .collect();

        Ok(Claim {
            id: claim_id,
            payer_id: payer.id,
            provider_id: provider.id,
            claim_control_number: parsed.claim_control_number,
            patient_control_number_hash,
            total_charge_amount: parsed.total_charge_amount,
            service_date_start: parsed.service_date_start,
            service_date_end: parsed.service_date_end,
            status: ClaimStatus::Submitted,
            lines,
            diagnoses: parsed.diagnoses,
            created_at: now,
            updated_at: now,
        })
    }

    /// Persists a batch of parsed claims (default batch size handled by
    /// `Storage::insert_claims_batch`).
    pub fn persist_claims(&self, claims: &[Claim]) -> Result<(), AppError> {
        self.storage.insert_claims_batch(claims)
    }

    pub fn transform_remittance(
        &self,
        header: ParsedRemittanceHeader,
        parsed_claims: Vec<ParsedRemittanceClaim>,
    ) -> Result<Remittance, AppError> {
        let payer = self.resolve_payer(
            header.payer_id_external.as_deref().unwrap_or("UNKNOWN"),
            header.payer_id_external.as_deref().unwrap_or("Unknown Payer"),
        )?;

        let remittance_id = Uuid::new_v4();
        let claims = parsed_claims
            .into_iter()
            .map(|c| RemittanceClaim {
                id: Uuid::new_v4(),
                remittance_id,
                claim_control_number: c.claim_control_number,
                claim_status_code: c.claim_status_code,
                paid_amount: c.paid_amount,
                charge_amount: c.charge_amount,
                patient_responsibility: c.patient_responsibility,
                adjustments: c.adjustments,
                service_lines: c
                    .service_lines
                    .into_iter()
                    .map(|sl| crate::models::RemittanceServiceLine {
                        procedure_code: sl.procedure_code,
                        paid_amount: sl.paid_amount,
                        charge_amount: sl.charge_amount,
                        adjustments: sl.adjustments,
                    })
                    .collect(),
                patient_control_number_hash: c
                    .patient_control_number
                    .as_deref()
                    .map(|pcn| hash_phi(&self.phi_salt, pcn)),
                service_date: c.service_date,
            })
            .collect();

        Ok(Remittance {
            id: remittance_id,
            payer_id: payer.id,
            remittance_control_number: header.remittance_control_number,
            payment_amount: header.payment_amount,
            payment_date: header.payment_date,
            payment_method: header.payment_method,
            claims,
            created_at: Utc::now(),
        })
    }

    pub fn persist_remittance(&self, remittance: &Remittance) -> Result<(), AppError> {
        self.storage.insert_remittance(remittance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformer() -> Transformer {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let cache = Cache::new();
        Transformer::new(storage, cache, "test-salt".to_string())
    }

    #[test]
    fn resolve_payer_is_idempotent() {
        let t = transformer();
        let a = t.resolve_payer("PAYER1", "Acme Payer").unwrap();
        let b = t.resolve_payer("PAYER1", "Acme Payer").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn hash_phi_is_deterministic_and_opaque() {
        let hashed = hash_phi("salt", "patient-123");
        assert_eq!(hashed, hash_phi("salt", "patient-123"));
        assert!(!hashed.contains("patient-123"));
    }

    #[test]
    fn transform_claim_hashes_patient_id_and_resolves_identities() {
        let t = transformer();
        let parsed = ParsedClaim {
            claim_control_number: "CTRL1".into(),
            patient_control_number: Some("patient-123".into()),
            payer_id_external: Some("PAYER1".into()),
            provider_npi: Some("1234567890".into()),
            provider_name: Some("Acme Clinic".into()),
            total_charge_amount: "1000.00".parse().unwrap(),
            service_date_start: None,
            service_date_end: None,
            lines: vec![],
            diagnoses: vec![],
            warnings: vec![],
        };
        let claim = t.transform_claim(parsed).unwrap();
        assert_ne!(claim.patient_control_number_hash, "patient-123");
        assert!(!claim.patient_control_number_hash.is_empty());
    }
}
