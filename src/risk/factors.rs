//! Risk factors (C11)
//! Mission: one small trait so the scorer can iterate a uniform list and
//! grow by appending (spec.md §9 "polymorphism across factors"). Each
//! factor is pure with respect to its claim + context inputs.

use crate::cache::Cache;
use crate::models::Claim;
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct RiskContext<'a> {
    pub storage: &'a Storage,
    pub cache: &'a Cache,
}

#[derive(Debug, Clone)]
pub struct FactorResult {
    pub name: String,
    pub score: u8,
    pub weight: f64,
    pub reasons: Vec<String>,
}

/// Shared capability set for every risk factor: `evaluate`, `name`,
/// `weight` — implemented as a small set of variants with uniform shape
/// (spec.md §9). Adding a factor means appending to the scorer's list.
pub trait RiskFactor: Send + Sync {
    fn name(&self) -> &'static str;
    fn default_weight(&self) -> f64;
    fn evaluate(&self, claim: &Claim, context: &RiskContext) -> FactorResult;
}

fn capped(score: i32, cap: i32) -> u8 {
    score.clamp(0, cap) as u8
}

const PAYER_DENIAL_RATE_WINDOW_DAYS: i64 = 90;
const PAYER_DENIAL_RATE_CACHE_TTL_SECS: u64 = 86_400;

pub struct PayerFactor;

impl RiskFactor for PayerFactor {
    fn name(&self) -> &'static str {
        "payer"
    }

    fn default_weight(&self) -> f64 {
        0.20
    }

    fn evaluate(&self, claim: &Claim, context: &RiskContext) -> FactorResult {
        let cache_key = format!("payer:{}:denial_rate", claim.payer_id);
        let denial_rate = match context.cache.get_json::<f64>(&cache_key) {
            Some(rate) => rate,
            None => {
                let rate = context
                    .storage
                    .payer_denial_rate(claim.payer_id, PAYER_DENIAL_RATE_WINDOW_DAYS)
                    .unwrap_or(0.0);
                context.cache.set_json(
                    &cache_key,
                    &rate,
                    Duration::from_secs(PAYER_DENIAL_RATE_CACHE_TTL_SECS),
                );
                rate
            }
        };
        let base = capped((denial_rate * 100.0).round() as i32, 100);
        let reasons = vec![format!("payer historical denial rate {:.1}%", denial_rate * 100.0)];
        FactorResult {
            name: self.name().to_string(),
            score: base,
            weight: self.default_weight(),
            reasons,
        }
    }
}

pub struct CodingFactor;

impl RiskFactor for CodingFactor {
    fn name(&self) -> &'static str {
        "coding"
    }

    fn default_weight(&self) -> f64 {
        0.25
    }

    fn evaluate(&self, claim: &Claim, _context: &RiskContext) -> FactorResult {
        let mut score = 0i32;
        let mut reasons = Vec::new();

        let invalid_procedures = claim.lines.iter().filter(|l| !l.procedure_code_valid).count() as i32;
        if invalid_procedures > 0 {
            score += (invalid_procedures * 25).min(50);
            reasons.push(format!("{invalid_procedures} invalid procedure code(s)"));
        }

        let invalid_diagnoses = claim.diagnoses.iter().filter(|d| !d.is_valid).count() as i32;
        if invalid_diagnoses > 0 {
            score += (invalid_diagnoses * 15).min(30);
            reasons.push(format!("{invalid_diagnoses} invalid diagnosis code(s)"));
        }

        let missing_modifiers = claim
            .lines
            .iter()
            .filter(|l| procedure_demands_modifier(&l.procedure_code) && l.modifiers.is_empty())
            .count() as i32;
        if missing_modifiers > 0 {
            score += missing_modifiers * 10;
            reasons.push(format!("{missing_modifiers} line(s) missing a required modifier"));
        }

        let inconsistent_units = claim.lines.iter().filter(|l| unit_count_inconsistent(l)).count() as i32;
        if inconsistent_units > 0 {
            score += 10;
            reasons.push(format!("{inconsistent_units} line(s) with unit count inconsistent for procedure type"));
        }

        FactorResult {
            name: self.name().to_string(),
            score: capped(score, 100),
            weight: self.default_weight(),
            reasons,
        }
    }
}

/// Anesthesia codes (CPT 00100–01999) require a physical status modifier;
/// this is the "rule list" spec.md §4.9 leaves implicit.
fn procedure_demands_modifier(code: &str) -> bool {
    code.parse::<u32>().map(|n| (100..=1999).contains(&n)).unwrap_or(false)
}

/// E/M codes (992xx) are conventionally billed at a single unit per
/// encounter; more than one is inconsistent with the procedure type.
fn unit_count_inconsistent(line: &crate::models::ClaimLine) -> bool {
    line.procedure_code.starts_with("992") && line.units > 1
}

pub struct DocumentationFactor;

impl RiskFactor for DocumentationFactor {
    fn name(&self) -> &'static str {
        "documentation"
    }

    fn default_weight(&self) -> f64 {
        0.20
    }

    fn evaluate(&self, claim: &Claim, context: &RiskContext) -> FactorResult {
        let mut score = 0i32;
        let mut reasons = Vec::new();

        if claim.principal_diagnosis().is_none() {
            score += 40;
            reasons.push("missing principal diagnosis".to_string());
        }

        let npi_present = context
            .storage
            .get_provider(claim.provider_id)
            .ok()
            .flatten()
            .and_then(|p| p.npi)
            .is_some();
        if !npi_present {
            score += 30;
            reasons.push("missing provider NPI".to_string());
        }

        if claim.patient_control_number_hash.is_empty() {
            score += 20;
            reasons.push("missing subscriber reference".to_string());
        }

        if claim.service_date_start.is_none() {
            score += 20;
            reasons.push("missing service date".to_string());
        }
        if claim.charge_mismatch().is_some() {
            score += 20;
            reasons.push("line charges do not sum to claim total".to_string());
        }

        FactorResult {
            name: self.name().to_string(),
            score: capped(score, 100),
            weight: self.default_weight(),
            reasons,
        }
    }
}

pub struct PatternMatchFactor;

impl RiskFactor for PatternMatchFactor {
    fn name(&self) -> &'static str {
        "pattern_match"
    }

    fn default_weight(&self) -> f64 {
        0.20
    }

    fn evaluate(&self, claim: &Claim, context: &RiskContext) -> FactorResult {
        let patterns = context
            .storage
            .list_denial_patterns(Some(claim.payer_id))
            .unwrap_or_default();

        let procedure_codes: std::collections::HashSet<&str> =
            claim.lines.iter().map(|l| l.procedure_code.as_str()).collect();
        let diagnosis_codes: std::collections::HashSet<&str> =
            claim.diagnoses.iter().map(|d| d.code.as_str()).collect();

        let mut accumulated = 0.0f64;
        let mut reasons = Vec::new();
        for pattern in &patterns {
            let procedure_matches = pattern
                .procedure_code
                .as_deref()
                .map(|p| procedure_codes.contains(p))
                .unwrap_or(true);
            let diagnosis_matches = pattern
                .diagnosis_code
                .as_deref()
                .map(|d| diagnosis_codes.contains(d))
                .unwrap_or(true);
            if procedure_matches && diagnosis_matches && (pattern.procedure_code.is_some() || pattern.diagnosis_code.is_some()) {
                accumulated += pattern.frequency * pattern.confidence * 100.0;
                reasons.push(format!(
                    "matches denial pattern reason={} confidence={:.2}",
                    pattern.denial_reason_code, pattern.confidence
                ));
            }
        }

        FactorResult {
            name: self.name().to_string(),
            score: capped(accumulated.round() as i32, 100),
            weight: self.default_weight(),
            reasons,
        }
    }
}

/// Pluggable ML predictor contract (spec.md §4.9). Model presence and
/// feature extraction are out of scope; this crate ships no model.
pub trait MlPredictor: Send + Sync {
    fn predict(&self, features: &HashMap<String, f64>) -> f64;
}

pub struct MlFactor {
    predictor: Option<Arc<dyn MlPredictor>>,
}

impl MlFactor {
    pub fn new(predictor: Option<Arc<dyn MlPredictor>>) -> Self {
        Self { predictor }
    }

    fn features(claim: &Claim) -> HashMap<String, f64> {
        let mut features = HashMap::new();
        features.insert("line_count".to_string(), claim.lines.len() as f64);
        features.insert(
            "total_charge_amount".to_string(),
            claim.total_charge_amount.to_string().parse().unwrap_or(0.0),
        );
        features
    }
}

impl RiskFactor for MlFactor {
    fn name(&self) -> &'static str {
        "ml"
    }

    fn default_weight(&self) -> f64 {
        0.15
    }

    fn evaluate(&self, claim: &Claim, _context: &RiskContext) -> FactorResult {
        match &self.predictor {
            None => FactorResult {
                name: self.name().to_string(),
                score: 50,
                weight: 0.0,
                reasons: vec!["no model".to_string()],
            },
            Some(predictor) => {
                let probability = predictor.predict(&Self::features(claim)).clamp(0.0, 1.0);
                FactorResult {
                    name: self.name().to_string(),
                    score: (probability * 100.0).round() as u8,
                    weight: self.default_weight(),
                    reasons: vec![format!("model probability {probability:.2}")],
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Claim, ClaimStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn context_fixtures() -> (Storage, std::sync::Arc<Cache>) {
        (Storage::in_memory().unwrap(), Cache::new())
    }

    fn bare_claim() -> Claim {
        Claim {
            id: Uuid::new_v4(),
            payer_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            claim_control_number: "CTRL1".into(),
            patient_control_number_hash: "hash".into(),
            total_charge_amount: "1000.00".parse().unwrap(),
            service_date_start: None,
            service_date_end: None,
            status: ClaimStatus::Submitted,
            lines: vec![],
            diagnoses: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn s1_clean_claim_has_zero_coding_and_documentation_score() {
        let (storage, cache) = context_fixtures();
        let provider = storage.upsert_provider(Some("1234567890"), "Dr. Test", None).unwrap();
        let context = RiskContext {
            storage: &storage,
            cache: &cache,
        };
        let mut claim = bare_claim();
        claim.provider_id = provider.id;
        claim.service_date_start = Some(chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        claim.diagnoses.push(crate::models::Diagnosis {
            code_system: "ICD10".into(),
            code: "E11.9".into(),
            principal: true,
            is_valid: true,
        });
        claim.lines.push(crate::models::ClaimLine {
            id: Uuid::new_v4(),
            claim_id: claim.id,
            line_number: 1,
            procedure_code: "99213".into(),
            modifiers: vec![],
            charge_amount: "1000.00".parse().unwrap(),
            units: 1,
            service_date: None,
            revenue_code: None,
            procedure_code_valid: true,
        });

        assert_eq!(CodingFactor.evaluate(&claim, &context).score, 0);
        assert_eq!(DocumentationFactor.evaluate(&claim, &context).score, 0);
    }

    #[test]
    fn documentation_factor_penalizes_missing_npi_and_subscriber_reference() {
        let (storage, cache) = context_fixtures();
        let context = RiskContext {
            storage: &storage,
            cache: &cache,
        };
        let mut claim = bare_claim();
        claim.patient_control_number_hash = String::new();
        claim.service_date_start = Some(chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        claim.diagnoses.push(crate::models::Diagnosis {
            code_system: "ICD10".into(),
            code: "E11.9".into(),
            principal: true,
            is_valid: true,
        });
        // provider_id does not resolve to any stored provider, so NPI is absent.
        let result = DocumentationFactor.evaluate(&claim, &context);
        assert!(result.score >= 50);
        assert!(result.reasons.iter().any(|r| r.contains("NPI")));
        assert!(result.reasons.iter().any(|r| r.contains("subscriber reference")));
    }

    #[test]
    fn coding_factor_penalizes_missing_modifier_and_inconsistent_units() {
        let (storage, cache) = context_fixtures();
        let context = RiskContext {
            storage: &storage,
            cache: &cache,
        };
        let mut claim = bare_claim();
        claim.lines.push(crate::models::ClaimLine {
            id: Uuid::new_v4(),
            claim_id: claim.id,
            line_number: 1,
            procedure_code: "00300".into(),
            modifiers: vec![],
            charge_amount: "500.00".parse().unwrap(),
            units: 1,
            service_date: None,
            revenue_code: None,
            procedure_code_valid: true,
        });
        claim.lines.push(crate::models::ClaimLine {
            id: Uuid::new_v4(),
            claim_id: claim.id,
            line_number: 2,
            procedure_code: "99213".into(),
            modifiers: vec![],
            charge_amount: "500.00".parse().unwrap(),
            units: 3,
            service_date: None,
            revenue_code: None,
            procedure_code_valid: true,
        });
        let result = CodingFactor.evaluate(&claim, &context);
        assert_eq!(result.score, 20);
        assert!(result.reasons.iter().any(|r| r.contains("modifier")));
        assert!(result.reasons.iter().any(|r| r.contains("unit count")));
    }

    #[test]
    fn s2_invalid_procedure_code_scores_at_least_25() {
        let (storage, cache) = context_fixtures();
        let context = RiskContext {
            storage: &storage,
            cache: &cache,
        };
        let mut claim = bare_claim();
        claim.lines.push(crate::models::ClaimLine {
            id: Uuid::new_v4(),
            claim_id: claim.id,
            line_number: 1,
            procedure_code: "9921X".into(),
            modifiers: vec![],
            charge_amount: "1000.00".parse().unwrap(),
            units: 1,
            service_date: None,
            revenue_code: None,
            procedure_code_valid: false,
        });
        assert!(CodingFactor.evaluate(&claim, &context).score >= 25);
    }

    #[test]
    fn ml_factor_with_no_model_contributes_nothing() {
        let (storage, cache) = context_fixtures();
        let context = RiskContext {
            storage: &storage,
            cache: &cache,
        };
        let factor = MlFactor::new(None);
        let result = factor.evaluate(&bare_claim(), &context);
        assert_eq!(result.score, 50);
        assert_eq!(result.weight, 0.0);
    }
}
