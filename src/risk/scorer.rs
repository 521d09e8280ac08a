//! Risk scorer (C12)
//! Mission: weighted composition of factor scores into one deterministic
//! 0–100 score with an explanation trail (spec.md §4.10).

use super::factors::{
    CodingFactor, DocumentationFactor, FactorResult, MlFactor, MlPredictor, PatternMatchFactor,
    PayerFactor, RiskContext, RiskFactor,
};
use crate::cache::Cache;
use crate::error::AppError;
use crate::models::{Claim, FactorScore, RiskLevel, RiskScore};
use crate::push::{PushChannel, PushEvent};
use crate::storage::Storage;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const RISK_SCORE_CACHE_TTL_SECS: u64 = 3_600;

pub struct RiskScorer {
    factors: Vec<Box<dyn RiskFactor>>,
    storage: Arc<Storage>,
    cache: Arc<Cache>,
    push: Arc<PushChannel>,
}

impl RiskScorer {
    pub fn new(storage: Arc<Storage>, cache: Arc<Cache>, push: Arc<PushChannel>) -> Self {
        Self::with_ml_predictor(storage, cache, push, None)
    }

    pub fn with_ml_predictor(
        storage: Arc<Storage>,
        cache: Arc<Cache>,
        push: Arc<PushChannel>,
        ml_predictor: Option<Arc<dyn MlPredictor>>,
    ) -> Self {
        let factors: Vec<Box<dyn RiskFactor>> = vec![
            Box::new(PayerFactor),
            Box::new(CodingFactor),
            Box::new(DocumentationFactor),
            Box::new(PatternMatchFactor),
            Box::new(MlFactor::new(ml_predictor)),
        ];
        Self {
            factors,
            storage,
            cache,
            push,
        }
    }

    /// Computes, persists, caches, and publishes a risk score for one
    /// claim. Deterministic for a fixed DB snapshot and cache state
    /// (spec.md §4.10, §8 property 6).
    pub fn score(&self, claim: &Claim) -> Result<RiskScore, AppError> {
        let context = RiskContext {
            storage: &self.storage,
            cache: &self.cache,
        };

        let results: Vec<FactorResult> = self.factors.iter().map(|f| f.evaluate(claim, &context)).collect();

        let weighted_sum: f64 = results
            .iter()
            .filter(|r| r.weight > 0.0)
            .map(|r| r.score as f64 * r.weight)
            .sum();
        let overall_score = weighted_sum.round().clamp(0.0, 100.0) as u8;
        let level = RiskLevel::from_score(overall_score);

        let factors: Vec<FactorScore> = results
            .into_iter()
            .map(|r| FactorScore {
                name: r.name,
                score: r.score,
                weight: r.weight,
                reasons: r.reasons,
            })
            .collect();

        let rationale = factors
            .iter()
            .filter(|f| f.weight > 0.0)
            .map(|f| format!("{}: {} (weight {:.2})", f.name, f.score, f.weight))
            .collect::<Vec<_>>()
            .join("; ");

        let risk_score = RiskScore {
            id: Uuid::new_v4(),
            claim_id: claim.id,
            calculated_at: Utc::now(),
            overall_score,
            level,
            factors,
            rationale: Some(rationale),
        };

        self.storage.insert_risk_score(&risk_score)?;

        let cache_key = format!("risk_score:{}", claim.id);
        self.cache.invalidate(&cache_key);
        self.cache
            .set_json(&cache_key, &risk_score, Duration::from_secs(RISK_SCORE_CACHE_TTL_SECS));

        self.push.publish(PushEvent::RiskScoreCalculated {
            claim_id: claim.id,
            overall_score,
            level,
        });

        Ok(risk_score)
    }

    pub fn latest(&self, claim_id: Uuid) -> Result<Option<RiskScore>, AppError> {
        let cache_key = format!("risk_score:{claim_id}");
        if let Some(score) = self.cache.get_json::<RiskScore>(&cache_key) {
            return Ok(Some(score));
        }
        let score = self.storage.latest_risk_score(claim_id)?;
        if let Some(score) = &score {
            self.cache
                .set_json(&cache_key, score, Duration::from_secs(RISK_SCORE_CACHE_TTL_SECS));
        }
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClaimStatus;

    fn scorer() -> RiskScorer {
        RiskScorer::new(
            Arc::new(Storage::in_memory().unwrap()),
            Cache::new(),
            PushChannel::new(16),
        )
    }

    fn claim() -> Claim {
        Claim {
            id: Uuid::new_v4(),
            payer_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            claim_control_number: "CTRL1".into(),
            patient_control_number_hash: "hash".into(),
            total_charge_amount: "1000.00".parse().unwrap(),
            service_date_start: Some(chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()),
            service_date_end: None,
            status: ClaimStatus::Submitted,
            lines: vec![crate::models::ClaimLine {
                id: Uuid::new_v4(),
                claim_id: Uuid::new_v4(),
                line_number: 1,
                procedure_code: "99213".into(),
                modifiers: vec![],
                charge_amount: "1000.00".parse().unwrap(),
                units: 1,
                service_date: None,
                revenue_code: None,
                procedure_code_valid: true,
            }],
            diagnoses: vec![crate::models::Diagnosis {
                code_system: "ICD10".into(),
                code: "E11.9".into(),
                principal: true,
                is_valid: true,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn score_is_in_range_and_level_matches_threshold() {
        let scorer = scorer();
        let score = scorer.score(&claim()).unwrap();
        assert!(score.overall_score <= 100);
        assert_eq!(score.level, RiskLevel::from_score(score.overall_score));
    }

    #[test]
    fn rescoring_same_snapshot_is_deterministic() {
        let scorer = scorer();
        let claim = claim();
        let first = scorer.score(&claim).unwrap();
        let second = scorer.score(&claim).unwrap();
        assert_eq!(first.overall_score, second.overall_score);
        assert_eq!(first.level, second.level);
    }

    #[test]
    fn latest_reads_through_cache_then_storage() {
        let scorer = scorer();
        let claim = claim();
        let written = scorer.score(&claim).unwrap();
        let latest = scorer.latest(claim.id).unwrap().unwrap();
        assert_eq!(latest.id, written.id);
    }
}
