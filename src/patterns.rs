//! Pattern detector (C10)
//! Mission: aggregate denied/partial episodes per payer into recurring
//! `(reason_code, payer, procedure?, diagnosis?)` patterns, per the
//! thresholds and refinement rule of spec.md §4.8.

use crate::error::AppError;
use crate::models::DenialPattern;
use crate::storage::Storage;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_WINDOW_DAYS: i64 = 90;
pub const DEFAULT_MIN_FREQUENCY: f64 = 0.05;
pub const DEFAULT_MIN_OCCURRENCES: u32 = 5;
const REFINEMENT_MIN_CONDITIONAL_FREQUENCY: f64 = 0.5;

/// One denial observation feeding the aggregation: the reason code plus
/// optional procedure/diagnosis codes present on the denied claim.
#[derive(Debug, Clone)]
pub struct DenialObservation {
    pub payer_id: Uuid,
    pub reason_code: String,
    pub procedure_code: Option<String>,
    pub diagnosis_code: Option<String>,
}

pub struct PatternDetector {
    storage: Arc<Storage>,
}

impl PatternDetector {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Runs pattern detection over the supplied denial observations
    /// (already scoped to the caller's time window and optional payer
    /// filter) and upserts any candidate above threshold. Returns the
    /// patterns that were written.
    pub fn detect(
        &self,
        observations: &[DenialObservation],
        min_frequency: f64,
        min_occurrences: u32,
    ) -> Result<Vec<DenialPattern>, AppError> {
        let mut by_payer: HashMap<Uuid, Vec<&DenialObservation>> = HashMap::new();
        for obs in observations {
            by_payer.entry(obs.payer_id).or_default().push(obs);
        }

        let mut written = Vec::new();
        for (payer_id, payer_observations) in by_payer {
            let total = payer_observations.len() as f64;
            let mut by_reason: HashMap<&str, Vec<&&DenialObservation>> = HashMap::new();
            for obs in &payer_observations {
                by_reason.entry(obs.reason_code.as_str()).or_default().push(obs);
            }

            for (reason_code, group) in by_reason {
                let occurrence_count = group.len() as u32;
                let frequency = group.len() as f64 / total;
                if frequency < min_frequency || occurrence_count < min_occurrences {
                    continue;
                }

                let (procedure_code, diagnosis_code) = refine(&group);
                let confidence = (occurrence_count as f64 / 20.0).min(1.0);
                let now = Utc::now();

                let pattern = DenialPattern {
                    id: Uuid::new_v4(),
                    payer_id,
                    denial_reason_code: reason_code.to_string(),
                    procedure_code,
                    diagnosis_code,
                    frequency,
                    confidence,
                    occurrence_count,
                    first_observed: now,
                    last_observed: now,
                };
                written.push(self.storage.upsert_denial_pattern(&pattern)?);
            }
        }
        Ok(written)
    }
}

/// Finds the most common procedure/diagnosis code within a reason group,
/// including it only if its conditional frequency clears the refinement
/// threshold (spec.md §4.8 step 4).
fn refine(group: &[&&DenialObservation]) -> (Option<String>, Option<String>) {
    let procedure_code = most_common(group.iter().filter_map(|o| o.procedure_code.as_deref()), group.len());
    let diagnosis_code = most_common(group.iter().filter_map(|o| o.diagnosis_code.as_deref()), group.len());
    (procedure_code, diagnosis_code)
}

fn most_common<'a>(values: impl Iterator<Item = &'a str>, total: usize) -> Option<String> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .filter(|(_, count)| *count as f64 / total as f64 >= REFINEMENT_MIN_CONDITIONAL_FREQUENCY)
        .map(|(code, _)| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> PatternDetector {
        PatternDetector::new(Arc::new(Storage::in_memory().unwrap()))
    }

    fn observation(payer_id: Uuid, reason: &str, procedure: Option<&str>) -> DenialObservation {
        DenialObservation {
            payer_id,
            reason_code: reason.to_string(),
            procedure_code: procedure.map(String::from),
            diagnosis_code: None,
        }
    }

    #[test]
    fn s4_five_denials_same_reason_emit_pattern_with_frequency_one() {
        let detector = detector();
        let payer_id = Uuid::new_v4();
        let observations: Vec<_> = (0..5).map(|_| observation(payer_id, "50", Some("99213"))).collect();
        let patterns = detector
            .detect(&observations, DEFAULT_MIN_FREQUENCY, DEFAULT_MIN_OCCURRENCES)
            .unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].denial_reason_code, "50");
        assert!((patterns[0].frequency - 1.0).abs() < f64::EPSILON);
        assert_eq!(patterns[0].procedure_code.as_deref(), Some("99213"));
    }

    #[test]
    fn below_threshold_occurrences_emits_nothing() {
        let detector = detector();
        let payer_id = Uuid::new_v4();
        let observations: Vec<_> = (0..3).map(|_| observation(payer_id, "50", None)).collect();
        let patterns = detector
            .detect(&observations, DEFAULT_MIN_FREQUENCY, DEFAULT_MIN_OCCURRENCES)
            .unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn rerun_is_idempotent_and_updates_occurrence_count() {
        let detector = detector();
        let payer_id = Uuid::new_v4();
        let observations: Vec<_> = (0..5).map(|_| observation(payer_id, "50", Some("99213"))).collect();
        detector
            .detect(&observations, DEFAULT_MIN_FREQUENCY, DEFAULT_MIN_OCCURRENCES)
            .unwrap();
        let more: Vec<_> = (0..8).map(|_| observation(payer_id, "50", Some("99213"))).collect();
        let patterns = detector
            .detect(&more, DEFAULT_MIN_FREQUENCY, DEFAULT_MIN_OCCURRENCES)
            .unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrence_count, 8);

        let all = detector.storage.list_denial_patterns(Some(payer_id)).unwrap();
        assert_eq!(all.len(), 1);
    }
}
