//! Domain model
//! Mission: one relational shape for claims, remittances, episodes, patterns
//! and risk scores, shared by the parser, transformer, linker, scorer, and API.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monetary amounts are fixed-point, scale 2, everywhere past the parser
/// boundary. `Decimal` avoids the float/rounding drift the source system
/// was prone to.
pub type Money = Decimal;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payer {
    pub id: Uuid,
    pub payer_id_external: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub npi: Option<String>,
    pub name: String,
    pub taxonomy_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Submitted,
    Processing,
    Adjudicated,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub code_system: String,
    pub code: String,
    pub principal: bool,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimLine {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub line_number: u32,
    pub procedure_code: String,
    pub modifiers: Vec<String>,
    pub charge_amount: Money,
    pub units: u32,
    pub service_date: Option<NaiveDate>,
    pub revenue_code: Option<String>,
    pub procedure_code_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub payer_id: Uuid,
    pub provider_id: Uuid,
    pub claim_control_number: String,
    pub patient_control_number_hash: String,
    pub total_charge_amount: Money,
    pub service_date_start: Option<NaiveDate>,
    pub service_date_end: Option<NaiveDate>,
    pub status: ClaimStatus,
    pub lines: Vec<ClaimLine>,
    pub diagnoses: Vec<Diagnosis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    pub fn principal_diagnosis(&self) -> Option<&Diagnosis> {
        self.diagnoses.iter().find(|d| d.principal)
    }

    /// §3 invariant: sum(line.charge_amount) == claim.total_charge_amount, ±0.01.
    pub fn charge_mismatch(&self) -> Option<Decimal> {
        let sum: Decimal = self.lines.iter().map(|l| l.charge_amount).sum();
        let diff = (sum - self.total_charge_amount).abs();
        if diff > Decimal::new(1, 2) {
            Some(diff)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjustment {
    pub group_code: String,
    pub reason_code: String,
    pub amount: Money,
    pub quantity: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemittanceServiceLine {
    pub procedure_code: Option<String>,
    pub paid_amount: Money,
    pub charge_amount: Money,
    pub adjustments: Vec<Adjustment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemittanceClaim {
    pub id: Uuid,
    pub remittance_id: Uuid,
    pub claim_control_number: String,
    pub claim_status_code: String,
    pub paid_amount: Money,
    pub charge_amount: Money,
    pub patient_responsibility: Money,
    pub adjustments: Vec<Adjustment>,
    pub service_lines: Vec<RemittanceServiceLine>,
    /// Hint used by the fallback episode-matching rule (§4.7 rule 2).
    pub patient_control_number_hash: Option<String>,
    pub service_date: Option<NaiveDate>,
}

impl RemittanceClaim {
    /// §3 invariant (warning, not error): paid + adjustments ≈ charge.
    pub fn amount_mismatch(&self) -> Option<Decimal> {
        let adj_sum: Decimal = self.adjustments.iter().map(|a| a.amount).sum();
        let diff = (self.paid_amount + adj_sum - self.charge_amount).abs();
        if diff > Decimal::new(1, 2) {
            Some(diff)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remittance {
    pub id: Uuid,
    pub payer_id: Uuid,
    pub remittance_control_number: String,
    pub payment_amount: Money,
    pub payment_date: Option<NaiveDate>,
    pub payment_method: String,
    pub claims: Vec<RemittanceClaim>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Open,
    Partial,
    Denied,
    Paid,
    Appealed,
    Closed,
}

impl EpisodeStatus {
    /// Monotone lattice order from spec §4.7: open < partial < paid/denied < appealed < closed.
    fn rank(self) -> u8 {
        match self {
            EpisodeStatus::Open => 0,
            EpisodeStatus::Partial => 1,
            EpisodeStatus::Denied => 2,
            EpisodeStatus::Paid => 2,
            EpisodeStatus::Appealed => 3,
            EpisodeStatus::Closed => 4,
        }
    }

    pub fn at_least(self, other: EpisodeStatus) -> bool {
        self.rank() >= other.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub remittance_id: Uuid,
    pub status: EpisodeStatus,
    pub denial_count: u32,
    pub total_paid: Money,
    pub total_adjustment: Money,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenialPattern {
    pub id: Uuid,
    pub payer_id: Uuid,
    pub denial_reason_code: String,
    pub procedure_code: Option<String>,
    pub diagnosis_code: Option<String>,
    pub frequency: f64,
    pub confidence: f64,
    pub occurrence_count: u32,
    pub first_observed: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// §3 invariant: deterministic function of overall_score.
    /// <25 low, <50 medium, <75 high, else critical. Boundary goes to the
    /// upper bucket (25 resolves to medium, not low).
    pub fn from_score(score: u8) -> Self {
        if score < 25 {
            RiskLevel::Low
        } else if score < 50 {
            RiskLevel::Medium
        } else if score < 75 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorScore {
    pub name: String,
    pub score: u8,
    pub weight: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScore {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub calculated_at: DateTime<Utc>,
    pub overall_score: u8,
    pub level: RiskLevel,
    pub factors: Vec<FactorScore>,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub principal_hash: Option<String>,
    pub duration_ms: u64,
}

/// Which X12 transaction set a file contains.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileType {
    Claim837,
    Remittance835,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Claim837 => "837",
            FileType::Remittance835 => "835",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_threshold_boundaries_go_up() {
        assert_eq!(RiskLevel::from_score(24), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(25), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(49), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(50), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(74), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(75), RiskLevel::Critical);
    }

    #[test]
    fn episode_status_lattice_is_monotone() {
        assert!(EpisodeStatus::Closed.at_least(EpisodeStatus::Appealed));
        assert!(EpisodeStatus::Paid.at_least(EpisodeStatus::Partial));
        assert!(!EpisodeStatus::Open.at_least(EpisodeStatus::Partial));
    }

    fn sample_claim(total: &str, line_amounts: &[&str]) -> Claim {
        Claim {
            id: Uuid::new_v4(),
            payer_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            claim_control_number: "CTRL1".into(),
            patient_control_number_hash: "hash".into(),
            total_charge_amount: total.parse().unwrap(),
            service_date_start: None,
            service_date_end: None,
            status: ClaimStatus::Submitted,
            lines: line_amounts
                .iter()
                .enumerate()
                .map(|(i, amt)| ClaimLine {
                    id: Uuid::new_v4(),
                    claim_id: Uuid::new_v4(),
                    line_number: i as u32 + 1,
                    procedure_code: "99213".into(),
                    modifiers: vec![],
                    charge_amount: amt.parse().unwrap(),
                    units: 1,
                    service_date: None,
                    revenue_code: None,
                    procedure_code_valid: true,
                })
                .collect(),
            diagnoses: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn charge_mismatch_within_tolerance_is_none() {
        let claim = sample_claim("100.00", &["50.00", "50.005"]);
        assert!(claim.charge_mismatch().is_none());
    }

    #[test]
    fn charge_mismatch_beyond_tolerance_is_some() {
        let claim = sample_claim("100.00", &["50.00", "40.00"]);
        assert!(claim.charge_mismatch().is_some());
    }
}
