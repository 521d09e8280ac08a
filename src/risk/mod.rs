//! Risk scoring (C11–C12): independently-weighted factors composed by a
//! scorer into one deterministic 0–100 score with an explanation trail.

pub mod factors;
pub mod scorer;

pub use factors::{FactorResult, MlPredictor, RiskContext, RiskFactor};
pub use scorer::RiskScorer;
