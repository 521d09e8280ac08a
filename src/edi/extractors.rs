//! Extractors (C2)
//! Mission: pure functions from raw segment elements to typed data. Nothing
//! here touches I/O or persistence — dynamic typing stops at this boundary
//! (spec.md §9): every EDI element is decoded into a decimal, date, or enum
//! before it goes any further.

use crate::error::ParseWarning;
use crate::models::{Adjustment, Diagnosis};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Parses a fixed-point monetary element, rounding half-up to 2 decimals.
pub fn parse_money(raw: &str) -> Result<Decimal, ParseWarning> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ParseWarning::new("missing_amount", "empty monetary element"));
    }
    Decimal::from_str(raw)
        .map(|d| d.round_dp(2))
        .map_err(|_| ParseWarning::new("bad_amount", format!("unparseable amount: {raw}")))
}

/// Parses a `YYYYMMDD` date element.
pub fn parse_date_yyyymmdd(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

/// ICD-10: `[A-Z][0-9]{2}(\.[0-9]{0,2})?`; ICD-9: `[0-9]{3,5}(\.[0-9]{0,2})?`.
/// Code length must fall in [3,10] regardless of system.
pub fn validate_diagnosis_code(code: &str) -> bool {
    if code.len() < 3 || code.len() > 10 {
        return false;
    }
    is_icd10(code) || is_icd9(code)
}

fn is_icd10(code: &str) -> bool {
    let bytes = code.as_bytes();
    if bytes.len() < 3 || !bytes[0].is_ascii_uppercase() {
        return false;
    }
    if !bytes[1].is_ascii_digit() || !bytes[2].is_ascii_digit() {
        return false;
    }
    match bytes.get(3) {
        None => true,
        Some(b'.') => {
            let frac = &bytes[4..];
            !frac.is_empty() && frac.len() <= 2 && frac.iter().all(u8::is_ascii_digit)
        }
        _ => false,
    }
}

fn is_icd9(code: &str) -> bool {
    let (int_part, frac_part) = match code.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (code, None),
    };
    if int_part.len() < 3 || int_part.len() > 5 || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match frac_part {
        None => true,
        Some(f) => !f.is_empty() && f.len() <= 2 && f.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// CPT: `[0-9]{5}`; HCPCS: `[A-Z][0-9]{4}`; an optional `-XX` modifier
/// suffix is stripped before validation.
pub fn validate_procedure_code(code: &str) -> bool {
    let base = code.split('-').next().unwrap_or(code);
    is_cpt(base) || is_hcpcs(base)
}

fn is_cpt(code: &str) -> bool {
    code.len() == 5 && code.bytes().all(|b| b.is_ascii_digit())
}

fn is_hcpcs(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 5 && bytes[0].is_ascii_uppercase() && bytes[1..].iter().all(|b| b.is_ascii_digit())
}

pub struct BprData {
    pub payment_amount: Decimal,
    pub payment_date: Option<NaiveDate>,
    pub payment_method: String,
}

/// BPR01 handling code, BPR02 amount, BPR16 payment date.
pub fn extract_bpr(elements: &[String]) -> (BprData, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let payment_method = elements.first().cloned().unwrap_or_default();
    let payment_amount = elements
        .get(1)
        .map(|s| s.as_str())
        .and_then(|s| parse_money(s).map_err(|w| warnings.push(w)).ok())
        .unwrap_or(Decimal::ZERO);
    let payment_date = elements.get(15).and_then(|s| parse_date_yyyymmdd(s));
    (
        BprData {
            payment_amount,
            payment_date,
            payment_method,
        },
        warnings,
    )
}

pub struct ClpData {
    pub claim_control_number: String,
    pub claim_status_code: String,
    pub charge_amount: Decimal,
    pub paid_amount: Decimal,
    pub patient_responsibility: Decimal,
}

/// CLP01 control number, CLP02 status code, CLP03 charge, CLP04 paid, CLP05 patient resp.
pub fn extract_clp(elements: &[String]) -> (ClpData, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let claim_control_number = elements.first().cloned().unwrap_or_default();
    let claim_status_code = elements.get(1).cloned().unwrap_or_default();
    let charge_amount = elements
        .get(2)
        .and_then(|s| parse_money(s).map_err(|w| warnings.push(w)).ok())
        .unwrap_or(Decimal::ZERO);
    let paid_amount = elements
        .get(3)
        .and_then(|s| parse_money(s).map_err(|w| warnings.push(w)).ok())
        .unwrap_or(Decimal::ZERO);
    let patient_responsibility = elements
        .get(4)
        .and_then(|s| parse_money(s).map_err(|w| warnings.push(w)).ok())
        .unwrap_or(Decimal::ZERO);
    (
        ClpData {
            claim_control_number,
            claim_status_code,
            charge_amount,
            paid_amount,
            patient_responsibility,
        },
        warnings,
    )
}

/// CAS01 group code, then repeating triples (reason_code, amount, quantity).
pub fn extract_cas(elements: &[String]) -> (Vec<Adjustment>, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let mut out = Vec::new();
    let Some(group_code) = elements.first() else {
        return (out, warnings);
    };
    let mut idx = 1;
    while idx + 1 < elements.len() + 1 && idx < elements.len() {
        let reason_code = match elements.get(idx) {
            Some(r) if !r.is_empty() => r.clone(),
            _ => break,
        };
        let amount = match elements.get(idx + 1) {
            Some(a) => match parse_money(a) {
                Ok(d) => d,
                Err(w) => {
                    warnings.push(w);
                    idx += 3;
                    continue;
                }
            },
            None => break,
        };
        let quantity = elements
            .get(idx + 2)
            .filter(|s| !s.is_empty())
            .and_then(|s| Decimal::from_str(s).ok());
        out.push(Adjustment {
            group_code: group_code.clone(),
            reason_code,
            amount,
            quantity,
        });
        idx += 3;
    }
    (out, warnings)
}

/// A single decoded diagnosis pointer from an HI segment.
pub fn extract_hi_entry(code_system: &str, code: &str, principal: bool) -> Diagnosis {
    Diagnosis {
        code_system: code_system.to_string(),
        code: code.to_string(),
        principal,
        is_valid: validate_diagnosis_code(code),
    }
}

/// HI segment: each element is `<qualifier>:<code>`. First element is the
/// principal diagnosis (ABK/BK qualifiers for ICD-10/ICD-9 principal).
pub fn extract_hi(elements: &[String]) -> Vec<Diagnosis> {
    elements
        .iter()
        .enumerate()
        .filter_map(|(i, raw)| {
            let (qualifier, code) = raw.split_once(':')?;
            let code_system = if qualifier.starts_with('A') { "ICD10" } else { "ICD9" };
            Some(extract_hi_entry(code_system, code, i == 0))
        })
        .collect()
}

pub struct ServiceLineData {
    pub procedure_code: String,
    pub modifiers: Vec<String>,
    pub charge_amount: Decimal,
    pub units: u32,
    pub revenue_code: Option<String>,
    pub procedure_code_valid: bool,
}

/// SV1/SV2: element 0 is `<qualifier>:<procedure>[:<mod1>:<mod2>:<mod3>:<mod4>]`,
/// element 1 is charge amount, element 3 is units. Up to 4 modifiers.
pub fn extract_service_line(elements: &[String]) -> (ServiceLineData, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let composite = elements.first().map(String::as_str).unwrap_or_default();
    let mut parts = composite.split(':');
    parts.next(); // qualifier (HC, etc.)
    let procedure_code = parts.next().unwrap_or_default().to_string();
    let modifiers: Vec<String> = parts.take(4).map(String::from).collect();

    let charge_amount = elements
        .get(1)
        .and_then(|s| parse_money(s).map_err(|w| warnings.push(w)).ok())
        .unwrap_or(Decimal::ZERO);
    let units = elements
        .get(3)
        .and_then(|s| s.parse::<f64>().ok())
        .map(|n| n.round() as u32)
        .unwrap_or(1);

    let procedure_code_valid = !procedure_code.is_empty() && validate_procedure_code(&procedure_code);
    if !procedure_code_valid {
        warnings.push(ParseWarning::new(
            "invalid_procedure_code",
            format!("procedure code failed validation: {procedure_code}"),
        ));
    }

    (
        ServiceLineData {
            procedure_code,
            modifiers,
            charge_amount,
            units,
            revenue_code: None,
            procedure_code_valid,
        },
        warnings,
    )
}

pub struct Nm1Data {
    pub entity_id_code: String,
    pub name: String,
    pub id_qualifier: String,
    pub id_code: String,
}

/// NM1: element 0 is the entity identifier code (`PR` payer, `85` billing
/// provider, `QC` patient, `41` submitter, …), element 2 the name,
/// element 7/8 the id qualifier/code (e.g. `XX`/NPI for providers).
pub fn extract_nm1(elements: &[String]) -> Nm1Data {
    Nm1Data {
        entity_id_code: elements.first().cloned().unwrap_or_default(),
        name: elements.get(2).cloned().unwrap_or_default(),
        id_qualifier: elements.get(7).cloned().unwrap_or_default(),
        id_code: elements.get(8).cloned().unwrap_or_default(),
    }
}

/// DTP: element 0 is the qualifier (`434` statement dates, `472` service
/// date), element 1 the format qualifier (`D8` single, `RD8` range),
/// element 2 the date or `start-end` range.
pub fn extract_dtp(elements: &[String]) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let format = elements.get(1).map(String::as_str).unwrap_or_default();
    let value = elements.get(2).map(String::as_str).unwrap_or_default();
    if format == "RD8" {
        if let Some((start, end)) = value.split_once('-') {
            return (parse_date_yyyymmdd(start), parse_date_yyyymmdd(end));
        }
        (None, None)
    } else {
        let d = parse_date_yyyymmdd(value);
        (d, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_icd10_codes() {
        assert!(validate_diagnosis_code("E11.9"));
        assert!(validate_diagnosis_code("E119"));
        assert!(!validate_diagnosis_code("E1"));
    }

    #[test]
    fn valid_icd9_codes() {
        assert!(validate_diagnosis_code("250.00"));
        assert!(validate_diagnosis_code("250"));
    }

    #[test]
    fn valid_cpt_and_hcpcs_codes() {
        assert!(validate_procedure_code("99213"));
        assert!(validate_procedure_code("J1100"));
        assert!(validate_procedure_code("99213-25"));
        assert!(!validate_procedure_code("9921X"));
    }

    #[test]
    fn money_rounds_half_up_to_two_decimals() {
        assert_eq!(parse_money("100.005").unwrap(), Decimal::from_str("100.01").unwrap());
    }

    #[test]
    fn extract_clp_decodes_fields() {
        let elements = vec![
            "CTRL1".to_string(),
            "1".to_string(),
            "1000.00".to_string(),
            "1000.00".to_string(),
            "0.00".to_string(),
        ];
        let (clp, warnings) = extract_clp(&elements);
        assert!(warnings.is_empty());
        assert_eq!(clp.claim_control_number, "CTRL1");
        assert_eq!(clp.paid_amount, Decimal::from_str("1000.00").unwrap());
    }

    #[test]
    fn extract_cas_decodes_triples() {
        let elements = vec!["CO".to_string(), "50".to_string(), "1000.00".to_string()];
        let (adjustments, warnings) = extract_cas(&elements);
        assert!(warnings.is_empty());
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].group_code, "CO");
        assert_eq!(adjustments[0].reason_code, "50");
    }

    #[test]
    fn extract_hi_marks_first_entry_principal() {
        let elements = vec!["ABK:E119".to_string(), "ABF:I10".to_string()];
        let diagnoses = extract_hi(&elements);
        assert!(diagnoses[0].principal);
        assert!(!diagnoses[1].principal);
        assert!(diagnoses[0].is_valid);
    }

    #[test]
    fn extract_sv1_flags_invalid_procedure_code() {
        let elements = vec![
            "HC:9921X".to_string(),
            "1000.00".to_string(),
            "UN".to_string(),
            "1".to_string(),
        ];
        let (line, warnings) = extract_service_line(&elements);
        assert!(!line.procedure_code_valid);
        assert!(!warnings.is_empty());
    }
}
