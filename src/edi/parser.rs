//! Streaming parser (C5)
//! Mission: compose the segment reader, extractors, envelope detector, and
//! partitioner into one parser that emits normalized claim/remittance
//! records in input order with memory bounded by the current block
//! (spec.md §4.5). No separate small-file fast path (spec.md §9).

use super::envelope::{self, Envelope};
use super::extractors::{self, Nm1Data};
use super::partitioner::{Block, Partitioner};
use super::segment::{Segment, SegmentSource};
use crate::error::{AppError, ParseWarning};
use crate::models::{Adjustment, Diagnosis};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::path::Path;

/// A claim parsed from an 837, not yet resolved against persisted
/// payer/provider rows — that resolution is the transformer's job (C6).
#[derive(Debug, Clone)]
pub struct ParsedClaim {
    pub claim_control_number: String,
    pub patient_control_number: Option<String>,
    pub payer_id_external: Option<String>,
    pub provider_npi: Option<String>,
    pub provider_name: Option<String>,
    pub total_charge_amount: Decimal,
    pub service_date_start: Option<NaiveDate>,
    pub service_date_end: Option<NaiveDate>,
    pub lines: Vec<ParsedClaimLine>,
    pub diagnoses: Vec<Diagnosis>,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone)]
pub struct ParsedClaimLine {
    pub line_number: u32,
    pub procedure_code: String,
    pub modifiers: Vec<String>,
    pub charge_amount: Decimal,
    pub units: u32,
    pub service_date: Option<NaiveDate>,
    pub revenue_code: Option<String>,
    pub procedure_code_valid: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedRemittanceClaim {
    pub claim_control_number: String,
    pub claim_status_code: String,
    pub charge_amount: Decimal,
    pub paid_amount: Decimal,
    pub patient_responsibility: Decimal,
    pub adjustments: Vec<Adjustment>,
    pub service_lines: Vec<ParsedRemittanceServiceLine>,
    pub patient_control_number: Option<String>,
    pub service_date: Option<NaiveDate>,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone)]
pub struct ParsedRemittanceServiceLine {
    pub procedure_code: Option<String>,
    pub paid_amount: Decimal,
    pub charge_amount: Decimal,
    pub adjustments: Vec<Adjustment>,
}

#[derive(Debug, Clone)]
pub struct ParsedRemittanceHeader {
    pub payer_id_external: Option<String>,
    pub remittance_control_number: String,
    pub payment_amount: Decimal,
    pub payment_date: Option<NaiveDate>,
    pub payment_method: String,
}

/// Every ~500 blocks we log a checkpoint; Rust has no explicit GC call to
/// invoke, but this marks the same batch boundary the source system used
/// to release memory, and gives operators a progress heartbeat on huge files.
const GC_HINT_INTERVAL: usize = 500;

pub fn open_source(path: Option<&Path>, bytes: Option<Vec<u8>>) -> Result<SegmentSource, AppError> {
    match (path, bytes) {
        (Some(path), _) => SegmentSource::from_file(path),
        (None, Some(bytes)) => SegmentSource::from_bytes(bytes),
        (None, None) => Err(AppError::InvariantViolation(
            "open_source called with neither a path nor bytes".to_string(),
        )),
    }
}

/// Parses an 837 stream, invoking `on_claim` for each completed claim block
/// as soon as it is available. Returns the envelope once the stream is
/// exhausted. `on_claim` errors abort the parse.
pub fn parse_837(
    source: &mut SegmentSource,
    mut on_claim: impl FnMut(ParsedClaim) -> Result<(), AppError>,
) -> Result<Envelope, AppError> {
    let envelope = envelope::detect(source)?;
    let mut partitioner = Partitioner::new(source, envelope.file_type);
    let mut header_nm1 = Vec::new();
    let mut block_count = 0usize;
    let mut first_block = true;

    while let Some(block) = partitioner.next_block()? {
        if first_block {
            for seg in partitioner.take_header() {
                if seg.id == "NM1" {
                    header_nm1.push(extractors::extract_nm1(&seg.elements));
                }
            }
            first_block = false;
        }
        let claim = decode_claim_block(&block, &header_nm1)?;
        on_claim(claim)?;
        block_count += 1;
        if block_count % GC_HINT_INTERVAL == 0 {
            tracing::debug!(block_count, "837 parse checkpoint");
        }
    }

    Ok(envelope)
}

fn decode_claim_block(block: &Block, header_nm1: &[Nm1Data]) -> Result<ParsedClaim, AppError> {
    let mut warnings = Vec::new();
    let header = block.header();

    let claim_control_number = header.element(0).unwrap_or_default().to_string();
    let total_charge_amount = header
        .element(1)
        .and_then(|s| extractors::parse_money(s).map_err(|w| warnings.push(w)).ok())
        .unwrap_or(Decimal::ZERO);

    let payer_id_external = header_nm1
        .iter()
        .find(|n| n.entity_id_code == "PR")
        .map(|n| n.id_code.clone())
        .filter(|s| !s.is_empty());
    let provider = header_nm1.iter().find(|n| n.entity_id_code == "85");
    let provider_npi = provider
        .filter(|n| n.id_qualifier == "XX")
        .map(|n| n.id_code.clone())
        .filter(|s| !s.is_empty());
    let provider_name = provider.map(|n| n.name.clone()).filter(|s| !s.is_empty());
    let patient_control_number = header_nm1
        .iter()
        .find(|n| n.entity_id_code == "QC")
        .map(|n| n.id_code.clone())
        .filter(|s| !s.is_empty());

    let mut diagnoses = Vec::new();
    for seg in block.find_all("HI") {
        diagnoses.extend(extractors::extract_hi(&seg.elements));
    }

    let mut service_date_start = None;
    let mut service_date_end = None;
    for seg in block.find_all("DTP") {
        if seg.element(0) == Some("434") || seg.element(0) == Some("472") {
            let (start, end) = extractors::extract_dtp(&seg.elements[1..]);
            service_date_start = service_date_start.or(start);
            service_date_end = service_date_end.or(end);
        }
    }

    let mut lines = Vec::new();
    let mut line_number = 0u32;
    for seg in block.segments.iter().filter(|s| s.id == "SV1" || s.id == "SV2") {
        line_number += 1;
        let (data, line_warnings) = extractors::extract_service_line(&seg.elements);
        warnings.extend(line_warnings);
        lines.push(ParsedClaimLine {
            line_number,
            procedure_code: data.procedure_code,
            modifiers: data.modifiers,
            charge_amount: data.charge_amount,
            units: data.units,
            service_date: service_date_start,
            revenue_code: data.revenue_code,
            procedure_code_valid: data.procedure_code_valid,
        });
    }

    if lines.is_empty() {
        warnings.push(ParseWarning::new(
            "no_service_lines",
            format!("claim {claim_control_number} has no SV1/SV2 lines"),
        ));
    }

    let sum_lines: Decimal = lines.iter().map(|l| l.charge_amount).sum();
    if (sum_lines - total_charge_amount).abs() > Decimal::new(1, 2) {
        warnings.push(ParseWarning::new(
            "charge_mismatch",
            format!("line sum {sum_lines} != claim total {total_charge_amount}"),
        ));
    }

    Ok(ParsedClaim {
        claim_control_number,
        patient_control_number,
        payer_id_external,
        provider_npi,
        provider_name,
        total_charge_amount,
        service_date_start,
        service_date_end,
        lines,
        diagnoses,
        warnings,
    })
}

/// Parses an 835 stream: decodes the remittance header immediately, then
/// invokes `on_remittance_claim` for each completed CLP block.
pub fn parse_835(
    source: &mut SegmentSource,
    mut on_remittance_claim: impl FnMut(ParsedRemittanceClaim) -> Result<(), AppError>,
) -> Result<(Envelope, ParsedRemittanceHeader), AppError> {
    let envelope = envelope::detect(source)?;
    let mut partitioner = Partitioner::new(source, envelope.file_type);
    let mut block_count = 0usize;
    let mut header: Option<ParsedRemittanceHeader> = None;

    while let Some(block) = partitioner.next_block()? {
        if header.is_none() {
            header = Some(decode_remittance_header(&partitioner.take_header()));
        }
        let remit_claim = decode_remittance_claim_block(&block);
        on_remittance_claim(remit_claim)?;
        block_count += 1;
        if block_count % GC_HINT_INTERVAL == 0 {
            tracing::debug!(block_count, "835 parse checkpoint");
        }
    }

    let header = header.unwrap_or_else(|| decode_remittance_header(&partitioner.take_header()));
    Ok((envelope, header))
}

fn decode_remittance_header(header_segments: &[Segment]) -> ParsedRemittanceHeader {
    let bpr = header_segments.iter().find(|s| s.id == "BPR");
    let (payment_amount, payment_date, payment_method) = match bpr {
        Some(seg) => {
            let (data, _warnings) = extractors::extract_bpr(&seg.elements);
            (data.payment_amount, data.payment_date, data.payment_method)
        }
        None => (Decimal::ZERO, None, String::new()),
    };
    let trn = header_segments.iter().find(|s| s.id == "TRN");
    let remittance_control_number = trn
        .and_then(|s| s.element(1))
        .unwrap_or_default()
        .to_string();
    let payer_id_external = header_segments
        .iter()
        .filter(|s| s.id == "N1")
        .find(|s| s.element(0) == Some("PR"))
        .and_then(|s| s.element(3))
        .map(String::from);

    ParsedRemittanceHeader {
        payer_id_external,
        remittance_control_number,
        payment_amount,
        payment_date,
        payment_method,
    }
}

fn decode_remittance_claim_block(block: &Block) -> ParsedRemittanceClaim {
    let mut warnings = Vec::new();
    let header = block.header();
    let (clp, clp_warnings) = extractors::extract_clp(&header.elements);
    warnings.extend(clp_warnings);

    let mut adjustments = Vec::new();
    for seg in block.find_all("CAS") {
        let (list, cas_warnings) = extractors::extract_cas(&seg.elements);
        adjustments.extend(list);
        warnings.extend(cas_warnings);
    }

    let mut service_lines = Vec::new();
    for seg in block.find_all("SVC") {
        let (line, line_warnings) = decode_svc(seg);
        service_lines.push(line);
        warnings.extend(line_warnings);
    }

    let patient_control_number = block
        .find_all("NM1")
        .find(|s| s.element(0) == Some("QC"))
        .and_then(|s| s.element(8))
        .map(String::from);

    let service_date = block
        .find_all("DTM")
        .find(|s| s.element(0) == Some("232"))
        .and_then(|s| s.element(1))
        .and_then(extractors::parse_date_yyyymmdd);

    let adj_sum: Decimal = adjustments.iter().map(|a| a.amount).sum();
    if (clp.paid_amount + adj_sum - clp.charge_amount).abs() > Decimal::new(1, 2) {
        warnings.push(ParseWarning::new(
            "amount_mismatch",
            format!(
                "paid {} + adjustments {} != charge {}",
                clp.paid_amount, adj_sum, clp.charge_amount
            ),
        ));
    }

    ParsedRemittanceClaim {
        claim_control_number: clp.claim_control_number,
        claim_status_code: clp.claim_status_code,
        charge_amount: clp.charge_amount,
        paid_amount: clp.paid_amount,
        patient_responsibility: clp.patient_responsibility,
        adjustments,
        service_lines,
        patient_control_number,
        service_date,
        warnings,
    }
}

fn decode_svc(seg: &Segment) -> (ParsedRemittanceServiceLine, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let procedure_code = seg
        .element(0)
        .and_then(|composite| composite.split(':').nth(1))
        .map(String::from);
    let charge_amount = seg
        .element(1)
        .and_then(|s| extractors::parse_money(s).map_err(|w| warnings.push(w)).ok())
        .unwrap_or(Decimal::ZERO);
    let paid_amount = seg
        .element(2)
        .and_then(|s| extractors::parse_money(s).map_err(|w| warnings.push(w)).ok())
        .unwrap_or(Decimal::ZERO);
    (
        ParsedRemittanceServiceLine {
            procedure_code,
            paid_amount,
            charge_amount,
            adjustments: Vec::new(),
        },
        warnings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1_837() -> Vec<u8> {
        b"ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
          GS*HC*SENDER*RECEIVER*20230101*1253*1*X*005010X222A1~\
          ST*837*0001~\
          NM1*85*2*ACME CLINIC*****XX*1234567890~\
          NM1*PR*2*ACME PAYER*****PI*PAYER1~\
          CLM*CTRL1*1000.00~\
          HI*ABK:E119~\
          SV1*HC:99213*1000.00*UN*1~\
          SE*7*0001~"
            .to_vec()
    }

    #[test]
    fn parses_s1_simple_paid_claim_shape() {
        let mut src = SegmentSource::from_bytes(s1_837()).unwrap();
        let mut claims = Vec::new();
        let envelope = parse_837(&mut src, |c| {
            claims.push(c);
            Ok(())
        })
        .unwrap();

        assert_eq!(claims.len(), 1);
        let claim = &claims[0];
        assert_eq!(claim.claim_control_number, "CTRL1");
        assert_eq!(claim.total_charge_amount, "1000.00".parse::<Decimal>().unwrap());
        assert_eq!(claim.lines.len(), 1);
        assert!(claim.lines[0].procedure_code_valid);
        assert_eq!(claim.diagnoses.len(), 1);
        assert!(claim.diagnoses[0].principal);
        assert_eq!(claim.provider_npi.as_deref(), Some("1234567890"));
        assert_eq!(claim.payer_id_external.as_deref(), Some("PAYER1"));
        assert!(claim.warnings.is_empty());
        assert!(matches!(envelope.file_type, crate::models::FileType::Claim837));
    }

    #[test]
    fn s2_invalid_procedure_code_flagged() {
        let bad = String::from_utf8(s1_837()).unwrap().replace("99213", "9921X");
        let mut src = SegmentSource::from_bytes(bad.into_bytes()).unwrap();
        let mut claims = Vec::new();
        parse_837(&mut src, |c| {
            claims.push(c);
            Ok(())
        })
        .unwrap();
        assert!(!claims[0].lines[0].procedure_code_valid);
    }

    fn s3_835() -> Vec<u8> {
        b"ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
          GS*HP*SENDER*RECEIVER*20230101*1253*1*X*005010X221A1~\
          ST*835*0001~\
          BPR*C*1000.00*C*ACH*CTX*01*999999999*DA*123456*1512345678**01*999999998*DA*654321*20230115~\
          TRN*1*REMIT1*1512345678~\
          N1*PR*ACME PAYER*PI*PAYER1~\
          CLP*CTRL1*1*1000.00*1000.00*0.00~\
          SE*6*0001~"
            .to_vec()
    }

    #[test]
    fn parses_s3_matching_remittance_paid_in_full() {
        let mut src = SegmentSource::from_bytes(s3_835()).unwrap();
        let mut claims = Vec::new();
        let (_, header) = parse_835(&mut src, |c| {
            claims.push(c);
            Ok(())
        })
        .unwrap();

        assert_eq!(header.payment_amount, "1000.00".parse::<Decimal>().unwrap());
        assert_eq!(header.payer_id_external.as_deref(), Some("PAYER1"));
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].claim_control_number, "CTRL1");
        assert_eq!(claims[0].paid_amount, "1000.00".parse::<Decimal>().unwrap());
    }
}
