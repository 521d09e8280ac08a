//! End-to-end lifecycle test: raw 837/835 EDI bytes in, through parsing,
//! transformation, persistence, episode linking and risk scoring, to a
//! final `Episode`/`RiskScore` state. Covers the denial-then-partial-payment
//! sequence and a paid-in-full sequence across two independent claims so the
//! same remittance file exercises both code paths.

use claimguard::cache::Cache;
use claimguard::edi::parser::{parse_835, parse_837};
use claimguard::edi::segment::SegmentSource;
use claimguard::episodes::EpisodeLinker;
use claimguard::models::EpisodeStatus;
use claimguard::push::PushChannel;
use claimguard::risk::RiskScorer;
use claimguard::storage::Storage;
use claimguard::transform::Transformer;
use std::sync::Arc;

fn harness() -> (Arc<Storage>, Transformer, EpisodeLinker, RiskScorer) {
    let storage = Arc::new(Storage::in_memory().unwrap());
    let cache = Cache::new();
    let push = PushChannel::new(16);
    let transformer = Transformer::new(storage.clone(), cache.clone(), "test-salt".to_string());
    let linker = EpisodeLinker::new(storage.clone(), cache.clone());
    let scorer = RiskScorer::new(storage.clone(), cache.clone(), push);
    (storage, transformer, linker, scorer)
}

fn claim_837(control_number: &str, procedure: &str, charge: &str) -> Vec<u8> {
    format!(
        "ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
         GS*HC*SENDER*RECEIVER*20230101*1253*1*X*005010X222A1~\
         ST*837*0001~\
         NM1*85*2*ACME CLINIC*****XX*1234567890~\
         NM1*PR*2*ACME PAYER*****PI*PAYER1~\
         CLM*{control_number}*{charge}~\
         HI*ABK:E119~\
         SV1*HC:{procedure}*{charge}*UN*1~\
         SE*7*0001~"
    )
    .into_bytes()
}

fn denied_835(control_number: &str, charge: &str) -> Vec<u8> {
    format!(
        "ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
         GS*HP*SENDER*RECEIVER*20230101*1253*1*X*005010X221A1~\
         ST*835*0001~\
         BPR*C*0.00*C*ACH*CTX*01*999999999*DA*123456*1512345678**01*999999998*DA*654321*20230115~\
         TRN*1*REMIT1*1512345678~\
         N1*PR*ACME PAYER*PI*PAYER1~\
         CLP*{control_number}*4*{charge}*0.00*0.00~\
         CAS*CO*50*{charge}~\
         SE*7*0001~"
    )
    .into_bytes()
}

fn partial_835(control_number: &str, charge: &str, paid: &str, adjustment: &str) -> Vec<u8> {
    format!(
        "ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000002*0*P*:~\
         GS*HP*SENDER*RECEIVER*20230201*1253*2*X*005010X221A1~\
         ST*835*0001~\
         BPR*C*{paid}*C*ACH*CTX*01*999999999*DA*123456*1512345679**01*999999998*DA*654321*20230215~\
         TRN*1*REMIT2*1512345679~\
         N1*PR*ACME PAYER*PI*PAYER1~\
         CLP*{control_number}*1*{charge}*{paid}*0.00~\
         CAS*CO*45*{adjustment}~\
         SE*7*0001~"
    )
    .into_bytes()
}

fn paid_in_full_835(control_number: &str, charge: &str) -> Vec<u8> {
    format!(
        "ISA*00*          *00*          *ZZ*SENDER         *ZZ*RECEIVER       *230101*1253*^*00501*000000001*0*P*:~\
         GS*HP*SENDER*RECEIVER*20230101*1253*1*X*005010X221A1~\
         ST*835*0001~\
         BPR*C*{charge}*C*ACH*CTX*01*999999999*DA*123456*1512345678**01*999999998*DA*654321*20230115~\
         TRN*1*REMIT3*1512345678~\
         N1*PR*ACME PAYER*PI*PAYER1~\
         CLP*{control_number}*1*{charge}*{charge}*0.00~\
         SE*6*0001~"
    )
    .into_bytes()
}

/// Drives one raw 837 payload through parse -> transform -> persist,
/// returning the persisted claim's control number for lookup later.
fn ingest_claim(transformer: &Transformer, bytes: Vec<u8>) {
    let mut src = SegmentSource::from_bytes(bytes).unwrap();
    let mut parsed_claims = Vec::new();
    parse_837(&mut src, |c| {
        parsed_claims.push(c);
        Ok(())
    })
    .unwrap();

    let claims: Vec<_> = parsed_claims
        .into_iter()
        .map(|p| transformer.transform_claim(p).unwrap())
        .collect();
    transformer.persist_claims(&claims).unwrap();
}

/// Drives one raw 835 payload through parse -> transform -> persist -> link,
/// returning whatever episode resulted for its (single) remittance claim.
fn ingest_remittance(
    transformer: &Transformer,
    linker: &EpisodeLinker,
    bytes: Vec<u8>,
) -> Option<claimguard::models::Episode> {
    let mut src = SegmentSource::from_bytes(bytes).unwrap();
    let mut parsed_claims = Vec::new();
    let (_, header) = parse_835(&mut src, |c| {
        parsed_claims.push(c);
        Ok(())
    })
    .unwrap();

    let remittance = transformer
        .transform_remittance(header, parsed_claims)
        .unwrap();
    transformer.persist_remittance(&remittance).unwrap();

    let mut episode = None;
    for remit_claim in &remittance.claims {
        if let Some(e) = linker.link(remit_claim, remittance.id).unwrap() {
            episode = Some(e);
        }
    }
    episode
}

#[test]
fn denial_then_partial_payment_resolves_episode_status_and_totals() {
    let (storage, transformer, linker, scorer) = harness();

    ingest_claim(&transformer, claim_837("CTRL-DENY", "99213", "1000.00"));

    let denied = ingest_remittance(&transformer, &linker, denied_835("CTRL-DENY", "1000.00"))
        .expect("denial remittance should link to the claim it names");
    assert_eq!(denied.status, EpisodeStatus::Denied);
    assert_eq!(denied.denial_count, 1);
    assert_eq!(denied.total_paid, "0.00".parse().unwrap());

    let partial = ingest_remittance(
        &transformer,
        &linker,
        partial_835("CTRL-DENY", "1000.00", "600.00", "400.00"),
    )
    .expect("second remittance should re-link to the same episode");
    assert_eq!(partial.id, denied.id, "relinking must update, not duplicate, the episode");
    assert_eq!(partial.status, EpisodeStatus::Partial);
    assert_eq!(partial.total_paid, "600.00".parse().unwrap());
    assert_eq!(partial.total_adjustment, "400.00".parse().unwrap());

    let claim = storage
        .get_claim_by_control_number("CTRL-DENY")
        .unwrap()
        .expect("claim persisted during ingest");
    let score = scorer.score(&claim).unwrap();
    assert!(score.overall_score <= 100);
}

#[test]
fn paid_in_full_remittance_creates_paid_episode_on_first_link() {
    let (_storage, transformer, linker, _scorer) = harness();

    ingest_claim(&transformer, claim_837("CTRL-PAID", "99214", "500.00"));

    let episode = ingest_remittance(&transformer, &linker, paid_in_full_835("CTRL-PAID", "500.00"))
        .expect("paid remittance should link to the claim it names");
    assert_eq!(episode.status, EpisodeStatus::Paid);
    assert_eq!(episode.total_paid, "500.00".parse().unwrap());
    assert_eq!(episode.denial_count, 0);
}

#[test]
fn unmatched_remittance_control_number_does_not_link() {
    let (_storage, transformer, linker, _scorer) = harness();

    ingest_claim(&transformer, claim_837("CTRL-KNOWN", "99213", "250.00"));

    let episode = ingest_remittance(&transformer, &linker, paid_in_full_835("CTRL-UNKNOWN", "250.00"));
    assert!(episode.is_none());
}
