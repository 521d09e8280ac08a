//! Exports claim + risk-score feature rows for a date range to a JSON lines
//! file, the input format the `train_model`/`evaluate_model`/`tune_model`
//! utilities expect.

use chrono::NaiveDate;
use clap::Parser;
use claimguard::config::AppConfig;
use claimguard::storage::{ClaimFilter, Storage};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "prepare_data")]
#[command(about = "Export claim feature rows for a date range")]
struct Cli {
    #[arg(long)]
    start_date: NaiveDate,

    #[arg(long)]
    end_date: NaiveDate,

    #[arg(long)]
    output: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.start_date > cli.end_date {
        eprintln!("error: --start-date must not be after --end-date");
        return ExitCode::FAILURE;
    }

    let config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let storage = match Storage::new(&config.database_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to open storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = ClaimFilter {
        payer_id: None,
        status: None,
        service_date_from: Some(cli.start_date),
        service_date_to: Some(cli.end_date),
    };

    let mut out = match std::fs::File::create(&cli.output) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: failed to create output file: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut skip = 0usize;
    const PAGE_SIZE: usize = 500;
    let mut written = 0usize;

    loop {
        let (claims, total) = match storage.list_claims(&filter, skip, PAGE_SIZE) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("error: failed to query claims: {e}");
                return ExitCode::FAILURE;
            }
        };
        if claims.is_empty() {
            break;
        }

        for claim in &claims {
            let risk_score = storage.latest_risk_score(claim.id).unwrap_or(None);
            let row = serde_json::json!({
                "claim": claim,
                "risk_score": risk_score,
            });
            if let Err(e) = writeln!(out, "{row}") {
                eprintln!("error: failed to write row: {e}");
                return ExitCode::FAILURE;
            }
            written += 1;
        }

        skip += claims.len();
        if skip >= total {
            break;
        }
    }

    eprintln!("wrote {written} rows to {}", cli.output.display());
    ExitCode::SUCCESS
}
