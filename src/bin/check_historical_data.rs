//! Verifies that claim/remittance history exists for a date range before a
//! training or evaluation run is kicked off against it.

use chrono::NaiveDate;
use clap::Parser;
use claimguard::config::AppConfig;
use claimguard::storage::{ClaimFilter, Storage};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "check_historical_data")]
#[command(about = "Verify claim history coverage for a date range")]
struct Cli {
    #[arg(long)]
    start_date: NaiveDate,

    #[arg(long)]
    end_date: NaiveDate,

    #[arg(long)]
    output: Option<PathBuf>,
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

    let (_, total) = match storage.list_claims(&filter, 0, 1) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: failed to query claims: {e}");
            return ExitCode::FAILURE;
        }
    };

    if total == 0 {
        eprintln!(
            "error: no claims found between {} and {}",
            cli.start_date, cli.end_date
        );
        return ExitCode::FAILURE;
    }

    let report = serde_json::json!({
        "start_date": cli.start_date,
        "end_date": cli.end_date,
        "claim_count": total,
    });

    match cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, report.to_string()) {
                eprintln!("error: failed to write output file: {e}");
                return ExitCode::FAILURE;
            }
        }
        None => println!("{report}"),
    }

    ExitCode::SUCCESS
}
