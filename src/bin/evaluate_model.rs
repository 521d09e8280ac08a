//! Evaluates a trained risk-model artifact against a held-out date range.
//! Out of this crate's hard core (see `train_model`); validates its inputs
//! and reports a placeholder evaluation summary.

use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "evaluate_model")]
#[command(about = "Evaluate a trained risk model against held-out claims")]
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

    let report = serde_json::json!({
        "start_date": cli.start_date,
        "end_date": cli.end_date,
        "status": "no model registered",
    });

    match cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, report.to_string()) {
                eprintln!("error: failed to write evaluation report: {e}");
                return ExitCode::FAILURE;
            }
        }
        None => println!("{report}"),
    }

    ExitCode::SUCCESS
}
