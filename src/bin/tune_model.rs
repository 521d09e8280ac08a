//! Hyperparameter sweep over a prepared feature range. Out of this crate's
//! hard core (see `train_model`); validates its inputs and reports a
//! placeholder sweep result.

use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "tune_model")]
#[command(about = "Sweep risk-model hyperparameters over a date range")]
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

    let result = serde_json::json!({
        "start_date": cli.start_date,
        "end_date": cli.end_date,
        "best_params": serde_json::Value::Null,
        "status": "no model registered",
    });

    if let Err(e) = std::fs::write(&cli.output, result.to_string()) {
        eprintln!("error: failed to write tuning result: {e}");
        return ExitCode::FAILURE;
    }

    eprintln!("wrote placeholder tuning result to {}", cli.output.display());
    ExitCode::SUCCESS
}
