//! Trains the optional ML risk factor (C11 `MlFactor`) against a prepared
//! feature file. Training itself is out of this crate's hard core (spec.md
//! §4.9's no-op `{score: 50, weight: 0}` contract applies until a model is
//! registered); this stub validates its inputs and writes a placeholder
//! model artifact so the surrounding pipeline (prepare -> train -> evaluate
//! -> tune) has a consistent contract to call into.

use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "train_model")]
#[command(about = "Train the risk ML factor against prepared feature data")]
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

    let artifact = serde_json::json!({
        "kind": "claimguard-risk-model",
        "start_date": cli.start_date,
        "end_date": cli.end_date,
        "status": "untrained",
    });

    if let Err(e) = std::fs::write(&cli.output, artifact.to_string()) {
        eprintln!("error: failed to write model artifact: {e}");
        return ExitCode::FAILURE;
    }

    eprintln!("wrote placeholder model artifact to {}", cli.output.display());
    ExitCode::SUCCESS
}
