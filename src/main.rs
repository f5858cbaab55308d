//! # hst-sentinel
//!
//! Command-line driver for the streaming detector.

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hst_sentinel::config::DEFAULT_FEATURES;
use hst_sentinel::models::iforest::{baseline, IsolationForestConfig};
use hst_sentinel::observation::from_json;
use hst_sentinel::replay::{read_records, sort_chronologically, stream_csv, ScoredRow};
use hst_sentinel::{Pipeline, PipelineConfig, Result};

#[derive(Parser)]
#[command(name = "hst-sentinel")]
#[command(about = "Streaming anomaly detection for equipment telemetry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a telemetry CSV row by row, learning as it goes
    Stream {
        /// Input CSV with timestamp and machine_id columns
        #[arg(short, long)]
        input: PathBuf,

        /// Output CSV of scores and flags
        #[arg(short, long)]
        output: PathBuf,

        /// Pipeline configuration (JSON); defaults to the telemetry schema
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Save the final pipeline snapshot here
        #[arg(short, long)]
        model: Option<PathBuf>,
    },

    /// Warm a pipeline on historical data and save it
    Train {
        #[arg(short, long)]
        input: PathBuf,

        /// Snapshot file to write
        #[arg(short, long)]
        model: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Score one JSON event against a saved pipeline
    Predict {
        #[arg(short, long)]
        model: PathBuf,

        /// Event as a JSON object
        #[arg(short, long)]
        event: String,

        /// Learn from the event and save the snapshot back
        #[arg(long)]
        learn: bool,
    },

    /// Batch isolation forest comparison on the same data
    Baseline {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Stream {
            input,
            output,
            config,
            model,
        } => {
            let mut pipeline = Pipeline::new(PipelineConfig::load_or_telemetry(config.as_deref())?)?;
            let reader = BufReader::new(File::open(&input)?);
            let writer = BufWriter::new(File::create(&output)?);
            let summary = stream_csv(reader, writer, &mut pipeline)?;
            println!("{}", serde_json::to_string(&summary)?);
            if let Some(path) = model {
                pipeline.save(&path)?;
            }
        }
        Commands::Train {
            input,
            model,
            config,
        } => {
            let mut pipeline = Pipeline::new(PipelineConfig::load_or_telemetry(config.as_deref())?)?;
            let schema = pipeline.config().detector.features.clone();
            let (records, rejected) = read_records(BufReader::new(File::open(&input)?), schema)?;
            let mut summary = pipeline.train(records.into_iter().map(|r| r.features));
            summary.rejected += rejected;
            pipeline.save(&model)?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Predict {
            model,
            event,
            learn,
        } => {
            let mut pipeline = Pipeline::load_with_stored_config(&model)?;
            let value: serde_json::Value = serde_json::from_str(&event)?;
            let x = from_json(&value, pipeline.config().detector.features.as_deref())?;
            let verdict = pipeline.predict_and_learn(&x, learn)?;
            if learn {
                pipeline.save(&model)?;
            }
            println!("{}", serde_json::to_string(&verdict)?);
        }
        Commands::Baseline { input, output } => {
            let features: Vec<String> = DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect();
            let (mut records, _) =
                read_records(BufReader::new(File::open(&input)?), Some(features.clone()))?;
            sort_chronologically(&mut records);
            let rows: Vec<_> = records.iter().map(|r| r.features.clone()).collect();
            let scored = baseline(&rows, &features, &IsolationForestConfig::default())?;

            let mut writer = csv::Writer::from_writer(BufWriter::new(File::create(&output)?));
            for row in &scored {
                let record = &records[row.index];
                writer.serialize(ScoredRow {
                    timestamp: record.timestamp.clone(),
                    machine_id: record.machine_id.clone(),
                    score: row.score,
                    is_anomaly: u8::from(row.is_anomaly),
                })?;
            }
            writer.flush()?;
            info!(rows = scored.len(), path = %output.display(), "Baseline written");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}
