//! `pestid` - identify crop pests from photographs.
//!
//! ## Commands
//!
//! - `detect`: classify an image, persist the detection and print the result
//! - `show`: re-render a stored detection in another locale
//! - `stats`: per-species counters and recent detections
//! - `library`: knowledge records for every known species

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;

use pestid_shared::telemetry::init_tracing;
use pestid_shared::{
    DetectionId, DetectionReader, ErrorKind, ErrorReport, PipelineConfig, PipelineError,
};

#[derive(Parser)]
#[command(name = "pestid")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pest identification from crop photographs", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "PESTID_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify an image and record the detection
    Detect {
        /// Image file (JPEG, PNG or WebP)
        image: PathBuf,

        /// Response locale: english, bangla or hindi
        #[arg(short, long, default_value = "english")]
        locale: String,
    },

    /// Show a stored detection
    Show {
        /// Detection id printed by `detect`
        id: String,

        #[arg(short, long, default_value = "english")]
        locale: String,
    },

    /// Per-species counters and recent detections
    Stats {
        /// Number of recent detections to include
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },

    /// Knowledge records for every known species
    Library {
        #[arg(short, long, default_value = "english")]
        locale: String,
    },
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "ml")]
async fn detect(config: &PipelineConfig, image: &Path, locale: &str) -> Result<()> {
    let bytes = std::fs::read(image)
        .with_context(|| format!("failed to read image {}", image.display()))?;
    let pipeline = pestid_shared::Pipeline::from_config(config)?;
    let response = pipeline.detect(std::sync::Arc::from(bytes), locale).await?;
    print_json(&response)
}

#[cfg(not(feature = "ml"))]
async fn detect(_config: &PipelineConfig, _image: &Path, _locale: &str) -> Result<()> {
    Err(PipelineError::ModelUnavailable("built without the `ml` feature".into()).into())
}

async fn show(config: &PipelineConfig, id: String, locale: &str) -> Result<()> {
    let reader = DetectionReader::open(config)?;
    let view = reader.view(&DetectionId(id), locale).await?;
    print_json(&view)
}

async fn stats(config: &PipelineConfig, recent: usize) -> Result<()> {
    let reader = DetectionReader::open(config)?;
    print_json(&reader.stats(recent).await?)
}

fn library(config: &PipelineConfig, locale: &str) -> Result<()> {
    let reader = DetectionReader::open(config)?;
    print_json(&reader.library(locale))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = "debug".into();
    }
    config.logging.json |= cli.json_logs;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Detect { image, locale } => detect(&config, &image, &locale).await,
        Commands::Show { id, locale } => show(&config, id, &locale).await,
        Commands::Stats { recent } => stats(&config, recent).await,
        Commands::Library { locale } => library(&config, &locale),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(pipeline_error) = err.downcast_ref::<PipelineError>() {
                let report = ErrorReport::from(pipeline_error);
                if let Ok(body) = serde_json::to_string_pretty(&serde_json::json!({ "error": report })) {
                    println!("{body}");
                }
                error!(code = %report.code, "{err:#}");
                if pipeline_error.kind() == ErrorKind::ModelUnavailable {
                    return ExitCode::from(3);
                }
                return ExitCode::from(2);
            }
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
