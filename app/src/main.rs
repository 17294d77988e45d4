//! Linch Assist command-line front end.

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::{load_config, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(
    name = "linch-assist",
    version,
    about = "Redact screenshots, triage them and hand them to the support backend"
)]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Preprocess, OCR and detect PII on images; print regions as JSON
    Scan(ScanArgs),
    /// Score candidates against features and print the disposition as JSON
    Triage(TriageArgs),
    /// Drive a full chat session against the local loopback backend
    Chat(ChatArgs),
    /// Show or write the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Images to scan
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// Write masked copies into this directory
    #[arg(long)]
    pub mask_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TriageArgs {
    /// Model configuration JSON (overrides `modelPath` in the config file)
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Features as inline JSON, e.g. '{"ocr_confidence":0.9,...}'
    #[arg(long)]
    pub features: String,
    /// JSON file with an array of candidates
    #[arg(long)]
    pub candidates: PathBuf,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Message text
    #[arg(long)]
    pub text: Option<String>,
    /// Attach an image (repeatable)
    #[arg(long = "image")]
    pub images: Vec<PathBuf>,
    /// Loopback reply: AUTO_RESOLVE, ASK_CLARIFICATION, ESCALATE, plain or silent
    #[arg(long, default_value = "AUTO_RESOLVE")]
    pub reply: String,
    /// Loopback reply delay in milliseconds
    #[arg(long, default_value_t = 300)]
    pub reply_delay_ms: u64,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Write the effective configuration back to the config path
    #[arg(long, action = ArgAction::SetTrue)]
    pub write: bool,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!("{err:#}");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Scan(args) => commands::scan(&config, args).await,
        Commands::Triage(args) => commands::triage(&config, args),
        Commands::Chat(args) => commands::chat(&config, args).await,
        Commands::Config(args) => commands::config(&cli.config, &config, args),
    }
}
