//! `gcp-provider-config`
//!
//! Loads a provider block, resolves it against the process environment and
//! prints the resolved configuration with secrets redacted.

/// Version injected at compile time via GCP_PROVIDER_VERSION env var (set by
/// CI/CD), or the crate version for local builds.
pub const VERSION: &str = match option_env!("GCP_PROVIDER_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gcp_provider_core::config::{Environment, ProviderBlock, ResolvedConfig};
use gcp_provider_core::gcp::endpoints::EnvMtlsDetector;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Resolve a GCP provider configuration
#[derive(Parser, Debug)]
#[command(name = "gcp-provider-config", version = VERSION, about, long_about = None)]
struct Args {
    /// Provider block to resolve (JSON, or YAML for any other extension)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("gcp-provider-config {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("gcp-provider").join("gcp-provider.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".gcp-provider").join("gcp-provider.log");
    }
    PathBuf::from("gcp-provider.log")
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = setup_logging(args.log_level)?;

    let block = ProviderBlock::from_path(&args.config)
        .with_context(|| format!("Failed to load provider block from {}", args.config.display()))?;

    let env = Environment::from_process();
    let detector = EnvMtlsDetector::new(&env);
    let config = ResolvedConfig::resolve(&block, &env, &detector).context("Failed to resolve provider configuration")?;

    let report = serde_json::to_string_pretty(&config.report()).context("Failed to encode resolved configuration")?;
    println!("{}", report);
    Ok(())
}
