use anyhow::{Context, Result};
use card_export_cache::DiskCacheStore;
use card_export_core::{
    ExportConfig, ExportEvent, ExportOrchestrator, ExportOutcome, ExportRequest, SummaryStatus,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "card-export")]
#[command(about = "Compose sequence-card images into printable pages")]
pub struct Cli {
    /// Log debug output (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export source images as numbered page PNGs and print a JSON summary.
    Export {
        #[arg(value_name = "SOURCE", required = true)]
        sources: Vec<PathBuf>,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long)]
        sequence_length: Option<u32>,
        #[command(flatten)]
        settings: Settings,
    },
    /// Print the effective configuration as JSON.
    Config {
        #[command(flatten)]
        settings: Settings,
        /// Save the configuration to this file instead of printing it.
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Inspect or empty the disk cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// Print disk cache statistics as JSON.
    Stats {
        #[command(flatten)]
        settings: Settings,
    },
    /// Delete every cached image.
    Clear {
        #[command(flatten)]
        settings: Settings,
    },
}

#[derive(Debug, clap::Args)]
struct Settings {
    /// JSON configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,
    #[arg(long)]
    no_disk_cache: bool,
}

impl Settings {
    fn load(&self) -> Result<ExportConfig> {
        let config = match &self.config {
            Some(path) => ExportConfig::from_file(path)?,
            None => ExportConfig::default(),
        };
        let mut config = config.with_env_overrides()?;
        if let Some(dir) = &self.cache_dir {
            config.cache = config.cache.with_disk_dir(dir);
        }
        if self.no_disk_cache {
            config.cache = config.cache.with_disk_enabled(false);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct ExportOutput {
    outcome: &'static str,
    status: &'static str,
    output_dir: String,
    pages: Vec<String>,
    pages_written: u32,
    pages_skipped: u32,
    total_items: usize,
    substitutions: Vec<SubstitutionOutput>,
}

#[derive(Debug, Serialize)]
struct SubstitutionOutput {
    page: u32,
    cell: String,
    source: String,
    reason: String,
}

#[derive(Debug, Serialize)]
struct CacheStatsOutput {
    cache_dir: String,
    entry_count: usize,
    total_bytes: u64,
    max_bytes: u64,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Export { sources, output, sequence_length, settings } => {
            run_export(sources, &output, sequence_length, &settings)
        }
        Commands::Config { settings, write } => run_config(&settings, write.as_deref()),
        Commands::Cache { action: CacheAction::Stats { settings } } => run_cache_stats(&settings),
        Commands::Cache { action: CacheAction::Clear { settings } } => run_cache_clear(&settings),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A second init (e.g. repeated `run` calls in one process) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_export(
    sources: Vec<PathBuf>,
    output: &Path,
    sequence_length: Option<u32>,
    settings: &Settings,
) -> Result<()> {
    let config = settings.load()?;
    let orchestrator =
        ExportOrchestrator::new(config).context("failed to set up the export engine")?;

    let mut request = ExportRequest::new(sources, output);
    request.sequence_length = sequence_length;

    let handle = orchestrator.start(request)?;
    for event in handle.events() {
        if let ExportEvent::Progress { done, total, message } = event {
            tracing::info!(done, total, "{message}");
        }
    }
    let outcome = handle.wait().context("export failed")?;

    let payload = export_output(output, &outcome);
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn export_output(output_dir: &Path, outcome: &ExportOutcome) -> ExportOutput {
    let summary = outcome.summary();
    let status = match summary.status() {
        SummaryStatus::FullySucceeded => "fully_succeeded",
        SummaryStatus::SucceededWithSubstitutions(_) => "succeeded_with_substitutions",
        SummaryStatus::SucceededWithSkippedPages(_) => "succeeded_with_skipped_pages",
    };

    ExportOutput {
        outcome: if outcome.is_cancelled() { "cancelled" } else { "completed" },
        status,
        output_dir: output_dir.display().to_string(),
        pages: summary
            .output_files
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect(),
        pages_written: summary.pages_written,
        pages_skipped: summary.pages_skipped,
        total_items: summary.total_items,
        substitutions: summary
            .substitutions
            .iter()
            .map(|s| SubstitutionOutput {
                page: s.page_index + 1,
                cell: s.position.to_string(),
                source: s.source.display().to_string(),
                reason: s.reason.clone(),
            })
            .collect(),
    }
}

fn run_config(settings: &Settings, write: Option<&Path>) -> Result<()> {
    let config = settings.load()?;
    match write {
        Some(path) => {
            config.save_to_file(path)?;
            println!("{}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

fn open_disk_cache(settings: &Settings) -> Result<DiskCacheStore> {
    let config = settings.load()?;
    if !config.cache.disk_enabled {
        anyhow::bail!("the disk cache is disabled");
    }
    DiskCacheStore::open(&config.cache.disk_cache_dir, config.cache.disk_policy()).with_context(
        || format!("failed to open disk cache at {}", config.cache.disk_cache_dir.display()),
    )
}

fn run_cache_stats(settings: &Settings) -> Result<()> {
    let store = open_disk_cache(settings)?;
    let stats = store.stats();

    let payload = CacheStatsOutput {
        cache_dir: store.cache_dir().display().to_string(),
        entry_count: stats.entry_count,
        total_bytes: stats.total_bytes,
        max_bytes: store.policy().max_bytes,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_cache_clear(settings: &Settings) -> Result<()> {
    let store = open_disk_cache(settings)?;
    let removed = store.stats().entry_count;
    store.clear().context("failed to clear disk cache")?;

    println!("removed {removed} cached image(s) from {}", store.cache_dir().display());
    Ok(())
}
