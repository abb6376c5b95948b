use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use paperfeed_sync::HarvestConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "paperfeed")]
#[command(about = "Harvest recent arXiv listings into a deduplicated JSON store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every configured subject and merge new records into the store.
    Sync,
    /// Rebuild paginated per-subject summaries from the current store.
    Pages,
}

/// Flags override the PAPERFEED_* environment, which overrides built-in defaults.
#[derive(Debug, Args)]
struct Overrides {
    /// Store file (JSON object keyed by arXiv id).
    #[arg(long, global = true)]
    output: Option<PathBuf>,
    /// File with one subject category per line.
    #[arg(long, global = true)]
    subjects_file: Option<PathBuf>,
    /// Comma-separated subjects; takes precedence over --subjects-file.
    #[arg(long, global = true)]
    subjects: Option<String>,
    #[arg(long, global = true)]
    page_size: Option<usize>,
    #[arg(long, global = true)]
    max_pages: Option<usize>,
    /// Minimum spacing between requests to the listing API.
    #[arg(long, global = true)]
    request_interval_ms: Option<u64>,
    /// Subjects fetched at the same time.
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    /// Abandon unfinished subjects after this many seconds; results so far are saved.
    #[arg(long, global = true)]
    run_timeout_secs: Option<u64>,
    /// Keep every raw listing response under this directory.
    #[arg(long, global = true)]
    archive_dir: Option<PathBuf>,
    /// Also write subjects/<subject>/page_<n>.json next to the store.
    #[arg(long, global = true)]
    subject_pages: bool,
}

impl Overrides {
    fn apply(self, mut config: HarvestConfig) -> HarvestConfig {
        if let Some(output) = self.output {
            config.output_path = output;
        }
        if let Some(file) = self.subjects_file {
            config.subjects_file = file;
        }
        if self.subjects.is_some() {
            config.inline_subjects = self.subjects;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(max_pages) = self.max_pages {
            config.max_pages = max_pages;
        }
        if let Some(ms) = self.request_interval_ms {
            config.request_interval = Duration::from_millis(ms);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(secs) = self.run_timeout_secs {
            config.run_timeout = Some(Duration::from_secs(secs));
        }
        if self.archive_dir.is_some() {
            config.archive_dir = self.archive_dir;
        }
        config.subject_pages |= self.subject_pages;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paperfeed=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.overrides.apply(HarvestConfig::from_env());

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = paperfeed_sync::run_harvest_once(config).await?;
            println!(
                "sync complete: run_id={} subjects={} completed={} abandoned={} unfinished={} pages={} added={} skipped={} dropped={} total={} store={}",
                summary.run_id,
                summary.subjects_total,
                summary.subjects_completed,
                summary.subjects_abandoned,
                summary.subjects_unfinished,
                summary.pages_fetched,
                summary.records_added,
                summary.records_skipped,
                summary.records_dropped,
                summary.collection_size,
                summary.store_path
            );
            if let Some(err) = &summary.subject_pages_error {
                eprintln!("subject pages not written: {err}");
            }
        }
        Commands::Pages => {
            let written = paperfeed_sync::export_pages_from_store(&config.output_path).await?;
            info!(written, "subject pages exported");
            println!("pages complete: files={written} store={}", config.output_path.display());
        }
    }

    Ok(())
}
