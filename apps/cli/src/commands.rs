//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use contentmigrator_core::{
    Collaborators, EntryOutcome, MigrationOrchestrator, MigrationReport, ProgressReporter,
    RunOptions,
};
use contentmigrator_providers::{ExtractiveProvider, Provider};
use contentmigrator_shared::{
    AiProvider, AppConfig, Destination, MigrationSettings, ProviderKind, config_file_path,
    init_config, load_config, load_config_from, validate_api_key,
};
use contentmigrator_storage::{SqlDestination, StateStore};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ContentMigrator: move content into a structured destination, enriched.
#[derive(Parser)]
#[command(
    name = "contentmigrator",
    version,
    about = "Resumable, rate-limited migration of content items into a destination database.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.contentmigrator/contentmigrator.toml).
    #[arg(long, global = true, env = "CONTENTMIGRATOR_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Flags of the default migration command.
#[derive(Args, Debug, Default)]
pub(crate) struct RunArgs {
    /// Report ledger and destination consistency without changing anything.
    #[arg(long)]
    pub verify_only: bool,

    /// Run every stage but record mutating calls instead of performing them.
    #[arg(long)]
    pub dry_run: bool,

    /// Process at most this many entries.
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Process only this entry.
    #[arg(long, value_name = "ID")]
    pub single_entry: Option<String>,

    /// Do not generate or upload images.
    #[arg(long)]
    pub skip_images: bool,

    /// Do not generate summaries, titles or keywords.
    #[arg(long)]
    pub skip_summaries: bool,

    /// Re-migrate entries that already completed or failed.
    #[arg(long)]
    pub force_update: bool,

    /// Restart in-progress entries from their first stage.
    #[arg(long)]
    pub reset_pending: bool,

    /// Entries per batch window.
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Pause between batch windows, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub delay: Option<u64>,

    /// Pipelines running at once within a window.
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Ledger file (defaults to `migration.state_file` from the config).
    #[arg(long, value_name = "PATH")]
    pub state_file: Option<PathBuf>,

    /// Also write the run report as JSON to this file.
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "contentmigrator=info",
        1 => "contentmigrator=debug",
        _ => "contentmigrator=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        None => cmd_migrate(config_path, cli.run).await,
        Some(Command::Config { action }) => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Fold CLI overrides into the configured settings.
fn apply_overrides(config: &AppConfig, args: &RunArgs) -> MigrationSettings {
    let mut settings = MigrationSettings::from(config);
    if let Some(batch_size) = args.batch_size {
        settings.batch_size = batch_size;
    }
    if let Some(concurrency) = args.concurrency {
        settings.concurrency = concurrency;
    }
    if let Some(delay) = args.delay {
        settings.delay = std::time::Duration::from_millis(delay);
    }
    if args.skip_images {
        settings.images_enabled = false;
    }
    if args.skip_summaries {
        settings.summaries_enabled = false;
    }
    if settings.images_enabled && config.ai.provider == ProviderKind::Extractive {
        warn!("the extractive provider cannot generate images; image generation disabled");
        settings.images_enabled = false;
    }
    settings
}

fn run_options(args: &RunArgs) -> RunOptions {
    RunOptions {
        verify_only: args.verify_only,
        dry_run: args.dry_run,
        single_entry: args.single_entry.clone(),
        force_update: args.force_update,
        reset_pending: args.reset_pending,
        limit: args.limit,
    }
}

async fn cmd_migrate(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let config = resolve_config(config_path)?;
    let settings = apply_overrides(&config, &args);
    settings.validate()?;
    let options = run_options(&args);
    options.validate()?;

    // ---- Collaborators ----
    let state_path = args
        .state_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.migration.state_file));
    let store = Arc::new(StateStore::open_file(&state_path)?);

    let destination_path = PathBuf::from(&config.destination.path);
    let destination: Arc<dyn Destination> =
        Arc::new(open_destination(&destination_path, &options).await?);

    let ai: Arc<dyn AiProvider> = if options.verify_only {
        Arc::new(Provider::Extractive(ExtractiveProvider))
    } else {
        validate_api_key(&config)?;
        Arc::new(Provider::from_config(&config.ai)?)
    };

    let collaborators = Collaborators {
        source: contentmigrator_providers::content::from_config(&config.source)?,
        ai,
        objects: contentmigrator_providers::object_store::from_config(&config.object_store)?,
        destination,
    };

    info!(
        mode = %options.mode(),
        ledger = %state_path.display(),
        destination = %destination_path.display(),
        batch_size = settings.batch_size,
        concurrency = settings.concurrency,
        images = settings.images_enabled,
        summaries = settings.summaries_enabled,
        "starting migration"
    );

    // ---- Cancellation ----
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight stages");
            on_signal.cancel();
        }
    });

    let orchestrator = MigrationOrchestrator::new(store, collaborators, settings);
    let reporter = CliProgress::new();
    let report = orchestrator.run(&options, &cancel, &reporter).await?;

    print_report(&report);
    if let Some(path) = &args.report {
        write_report(&report, path)?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn write_report(report: &MigrationReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

/// Open the destination database for the run mode.
///
/// Only a live run may create the file or apply the schema. A dry run reads
/// an existing database, or plans against an empty in-memory one.
async fn open_destination(path: &Path, options: &RunOptions) -> Result<SqlDestination> {
    let exists = path.exists();
    if options.verify_only && !exists {
        return Err(eyre!("destination database not found at '{}'", path.display()));
    }
    let destination = if options.verify_only || (options.dry_run && exists) {
        SqlDestination::open_readonly(path).await?
    } else if options.dry_run {
        info!(path = %path.display(), "no destination yet; planning against an empty one");
        SqlDestination::open_in_memory().await?
    } else {
        SqlDestination::open(path).await?
    };
    Ok(destination)
}

fn print_report(report: &MigrationReport) {
    println!();
    println!("  Migration {} ({})", report.run_id, report.mode);

    if let Some(verification) = &report.verification {
        for (status, count) in &verification.status_counts {
            println!("  {status:<13}{count}");
        }
        println!(
            "  Missing in destination: {}",
            verification.missing_in_destination.len()
        );
        for entry_id in &verification.missing_in_destination {
            println!("    - {entry_id}");
        }
        println!("  Not yet registered:     {}", verification.unregistered.len());
        if let Some(error) = &verification.source_error {
            println!("  Source listing failed:  {error}");
        }
        println!(
            "  Consistent:             {}",
            if verification.is_consistent() { "yes" } else { "no" }
        );
    } else {
        println!("  Processed:   {}", report.processed());
        println!("  Completed:   {}", report.completed);
        println!("  Failed:      {}", report.failed);
        println!("  Skipped:     {}", report.skipped);
        println!("  Interrupted: {}", report.interrupted);
        println!("  Windows:     {}", report.windows);

        if !report.failures.is_empty() {
            println!();
            println!("  Failures:");
            for failure in &report.failures {
                let stage = failure.stage.map(|s| s.to_string()).unwrap_or_default();
                println!("    - {} [{stage}] {}", failure.entry_id, failure.error);
            }
        }

        if !report.planned_actions.is_empty() {
            println!();
            println!("  Planned actions:");
            for action in &report.planned_actions {
                println!("    - {action}");
            }
        }

        if report.interrupted > 0 {
            println!();
            println!("  Run again to resume interrupted entries.");
        }
    }

    println!("  Time:        {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using indicatif spinners.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn window_started(&self, index: usize, total: usize, entries: usize) {
        self.spinner
            .set_message(format!("Window {index}/{total} ({entries} entries)"));
    }

    fn entry_finished(&self, outcome: &EntryOutcome, current: usize, total: usize) {
        let verdict = match outcome {
            EntryOutcome::Completed { .. } => "done",
            EntryOutcome::Failed { .. } => "failed",
            EntryOutcome::Skipped { .. } => "skipped",
            EntryOutcome::Interrupted { .. } => "interrupted",
        };
        self.spinner.set_message(format!(
            "[{current}/{total}] {} {verdict}",
            outcome.entry_id()
        ));
    }

    fn done(&self, _report: &MigrationReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = match path {
        None => init_config()?,
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, toml::to_string_pretty(&AppConfig::default())?)?;
            path.to_path_buf()
        }
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let source = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    let config = resolve_config(path)?;
    println!("# {}", source.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
