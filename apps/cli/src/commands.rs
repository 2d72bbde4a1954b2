//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use moood_core::{ExecutionObserver, ExecutionState, Pipeline};
use moood_shared::{
    AppConfig, EntryId, WorkerTarget, init_config, init_config_at, load_config, load_config_from,
};
use moood_storage::Storage;
use moood_workers::WorkerRegistry;

use crate::server;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Moood: fan journal entries out to analysis workers and store the merged result.
#[derive(Parser)]
#[command(
    name = "moood",
    version,
    about = "Ingest entries, run them through analysis workers, and persist the merged metadata.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.moood/moood.toml).
    #[arg(long, global = true, env = "MOOOD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file, overriding `storage.database_path`.
    #[arg(long, global = true, env = "MOOOD_DB")]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the ingestion API and the relay in one process.
    Serve {
        /// Socket address to bind (overrides `api.bind`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Store a new entry.
    Ingest {
        /// Entry text.
        text: String,
    },

    /// Change-feed relay operations.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },

    /// Worker registry operations.
    Workers {
        #[command(subcommand)]
        action: WorkersAction,
    },

    /// Inspect stored entries.
    Entries {
        #[command(subcommand)]
        action: EntriesAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Relay subcommands.
#[derive(Subcommand)]
pub(crate) enum RelayAction {
    /// Poll the change feed until Ctrl-C.
    Run,
    /// Process everything pending, then exit.
    Drain,
}

/// Worker subcommands.
#[derive(Subcommand)]
pub(crate) enum WorkersAction {
    /// List registered workers in fan-out order.
    List,
}

/// Entry subcommands.
#[derive(Subcommand)]
pub(crate) enum EntriesAction {
    /// Print an entry and its metadata as JSON.
    Show {
        /// Entry id.
        id: String,
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
        0 => "moood=info",
        1 => "moood=debug",
        _ => "moood=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let Cli {
        config: config_path,
        db,
        command,
        ..
    } = cli;
    let resolve = || resolve_config(config_path.as_deref(), db.as_deref());

    match command {
        Command::Serve { bind } => cmd_serve(&resolve()?, bind.as_deref()).await,
        Command::Ingest { text } => cmd_ingest(&resolve()?, &text).await,
        Command::Relay { action } => match action {
            RelayAction::Run => cmd_relay_run(&resolve()?).await,
            RelayAction::Drain => cmd_relay_drain(&resolve()?).await,
        },
        Command::Workers { action } => match action {
            WorkersAction::List => cmd_workers_list(&resolve()?),
        },
        Command::Entries { action } => match action {
            EntriesAction::Show { id } => cmd_entries_show(&resolve()?, &id).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path.as_deref()),
            ConfigAction::Show => cmd_config_show(&resolve()?),
        },
    }
}

/// Config file (or defaults) with CLI overrides applied.
fn resolve_config(config_path: Option<&Path>, db: Option<&Path>) -> Result<AppConfig> {
    let mut config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(db) = db {
        config.storage.database_path = db.to_path_buf();
    }
    Ok(config)
}

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = &config.storage.database_path;
    info!(path = %path.display(), "opening database");
    Ok(Arc::new(Storage::open(path).await?))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_serve(config: &AppConfig, bind: Option<&str>) -> Result<()> {
    let storage = open_storage(config).await?;
    let pipeline = Pipeline::build(config, storage)?;
    let bind = bind.unwrap_or(&config.api.bind);
    server::serve(pipeline, bind, &config.api.cors).await
}

async fn cmd_ingest(config: &AppConfig, text: &str) -> Result<()> {
    let storage = open_storage(config).await?;
    let entry = moood_core::ingest(&storage, text).await?;

    println!("{}", entry.id);
    Ok(())
}

async fn cmd_relay_run(config: &AppConfig) -> Result<()> {
    let storage = open_storage(config).await?;
    let pipeline = Pipeline::build(config, storage)?;

    let stats = pipeline.relay.run(server::shutdown_signal()).await;

    println!();
    println!("  Relay stopped.");
    println!("  Batches:   {}", stats.batches);
    println!("  Processed: {}", stats.processed);
    println!("  Failed:    {}", stats.failed_batches);
    println!();
    Ok(())
}

async fn cmd_relay_drain(config: &AppConfig) -> Result<()> {
    let storage = open_storage(config).await?;
    let progress = Arc::new(CliProgress::new());
    let pipeline = Pipeline::build_with_observer(config, storage, progress.clone())?;

    let pending = pipeline.relay.pending().await?;
    progress.start(pending);
    let stats = pipeline.relay.drain().await;
    progress.finish();
    let stats = stats?;

    println!();
    println!("  Pending:   {pending}");
    println!("  Processed: {}", stats.processed);
    println!("  Batches:   {}", stats.batches);
    println!();

    if stats.failed_batches > 0 {
        return Err(eyre!(
            "a batch failed and was left for redelivery; run `moood relay drain` again to retry"
        ));
    }
    Ok(())
}

fn cmd_workers_list(config: &AppConfig) -> Result<()> {
    // Same validation the pipeline applies at startup
    let registry = WorkerRegistry::from_configs(&config.workers)?;
    if registry.is_empty() {
        println!("No workers registered. Entries will be persisted with empty metadata.");
        return Ok(());
    }

    for (descriptor, worker) in registry.all().iter().zip(&config.workers) {
        let target = match &worker.target {
            WorkerTarget::Command { program, args, .. } => {
                format!("{program} {}", args.join(" ")).trim_end().to_string()
            }
            WorkerTarget::Http { url } => url.to_string(),
        };
        println!(
            "  {:<16} {:<8} {target}",
            descriptor.display_name(),
            worker.target.kind()
        );
        for (key, value) in &descriptor.build_parameters {
            println!("  {:<16} build   {key}={value}", "");
        }
        for key in descriptor.runtime_parameters.keys() {
            println!("  {:<16} runtime {key}", "");
        }
    }
    Ok(())
}

async fn cmd_entries_show(config: &AppConfig, id: &str) -> Result<()> {
    let path = &config.storage.database_path;
    if !path.exists() {
        return Err(eyre!("no database at {}", path.display()));
    }
    let storage = Storage::open_readonly(path).await?;
    let id = EntryId::from(id);

    if let Some(record) = storage.get_processed(&id).await? {
        let mut doc = serde_json::to_value(&record.processed)?;
        doc["processedAt"] = serde_json::json!(record.processed_at);
        doc["deliveries"] = serde_json::json!(record.deliveries);
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    match storage.get_entry(&id).await? {
        Some(entry) => {
            println!("{}", serde_json::to_string_pretty(&entry)?);
            println!("(not processed yet)");
            Ok(())
        }
        None => Err(eyre!("entry {id} not found")),
    }
}

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(p) => init_config_at(p)?,
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner showing which entry is in which execution state.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        Self { spinner }
    }

    fn start(&self, pending: u64) {
        self.spinner.set_length(pending);
        self.spinner.set_message("draining change feed");
        self.spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ExecutionObserver for CliProgress {
    fn state_changed(&self, entry_id: &EntryId, state: ExecutionState) {
        if state == ExecutionState::Succeeded {
            self.spinner.inc(1);
        }
        self.spinner.set_message(format!("{entry_id} {state}"));
    }

    fn branch_completed(&self, entry_id: &EntryId, worker: &str, succeeded: bool) {
        let mark = if succeeded { "done" } else { "failed" };
        self.spinner.set_message(format!("{entry_id} {worker} {mark}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "moood", "relay", "drain", "--db", "/tmp/x.db", "-vv", "--log-format", "json",
        ])
        .unwrap();
        assert_eq!(cli.db.as_deref(), Some(Path::new("/tmp/x.db")));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(
            cli.command,
            Command::Relay {
                action: RelayAction::Drain
            }
        ));
    }

    #[test]
    fn parses_serve_and_ingest() {
        let cli = Cli::try_parse_from(["moood", "serve", "--bind", "0.0.0.0:8080"]).unwrap();
        match cli.command {
            Command::Serve { bind } => assert_eq!(bind.as_deref(), Some("0.0.0.0:8080")),
            _ => panic!("expected serve"),
        }

        let cli = Cli::try_parse_from(["moood", "ingest", "I feel great today"]).unwrap();
        match cli.command {
            Command::Ingest { text } => assert_eq!(text, "I feel great today"),
            _ => panic!("expected ingest"),
        }

        assert!(Cli::try_parse_from(["moood", "ingest"]).is_err());
    }

    #[test]
    fn db_flag_overrides_config() {
        let dir = std::env::temp_dir().join(format!("moood-cli-{}", uuid::Uuid::now_v7()));
        let config_path = dir.join("moood.toml");
        init_config_at(&config_path).unwrap();

        let cli = Cli::try_parse_from([
            "moood",
            "--config",
            config_path.to_str().unwrap(),
            "--db",
            "/tmp/override.db",
            "workers",
            "list",
        ])
        .unwrap();
        let config = resolve_config(cli.config.as_deref(), cli.db.as_deref()).unwrap();
        assert_eq!(config.storage.database_path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.workers.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
