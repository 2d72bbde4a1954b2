//! Application configuration for Moood.
//!
//! User config lives at `~/.moood/moood.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{MooodError, Result};
use crate::types::WorkerDescriptor;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "moood.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".moood";

// ---------------------------------------------------------------------------
// Config structs (matching moood.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Primary store location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Change-feed relay settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Workflow execution limits.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// HTTP ingestion endpoint.
    #[serde(default)]
    pub api: ApiConfig,

    /// Registered workers, in registration order.
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("var").join("moood.db")
}

/// Where a relay with no checkpoint starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    /// Oldest retained record.
    #[default]
    TrimHorizon,
    /// Only records written after first activation.
    Latest,
}

/// How the items of one batch are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// One item at a time, in feed order; stops at the first failure.
    #[default]
    Serial,
    /// All items at once; the batch fails if any item fails.
    Concurrent,
}

/// `[relay]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Checkpoint key for this relay.
    #[serde(default = "default_relay_name")]
    pub name: String,

    /// Maximum change records per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Start position on first activation.
    #[serde(default)]
    pub starting_position: StartingPosition,

    /// Delay between polls when idle, and before redelivering a failed batch.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Serial or concurrent execution of batch items.
    #[serde(default)]
    pub batch_mode: BatchMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: default_relay_name(),
            batch_size: default_batch_size(),
            starting_position: StartingPosition::default(),
            poll_interval_ms: default_poll_interval(),
            batch_mode: BatchMode::default(),
        }
    }
}

fn default_relay_name() -> String {
    "entry-pipe".into()
}
fn default_batch_size() -> usize {
    1
}
fn default_poll_interval() -> u64 {
    500
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deadline for the whole Start→Persist sequence of one entry.
    #[serde(default = "default_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Deadline for a single worker invocation.
    #[serde(default = "default_timeout_ms")]
    pub invocation_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: default_timeout_ms(),
            invocation_timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    60_000
}

/// `[api]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Socket address the ingestion endpoint binds to.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Cross-origin access for browser clients.
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors: CorsConfig::default(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".into()
}

/// `[api.cors]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. `["*"]` allows any origin; an empty list disables CORS.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// How long browsers may cache a preflight response.
    #[serde(default = "default_cors_max_age")]
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            max_age_seconds: default_cors_max_age(),
        }
    }
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".into()]
}

fn default_cors_max_age() -> u64 {
    3600
}

/// `[[workers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name; also its metadata key.
    pub name: String,

    /// Packaging parameters (not used at invocation time).
    #[serde(default)]
    pub build: BTreeMap<String, String>,

    /// Invocation-time parameters.
    #[serde(default)]
    pub runtime: BTreeMap<String, String>,

    /// How to reach the worker.
    pub target: WorkerTarget,
}

impl WorkerConfig {
    /// The registry descriptor for this worker.
    pub fn descriptor(&self) -> WorkerDescriptor {
        WorkerDescriptor {
            name: self.name.clone(),
            build_parameters: self.build.clone(),
            runtime_parameters: self.runtime.clone(),
        }
    }
}

/// Compute substrate a worker runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerTarget {
    /// A local executable speaking JSON over stdin/stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
    },
    /// A remote endpoint accepting a JSON POST.
    Http { url: Url },
}

impl WorkerTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Http { .. } => "http",
        }
    }
}

impl AppConfig {
    /// Config written by `moood config init`: defaults plus the two stock workers.
    pub fn starter() -> Self {
        let python_worker = |name: &str| WorkerConfig {
            name: name.to_string(),
            build: BTreeMap::from([("PYTHON_VERSION".to_string(), "3.12".to_string())]),
            runtime: BTreeMap::new(),
            target: WorkerTarget::Command {
                program: "python3".into(),
                args: vec![format!("workers/{name}/worker.py")],
                working_dir: None,
            },
        };

        Self {
            workers: vec![python_worker("asent"), python_worker("complexity")],
            ..Self::default()
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.batch_size == 0 {
            return Err(MooodError::config("relay.batch_size must be at least 1"));
        }
        if self.orchestrator.execution_timeout_ms == 0 {
            return Err(MooodError::config(
                "orchestrator.execution_timeout_ms must be greater than 0",
            ));
        }
        if self.orchestrator.invocation_timeout_ms == 0 {
            return Err(MooodError::config(
                "orchestrator.invocation_timeout_ms must be greater than 0",
            ));
        }
        let origins = &self.api.cors.allowed_origins;
        if origins.len() > 1 && origins.iter().any(|origin| origin == "*") {
            return Err(MooodError::config(
                "api.cors.allowed_origins cannot mix \"*\" with explicit origins",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime options (derived from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime relay options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub name: String,
    pub batch_size: usize,
    pub starting_position: StartingPosition,
    pub poll_interval: Duration,
    pub batch_mode: BatchMode,
}

impl From<&AppConfig> for RelayOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            name: config.relay.name.clone(),
            batch_size: config.relay.batch_size,
            starting_position: config.relay.starting_position,
            poll_interval: Duration::from_millis(config.relay.poll_interval_ms),
            batch_mode: config.relay.batch_mode,
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime orchestrator options.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    pub execution_timeout: Duration,
    pub invocation_timeout: Duration,
}

impl From<&AppConfig> for OrchestratorOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            execution_timeout: Duration::from_millis(config.orchestrator.execution_timeout_ms),
            invocation_timeout: Duration::from_millis(config.orchestrator.invocation_timeout_ms),
        }
    }
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.moood/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| MooodError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.moood/moood.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| MooodError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| MooodError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Write the starter config to the default location.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

/// Write the starter config to `path`. Refuses to overwrite an existing file.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Err(MooodError::config(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| MooodError::io(dir, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::starter())
        .map_err(|e| MooodError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| MooodError::io(path, e))?;
    tracing::info!(?path, "created starter config file");

    Ok(path.to_path_buf())
}
