//! Application configuration for the egressos pipeline.
//!
//! User config lives at `~/.egressos/egressos.toml` (or wherever `--config`
//! points). CLI flags and their environment variables override config file
//! values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EgressosError, Result};
use crate::identity::JoinKeyMode;
use crate::types::AgeBrackets;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "egressos.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".egressos";

/// Registry index hosts, primary first.
const DEFAULT_INDEX_URLS: [&str; 2] = [
    "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj/",
    "https://dadosabertos.rfb.gov.br/CNPJ/dados_abertos_cnpj/",
];

// ---------------------------------------------------------------------------
// Config structs (matching egressos.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Data directories and the default roster location.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Registry acquisition and normalization settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Pseudonymization settings.
    #[serde(default)]
    pub privacy: PrivacyConfig,

    /// Enriched output settings.
    #[serde(default)]
    pub output: OutputConfig,

    /// Schedule consumed by the external scheduler.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Staging directory for downloaded registry archives.
    #[serde(default = "default_raw_dir")]
    pub raw_dir: String,

    /// Directory holding the normalized registry datasets.
    #[serde(default = "default_silver_dir")]
    pub silver_dir: String,

    /// Root directory for the enriched output.
    #[serde(default = "default_gold_dir")]
    pub gold_dir: String,

    /// Default alumni roster spreadsheet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roster_file: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            silver_dir: default_silver_dir(),
            gold_dir: default_gold_dir(),
            roster_file: None,
        }
    }
}

fn default_raw_dir() -> String {
    "data/raw/cnpj".into()
}
fn default_silver_dir() -> String {
    "data/silver".into()
}
fn default_gold_dir() -> String {
    "data/gold".into()
}

/// `[registry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Index base URLs tried in order (primary, then mirrors).
    #[serde(default = "default_index_urls")]
    pub index_urls: Vec<String>,

    /// Maximum archives to download; negative means all.
    #[serde(default = "default_max_files")]
    pub max_files: i64,

    /// File name prefixes to download. Empty means all archives.
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,

    /// Concurrent downloads.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Attempts per host before failing over.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base backoff between attempts (doubled each retry).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Timeout for index listing requests.
    #[serde(default = "default_listing_timeout")]
    pub listing_timeout_secs: u64,

    /// Timeout for a whole archive download.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Malformed-row ratio above which normalization fails.
    #[serde(default = "default_max_malformed_ratio")]
    pub max_malformed_ratio: f64,

    /// How identifiers are reduced before matching.
    #[serde(default)]
    pub join_key: JoinKeyMode,

    /// Token-set similarity at or above which a roster name counts as a
    /// registry name match.
    #[serde(default = "default_name_match_threshold")]
    pub name_match_threshold: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            index_urls: default_index_urls(),
            max_files: default_max_files(),
            prefixes: default_prefixes(),
            concurrency: default_concurrency(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            listing_timeout_secs: default_listing_timeout(),
            download_timeout_secs: default_download_timeout(),
            max_malformed_ratio: default_max_malformed_ratio(),
            join_key: JoinKeyMode::default(),
            name_match_threshold: default_name_match_threshold(),
        }
    }
}

fn default_index_urls() -> Vec<String> {
    DEFAULT_INDEX_URLS.iter().map(|s| s.to_string()).collect()
}
fn default_max_files() -> i64 {
    -1
}
fn default_prefixes() -> Vec<String> {
    vec!["Socios".into()]
}
fn default_concurrency() -> u32 {
    3
}
fn default_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_listing_timeout() -> u64 {
    60
}
fn default_download_timeout() -> u64 {
    600
}
fn default_max_malformed_ratio() -> f64 {
    0.05
}
fn default_name_match_threshold() -> f64 {
    0.92
}

/// `[privacy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Name of the env var holding the salt (never store the salt itself).
    #[serde(default = "default_salt_env")]
    pub salt_env: String,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            salt_env: default_salt_env(),
        }
    }
}

fn default_salt_env() -> String {
    "CPF_SALT".into()
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Dataset directory and file stem under the gold directory.
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,

    /// Inclusive lower bounds of the age brackets.
    #[serde(default)]
    pub age_bracket_bounds: AgeBrackets,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dataset_name: default_dataset_name(),
            age_bracket_bounds: AgeBrackets::default(),
        }
    }
}

fn default_dataset_name() -> String {
    "egressos".into()
}

/// `[schedule]` section. Read by the external scheduler, not by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            timezone: default_timezone(),
        }
    }
}

fn default_cron() -> String {
    "0 3 * * *".into()
}
fn default_timezone() -> String {
    "America/Sao_Paulo".into()
}

// ---------------------------------------------------------------------------
// Fetch config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime fetch configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Index base URLs, primary first.
    pub index_urls: Vec<String>,
    /// Maximum concurrent downloads.
    pub concurrency: u32,
    /// Attempts per host before failing over.
    pub retries: u32,
    /// Base backoff in ms between attempts.
    pub backoff_ms: u64,
    /// Listing request timeout in seconds.
    pub listing_timeout_secs: u64,
    /// Archive download timeout in seconds.
    pub download_timeout_secs: u64,
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            index_urls: config.registry.index_urls.clone(),
            concurrency: config.registry.concurrency,
            retries: config.registry.retries,
            backoff_ms: config.registry.backoff_ms,
            listing_timeout_secs: config.registry.listing_timeout_secs,
            download_timeout_secs: config.registry.download_timeout_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.egressos/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| EgressosError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.egressos/egressos.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| EgressosError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        EgressosError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| EgressosError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| EgressosError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| EgressosError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject settings the pipeline cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let registry = &config.registry;
    if registry.index_urls.is_empty() {
        return Err(EgressosError::config("registry.index_urls must list at least one host"));
    }
    if registry.concurrency == 0 {
        return Err(EgressosError::config("registry.concurrency must be at least 1"));
    }
    if registry.retries == 0 {
        return Err(EgressosError::config("registry.retries must be at least 1"));
    }
    if !(0.0..=1.0).contains(&registry.max_malformed_ratio) {
        return Err(EgressosError::config(format!(
            "registry.max_malformed_ratio must be within [0, 1], got {}",
            registry.max_malformed_ratio
        )));
    }
    if !(0.0..=1.0).contains(&registry.name_match_threshold) {
        return Err(EgressosError::config(format!(
            "registry.name_match_threshold must be within [0, 1], got {}",
            registry.name_match_threshold
        )));
    }
    if config.output.dataset_name.trim().is_empty()
        || config.output.dataset_name.contains(['/', '\\'])
    {
        return Err(EgressosError::config(
            "output.dataset_name must be a plain directory name",
        ));
    }
    Ok(())
}
