//! Application configuration for ContentMigrator.
//!
//! User config lives at `~/.contentmigrator/contentmigrator.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigratorError, Result};
use crate::types::EnrichmentKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "contentmigrator.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".contentmigrator";

// ---------------------------------------------------------------------------
// Config structs (matching contentmigrator.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Batch, concurrency and ledger settings.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Backoff timing.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Image task polling.
    #[serde(default)]
    pub poller: PollerConfig,

    /// Feature toggles for enrichment.
    #[serde(default)]
    pub features: FeaturesConfig,

    /// Per-service-class throttles.
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// Where content comes from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Which AI provider variant to use.
    #[serde(default)]
    pub ai: AiConfig,

    /// Where generated assets go.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    /// Destination database.
    #[serde(default)]
    pub destination: DestinationConfig,
}

/// `[migration]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Entries per batch window.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pipelines running in parallel inside a window.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Pause between windows in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Pipeline executions per entry before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Path of the JSON ledger.
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            delay_ms: default_delay_ms(),
            max_attempts: default_max_attempts(),
            state_file: default_state_file(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_concurrency() -> usize {
    4
}
fn default_delay_ms() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_state_file() -> String {
    "migration-state.json".into()
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff for the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the exponential part of the backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random extra delay as a fraction of the computed delay (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// How much longer a rate-limited retry waits than a transient one.
    #[serde(default = "default_rate_limit_factor")]
    pub rate_limit_factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            rate_limit_factor: default_rate_limit_factor(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.25
}
fn default_rate_limit_factor() -> u32 {
    2
}

/// `[poller]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Status checks before a task is considered timed out.
    #[serde(default = "default_poll_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_attempts: default_poll_max_attempts(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_poll_max_attempts() -> u32 {
    30
}

/// `[features]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Generate and upload an illustrative image per entry.
    #[serde(default = "default_true")]
    pub images: bool,

    /// Generate summary, title and keywords per entry.
    #[serde(default = "default_true")]
    pub summaries: bool,

    /// Maximum keywords requested per entry.
    #[serde(default = "default_keywords_max")]
    pub keywords_max: usize,

    /// Enrichment sub-steps whose failure fails the enrich stage.
    #[serde(default = "default_required_enrichments")]
    pub required_enrichments: Vec<EnrichmentKind>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            images: true,
            summaries: true,
            keywords_max: default_keywords_max(),
            required_enrichments: default_required_enrichments(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_keywords_max() -> usize {
    5
}
fn default_required_enrichments() -> Vec<EnrichmentKind> {
    vec![EnrichmentKind::Summary]
}

/// Refill period of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatePeriod {
    Second,
    Minute,
}

impl RatePeriod {
    pub fn as_duration(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
        }
    }
}

/// A single service class throttle: `requests` per `per`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub per: RatePeriod,
    /// Tokens that may accumulate while idle.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

/// `[rate_limits]` section. A missing class is unthrottled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub content_source: Option<RateLimitConfig>,
    #[serde(default)]
    pub ai_provider: Option<RateLimitConfig>,
    #[serde(default)]
    pub object_storage: Option<RateLimitConfig>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            content_source: Some(RateLimitConfig {
                requests: 3,
                per: RatePeriod::Second,
                burst: 1,
            }),
            ai_provider: Some(RateLimitConfig {
                requests: 60,
                per: RatePeriod::Minute,
                burst: 1,
            }),
            object_storage: Some(RateLimitConfig {
                requests: 10,
                per: RatePeriod::Second,
                burst: 1,
            }),
        }
    }
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// One JSON file per item in a local directory.
    Directory { path: String },
    /// A JSON-over-HTTP content API.
    Http {
        base_url: String,
        /// Name of the env var holding the bearer token.
        #[serde(default)]
        token_env: Option<String>,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Directory {
            path: "content".into(),
        }
    }
}

/// Closed set of AI provider variants, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local heuristics; no network, no image generation.
    Extractive,
    /// OpenAI-compatible chat API plus a task-based image API.
    OpenAi,
}

/// `[ai]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,

    /// Base URL of the chat completions API.
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the image task API.
    #[serde(default)]
    pub image_base_url: Option<String>,

    #[serde(default)]
    pub image_model: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_ai_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            image_base_url: None,
            image_model: None,
        }
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::Extractive
}
fn default_ai_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_api_key_env() -> String {
    "CONTENTMIGRATOR_AI_KEY".into()
}

/// `[object_store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    /// Files under `root`, served from `public_base_url`.
    Local {
        root: String,
        public_base_url: String,
    },
    /// HTTP PUT to `base_url/<path>`.
    Http {
        base_url: String,
        #[serde(default)]
        public_base_url: Option<String>,
        #[serde(default)]
        token_env: Option<String>,
    },
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self::Local {
            root: "assets".into(),
            public_base_url: "http://localhost:8080/assets".into(),
        }
    }
}

/// `[destination]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default = "default_destination_path")]
    pub path: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            path: default_destination_path(),
        }
    }
}

fn default_destination_path() -> String {
    "destination.db".into()
}

// ---------------------------------------------------------------------------
// Migration settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime migration settings: merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Pause between batch windows.
    pub delay: Duration,
    pub max_attempts: u32,
    pub images_enabled: bool,
    pub summaries_enabled: bool,
    pub keywords_max: usize,
    pub required_enrichments: Vec<EnrichmentKind>,
    pub retry: RetryConfig,
    pub poller: PollerConfig,
    pub rate_limits: RateLimitsConfig,
}

impl From<&AppConfig> for MigrationSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.migration.batch_size,
            concurrency: config.migration.concurrency,
            delay: Duration::from_millis(config.migration.delay_ms),
            max_attempts: config.migration.max_attempts,
            images_enabled: config.features.images,
            summaries_enabled: config.features.summaries,
            keywords_max: config.features.keywords_max,
            required_enrichments: config.features.required_enrichments.clone(),
            retry: config.retry.clone(),
            poller: config.poller.clone(),
            rate_limits: config.rate_limits.clone(),
        }
    }
}

impl MigrationSettings {
    /// Reject settings that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MigratorError::validation("batch size must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(MigratorError::validation("concurrency must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(MigratorError::validation("max attempts must be at least 1"));
        }
        if self.poller.max_attempts == 0 {
            return Err(MigratorError::validation(
                "poller max attempts must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(MigratorError::validation(format!(
                "retry jitter must be within 0.0..=1.0, got {}",
                self.retry.jitter
            )));
        }
        if self.retry.rate_limit_factor == 0 {
            return Err(MigratorError::validation(
                "retry rate_limit_factor must be at least 1",
            ));
        }
        for (class, limit) in [
            ("content_source", &self.rate_limits.content_source),
            ("ai_provider", &self.rate_limits.ai_provider),
            ("object_storage", &self.rate_limits.object_storage),
        ] {
            if let Some(limit) = limit {
                if limit.requests == 0 || limit.burst == 0 {
                    return Err(MigratorError::validation(format!(
                        "rate limit for {class} needs requests and burst of at least 1"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.contentmigrator/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| MigratorError::config("could not determine home dir"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.contentmigrator/contentmigrator.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| MigratorError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| MigratorError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| MigratorError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| MigratorError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| MigratorError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a secret from the env var named `var_name`.
pub fn read_secret(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(MigratorError::config(format!(
            "secret not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check that the AI provider's key is available when the provider needs one.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    match config.ai.provider {
        ProviderKind::Extractive => Ok(()),
        ProviderKind::OpenAi => read_secret(&config.ai.api_key_env).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("batch_size"));
        assert!(toml_str.contains("CONTENTMIGRATOR_AI_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.migration.batch_size, 10);
        assert_eq!(parsed.ai.provider, ProviderKind::Extractive);
        assert_eq!(
            parsed.rate_limits.ai_provider.map(|l| l.per),
            Some(RatePeriod::Minute)
        );
    }

    #[test]
    fn config_with_http_adapters() {
        let toml_str = r#"
[migration]
batch_size = 25
concurrency = 8

[features]
images = false
required_enrichments = ["summary", "keywords"]

[source]
kind = "http"
base_url = "https://cms.example.com/api"
token_env = "CMS_TOKEN"

[ai]
provider = "openai"
image_base_url = "https://images.example.com/v1"

[rate_limits.content_source]
requests = 5
per = "second"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.migration.batch_size, 25);
        assert!(!config.features.images);
        assert_eq!(
            config.features.required_enrichments,
            vec![EnrichmentKind::Summary, EnrichmentKind::Keywords]
        );
        assert!(matches!(config.source, SourceConfig::Http { .. }));
        assert_eq!(config.ai.provider, ProviderKind::OpenAi);
        // An explicit [rate_limits] table drops the unlisted classes.
        assert!(config.rate_limits.object_storage.is_none());
        assert_eq!(config.rate_limits.content_source.map(|l| l.burst), Some(1));
    }

    #[test]
    fn settings_from_app_config() {
        let app = AppConfig::default();
        let settings = MigrationSettings::from(&app);
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.delay, Duration::from_secs(1));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn settings_validation_rejects_zero_batch() {
        let mut settings = MigrationSettings::from(&AppConfig::default());
        settings.batch_size = 0;
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, MigratorError::Validation { .. }));

        let mut settings = MigrationSettings::from(&AppConfig::default());
        settings.retry.jitter = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contentmigrator.toml");
        std::fs::write(&path, "[migration]\nmax_attempts = 7\n").unwrap();
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.migration.max_attempts, 7);

        std::fs::write(&path, "[migration\n").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        assert!(validate_api_key(&config).is_ok());

        config.ai.provider = ProviderKind::OpenAi;
        // Use a unique env var name to avoid interfering with other tests
        config.ai.api_key_env = "CM_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CM_TEST_NONEXISTENT_KEY_12345"));
    }
}
