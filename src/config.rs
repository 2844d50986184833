use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for github-export
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory that receives one mirror per repository
    pub base_directory: String,

    /// Location of the mirror index (defaults to `<base_directory>/.github-export/index.db`)
    #[serde(default)]
    pub index_path: Option<String>,

    /// GitHub authentication and listing settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Clone/update behavior
    #[serde(default)]
    pub sync: SyncConfig,

    /// Backoff policy for throttled or failing listing calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// REST API root
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token", "config"

    /// Personal access token, used by the "config" method and as the last "auto" fallback
    #[serde(default)]
    pub token: Option<String>,

    /// Repositories requested per listing page (GitHub caps this at 100)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Listing affiliation filter passed to the API
    #[serde(default = "default_affiliation")]
    pub affiliation: String,

    /// Listing visibility filter passed to the API
    #[serde(default = "default_visibility")]
    pub visibility: String,

    /// Include forked repositories
    #[serde(default = "default_true")]
    pub include_forks: bool,

    /// Include archived repositories
    #[serde(default = "default_true")]
    pub include_archived: bool,

    /// Repository exclusion patterns
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Timeout for each API request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

/// Local layout of an exported repository
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MirrorMode {
    /// Bare `git clone --mirror`, suitable for backup and restore
    #[default]
    Mirror,
    /// Regular clone with a checked-out default branch
    WorkingTree,
}

/// Transport used for git transfers
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CloneProtocol {
    #[default]
    Https,
    Ssh,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: MirrorMode,

    #[serde(default)]
    pub protocol: CloneProtocol,

    /// Maximum parallel clone/update operations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Timeout for git operations in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Skip repositories that have not changed since their last successful sync
    #[serde(default = "default_true")]
    pub skip_unchanged: bool,
}

/// Exponential backoff policy
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

pub const MAX_PAGE_SIZE: u32 = 100;
pub const MAX_CONCURRENCY: usize = 16;

// Default value functions
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}
fn default_affiliation() -> String {
    "owner".to_string()
}
fn default_visibility() -> String {
    "all".to_string()
}
fn default_true() -> bool {
    true
}
fn default_request_timeout() -> u64 {
    30
}
fn default_concurrency() -> usize {
    4
}
fn default_timeout() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            auth_method: default_auth_method(),
            token: None,
            page_size: default_page_size(),
            affiliation: default_affiliation(),
            visibility: default_visibility(),
            include_forks: default_true(),
            include_archived: default_true(),
            exclude_patterns: Vec::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: MirrorMode::default(),
            protocol: CloneProtocol::default(),
            concurrency: default_concurrency(),
            timeout: default_timeout(),
            skip_unchanged: default_true(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("github-export").join("config.yml"))
    }

    /// Expand environment variables and `~` in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.base_directory = expand_path(&self.base_directory)
            .context("Failed to expand base_directory path")?;

        if let Some(index_path) = &self.index_path {
            self.index_path =
                Some(expand_path(index_path).context("Failed to expand index_path")?);
        }

        Ok(())
    }

    /// Reject settings that cannot produce a working export.
    ///
    /// Runs once at startup so that every later component can trust the values.
    pub fn validate(&self) -> Result<()> {
        if self.base_directory.trim().is_empty() {
            bail!("base_directory must not be empty");
        }

        match self.github.auth_method.as_str() {
            "auto" | "gh_cli" | "token" | "config" => {}
            other => bail!("Unknown auth method: {}", other),
        }
        if self.github.auth_method == "config" && self.github.token.is_none() {
            bail!("auth_method \"config\" requires github.token");
        }

        url::Url::parse(&self.github.api_url)
            .with_context(|| format!("Invalid github.api_url: {}", self.github.api_url))?;

        if !(1..=MAX_PAGE_SIZE).contains(&self.github.page_size) {
            bail!(
                "github.page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE,
                self.github.page_size
            );
        }
        if self.github.request_timeout == 0 {
            bail!("github.request_timeout must be greater than zero");
        }
        for pattern in &self.github.exclude_patterns {
            crate::github::glob_to_regex(pattern)
                .with_context(|| format!("Invalid exclude pattern: {}", pattern))?;
        }

        if !(1..=MAX_CONCURRENCY).contains(&self.sync.concurrency) {
            bail!(
                "sync.concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY,
                self.sync.concurrency
            );
        }
        if self.sync.timeout == 0 {
            bail!("sync.timeout must be greater than zero");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }

        Ok(())
    }

    /// Directory that holds the mirrors
    pub fn base_path(&self) -> PathBuf {
        path_clean::clean(&self.base_directory)
    }

    /// Resolved location of the mirror index
    pub fn index_file(&self) -> PathBuf {
        match &self.index_path {
            Some(path) => path_clean::clean(path),
            None => self.base_path().join(".github-export").join("index.db"),
        }
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.github.request_timeout)
    }
}

fn expand_path(path: &str) -> Result<String> {
    Ok(shellexpand::full(path)?.into_owned())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_directory: "${HOME}/github-export".to_string(),
            index_path: None,
            github: GitHubConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
