//! Configuration management for the sync runtime.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Sync runtime configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Directory holding one SQLite file per database
    pub data_dir: PathBuf,
    /// Quiet period before queued actions are committed
    pub debounce: Duration,
    /// Remote commits taking longer than this count as failed
    pub commit_timeout: Duration,
    /// First retry delay after a failed commit
    pub retry_backoff: Duration,
    /// Upper bound of the retry delay
    pub retry_backoff_max: Duration,
    /// Items per chunk blob
    pub chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./gitray-data"),
            debounce: Duration::from_millis(2000),
            commit_timeout: Duration::from_millis(30_000),
            retry_backoff: Duration::from_millis(1000),
            retry_backoff_max: Duration::from_millis(60_000),
            chunk_size: gitray_engine::transform::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        Ok(Self {
            data_dir: lookup("GITRAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            debounce: millis("GITRAY_DEBOUNCE_MS", defaults.debounce)?,
            commit_timeout: millis("GITRAY_COMMIT_TIMEOUT_MS", defaults.commit_timeout)?,
            retry_backoff: millis("GITRAY_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
            retry_backoff_max: millis("GITRAY_RETRY_BACKOFF_MAX_MS", defaults.retry_backoff_max)?,
            chunk_size: parse_or(&lookup, "GITRAY_CHUNK_SIZE", defaults.chunk_size)?,
        })
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.retry_backoff_max = max;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// GitHub repository access.
#[derive(Clone, PartialEq, Eq)]
pub struct GithubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub api_url: String,
}

// The token stays out of logs.
impl std::fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubConfig")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl GithubConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = lookup("GITHUB_TOKEN").ok_or(ConfigError::Missing("GITHUB_TOKEN"))?;
        let full_name = lookup("GITHUB_REPO").ok_or(ConfigError::Missing("GITHUB_REPO"))?;
        let (owner, repo) = match full_name.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                (owner.to_string(), repo.to_string())
            }
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "GITHUB_REPO",
                    value: full_name,
                })
            }
        };

        Ok(Self {
            token,
            owner,
            repo,
            branch: lookup("GITHUB_BRANCH").unwrap_or_else(|| "main".to_string()),
            api_url: lookup("GITHUB_API_URL")
                .unwrap_or_else(|| "https://api.github.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid {key} value: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}
