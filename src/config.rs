use std::{env, num::NonZeroUsize, path::PathBuf, time::Duration};

use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

/// ポッドキャスト名とフィードURLの対応。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    data_dir: PathBuf,
    feeds: Vec<FeedSpec>,
    feed_connect_timeout: Duration,
    feed_total_timeout: Duration,
    http_max_retries: usize,
    http_backoff_base_ms: u64,
    http_backoff_cap_ms: u64,
    feed_cache_ttl: Duration,
    embedding_model: String,
    embedding_text_prefix: Option<String>,
    embedding_batch_size: NonZeroUsize,
    kmeans_seed: u64,
    kmeans_restarts: NonZeroUsize,
    kmeans_max_iterations: usize,
    k_exploration_min: usize,
    k_exploration_max: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から Catalog Worker の設定値を読み込み、検証する。
    ///
    /// 必須の環境変数が揃っていない場合や、数値のパースに失敗した場合はエラーを返す。
    ///
    /// # Errors
    /// `CATALOG_DATA_DIR` / `CATALOG_FEEDS` が未設定、もしくは各種値のパースに
    /// 失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = PathBuf::from(env_var("CATALOG_DATA_DIR")?);
        let feeds = parse_feed_registry("CATALOG_FEEDS")?;

        // HTTP timeout settings
        let feed_connect_timeout = parse_duration_ms("FEED_CONNECT_TIMEOUT_MS", 3000)?;
        let feed_total_timeout = parse_duration_ms("FEED_TOTAL_TIMEOUT_MS", 30000)?;

        // Retry settings (exponential backoff + jitter)
        let http_max_retries = parse_usize("HTTP_MAX_RETRIES", 3)?;
        let http_backoff_base_ms = parse_u64("HTTP_BACKOFF_BASE_MS", 250)?;
        let http_backoff_cap_ms = parse_u64("HTTP_BACKOFF_CAP_MS", 10000)?;

        // Feed response cache window
        let feed_cache_ttl = parse_duration_secs("FEED_CACHE_TTL_SECS", 300)?;

        // Embedding settings
        let embedding_model = env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "distiluse-base-multilingual-cased".to_string());
        let embedding_text_prefix = env::var("EMBEDDING_TEXT_PREFIX").ok();
        let embedding_batch_size = parse_non_zero_usize("EMBEDDING_BATCH_SIZE", 32)?;

        // Clustering settings
        let kmeans_seed = parse_u64("KMEANS_SEED", 42)?;
        let kmeans_restarts = parse_non_zero_usize("KMEANS_RESTARTS", 10)?;
        let kmeans_max_iterations = parse_usize("KMEANS_MAX_ITERATIONS", 300)?;
        let k_exploration_min = parse_usize("K_EXPLORATION_MIN", 3)?;
        let k_exploration_max = parse_usize("K_EXPLORATION_MAX", 14)?;
        if k_exploration_min > k_exploration_max {
            return Err(ConfigError::Invalid {
                name: "K_EXPLORATION_MIN",
                source: anyhow::anyhow!(
                    "exploration minimum {k_exploration_min} exceeds maximum {k_exploration_max}"
                ),
            });
        }

        Ok(Self {
            data_dir,
            feeds,
            feed_connect_timeout,
            feed_total_timeout,
            http_max_retries,
            http_backoff_base_ms,
            http_backoff_cap_ms,
            feed_cache_ttl,
            embedding_model,
            embedding_text_prefix,
            embedding_batch_size,
            kmeans_seed,
            kmeans_restarts,
            kmeans_max_iterations,
            k_exploration_min,
            k_exploration_max,
        })
    }

    #[must_use]
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    #[must_use]
    pub fn feeds(&self) -> &[FeedSpec] {
        &self.feeds
    }

    /// 登録済みポッドキャストのフィードURLを返す。未登録なら `None`。
    #[must_use]
    pub fn feed_url_for(&self, podcast: &str) -> Option<&str> {
        self.feeds
            .iter()
            .find(|spec| spec.name == podcast)
            .map(|spec| spec.url.as_str())
    }

    #[must_use]
    pub fn feed_connect_timeout(&self) -> Duration {
        self.feed_connect_timeout
    }

    #[must_use]
    pub fn feed_total_timeout(&self) -> Duration {
        self.feed_total_timeout
    }

    #[must_use]
    pub fn http_max_retries(&self) -> usize {
        self.http_max_retries
    }

    #[must_use]
    pub fn http_backoff_base_ms(&self) -> u64 {
        self.http_backoff_base_ms
    }

    #[must_use]
    pub fn http_backoff_cap_ms(&self) -> u64 {
        self.http_backoff_cap_ms
    }

    #[must_use]
    pub fn feed_cache_ttl(&self) -> Duration {
        self.feed_cache_ttl
    }

    #[must_use]
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    #[must_use]
    pub fn embedding_text_prefix(&self) -> Option<&str> {
        self.embedding_text_prefix.as_deref()
    }

    #[must_use]
    pub fn embedding_batch_size(&self) -> NonZeroUsize {
        self.embedding_batch_size
    }

    #[must_use]
    pub fn kmeans_seed(&self) -> u64 {
        self.kmeans_seed
    }

    #[must_use]
    pub fn kmeans_restarts(&self) -> NonZeroUsize {
        self.kmeans_restarts
    }

    #[must_use]
    pub fn kmeans_max_iterations(&self) -> usize {
        self.kmeans_max_iterations
    }

    #[must_use]
    pub fn k_exploration_min(&self) -> usize {
        self.k_exploration_min
    }

    #[must_use]
    pub fn k_exploration_max(&self) -> usize {
        self.k_exploration_max
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

/// `name=url` のカンマ区切り形式でフィード登録簿をパースする。
fn parse_feed_registry(name: &'static str) -> Result<Vec<FeedSpec>, ConfigError> {
    let raw = env_var(name)?;
    let mut feeds = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((podcast, url)) = entry.split_once('=') else {
            return Err(ConfigError::Invalid {
                name,
                source: anyhow::anyhow!("entry {entry:?} is not of the form name=url"),
            });
        };
        let podcast = podcast.trim();
        let url = url.trim();
        if podcast.is_empty() || url.is_empty() {
            return Err(ConfigError::Invalid {
                name,
                source: anyhow::anyhow!("entry {entry:?} has an empty name or url"),
            });
        }
        feeds.push(FeedSpec {
            name: podcast.to_string(),
            url: url.to_string(),
        });
    }
    if feeds.is_empty() {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("at least one name=url entry is required"),
        });
    }
    Ok(feeds)
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let parsed = parse_usize(name, default)?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let ms = parse_u64(name, default_ms)?;
    Ok(Duration::from_millis(ms))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}
