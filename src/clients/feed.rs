/// RSSフィード取得クライアント。
///
/// タイムアウト、再試行、TTL付きキャッシュをサポートします。
use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::Config;
use crate::util::retry::{RetryConfig, is_retryable_error};

/// フィードクライアントの設定。
#[derive(Debug, Clone)]
pub(crate) struct FeedClientConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) total_timeout: Duration,
    pub(crate) cache_ttl: Duration,
}

/// URLをキーにしたフィード本文のTTL付きキャッシュ。
///
/// TTLを過ぎたエントリは取得時に無効として扱う。TTLがゼロの場合は
/// 常に再取得になる。
#[derive(Debug)]
struct FeedCache {
    ttl: Duration,
    entries: HashMap<String, (Instant, String)>,
}

impl FeedCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    fn get(&self, url: &str) -> Option<String> {
        let (fetched_at, body) = self.entries.get(url)?;
        if fetched_at.elapsed() < self.ttl {
            Some(body.clone())
        } else {
            None
        }
    }

    fn insert(&mut self, url: &str, body: String) {
        self.entries.insert(url.to_string(), (Instant::now(), body));
    }
}

/// フィードサーバーとの通信を管理するクライアント。
#[derive(Debug)]
pub(crate) struct FeedClient {
    client: Client,
    retry: RetryConfig,
    cache: tokio::sync::Mutex<FeedCache>,
}

impl FeedClient {
    /// 新しいフィードクライアントを作成する。
    ///
    /// # Errors
    /// HTTPクライアントの構築に失敗した場合はエラーを返します。
    pub(crate) fn new(config: FeedClientConfig, retry: RetryConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build feed HTTP client")?;

        Ok(Self {
            client,
            retry,
            cache: tokio::sync::Mutex::new(FeedCache::new(config.cache_ttl)),
        })
    }

    /// アプリケーション設定からクライアントを構築する。
    ///
    /// # Errors
    /// HTTPクライアントの構築に失敗した場合はエラーを返します。
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        let client_config = FeedClientConfig {
            connect_timeout: config.feed_connect_timeout(),
            total_timeout: config.feed_total_timeout(),
            cache_ttl: config.feed_cache_ttl(),
        };
        let retry = RetryConfig::new(
            config.http_max_retries(),
            config.http_backoff_base_ms(),
            config.http_backoff_cap_ms(),
        );
        Self::new(client_config, retry)
    }

    /// フィードXMLを取得する。
    ///
    /// TTL内のキャッシュがあればそれを返し、なければ再試行付きで
    /// 取得してキャッシュに載せます。
    ///
    /// # Errors
    /// 再試行上限まで取得に失敗した場合はエラーを返します。
    pub(crate) async fn fetch(&self, url: &str) -> Result<String> {
        {
            let cache = self.cache.lock().await;
            if let Some(body) = cache.get(url) {
                debug!(url, "feed cache hit");
                return Ok(body);
            }
        }

        let body = self.fetch_with_retry(url).await?;

        let mut cache = self.cache.lock().await;
        cache.insert(url, body.clone());
        Ok(body)
    }

    /// 再試行ループ付きでフィード本文を取得する。
    async fn fetch_with_retry(&self, url: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.request_body(url).await {
                Ok(body) => {
                    debug!(url, attempt, bytes = body.len(), "fetched feed");
                    return Ok(body);
                }
                Err(error) => {
                    let next_attempt = attempt + 1;
                    if is_retryable_error(&error) && self.retry.can_retry(next_attempt) {
                        warn!(url, attempt, %error, "feed fetch failed, retrying");
                        attempt = next_attempt;
                    } else {
                        return Err(error)
                            .with_context(|| format!("failed to fetch feed from {url}"));
                    }
                }
            }
        }
    }

    /// 単一のHTTPリクエストを発行して本文を返す。
    async fn request_body(&self, url: &str) -> Result<String, reqwest::Error> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        response.text().await
    }
}
