//! Rate-Limited Feed Client
//!
//! Wraps an external market-data API behind client-side budget
//! enforcement: a sliding per-minute window that waits cooperatively, a
//! daily cap that fails fast, a TTL response cache, and exponential
//! backoff for retryable failures. Callers get `Option<Value>` back and
//! never see a panic or an unbounded stall from a misbehaving upstream.

use super::feed_errors::FeedError;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Budget and retry settings for the feed client
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    /// Sliding-window request budget per minute
    pub per_minute_limit: usize,
    /// Hard daily cap, resets at UTC midnight
    pub daily_limit: u32,
    /// How long a cached response stays fresh
    pub cache_ttl: Duration,
    /// Retry attempts after the initial request
    pub max_retries: u32,
    /// First backoff delay, doubled on each subsequent retry
    pub base_retry_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.marketfeed.example".to_string(),
            per_minute_limit: 10,
            daily_limit: 100,
            cache_ttl: Duration::from_secs(300),
            max_retries: 3,
            base_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Raw HTTP response handed back by a transport
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Transport seam so tests can script response sequences without a server
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(&self, url: &str, params: &[(String, String)]) -> Result<HttpResponse, FeedError>;
}

/// Production transport backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl ReqwestTransport {
    pub fn new(api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, api_key }
    }
}

#[async_trait]
impl FeedTransport for ReqwestTransport {
    async fn get(&self, url: &str, params: &[(String, String)]) -> Result<HttpResponse, FeedError> {
        let mut request = self.client.get(url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FeedError::from_network_error(&e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| FeedError::from_network_error(&e))?;

        Ok(HttpResponse { status, body })
    }
}

/// Snapshot of current budget consumption
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub minute_used: usize,
    pub minute_limit: usize,
    pub daily_used: u32,
    pub daily_limit: u32,
    pub cached_entries: usize,
}

struct FeedState {
    minute_window: VecDeque<Instant>,
    daily_count: u32,
    daily_date: NaiveDate,
    cache: HashMap<String, (Value, Instant)>,
}

pub struct RateLimitedClient {
    config: FeedConfig,
    transport: Arc<dyn FeedTransport>,
    state: Mutex<FeedState>,
}

impl RateLimitedClient {
    pub fn new(config: FeedConfig, api_key: Option<String>) -> Self {
        Self::with_transport(config, Arc::new(ReqwestTransport::new(api_key)))
    }

    pub fn with_transport(config: FeedConfig, transport: Arc<dyn FeedTransport>) -> Self {
        Self {
            config,
            transport,
            state: Mutex::new(FeedState {
                minute_window: VecDeque::new(),
                daily_count: 0,
                daily_date: Utc::now().date_naive(),
                cache: HashMap::new(),
            }),
        }
    }

    /// Fetch JSON from `endpoint`, honoring budgets, cache, and retries.
    ///
    /// Returns `None` when the daily budget is exhausted or the request
    /// ultimately fails; waits (rather than failing) when only the
    /// per-minute window is full.
    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        use_cache: bool,
    ) -> Option<Value> {
        let key = cache_key(endpoint, params);

        if use_cache {
            let mut state = self.state.lock().await;
            if let Some((value, stored_at)) = state.cache.get(&key) {
                if stored_at.elapsed() < self.config.cache_ttl {
                    debug!("Cache hit for {}", key);
                    return Some(value.clone());
                }
                // expired, drop it now so it stops counting against the cache
                state.cache.remove(&key);
            }
        }

        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );

        let mut attempt = 0u32;
        let mut delay = self.config.base_retry_delay;
        loop {
            if !self.acquire_budget().await {
                return None;
            }

            match self.transport.get(&url, params).await {
                Ok(response) if response.status == 200 => {
                    let value: Value = match serde_json::from_str(&response.body) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("Feed returned malformed JSON for {}: {}", endpoint, e);
                            return None;
                        }
                    };
                    if use_cache {
                        let mut state = self.state.lock().await;
                        state.cache.insert(key, (value.clone(), Instant::now()));
                    }
                    return Some(value);
                }
                Ok(response) => {
                    let err = FeedError::from_response(response.status, &response.body);
                    if !self.should_retry(&err, &mut attempt, endpoint) {
                        return None;
                    }
                }
                Err(err) => {
                    if !self.should_retry(&err, &mut attempt, endpoint) {
                        return None;
                    }
                }
            }

            debug!("Retrying {} in {:?} (attempt {})", endpoint, delay, attempt);
            sleep(delay).await;
            delay *= 2;
        }
    }

    pub async fn rate_limit_status(&self) -> RateLimitStatus {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        prune_window(&mut state.minute_window, now);
        RateLimitStatus {
            minute_used: state.minute_window.len(),
            minute_limit: self.config.per_minute_limit,
            daily_used: state.daily_count,
            daily_limit: self.config.daily_limit,
            cached_entries: state.cache.len(),
        }
    }

    pub async fn clear_cache(&self) {
        let mut state = self.state.lock().await;
        let dropped = state.cache.len();
        state.cache.clear();
        info!("Cleared {} cached feed responses", dropped);
    }

    fn should_retry(&self, err: &FeedError, attempt: &mut u32, endpoint: &str) -> bool {
        if !err.is_retryable() {
            warn!("Feed request to {} failed: {}", endpoint, err);
            return false;
        }
        *attempt += 1;
        if *attempt > self.config.max_retries {
            warn!(
                "Feed request to {} failed after {} attempts: {}",
                endpoint, *attempt, err
            );
            return false;
        }
        true
    }

    /// Reserve one request slot. Waits while the minute window is full,
    /// returns false when the daily cap is hit.
    async fn acquire_budget(&self) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock().await;

                let today = Utc::now().date_naive();
                if today != state.daily_date {
                    state.daily_date = today;
                    state.daily_count = 0;
                }
                if state.daily_count >= self.config.daily_limit {
                    warn!(
                        "Daily feed budget exhausted ({} requests)",
                        self.config.daily_limit
                    );
                    return false;
                }

                let now = Instant::now();
                prune_window(&mut state.minute_window, now);
                if state.minute_window.len() < self.config.per_minute_limit {
                    state.minute_window.push_back(now);
                    state.daily_count += 1;
                    return true;
                }

                // oldest entry in the window decides how long to wait
                match state.minute_window.front() {
                    Some(oldest) => MINUTE_WINDOW.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };

            debug!("Minute budget full, waiting {:?}", wait);
            sleep(wait.max(Duration::from_millis(10))).await;
        }
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) >= MINUTE_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn cache_key(endpoint: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return endpoint.to_string();
    }
    let mut sorted: Vec<_> = params.to_vec();
    sorted.sort();
    let query: Vec<String> = sorted.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}?{}", endpoint, query.join("&"))
}
