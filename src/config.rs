//! Configuration management for the sync engine

use crate::services::MIN_SYNC_INTERVAL_SECS;
use anyhow::Result;
use std::env;
use tracing::warn;

/// Engine configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON-RPC endpoint for the chain
    pub rpc_url: String,

    /// Prediction market contract address (optional; chain features are
    /// disabled without it)
    pub contract_address: Option<String>,

    /// Path to SQLite database
    pub database_path: String,

    /// Full reconciliation interval in seconds
    pub sync_interval_seconds: u64,

    /// Event filter poll interval in seconds
    pub event_poll_seconds: u64,

    /// Block scan interval in seconds
    pub scan_interval_seconds: u64,

    /// Wait after a failed event poll before retrying, in seconds
    pub event_error_backoff_seconds: u64,

    /// External data-feed API key (optional)
    pub feed_api_key: Option<String>,

    /// External data-feed base URL
    pub feed_base_url: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let rpc_url = env::var("CHAIN_RPC_URL")
            .unwrap_or_else(|_| "https://base-sepolia.api.onfinality.io/public".to_string());

        let contract_address = env::var("PREDICTION_MARKET_CONTRACT_ADDRESS")
            .ok()
            .filter(|s| !s.is_empty());

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "marketsync.db".to_string());

        let sync_interval_seconds = clamp_sync_interval(
            env::var("SYNC_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        );

        let event_poll_seconds = env::var("EVENT_POLL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let scan_interval_seconds = env::var("SCAN_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let event_error_backoff_seconds = env::var("EVENT_ERROR_BACKOFF_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let feed_api_key = env::var("FEED_API_KEY").ok().filter(|s| !s.is_empty());

        let feed_base_url = env::var("FEED_BASE_URL")
            .unwrap_or_else(|_| "https://api.marketfeed.example".to_string());

        Ok(Self {
            rpc_url,
            contract_address,
            database_path,
            sync_interval_seconds,
            event_poll_seconds,
            scan_interval_seconds,
            event_error_backoff_seconds,
            feed_api_key,
            feed_base_url,
        })
    }
}

fn clamp_sync_interval(requested: u64) -> u64 {
    if requested < MIN_SYNC_INTERVAL_SECS {
        warn!(
            "SYNC_INTERVAL_SECONDS {} below minimum, using {}",
            requested, MIN_SYNC_INTERVAL_SECS
        );
        MIN_SYNC_INTERVAL_SECS
    } else {
        requested
    }
}
