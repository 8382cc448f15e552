//! Feed API Error Differentiation
//!
//! Classifies upstream data-feed responses into structured types so the
//! rate-limited client can decide between retrying with backoff and
//! failing fast.

use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone)]
pub enum FeedError {
    /// Rate limited by the upstream API (HTTP 429)
    RateLimited,
    /// Authentication or access rejected (HTTP 401/403), never retried
    Forbidden,
    /// Other client-side error, request is malformed and retrying won't help
    ClientError { status: u16, body: String },
    /// Upstream failure (HTTP 5xx), transient
    ServerError { status: u16 },
    /// Request timed out before a response arrived
    Timeout,
    /// Connection-level failure (DNS, refused, reset)
    Network(String),
}

/// Common upstream error response body
#[derive(Debug, Deserialize)]
struct FeedErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl FeedError {
    /// Classify a non-success HTTP response
    pub fn from_response(status: u16, body: &str) -> Self {
        let error_msg = if let Ok(parsed) = serde_json::from_str::<FeedErrorResponse>(body) {
            parsed.error.or(parsed.message).unwrap_or_default()
        } else {
            body.to_string()
        };

        let msg_lower = error_msg.to_lowercase();

        if status == 429 || msg_lower.contains("rate limit") || msg_lower.contains("too many requests") {
            return FeedError::RateLimited;
        }

        if status == 401 || status == 403 || msg_lower.contains("unauthorized") || msg_lower.contains("forbidden") {
            return FeedError::Forbidden;
        }

        if (500..600).contains(&status) {
            return FeedError::ServerError { status };
        }

        FeedError::ClientError {
            status,
            body: error_msg,
        }
    }

    /// Classify a reqwest transport error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Timeout
        } else if err.is_connect() {
            FeedError::Network("Connection failed".to_string())
        } else {
            FeedError::Network(err.to_string())
        }
    }

    /// Whether this error is retryable with exponential backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::RateLimited
                | FeedError::ServerError { .. }
                | FeedError::Timeout
                | FeedError::Network(_)
        )
    }
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedError::RateLimited => write!(f, "Rate limited by upstream API"),
            FeedError::Forbidden => write!(f, "Access forbidden by upstream API"),
            FeedError::ClientError { status, body } => {
                write!(f, "Feed API client error {}: {}", status, body)
            }
            FeedError::ServerError { status } => write!(f, "Feed API server error {}", status),
            FeedError::Timeout => write!(f, "Feed API request timed out"),
            FeedError::Network(msg) => write!(f, "Network error: {}", msg),
        }
    }
}

impl std::error::Error for FeedError {}
