//! Core types for the chain cache

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A market mirrored from the chain. The chain is the authority; this row
/// is a possibly-stale copy refreshed by the event listener or the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Chain-assigned sequential id, stored in string form
    pub id: String,
    pub question: String,
    pub description: String,
    /// Unix seconds
    pub end_time: i64,
    pub creator: String,
    pub resolved: bool,
    /// 0 or 1; always None while unresolved
    pub winning_outcome: Option<u8>,
    pub total_liquidity: u128,
    pub outcome_a_shares: u128,
    pub outcome_b_shares: u128,
    pub yes_pool: u128,
    pub no_pool: u128,
}

impl MarketSnapshot {
    /// YES/NO prices in percent, derived from the pools (50/50 when empty)
    pub fn prices(&self) -> (u32, u32) {
        let (mut yes, mut no) = (self.yes_pool, self.no_pool);
        // scale both pools down together until the percent math cannot overflow
        while yes > u128::MAX / 100 || no > u128::MAX - yes {
            yes >>= 1;
            no >>= 1;
        }
        let total = yes + no;
        if total == 0 {
            return (50, 50);
        }
        let yes_pct = ((yes * 100 + total / 2) / total) as u32;
        (yes_pct, 100 - yes_pct)
    }

    pub fn status(&self, now_unix: i64) -> MarketStatus {
        if self.resolved {
            MarketStatus::Resolved
        } else if now_unix >= self.end_time {
            MarketStatus::Ended
        } else {
            MarketStatus::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    Active,
    Ended,
    Resolved,
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketStatus::Active => write!(f, "active"),
            MarketStatus::Ended => write!(f, "ended"),
            MarketStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// A cached bet. The transaction hash is globally unique and serves as the
/// idempotency key; one logical bet per (market, user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetRecord {
    pub id: i64,
    pub transaction_hash: String,
    pub market_id: String,
    pub user_address: String,
    /// 0 = NO, 1 = YES
    pub outcome: u8,
    pub amount: u128,
    pub claimed: bool,
    pub payout: Option<u128>,
    /// Unix seconds at which the bet was observed
    pub timestamp: i64,
}

/// A user's bet as read directly from the contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBet {
    pub amount: u128,
    pub outcome: u8,
    pub claimed: bool,
}

/// A decoded contract event, tagged with its transaction hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    MarketCreated {
        market_id: u64,
        question: String,
        end_time: i64,
        creator: String,
        tx_hash: String,
    },
    BetPlaced {
        market_id: u64,
        user: String,
        outcome: u8,
        amount: u128,
        tx_hash: String,
    },
    MarketResolved {
        market_id: u64,
        winning_outcome: u8,
        tx_hash: String,
    },
    PayoutClaimed {
        market_id: u64,
        user: String,
        payout: u128,
        tx_hash: String,
    },
}

impl ChainEvent {
    pub fn market_id(&self) -> u64 {
        match self {
            ChainEvent::MarketCreated { market_id, .. }
            | ChainEvent::BetPlaced { market_id, .. }
            | ChainEvent::MarketResolved { market_id, .. }
            | ChainEvent::PayoutClaimed { market_id, .. } => *market_id,
        }
    }

    pub fn tx_hash(&self) -> &str {
        match self {
            ChainEvent::MarketCreated { tx_hash, .. }
            | ChainEvent::BetPlaced { tx_hash, .. }
            | ChainEvent::MarketResolved { tx_hash, .. }
            | ChainEvent::PayoutClaimed { tx_hash, .. } => tx_hash,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::MarketCreated { .. } => "MarketCreated",
            ChainEvent::BetPlaced { .. } => "BetPlaced",
            ChainEvent::MarketResolved { .. } => "MarketResolved",
            ChainEvent::PayoutClaimed { .. } => "PayoutClaimed",
        }
    }
}

/// Result of a forced synchronization, returned instead of raised so an
/// external trigger can surface it directly.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub synced_count: usize,
    pub removed_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Per-process reconciliation counters, reset on restart
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub last_sync_duration_ms: u64,
}

/// Scheduler status as exposed to the admin layer
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub sync_interval_seconds: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub stats: SyncStats,
}
