//! Chain-to-Cache Synchronization Engine
//!
//! Mirrors the state of an on-chain prediction market contract into a
//! local SQLite cache through three cooperating paths:
//!
//! 1. **Event Listener**: polls chain log filters for contract events and
//!    applies them incrementally for low-latency updates.
//! 2. **Block Scanner**: walks recent blocks transaction-by-transaction as
//!    a safety net for events the filters dropped.
//! 3. **Sync Scheduler**: periodically re-fetches the full market set and
//!    reconciles the cache against it, the authoritative convergence path.
//!
//! A rate-limited feed client wraps the external market-data API behind
//! request budgets, caching, and retry with backoff.

pub mod chain;
pub mod config;
pub mod db;
pub mod services;
pub mod types;

pub use chain::{ChainError, ChainReader, RpcChainReader};
pub use config::Config;
pub use db::Database;
pub use services::{
    BlockScanner, EventApplier, EventListener, FeedConfig, RateLimitedClient, SyncScheduler,
};
pub use types::{BetRecord, ChainEvent, MarketSnapshot, MarketStatus, SyncReport, UserBet};
