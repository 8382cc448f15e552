//! Background services for chain-to-cache synchronization

pub mod apply;
pub mod block_scanner;
pub mod event_listener;
pub mod feed;
pub mod feed_errors;
pub mod sync_scheduler;

pub use apply::{ApplyOutcome, EventApplier};
pub use block_scanner::{BlockScanner, ScannerStatus};
pub use event_listener::EventListener;
pub use feed::{FeedConfig, FeedTransport, RateLimitStatus, RateLimitedClient, ReqwestTransport};
pub use feed_errors::FeedError;
pub use sync_scheduler::{SyncScheduler, MIN_SYNC_INTERVAL_SECS};
