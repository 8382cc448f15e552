//! Event Stream Consumer
//!
//! Polls the contract's event filters on a fixed interval and applies each
//! entry to the cache through the shared idempotent path. A failed poll
//! lengthens the wait before the next cycle instead of killing the loop.

use super::apply::EventApplier;
use crate::chain::ChainReader;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EventListener {
    chain: Arc<dyn ChainReader>,
    applier: Arc<EventApplier>,
    poll_interval: Duration,
    error_backoff: Duration,
    running: AtomicBool,
    shutdown: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventListener {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        applier: Arc<EventApplier>,
        poll_interval: Duration,
        error_backoff: Duration,
    ) -> Self {
        Self {
            chain,
            applier,
            poll_interval,
            error_backoff,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the poll loop. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Event listener already running");
            return;
        }

        let listener = Arc::clone(self);
        let handle = tokio::spawn(async move { listener.run_loop().await });
        *self.handle.lock().await = Some(handle);
        info!("Event listener started");
    }

    /// Cooperative stop: the in-flight cycle finishes; waiting is bounded.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("Event listener did not stop in time, leaving cycle to finish");
            }
        }
        info!("Event listener stopped");
    }

    async fn run_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let wait = match self.run_cycle().await {
                Ok(applied) => {
                    if applied > 0 {
                        debug!("Applied {} chain events", applied);
                    }
                    self.poll_interval
                }
                Err(e) => {
                    error!("Event poll failed: {}", e);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One poll-and-apply pass. A single event's failure is contained; the
    /// remaining entries still apply.
    pub(crate) async fn run_cycle(&self) -> Result<usize> {
        let events = self.chain.poll_events().await?;
        let mut applied = 0;

        for event in &events {
            match self.applier.apply(event).await {
                Ok(outcome) => {
                    debug!("{} in tx {}: {:?}", event.kind(), event.tx_hash(), outcome);
                    applied += 1;
                }
                Err(e) => {
                    error!(
                        "Failed to apply {} event in tx {}: {}",
                        event.kind(),
                        event.tx_hash(),
                        e
                    );
                }
            }
        }

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainReader;
    use crate::db::Database;
    use crate::types::{ChainEvent, MarketSnapshot};

    fn snapshot(id: u64) -> MarketSnapshot {
        MarketSnapshot {
            id: id.to_string(),
            question: format!("Question {}", id),
            description: String::new(),
            end_time: 1_900_000_000,
            creator: "0xaa".to_string(),
            resolved: false,
            winning_outcome: None,
            total_liquidity: 0,
            outcome_a_shares: 0,
            outcome_b_shares: 0,
            yes_pool: 0,
            no_pool: 0,
        }
    }

    async fn listener_with(
        chain: Arc<MockChainReader>,
    ) -> (Arc<Database>, Arc<EventListener>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let reader: Arc<dyn ChainReader> = chain.clone();
        let applier = Arc::new(EventApplier::new(Arc::clone(&db), reader));
        let listener = Arc::new(EventListener::new(
            chain,
            applier,
            Duration::from_secs(10),
            Duration::from_secs(30),
        ));
        (db, listener)
    }

    #[tokio::test]
    async fn cycle_applies_batch_and_continues_past_skips() {
        let chain = Arc::new(MockChainReader::with_markets(vec![snapshot(1)]));
        chain.push_events(vec![
            // bet for an uncached market: skipped, not fatal
            ChainEvent::BetPlaced {
                market_id: 42,
                user: "0xuser".to_string(),
                outcome: 0,
                amount: 10,
                tx_hash: "0xaaa".to_string(),
            },
            ChainEvent::MarketCreated {
                market_id: 1,
                question: "Question 1".to_string(),
                end_time: 1_900_000_000,
                creator: "0xaa".to_string(),
                tx_hash: "0xbbb".to_string(),
            },
            ChainEvent::BetPlaced {
                market_id: 1,
                user: "0xuser".to_string(),
                outcome: 1,
                amount: 25,
                tx_hash: "0xccc".to_string(),
            },
        ]);

        let (db, listener) = listener_with(chain).await;
        assert_eq!(listener.run_cycle().await.unwrap(), 3);
        assert_eq!(db.count_markets().await.unwrap(), 1);
        assert_eq!(db.count_bets().await.unwrap(), 1);

        // queue drained; next cycle is quiet
        assert_eq!(listener.run_cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cycle_propagates_total_poll_failure() {
        let chain = Arc::new(MockChainReader::new());
        chain.fail_all.store(true, Ordering::SeqCst);
        let (_db, listener) = listener_with(chain).await;
        assert!(listener.run_cycle().await.is_err());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins() {
        let chain = Arc::new(MockChainReader::new());
        let (_db, listener) = listener_with(chain).await;

        listener.start().await;
        listener.start().await;
        assert!(listener.is_running());

        listener.stop().await;
        assert!(!listener.is_running());
        // a second stop is harmless
        listener.stop().await;
    }
}
