//! Block Scanner
//!
//! Defense-in-depth recovery path: walks raw blocks from a bounded backfill
//! point to the chain head and re-derives bet events from transaction
//! receipts, feeding them through the same idempotent apply path as the
//! live filters. Catches entries the filters missed, e.g. after a restart.

use super::apply::EventApplier;
use crate::chain::ChainReader;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How far behind the head the first cycle starts. This is a bounded
/// backfill, never a full replay.
pub const BACKFILL_BLOCKS: u64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    pub is_running: bool,
    pub last_processed_block: Option<u64>,
    pub processed_transactions: usize,
}

pub struct BlockScanner {
    chain: Arc<dyn ChainReader>,
    applier: Arc<EventApplier>,
    scan_interval: Duration,
    error_backoff: Duration,
    running: AtomicBool,
    shutdown: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
    // status mirrors of the loop-local cursor and seen set
    last_processed_block: AtomicU64,
    has_cursor: AtomicBool,
    processed_transactions: AtomicUsize,
}

impl BlockScanner {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        applier: Arc<EventApplier>,
        scan_interval: Duration,
        error_backoff: Duration,
    ) -> Self {
        Self {
            chain,
            applier,
            scan_interval,
            error_backoff,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            handle: Mutex::new(None),
            last_processed_block: AtomicU64::new(0),
            has_cursor: AtomicBool::new(false),
            processed_transactions: AtomicUsize::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ScannerStatus {
        ScannerStatus {
            is_running: self.is_running(),
            last_processed_block: self
                .has_cursor
                .load(Ordering::SeqCst)
                .then(|| self.last_processed_block.load(Ordering::SeqCst)),
            processed_transactions: self.processed_transactions.load(Ordering::SeqCst),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Block scanner already running");
            return;
        }

        let scanner = Arc::clone(self);
        let handle = tokio::spawn(async move { scanner.run_loop().await });
        *self.handle.lock().await = Some(handle);
        info!("Block scanner started");
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("Block scanner did not stop in time, leaving cycle to finish");
            }
        }
        info!("Block scanner stopped");
    }

    async fn run_loop(&self) {
        // cursor and dedup set are process-local; a restart re-seeds from
        // head minus the backfill window
        let mut cursor: Option<u64> = None;
        let mut seen: HashSet<String> = HashSet::new();

        while self.running.load(Ordering::SeqCst) {
            let wait = match self.scan_once(&mut cursor, &mut seen).await {
                Ok(_) => self.scan_interval,
                Err(e) => {
                    error!("Block scan failed: {}", e);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Walk cursor+1..=head. A single block's error is logged and the walk
    /// continues; the cursor advances to head regardless, because the
    /// reconciler's full re-fetch backstops market state.
    pub(crate) async fn scan_once(
        &self,
        cursor: &mut Option<u64>,
        seen: &mut HashSet<String>,
    ) -> Result<u64> {
        let head = self.chain.latest_block().await?;
        let from = cursor.unwrap_or_else(|| head.saturating_sub(BACKFILL_BLOCKS));

        for block in (from + 1)..=head {
            match self.chain.bet_events_in_block(block).await {
                Ok(events) => {
                    for event in events {
                        if seen.contains(event.tx_hash()) {
                            continue;
                        }
                        match self.applier.apply(&event).await {
                            Ok(outcome) => {
                                debug!(
                                    "Block {}: {} in tx {}: {:?}",
                                    block,
                                    event.kind(),
                                    event.tx_hash(),
                                    outcome
                                );
                                seen.insert(event.tx_hash().to_string());
                                self.processed_transactions.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) => {
                                error!("Failed to apply bet from tx {}: {}", event.tx_hash(), e)
                            }
                        }
                    }
                }
                Err(e) => warn!("Error processing block {}: {}", block, e),
            }
        }

        *cursor = Some(head);
        self.last_processed_block.store(head, Ordering::SeqCst);
        self.has_cursor.store(true, Ordering::SeqCst);
        Ok(head)
    }
}
