//! Reconciler / Scheduler
//!
//! The authoritative convergence path: on each cycle the complete market
//! set is re-fetched from the chain, upserted into the cache, and rows no
//! longer present on-chain are deleted. This is the sole source of truth
//! for "does this market still exist".

use crate::chain::ChainReader;
use crate::db::{Database, ReconcileSummary};
use crate::types::{SchedulerStatus, SyncReport, SyncStats};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Floor below which the interval cannot be configured, preventing
/// pathological tight loops against the provider
pub const MIN_SYNC_INTERVAL_SECS: u64 = 60;

/// Wait after a failed cycle, shorter than the normal interval so a
/// transient failure recovers quickly
pub const ERROR_RETRY_SECS: u64 = 60;

#[derive(Default)]
struct StatsInner {
    stats: SyncStats,
    last_sync_time: Option<DateTime<Utc>>,
}

pub struct SyncScheduler {
    db: Arc<Database>,
    chain: Arc<dyn ChainReader>,
    interval_secs: AtomicU64,
    running: AtomicBool,
    shutdown: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
    inner: Mutex<StatsInner>,
}

impl SyncScheduler {
    pub fn new(db: Arc<Database>, chain: Arc<dyn ChainReader>, interval: Duration) -> Self {
        let secs = interval.as_secs().max(MIN_SYNC_INTERVAL_SECS);
        Self {
            db,
            chain,
            interval_secs: AtomicU64::new(secs),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            handle: Mutex::new(None),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.load(Ordering::SeqCst))
    }

    pub fn set_sync_interval(&self, interval_secs: u64) -> Result<()> {
        if interval_secs < MIN_SYNC_INTERVAL_SECS {
            bail!(
                "Sync interval must be at least {} seconds",
                MIN_SYNC_INTERVAL_SECS
            );
        }
        self.interval_secs.store(interval_secs, Ordering::SeqCst);
        info!("Sync interval set to {} seconds", interval_secs);
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Sync scheduler already running");
            return;
        }

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run_loop().await });
        *self.handle.lock().await = Some(handle);
        info!("Sync scheduler started");
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("Sync scheduler did not stop in time, leaving cycle to finish");
            }
        }
        info!("Sync scheduler stopped");
    }

    async fn run_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            let result = self.run_cycle().await;
            let duration = started.elapsed();
            self.record_cycle(&result, duration).await;

            let wait = match result {
                Ok(summary) => {
                    info!(
                        "Sync completed in {:.2}s ({} markets, {} removed)",
                        duration.as_secs_f64(),
                        summary.synced_count(),
                        summary.removed.len()
                    );
                    self.sync_interval()
                }
                Err(e) => {
                    error!("Sync cycle failed: {}", e);
                    Duration::from_secs(ERROR_RETRY_SECS)
                }
            };

            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One full reconciliation pass, committed as a single transaction.
    pub(crate) async fn run_cycle(&self) -> Result<ReconcileSummary> {
        let markets = self.chain.fetch_all_markets().await?;
        let summary = self.db.reconcile(&markets).await?;
        for id in &summary.removed {
            info!("Removed orphaned market {}", id);
        }
        Ok(summary)
    }

    /// Synchronous on-demand sync returning a structured report instead of
    /// propagating, so an external trigger can surface it directly.
    pub async fn force_sync(&self) -> SyncReport {
        info!("Starting forced sync");
        let started = Instant::now();
        let result = self.run_cycle().await;
        let duration = started.elapsed();
        self.record_cycle(&result, duration).await;

        match result {
            Ok(summary) => SyncReport {
                success: true,
                synced_count: summary.synced_count(),
                removed_count: summary.removed.len(),
                error: None,
                duration_ms: duration.as_millis() as u64,
            },
            Err(e) => {
                error!("Forced sync failed: {}", e);
                SyncReport {
                    success: false,
                    synced_count: 0,
                    removed_count: 0,
                    error: Some(e.to_string()),
                    duration_ms: duration.as_millis() as u64,
                }
            }
        }
    }

    pub async fn get_stats(&self) -> SchedulerStatus {
        let inner = self.inner.lock().await;
        SchedulerStatus {
            is_running: self.is_running(),
            sync_interval_seconds: self.interval_secs.load(Ordering::SeqCst),
            last_sync_time: inner.last_sync_time,
            stats: inner.stats.clone(),
        }
    }

    async fn record_cycle(&self, result: &Result<ReconcileSummary>, duration: Duration) {
        let mut inner = self.inner.lock().await;
        inner.stats.total_syncs += 1;
        match result {
            Ok(_) => inner.stats.successful_syncs += 1,
            Err(_) => inner.stats.failed_syncs += 1,
        }
        inner.stats.last_sync_duration_ms = duration.as_millis() as u64;
        inner.last_sync_time = Some(Utc::now());
    }
}
