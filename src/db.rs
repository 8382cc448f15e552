//! SQLite cache for markets and bets
//!
//! The cache mirrors chain state; every write path here is idempotent so
//! the event listener, block scanner, and reconciler can all hit the same
//! rows without coordination.

use crate::types::{BetRecord, MarketSnapshot};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::info;

/// A bet observed on-chain, ready for insertion
#[derive(Debug, Clone)]
pub struct NewBet {
    pub transaction_hash: String,
    pub market_id: String,
    pub user_address: String,
    pub outcome: u8,
    pub amount: u128,
    pub timestamp: i64,
}

/// What an upsert did to the market row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// One reconciliation pass over the whole cache
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: Vec<String>,
}

impl ReconcileSummary {
    pub fn synced_count(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the cache database at the given path
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// In-memory database on a single connection, for tests and one-shots
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                end_time INTEGER NOT NULL,
                creator TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                winning_outcome INTEGER,
                total_liquidity TEXT NOT NULL DEFAULT '0',
                outcome_a_shares TEXT NOT NULL DEFAULT '0',
                outcome_b_shares TEXT NOT NULL DEFAULT '0',
                yes_pool TEXT NOT NULL DEFAULT '0',
                no_pool TEXT NOT NULL DEFAULT '0',
                last_updated TEXT NOT NULL,
                indexed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transaction_hash TEXT NOT NULL UNIQUE,
                market_id TEXT NOT NULL,
                user_address TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                amount TEXT NOT NULL,
                claimed INTEGER NOT NULL DEFAULT 0,
                payout TEXT,
                timestamp INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (market_id) REFERENCES markets(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bets_market ON bets(market_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bets_market_user ON bets(market_id, user_address)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_markets_resolved ON markets(resolved)")
            .execute(&self.pool)
            .await?;

        info!("Database initialized");
        Ok(())
    }

    // ==================== MARKETS ====================

    pub async fn get_market(&self, market_id: &str) -> Result<Option<MarketSnapshot>> {
        let mut conn = self.pool.acquire().await?;
        fetch_market(&mut conn, market_id).await
    }

    pub async fn market_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM markets")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    /// Insert or update one market, preserving resolution monotonicity
    pub async fn upsert_market(&self, market: &MarketSnapshot) -> Result<UpsertOutcome> {
        let mut conn = self.pool.acquire().await?;
        upsert_market_inner(&mut conn, market).await
    }

    /// Apply a creation event's fields to an existing row
    pub async fn update_market_created(
        &self,
        market_id: &str,
        question: &str,
        end_time: i64,
        creator: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE markets SET question = ?, end_time = ?, creator = ?, last_updated = ? WHERE id = ?",
        )
        .bind(question)
        .bind(end_time)
        .bind(creator)
        .bind(Utc::now().to_rfc3339())
        .bind(market_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a market resolved. Never un-resolves.
    pub async fn set_market_resolved(&self, market_id: &str, winning_outcome: u8) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE markets SET resolved = 1, winning_outcome = ?, last_updated = ? WHERE id = ?",
        )
        .bind(i64::from(winning_outcome))
        .bind(Utc::now().to_rfc3339())
        .bind(market_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reconcile the cache against a full chain enumeration in one
    /// transaction: upsert every chain market, then delete orphan rows.
    /// Dependent bets go with their market via cascading deletes.
    pub async fn reconcile(&self, markets: &[MarketSnapshot]) -> Result<ReconcileSummary> {
        let mut tx = self.pool.begin().await?;
        let mut summary = ReconcileSummary::default();

        let chain_ids: HashSet<String> = markets.iter().map(|m| m.id.clone()).collect();
        for market in markets {
            match upsert_market_inner(&mut *tx, market).await? {
                UpsertOutcome::Created => summary.created += 1,
                UpsertOutcome::Updated => summary.updated += 1,
                UpsertOutcome::Unchanged => summary.unchanged += 1,
            }
        }

        let rows = sqlx::query("SELECT id FROM markets")
            .fetch_all(&mut *tx)
            .await?;
        for row in rows {
            let id: String = row.get("id");
            if !chain_ids.contains(&id) {
                sqlx::query("DELETE FROM markets WHERE id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                summary.removed.push(id);
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    pub async fn count_markets(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM markets")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // ==================== BETS ====================

    /// Insert a bet keyed by transaction hash. Returns false when the hash
    /// was already recorded (the event is a replay, not an error).
    pub async fn insert_bet(&self, bet: &NewBet) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO bets (transaction_hash, market_id, user_address, outcome, amount, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(transaction_hash) DO NOTHING
            "#,
        )
        .bind(&bet.transaction_hash)
        .bind(&bet.market_id)
        .bind(&bet.user_address)
        .bind(i64::from(bet.outcome))
        .bind(bet.amount.to_string())
        .bind(bet.timestamp)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn bet_exists(&self, market_id: &str, user_address: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bets WHERE market_id = ? AND user_address = ?",
        )
        .bind(market_id)
        .bind(user_address)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    pub async fn get_bet(&self, market_id: &str, user_address: &str) -> Result<Option<BetRecord>> {
        let row = sqlx::query("SELECT * FROM bets WHERE market_id = ? AND user_address = ?")
            .bind(market_id)
            .bind(user_address)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_bet(&r)).transpose()
    }

    /// Mark a bet claimed and record the payout. Returns false when no
    /// unclaimed bet matches (replay or unknown claim).
    pub async fn mark_bet_claimed(
        &self,
        market_id: &str,
        user_address: &str,
        payout: u128,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE bets SET claimed = 1, payout = ? WHERE market_id = ? AND user_address = ? AND claimed = 0",
        )
        .bind(payout.to_string())
        .bind(market_id)
        .bind(user_address)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_bets(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bets")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

async fn fetch_market(
    conn: &mut SqliteConnection,
    market_id: &str,
) -> Result<Option<MarketSnapshot>> {
    let row = sqlx::query("SELECT * FROM markets WHERE id = ?")
        .bind(market_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| row_to_market(&r)).transpose()
}

async fn upsert_market_inner(
    conn: &mut SqliteConnection,
    market: &MarketSnapshot,
) -> Result<UpsertOutcome> {
    let existing = fetch_market(conn, &market.id).await?;
    let now = Utc::now().to_rfc3339();

    match existing {
        None => {
            sqlx::query(
                r#"
                INSERT INTO markets (id, question, description, end_time, creator, resolved,
                                     winning_outcome, total_liquidity, outcome_a_shares,
                                     outcome_b_shares, yes_pool, no_pool, last_updated, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&market.id)
            .bind(&market.question)
            .bind(&market.description)
            .bind(market.end_time)
            .bind(&market.creator)
            .bind(market.resolved)
            .bind(market.winning_outcome.map(i64::from))
            .bind(market.total_liquidity.to_string())
            .bind(market.outcome_a_shares.to_string())
            .bind(market.outcome_b_shares.to_string())
            .bind(market.yes_pool.to_string())
            .bind(market.no_pool.to_string())
            .bind(&now)
            .bind(&now)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertOutcome::Created)
        }
        Some(existing) => {
            // resolution is monotonic: a stale unresolved payload must not
            // clear a resolved row
            let mut merged = market.clone();
            if existing.resolved && !merged.resolved {
                merged.resolved = true;
                merged.winning_outcome = existing.winning_outcome;
            }

            if merged == existing {
                return Ok(UpsertOutcome::Unchanged);
            }

            sqlx::query(
                r#"
                UPDATE markets SET question = ?, description = ?, end_time = ?, creator = ?,
                       resolved = ?, winning_outcome = ?, total_liquidity = ?,
                       outcome_a_shares = ?, outcome_b_shares = ?, yes_pool = ?, no_pool = ?,
                       last_updated = ?
                WHERE id = ?
                "#,
            )
            .bind(&merged.question)
            .bind(&merged.description)
            .bind(merged.end_time)
            .bind(&merged.creator)
            .bind(merged.resolved)
            .bind(merged.winning_outcome.map(i64::from))
            .bind(merged.total_liquidity.to_string())
            .bind(merged.outcome_a_shares.to_string())
            .bind(merged.outcome_b_shares.to_string())
            .bind(merged.yes_pool.to_string())
            .bind(merged.no_pool.to_string())
            .bind(&now)
            .bind(&merged.id)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertOutcome::Updated)
        }
    }
}

fn row_to_market(row: &sqlx::sqlite::SqliteRow) -> Result<MarketSnapshot> {
    let winning_outcome: Option<i64> = row.get("winning_outcome");
    let total_liquidity: String = row.get("total_liquidity");
    let outcome_a_shares: String = row.get("outcome_a_shares");
    let outcome_b_shares: String = row.get("outcome_b_shares");
    let yes_pool: String = row.get("yes_pool");
    let no_pool: String = row.get("no_pool");

    Ok(MarketSnapshot {
        id: row.get("id"),
        question: row.get("question"),
        description: row.get("description"),
        end_time: row.get("end_time"),
        creator: row.get("creator"),
        resolved: row.get("resolved"),
        winning_outcome: winning_outcome.map(|v| v as u8),
        total_liquidity: total_liquidity.parse().context("bad total_liquidity")?,
        outcome_a_shares: outcome_a_shares.parse().context("bad outcome_a_shares")?,
        outcome_b_shares: outcome_b_shares.parse().context("bad outcome_b_shares")?,
        yes_pool: yes_pool.parse().context("bad yes_pool")?,
        no_pool: no_pool.parse().context("bad no_pool")?,
    })
}

fn row_to_bet(row: &sqlx::sqlite::SqliteRow) -> Result<BetRecord> {
    let outcome: i64 = row.get("outcome");
    let amount: String = row.get("amount");
    let payout: Option<String> = row.get("payout");

    Ok(BetRecord {
        id: row.get("id"),
        transaction_hash: row.get("transaction_hash"),
        market_id: row.get("market_id"),
        user_address: row.get("user_address"),
        outcome: outcome as u8,
        amount: amount.parse().context("bad amount")?,
        claimed: row.get("claimed"),
        payout: payout.map(|p| p.parse().context("bad payout")).transpose()?,
        timestamp: row.get("timestamp"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(id: &str, resolved: bool) -> MarketSnapshot {
        MarketSnapshot {
            id: id.to_string(),
            question: format!("Question {}", id),
            description: String::new(),
            end_time: 1_900_000_000,
            creator: "0xaa".to_string(),
            resolved,
            winning_outcome: if resolved { Some(1) } else { None },
            total_liquidity: 1000,
            outcome_a_shares: 400,
            outcome_b_shares: 600,
            yes_pool: 700,
            no_pool: 300,
        }
    }

    fn bet(tx: &str, market_id: &str, user: &str) -> NewBet {
        NewBet {
            transaction_hash: tx.to_string(),
            market_id: market_id.to_string(),
            user_address: user.to_string(),
            outcome: 1,
            amount: 500,
            timestamp: 1_800_000_000,
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let db = Database::in_memory().await.unwrap();

        assert_eq!(
            db.upsert_market(&market("1", false)).await.unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            db.upsert_market(&market("1", false)).await.unwrap(),
            UpsertOutcome::Unchanged
        );

        let mut changed = market("1", false);
        changed.yes_pool = 900;
        assert_eq!(
            db.upsert_market(&changed).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(db.get_market("1").await.unwrap().unwrap().yes_pool, 900);
    }

    #[tokio::test]
    async fn resolved_flag_is_monotonic() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_market(&market("1", true)).await.unwrap();

        // a stale unresolved snapshot must not clear resolution
        db.upsert_market(&market("1", false)).await.unwrap();
        let cached = db.get_market("1").await.unwrap().unwrap();
        assert!(cached.resolved);
        assert_eq!(cached.winning_outcome, Some(1));
    }

    #[tokio::test]
    async fn bet_insert_is_idempotent_by_tx_hash() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_market(&market("1", false)).await.unwrap();

        assert!(db.insert_bet(&bet("0x01", "1", "0xuser")).await.unwrap());
        assert!(!db.insert_bet(&bet("0x01", "1", "0xuser")).await.unwrap());
        assert_eq!(db.count_bets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_marks_once() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_market(&market("1", true)).await.unwrap();
        db.insert_bet(&bet("0x01", "1", "0xuser")).await.unwrap();

        assert!(db.mark_bet_claimed("1", "0xuser", 950).await.unwrap());
        assert!(!db.mark_bet_claimed("1", "0xuser", 950).await.unwrap());

        let cached = db.get_bet("1", "0xuser").await.unwrap().unwrap();
        assert!(cached.claimed);
        assert_eq!(cached.payout, Some(950));
    }

    #[tokio::test]
    async fn file_backed_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();

        {
            let db = Database::new(path).await.unwrap();
            db.upsert_market(&market("1", false)).await.unwrap();
        }

        let db = Database::new(path).await.unwrap();
        let cached = db.get_market("1").await.unwrap().unwrap();
        assert_eq!(cached.question, "Question 1");
    }

    #[tokio::test]
    async fn reconcile_removes_orphans_and_their_bets() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_market(&market("1", false)).await.unwrap();
        db.upsert_market(&market("2", false)).await.unwrap();
        db.upsert_market(&market("3", false)).await.unwrap();
        db.insert_bet(&bet("0x01", "3", "0xuser")).await.unwrap();

        let summary = db
            .reconcile(&[market("1", false), market("2", false)])
            .await
            .unwrap();
        assert_eq!(summary.removed, vec!["3".to_string()]);
        assert_eq!(summary.unchanged, 2);

        let mut ids = db.market_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
        // cascade removed the dependent bet
        assert_eq!(db.count_bets().await.unwrap(), 0);
    }
}
