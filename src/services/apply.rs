//! Idempotent event application
//!
//! Both the live event listener and the block scanner funnel their events
//! through here, so replays and cross-path duplicates converge on the same
//! cache state.

use crate::chain::ChainReader;
use crate::db::{Database, NewBet};
use crate::types::ChainEvent;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What applying an event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new row was written
    Inserted,
    /// An existing row was mutated
    Updated,
    /// The event had already been applied; nothing changed
    AlreadyApplied,
    /// The referenced row is missing; logged and skipped, not fatal
    SkippedMissing,
}

/// Applies decoded chain events to the cache
pub struct EventApplier {
    db: Arc<Database>,
    chain: Arc<dyn ChainReader>,
}

impl EventApplier {
    pub fn new(db: Arc<Database>, chain: Arc<dyn ChainReader>) -> Self {
        Self { db, chain }
    }

    pub async fn apply(&self, event: &ChainEvent) -> Result<ApplyOutcome> {
        match event {
            ChainEvent::MarketCreated {
                market_id,
                question,
                end_time,
                creator,
                ..
            } => {
                self.apply_market_created(*market_id, question, *end_time, creator)
                    .await
            }
            ChainEvent::BetPlaced {
                market_id,
                user,
                outcome,
                amount,
                tx_hash,
            } => {
                self.apply_bet_placed(*market_id, user, *outcome, *amount, tx_hash)
                    .await
            }
            ChainEvent::MarketResolved {
                market_id,
                winning_outcome,
                ..
            } => self.apply_market_resolved(*market_id, *winning_outcome).await,
            ChainEvent::PayoutClaimed {
                market_id,
                user,
                payout,
                ..
            } => self.apply_payout_claimed(*market_id, user, *payout).await,
        }
    }

    async fn apply_market_created(
        &self,
        market_id: u64,
        question: &str,
        end_time: i64,
        creator: &str,
    ) -> Result<ApplyOutcome> {
        let id = market_id.to_string();

        if self.db.get_market(&id).await?.is_some() {
            self.db
                .update_market_created(&id, question, end_time, creator)
                .await?;
            debug!("Market {} already cached, refreshed creation fields", id);
            return Ok(ApplyOutcome::Updated);
        }

        // the event payload is partial; fetch the full snapshot so the new
        // row carries pools and share counts too
        match self.chain.get_market(market_id).await? {
            Some(snapshot) => {
                self.db.upsert_market(&snapshot).await?;
                info!("Cached new market {}: {}", id, snapshot.question);
                Ok(ApplyOutcome::Inserted)
            }
            None => {
                warn!("MarketCreated for {} but chain has no such market", id);
                Ok(ApplyOutcome::SkippedMissing)
            }
        }
    }

    async fn apply_bet_placed(
        &self,
        market_id: u64,
        user: &str,
        outcome: u8,
        amount: u128,
        tx_hash: &str,
    ) -> Result<ApplyOutcome> {
        let id = market_id.to_string();

        if self.db.bet_exists(&id, user).await? {
            debug!("Bet already recorded for market {}, user {}", id, user);
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        // the creation event may still be in flight; skip rather than block
        if self.db.get_market(&id).await?.is_none() {
            debug!("Market {} not yet cached, skipping bet {}", id, tx_hash);
            return Ok(ApplyOutcome::SkippedMissing);
        }

        let inserted = self
            .db
            .insert_bet(&NewBet {
                transaction_hash: tx_hash.to_string(),
                market_id: id.clone(),
                user_address: user.to_string(),
                outcome,
                amount,
                timestamp: Utc::now().timestamp(),
            })
            .await?;

        if inserted {
            info!("Recorded bet on market {} by {} for {}", id, user, amount);
            Ok(ApplyOutcome::Inserted)
        } else {
            Ok(ApplyOutcome::AlreadyApplied)
        }
    }

    async fn apply_market_resolved(
        &self,
        market_id: u64,
        winning_outcome: u8,
    ) -> Result<ApplyOutcome> {
        let id = market_id.to_string();

        match self.db.get_market(&id).await? {
            None => {
                warn!("MarketResolved for {} but market is not cached", id);
                Ok(ApplyOutcome::SkippedMissing)
            }
            Some(cached) if cached.resolved => {
                debug!("Market {} already resolved", id);
                Ok(ApplyOutcome::AlreadyApplied)
            }
            Some(_) => {
                self.db.set_market_resolved(&id, winning_outcome).await?;
                info!("Resolved market {} with outcome {}", id, winning_outcome);
                Ok(ApplyOutcome::Updated)
            }
        }
    }

    async fn apply_payout_claimed(
        &self,
        market_id: u64,
        user: &str,
        payout: u128,
    ) -> Result<ApplyOutcome> {
        let id = market_id.to_string();

        match self.db.get_bet(&id, user).await? {
            None => {
                warn!("PayoutClaimed for market {}, user {} but no bet cached", id, user);
                Ok(ApplyOutcome::SkippedMissing)
            }
            Some(bet) if bet.claimed => Ok(ApplyOutcome::AlreadyApplied),
            Some(_) => {
                self.db.mark_bet_claimed(&id, user, payout).await?;
                info!("Marked payout claimed on market {} by {}", id, user);
                Ok(ApplyOutcome::Updated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainReader;
    use crate::types::MarketSnapshot;

    fn snapshot(id: u64, resolved: bool) -> MarketSnapshot {
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

    async fn setup(chain_markets: Vec<MarketSnapshot>) -> (Arc<Database>, EventApplier) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let chain = Arc::new(MockChainReader::with_markets(chain_markets));
        let applier = EventApplier::new(Arc::clone(&db), chain);
        (db, applier)
    }

    #[tokio::test]
    async fn created_event_inserts_full_snapshot() {
        let (db, applier) = setup(vec![snapshot(5, false)]).await;

        let event = ChainEvent::MarketCreated {
            market_id: 5,
            question: "Question 5".to_string(),
            end_time: 1_900_000_000,
            creator: "0xaa".to_string(),
            tx_hash: "0x01".to_string(),
        };
        assert_eq!(applier.apply(&event).await.unwrap(), ApplyOutcome::Inserted);

        // insert came from the full chain fetch, not the event payload
        let cached = db.get_market("5").await.unwrap().unwrap();
        assert_eq!(cached.yes_pool, 700);

        // replaying the creation refreshes fields without duplicating
        assert_eq!(applier.apply(&event).await.unwrap(), ApplyOutcome::Updated);
        assert_eq!(db.count_markets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bet_event_is_idempotent() {
        let (db, applier) = setup(vec![snapshot(5, false)]).await;
        db.upsert_market(&snapshot(5, false)).await.unwrap();

        let event = ChainEvent::BetPlaced {
            market_id: 5,
            user: "0xuser".to_string(),
            outcome: 1,
            amount: 500,
            tx_hash: "0x02".to_string(),
        };
        assert_eq!(applier.apply(&event).await.unwrap(), ApplyOutcome::Inserted);
        assert_eq!(
            applier.apply(&event).await.unwrap(),
            ApplyOutcome::AlreadyApplied
        );
        assert_eq!(db.count_bets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bet_before_market_is_skipped_not_fatal() {
        let (db, applier) = setup(vec![]).await;

        let event = ChainEvent::BetPlaced {
            market_id: 9,
            user: "0xuser".to_string(),
            outcome: 0,
            amount: 100,
            tx_hash: "0x03".to_string(),
        };
        assert_eq!(
            applier.apply(&event).await.unwrap(),
            ApplyOutcome::SkippedMissing
        );
        assert_eq!(db.count_bets().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resolved_event_applies_once() {
        // market "5" cached unresolved; a resolved event with outcome 1
        // flips it exactly once
        let (db, applier) = setup(vec![snapshot(5, false)]).await;
        db.upsert_market(&snapshot(5, false)).await.unwrap();

        let event = ChainEvent::MarketResolved {
            market_id: 5,
            winning_outcome: 1,
            tx_hash: "0x04".to_string(),
        };
        assert_eq!(applier.apply(&event).await.unwrap(), ApplyOutcome::Updated);

        let cached = db.get_market("5").await.unwrap().unwrap();
        assert!(cached.resolved);
        assert_eq!(cached.winning_outcome, Some(1));

        // redelivery leaves the row unchanged
        assert_eq!(
            applier.apply(&event).await.unwrap(),
            ApplyOutcome::AlreadyApplied
        );
        let again = db.get_market("5").await.unwrap().unwrap();
        assert_eq!(again.winning_outcome, Some(1));
        assert!(again.resolved);
    }

    #[tokio::test]
    async fn payout_claim_updates_matching_bet() {
        let (db, applier) = setup(vec![snapshot(5, true)]).await;
        db.upsert_market(&snapshot(5, true)).await.unwrap();
        let bet = ChainEvent::BetPlaced {
            market_id: 5,
            user: "0xuser".to_string(),
            outcome: 1,
            amount: 500,
            tx_hash: "0x05".to_string(),
        };
        applier.apply(&bet).await.unwrap();

        let claim = ChainEvent::PayoutClaimed {
            market_id: 5,
            user: "0xuser".to_string(),
            payout: 950,
            tx_hash: "0x06".to_string(),
        };
        assert_eq!(applier.apply(&claim).await.unwrap(), ApplyOutcome::Updated);
        assert_eq!(
            applier.apply(&claim).await.unwrap(),
            ApplyOutcome::AlreadyApplied
        );

        let cached = db.get_bet("5", "0xuser").await.unwrap().unwrap();
        assert!(cached.claimed);
        assert_eq!(cached.payout, Some(950));
    }

    #[tokio::test]
    async fn claim_without_bet_is_skipped() {
        let (_db, applier) = setup(vec![]).await;
        let claim = ChainEvent::PayoutClaimed {
            market_id: 7,
            user: "0xghost".to_string(),
            payout: 10,
            tx_hash: "0x07".to_string(),
        };
        assert_eq!(
            applier.apply(&claim).await.unwrap(),
            ApplyOutcome::SkippedMissing
        );
    }
}
