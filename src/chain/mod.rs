//! Read-only access to the deployed prediction market contract
//!
//! Everything the sync layer learns from the chain flows through the
//! [`ChainReader`] trait: single-market fetches, full sequential-id
//! enumeration, event filter polling, and block walking. The production
//! implementation speaks raw JSON-RPC; tests swap in a scripted reader.

pub mod abi;

use crate::types::{ChainEvent, MarketSnapshot, UserBet};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Decode(String),
    #[error("invalid contract address: {0}")]
    InvalidAddress(String),
}

/// Read-only view of the market contract
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Fetch one market's full state; None when the id was never assigned
    async fn get_market(&self, market_id: u64) -> Result<Option<MarketSnapshot>, ChainError>;

    /// Enumerate every market by sequential id scan
    async fn fetch_all_markets(&self) -> Result<Vec<MarketSnapshot>, ChainError>;

    /// Read a user's bet directly from contract storage
    async fn get_user_bet(
        &self,
        market_id: u64,
        user_address: &str,
    ) -> Result<Option<UserBet>, ChainError>;

    /// Drain new entries from the four installed event filters
    async fn poll_events(&self) -> Result<Vec<ChainEvent>, ChainError>;

    /// Current chain head
    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// Re-derive BetPlaced events from one block's transaction receipts
    async fn bet_events_in_block(&self, block: u64) -> Result<Vec<ChainEvent>, ChainError>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct BlockTransaction {
    hash: String,
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockWithTransactions {
    #[serde(default)]
    transactions: Vec<BlockTransaction>,
}

#[derive(Debug, Deserialize)]
struct TransactionReceipt {
    #[serde(default)]
    logs: Vec<abi::RawLog>,
}

/// Per-topic event filter registry. Filters are installed lazily from
/// "latest" and re-installed when the provider forgets them.
#[derive(Default)]
struct FilterIds {
    created: Option<String>,
    bet_placed: Option<String>,
    resolved: Option<String>,
    payout_claimed: Option<String>,
}

impl FilterIds {
    fn slot(&mut self, topic: &str) -> &mut Option<String> {
        match topic {
            abi::TOPIC_MARKET_CREATED => &mut self.created,
            abi::TOPIC_BET_PLACED => &mut self.bet_placed,
            abi::TOPIC_MARKET_RESOLVED => &mut self.resolved,
            _ => &mut self.payout_claimed,
        }
    }
}

/// JSON-RPC chain reader against a deployed contract
pub struct RpcChainReader {
    client: reqwest::Client,
    rpc_url: String,
    contract_address: String,
    filters: Mutex<FilterIds>,
}

impl RpcChainReader {
    pub fn new(rpc_url: &str, contract_address: &str) -> Result<Self, ChainError> {
        let stripped = contract_address.trim_start_matches("0x");
        if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChainError::InvalidAddress(contract_address.to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            contract_address: format!("0x{}", stripped.to_lowercase()),
            filters: Mutex::new(FilterIds::default()),
        })
    }

    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response: JsonRpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        response
            .result
            .ok_or_else(|| ChainError::Decode("missing result field".to_string()))
    }

    async fn eth_call(&self, data: String) -> Result<String, ChainError> {
        let result = self
            .rpc(
                "eth_call",
                json!([{ "to": self.contract_address, "data": data }, "latest"]),
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::Decode("eth_call result is not a string".to_string()))
    }

    async fn next_market_id(&self) -> Result<u64, ChainError> {
        let raw = self.eth_call(abi::SEL_NEXT_MARKET_ID.to_string()).await?;
        abi::Words::parse(&raw)?.uint64(0)
    }

    async fn install_filter(&self, topic: &str) -> Result<String, ChainError> {
        let result = self
            .rpc(
                "eth_newFilter",
                json!([{
                    "address": self.contract_address,
                    "topics": [topic],
                    "fromBlock": "latest"
                }]),
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::Decode("filter id is not a string".to_string()))
    }

    async fn ensure_filter(&self, topic: &str) -> Result<String, ChainError> {
        let mut filters = self.filters.lock().await;
        if let Some(id) = filters.slot(topic).as_ref() {
            return Ok(id.clone());
        }
        let id = self.install_filter(topic).await?;
        debug!("Installed event filter {} for topic {}", id, topic);
        *filters.slot(topic) = Some(id.clone());
        Ok(id)
    }

    async fn filter_changes(&self, filter_id: &str) -> Result<Vec<abi::RawLog>, ChainError> {
        let result = self
            .rpc("eth_getFilterChanges", json!([filter_id]))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ChainError::Decode(format!("bad filter changes payload: {}", e)))
    }

    /// Drain one topic's filter, re-installing it once if the provider has
    /// expired it ("filter not found").
    async fn drain_topic(&self, topic: &str) -> Result<Vec<abi::RawLog>, ChainError> {
        let filter_id = self.ensure_filter(topic).await?;
        match self.filter_changes(&filter_id).await {
            Ok(logs) => Ok(logs),
            Err(ChainError::Rpc { message, .. })
                if message.to_lowercase().contains("filter not found") =>
            {
                self.filters.lock().await.slot(topic).take();
                let filter_id = self.ensure_filter(topic).await?;
                self.filter_changes(&filter_id).await
            }
            Err(e) => Err(e),
        }
    }
}

const EVENT_TOPICS: [&str; 4] = [
    abi::TOPIC_MARKET_CREATED,
    abi::TOPIC_BET_PLACED,
    abi::TOPIC_MARKET_RESOLVED,
    abi::TOPIC_PAYOUT_CLAIMED,
];

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn get_market(&self, market_id: u64) -> Result<Option<MarketSnapshot>, ChainError> {
        let data = format!("{}{}", abi::SEL_MARKETS, abi::uint_arg(market_id));
        let raw = self.eth_call(data).await?;
        abi::decode_market(market_id, &raw)
    }

    async fn fetch_all_markets(&self) -> Result<Vec<MarketSnapshot>, ChainError> {
        let next_id = self.next_market_id().await?;
        let mut markets = Vec::new();

        for market_id in 0..next_id {
            match self.get_market(market_id).await {
                Ok(Some(market)) => markets.push(market),
                Ok(None) => {}
                // one bad id must not sink the enumeration
                Err(e) => warn!("Failed to fetch market {}: {}", market_id, e),
            }
        }

        Ok(markets)
    }

    async fn get_user_bet(
        &self,
        market_id: u64,
        user_address: &str,
    ) -> Result<Option<UserBet>, ChainError> {
        let data = format!(
            "{}{}{}",
            abi::SEL_BETS,
            abi::uint_arg(market_id),
            abi::address_arg(user_address)?
        );
        let raw = self.eth_call(data).await?;
        abi::decode_bet(&raw)
    }

    async fn poll_events(&self) -> Result<Vec<ChainEvent>, ChainError> {
        let mut events = Vec::new();
        let mut first_error = None;
        let mut failed_topics = 0;

        for topic in EVENT_TOPICS {
            match self.drain_topic(topic).await {
                Ok(logs) => {
                    for log in logs {
                        match abi::decode_log(&log) {
                            Ok(Some(event)) => events.push(event),
                            Ok(None) => {}
                            Err(e) => {
                                warn!("Skipping undecodable log in tx {}: {}", log.transaction_hash, e)
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to poll topic {}: {}", topic, e);
                    failed_topics += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        // partial topic failures still deliver what arrived; a total outage
        // propagates so the caller backs off
        if failed_topics == EVENT_TOPICS.len() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(events)
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        let result = self.rpc("eth_blockNumber", json!([])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| ChainError::Decode("block number is not a string".to_string()))?;
        abi::parse_quantity(raw)
    }

    async fn bet_events_in_block(&self, block: u64) -> Result<Vec<ChainEvent>, ChainError> {
        let result = self
            .rpc(
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", block), true]),
            )
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        let block_body: BlockWithTransactions = serde_json::from_value(result)
            .map_err(|e| ChainError::Decode(format!("bad block payload: {}", e)))?;

        let mut events = Vec::new();
        for tx in block_body.transactions {
            let addressed_here = tx
                .to
                .as_deref()
                .map(|to| to.eq_ignore_ascii_case(&self.contract_address))
                .unwrap_or(false);
            if !addressed_here {
                continue;
            }

            let receipt = self
                .rpc("eth_getTransactionReceipt", json!([tx.hash]))
                .await?;
            if receipt.is_null() {
                continue;
            }
            let receipt: TransactionReceipt = serde_json::from_value(receipt)
                .map_err(|e| ChainError::Decode(format!("bad receipt payload: {}", e)))?;

            for log in receipt.logs {
                if !log.address.eq_ignore_ascii_case(&self.contract_address) {
                    continue;
                }
                let is_bet = log
                    .topics
                    .first()
                    .map(|t| t.eq_ignore_ascii_case(abi::TOPIC_BET_PLACED))
                    .unwrap_or(false);
                if !is_bet {
                    continue;
                }
                match abi::decode_log(&log) {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(e) => warn!(
                        "Skipping undecodable bet log in tx {}: {}",
                        log.transaction_hash, e
                    ),
                }
            }
        }

        Ok(events)
    }
}
