//! Minimal ABI plumbing for the prediction market contract
//!
//! Hand-rolled 32-byte-word encoding/decoding for the three view functions
//! and four event topics the sync layer consumes. Dynamic strings use the
//! standard offset/length head-tail layout.

use super::ChainError;
use crate::types::{ChainEvent, MarketSnapshot, UserBet};
use serde::Deserialize;

// keccak-256 selectors for the contract's view functions
pub const SEL_NEXT_MARKET_ID: &str = "0x406ef2ef";
pub const SEL_MARKETS: &str = "0xb1283e77";
pub const SEL_BETS: &str = "0xf644b3bb";

// keccak-256 topic hashes for the contract's events
pub const TOPIC_MARKET_CREATED: &str =
    "0x57d0d124b72f81ed1da0dc728fc33db342705974792928796f6577b8db5c3d53";
pub const TOPIC_BET_PLACED: &str =
    "0x4f1eed5e863a822b0f9eb960dfdab2cc5a99beec4b191f2a7a9c7e28e5a15524";
pub const TOPIC_MARKET_RESOLVED: &str =
    "0x739f283563fb51ab6b89ee95d937b2e63a6cfcb83c385dbebb629f9d97bd43e6";
pub const TOPIC_PAYOUT_CLAIMED: &str =
    "0xe97cee5a4c0549d3fdc81e322b718ddf0aeb3418ec87dce4f9a7fb28d117c312";

/// Encode a uint256 argument as 64 hex chars
pub fn uint_arg(value: u64) -> String {
    format!("{:064x}", value)
}

/// Encode an address argument, left-padded to 32 bytes
pub fn address_arg(address: &str) -> Result<String, ChainError> {
    let stripped = address.trim_start_matches("0x");
    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ChainError::Decode(format!("invalid address: {}", address)));
    }
    Ok(format!("{:0>64}", stripped.to_lowercase()))
}

/// Parse a JSON-RPC quantity ("0x1a") into a u64
pub fn parse_quantity(hex_str: &str) -> Result<u64, ChainError> {
    let stripped = hex_str.trim_start_matches("0x");
    u64::from_str_radix(stripped, 16)
        .map_err(|_| ChainError::Decode(format!("invalid quantity: {}", hex_str)))
}

/// ABI return data split into 32-byte words
pub struct Words {
    data: Vec<u8>,
}

impl Words {
    pub fn parse(hex_str: &str) -> Result<Self, ChainError> {
        let data = hex::decode(hex_str.trim_start_matches("0x"))
            .map_err(|e| ChainError::Decode(format!("invalid hex payload: {}", e)))?;
        Ok(Self { data })
    }

    fn word(&self, index: usize) -> Result<&[u8], ChainError> {
        self.data
            .get(index * 32..(index + 1) * 32)
            .ok_or_else(|| ChainError::Decode(format!("word {} out of range", index)))
    }

    pub fn uint(&self, index: usize) -> Result<u128, ChainError> {
        let word = self.word(index)?;
        if word[..16].iter().any(|&b| b != 0) {
            return Err(ChainError::Decode(format!("uint at word {} overflows u128", index)));
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(&word[16..]);
        Ok(u128::from_be_bytes(buf))
    }

    pub fn uint64(&self, index: usize) -> Result<u64, ChainError> {
        let value = self.uint(index)?;
        u64::try_from(value)
            .map_err(|_| ChainError::Decode(format!("uint at word {} overflows u64", index)))
    }

    pub fn uint8(&self, index: usize) -> Result<u8, ChainError> {
        let value = self.uint(index)?;
        u8::try_from(value)
            .map_err(|_| ChainError::Decode(format!("uint at word {} overflows u8", index)))
    }

    pub fn boolean(&self, index: usize) -> Result<bool, ChainError> {
        Ok(self.uint(index)? != 0)
    }

    pub fn address(&self, index: usize) -> Result<String, ChainError> {
        let word = self.word(index)?;
        Ok(format!("0x{}", hex::encode(&word[12..])))
    }

    /// Decode a dynamic string whose offset lives in the given head word
    pub fn string(&self, head_index: usize) -> Result<String, ChainError> {
        let offset = self.uint64(head_index)? as usize;
        if offset % 32 != 0 {
            return Err(ChainError::Decode(format!("misaligned string offset {}", offset)));
        }
        let len_index = offset / 32;
        let len = self.uint64(len_index)? as usize;
        let start = (len_index + 1) * 32;
        let bytes = self
            .data
            .get(start..start + len)
            .ok_or_else(|| ChainError::Decode("string payload out of range".to_string()))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Decode the `markets(uint256)` tuple. Returns None for the default struct
/// the mapping yields when the id has never been assigned.
pub fn decode_market(market_id: u64, hex_str: &str) -> Result<Option<MarketSnapshot>, ChainError> {
    let words = Words::parse(hex_str)?;
    let question = words.string(0)?;
    let end_time = i64::try_from(words.uint64(2)?)
        .map_err(|_| ChainError::Decode("end_time overflows i64".to_string()))?;

    if question.is_empty() && end_time == 0 {
        return Ok(None);
    }

    let resolved = words.boolean(3)?;
    let winning = words.uint8(4)?;
    Ok(Some(MarketSnapshot {
        id: market_id.to_string(),
        question,
        description: words.string(1)?,
        end_time,
        creator: words.address(10)?,
        resolved,
        winning_outcome: if resolved { Some(winning) } else { None },
        total_liquidity: words.uint(5)?,
        outcome_a_shares: words.uint(6)?,
        outcome_b_shares: words.uint(7)?,
        yes_pool: words.uint(8)?,
        no_pool: words.uint(9)?,
    }))
}

/// Decode the `bets(uint256,address)` tuple. A zero amount means the user
/// never placed a bet on this market.
pub fn decode_bet(hex_str: &str) -> Result<Option<UserBet>, ChainError> {
    let words = Words::parse(hex_str)?;
    let amount = words.uint(0)?;
    if amount == 0 {
        return Ok(None);
    }
    Ok(Some(UserBet {
        amount,
        outcome: words.uint8(1)?,
        claimed: words.boolean(2)?,
    }))
}

/// A raw log entry as returned by `eth_getFilterChanges` / receipts
#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
}

fn topic_word(log: &RawLog, index: usize) -> Result<Words, ChainError> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| ChainError::Decode(format!("missing topic {}", index)))?;
    Words::parse(topic)
}

fn topic_u64(log: &RawLog, index: usize) -> Result<u64, ChainError> {
    topic_word(log, index)?.uint64(0)
}

fn topic_address(log: &RawLog, index: usize) -> Result<String, ChainError> {
    topic_word(log, index)?.address(0)
}

/// Decode a contract log into a ChainEvent. Logs with an unknown topic are
/// not an error; they decode to None and the caller moves on.
pub fn decode_log(log: &RawLog) -> Result<Option<ChainEvent>, ChainError> {
    let topic0 = match log.topics.first() {
        Some(t) => t.to_lowercase(),
        None => return Ok(None),
    };
    let tx_hash = log.transaction_hash.clone();

    let event = if topic0 == TOPIC_MARKET_CREATED {
        let data = Words::parse(&log.data)?;
        ChainEvent::MarketCreated {
            market_id: topic_u64(log, 1)?,
            creator: topic_address(log, 2)?,
            question: data.string(0)?,
            end_time: i64::try_from(data.uint64(1)?)
                .map_err(|_| ChainError::Decode("end_time overflows i64".to_string()))?,
            tx_hash,
        }
    } else if topic0 == TOPIC_BET_PLACED {
        let data = Words::parse(&log.data)?;
        ChainEvent::BetPlaced {
            market_id: topic_u64(log, 1)?,
            user: topic_address(log, 2)?,
            outcome: data.uint8(0)?,
            amount: data.uint(1)?,
            tx_hash,
        }
    } else if topic0 == TOPIC_MARKET_RESOLVED {
        let data = Words::parse(&log.data)?;
        ChainEvent::MarketResolved {
            market_id: topic_u64(log, 1)?,
            winning_outcome: data.uint8(0)?,
            tx_hash,
        }
    } else if topic0 == TOPIC_PAYOUT_CLAIMED {
        let data = Words::parse(&log.data)?;
        ChainEvent::PayoutClaimed {
            market_id: topic_u64(log, 1)?,
            user: topic_address(log, 2)?,
            payout: data.uint(0)?,
            tx_hash,
        }
    } else {
        return Ok(None);
    };

    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_uint(v: u128) -> String {
        format!("{:064x}", v)
    }

    fn word_string(s: &str) -> String {
        // length word plus right-padded payload
        let mut out = word_uint(s.len() as u128);
        let mut payload = hex::encode(s.as_bytes());
        while payload.len() % 64 != 0 {
            payload.push('0');
        }
        out.push_str(&payload);
        out
    }

    fn word_address(addr: &str) -> String {
        format!("{:0>64}", addr.trim_start_matches("0x"))
    }

    /// Build the 11-word markets() tuple with two trailing dynamic strings
    fn market_return(question: &str, description: &str, resolved: bool, winning: u8) -> String {
        let head_words = 11;
        let q_enc = word_string(question);
        let q_offset = head_words * 32;
        let d_offset = q_offset + q_enc.len() / 2;

        let mut out = String::from("0x");
        out.push_str(&word_uint(q_offset as u128)); // question offset
        out.push_str(&word_uint(d_offset as u128)); // description offset
        out.push_str(&word_uint(1_900_000_000)); // endTime
        out.push_str(&word_uint(u128::from(resolved))); // resolved
        out.push_str(&word_uint(u128::from(winning))); // winningOutcome
        out.push_str(&word_uint(1000)); // totalLiquidity
        out.push_str(&word_uint(400)); // outcomeAShares
        out.push_str(&word_uint(600)); // outcomeBShares
        out.push_str(&word_uint(700)); // yesPool
        out.push_str(&word_uint(300)); // noPool
        out.push_str(&word_address("0x00000000000000000000000000000000000000aa"));
        out.push_str(&q_enc);
        out.push_str(&word_string(description));
        out
    }

    #[test]
    fn decodes_market_tuple() {
        let hex_str = market_return("Will ETH flip BTC?", "desc", false, 1);
        let market = decode_market(7, &hex_str).unwrap().unwrap();
        assert_eq!(market.id, "7");
        assert_eq!(market.question, "Will ETH flip BTC?");
        assert_eq!(market.description, "desc");
        assert_eq!(market.end_time, 1_900_000_000);
        assert!(!market.resolved);
        // unresolved markets never carry a winning outcome
        assert_eq!(market.winning_outcome, None);
        assert_eq!(market.yes_pool, 700);
        assert_eq!(market.no_pool, 300);
        assert_eq!(market.creator, "0x00000000000000000000000000000000000000aa");
    }

    #[test]
    fn resolved_market_keeps_winning_outcome() {
        let hex_str = market_return("Done?", "", true, 1);
        let market = decode_market(3, &hex_str).unwrap().unwrap();
        assert!(market.resolved);
        assert_eq!(market.winning_outcome, Some(1));
    }

    #[test]
    fn default_struct_decodes_to_none() {
        let hex_str = market_return("", "", false, 0).replacen(
            &word_uint(1_900_000_000),
            &word_uint(0),
            1,
        );
        assert!(decode_market(99, &hex_str).unwrap().is_none());
    }

    #[test]
    fn decodes_bet_tuple() {
        let mut hex_str = String::from("0x");
        hex_str.push_str(&word_uint(500));
        hex_str.push_str(&word_uint(1));
        hex_str.push_str(&word_uint(0));
        let bet = decode_bet(&hex_str).unwrap().unwrap();
        assert_eq!(
            bet,
            UserBet {
                amount: 500,
                outcome: 1,
                claimed: false
            }
        );

        let empty = format!("0x{}{}{}", word_uint(0), word_uint(0), word_uint(0));
        assert!(decode_bet(&empty).unwrap().is_none());
    }

    fn log(topic0: &str, topics: Vec<String>, data: String) -> RawLog {
        let mut all = vec![topic0.to_string()];
        all.extend(topics);
        RawLog {
            address: "0xcontract".to_string(),
            topics: all,
            data,
            transaction_hash: "0xdeadbeef".to_string(),
        }
    }

    #[test]
    fn decodes_market_created_log() {
        let mut data = String::from("0x");
        data.push_str(&word_uint(64)); // question offset
        data.push_str(&word_uint(1_900_000_000)); // endTime
        data.push_str(&word_string("New market"));
        let raw = log(
            TOPIC_MARKET_CREATED,
            vec![
                format!("0x{}", word_uint(5)),
                format!("0x{}", word_address("0x00000000000000000000000000000000000000bb")),
            ],
            data,
        );
        let event = decode_log(&raw).unwrap().unwrap();
        assert_eq!(
            event,
            ChainEvent::MarketCreated {
                market_id: 5,
                question: "New market".to_string(),
                end_time: 1_900_000_000,
                creator: "0x00000000000000000000000000000000000000bb".to_string(),
                tx_hash: "0xdeadbeef".to_string(),
            }
        );
    }

    #[test]
    fn decodes_bet_placed_log() {
        let data = format!("0x{}{}", word_uint(1), word_uint(2500));
        let raw = log(
            TOPIC_BET_PLACED,
            vec![
                format!("0x{}", word_uint(5)),
                format!("0x{}", word_address("0x00000000000000000000000000000000000000cc")),
            ],
            data,
        );
        let event = decode_log(&raw).unwrap().unwrap();
        assert_eq!(
            event,
            ChainEvent::BetPlaced {
                market_id: 5,
                user: "0x00000000000000000000000000000000000000cc".to_string(),
                outcome: 1,
                amount: 2500,
                tx_hash: "0xdeadbeef".to_string(),
            }
        );
    }

    #[test]
    fn decodes_resolved_and_claimed_logs() {
        let raw = log(
            TOPIC_MARKET_RESOLVED,
            vec![format!("0x{}", word_uint(5))],
            format!("0x{}", word_uint(1)),
        );
        assert_eq!(
            decode_log(&raw).unwrap().unwrap(),
            ChainEvent::MarketResolved {
                market_id: 5,
                winning_outcome: 1,
                tx_hash: "0xdeadbeef".to_string(),
            }
        );

        let raw = log(
            TOPIC_PAYOUT_CLAIMED,
            vec![
                format!("0x{}", word_uint(5)),
                format!("0x{}", word_address("0x00000000000000000000000000000000000000cc")),
            ],
            format!("0x{}", word_uint(4200)),
        );
        assert_eq!(
            decode_log(&raw).unwrap().unwrap(),
            ChainEvent::PayoutClaimed {
                market_id: 5,
                user: "0x00000000000000000000000000000000000000cc".to_string(),
                payout: 4200,
                tx_hash: "0xdeadbeef".to_string(),
            }
        );
    }

    #[test]
    fn unknown_topic_decodes_to_none() {
        let raw = log(
            "0x0000000000000000000000000000000000000000000000000000000000000000",
            vec![],
            "0x".to_string(),
        );
        assert!(decode_log(&raw).unwrap().is_none());
    }

    #[test]
    fn encodes_call_arguments() {
        assert_eq!(uint_arg(255), format!("{:064x}", 255));
        let encoded = address_arg("0x00000000000000000000000000000000000000AA").unwrap();
        assert_eq!(
            encoded,
            "00000000000000000000000000000000000000000000000000000000000000aa"
        );
        assert!(address_arg("0x1234").is_err());
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
    }
}
