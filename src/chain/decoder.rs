//! Fixed-layout decoder for exchange `OrderFilled` logs.
//!
//! Layout: `topics = [sig, orderHash, maker, taker]`, `data` = five 32-byte big-endian
//! words `(makerAssetId, takerAssetId, makerAmountFilled, takerAmountFilled, fee)`.

use num_bigint::BigUint;
use serde_json::Value;

use crate::config::ORDER_FILLED_TOPIC0;
use crate::types::DecodedLog;

const WORD_HEX: usize = 64;
const DATA_WORDS: usize = 5;

/// Decodes one raw log object. `None` for anything that is not a well-formed fill.
pub fn decode_order_filled(log: &Value) -> Option<DecodedLog> {
    let topics = log.get("topics")?.as_array()?;
    if topics.len() < 4 {
        return None;
    }
    if !topics[0].as_str()?.eq_ignore_ascii_case(ORDER_FILLED_TOPIC0) {
        return None;
    }

    let payload = log.get("data")?.as_str()?.strip_prefix("0x")?;
    if payload.len() < WORD_HEX * DATA_WORDS {
        return None;
    }

    let maker = topic_to_address(topics[2].as_str()?)?;
    let taker = topic_to_address(topics[3].as_str()?)?;

    Some(DecodedLog {
        address: lower_str(log, "address"),
        tx_hash: lower_str(log, "transactionHash"),
        block_number: log.get("blockNumber").map(parse_quantity).unwrap_or(0),
        log_index: log.get("logIndex").map(parse_quantity).unwrap_or(0),
        block_timestamp: log
            .get("blockTimestamp")
            .map(parse_quantity)
            .filter(|ts| *ts > 0),
        maker,
        taker,
        maker_asset_id: data_word(payload, 0)?,
        taker_asset_id: data_word(payload, 1)?,
        maker_amount_raw: data_word(payload, 2)?,
        taker_amount_raw: data_word(payload, 3)?,
        fee_raw: data_word(payload, 4)?,
    })
}

/// Low 20 bytes of a left-padded 32-byte topic, as `0x`-prefixed lowercase hex.
pub fn topic_to_address(topic: &str) -> Option<String> {
    let clean = topic.trim();
    let clean = clean.strip_prefix("0x").unwrap_or(clean);
    if clean.len() != WORD_HEX || !clean.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", clean[24..].to_ascii_lowercase()))
}

/// Inverse of `topic_to_address`, for indexed-topic filters.
pub fn address_to_topic(address: &str) -> String {
    let clean = address.trim().trim_start_matches("0x").to_ascii_lowercase();
    format!("0x{clean:0>64}")
}

fn data_word(payload: &str, index: usize) -> Option<BigUint> {
    let chunk = payload.get(index * WORD_HEX..(index + 1) * WORD_HEX)?;
    BigUint::parse_bytes(chunk.as_bytes(), 16)
}

fn lower_str(log: &Value, key: &str) -> String {
    log.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// JSON-RPC quantity: `0x`-hex string, decimal string, or JSON number. Garbage reads as 0.
pub fn parse_quantity(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).unwrap_or(0),
            None => s.parse().unwrap_or(0),
        },
        _ => 0,
    }
}

pub fn to_quantity(n: u64) -> String {
    format!("{n:#x}")
}
