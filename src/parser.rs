//! Parser module for the Bitfinex v2 book channel
//!
//! Encodes subscribe requests and decodes inbound frames. Event frames are JSON
//! objects (`subscribed`, `info`, `error`); data frames are arrays tagged with
//! the channel id assigned at subscription time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{BookSyncError, Result};
use crate::orderbook::SubscriptionParams;

/// Session-scoped id tagging the data frames of one subscription
pub type ChannelId = u64;

/// Payload of a heartbeat data frame
pub const HEARTBEAT: &str = "hb";

/// New state of one price level as sent on the wire
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelDiff {
    pub price: Decimal,
    /// Zero removes the level
    pub count: u32,
    /// Positive for bids, negative for asks
    pub amount: Decimal,
}

/// Outbound subscribe request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub event: String,
    pub channel: String,
    pub symbol: String,
    pub prec: String,
}

impl SubscribeRequest {
    pub fn book(params: &SubscriptionParams) -> Self {
        Self {
            event: "subscribe".to_string(),
            channel: "book".to_string(),
            symbol: params.symbol.clone(),
            prec: format!("P{}", params.precision),
        }
    }
}

/// Object-shaped event frame
#[derive(Debug, Clone, Deserialize)]
struct EventFrame {
    event: Option<String>,
    channel: Option<String>,
    #[serde(rename = "chanId")]
    chan_id: Option<ChannelId>,
    symbol: Option<String>,
    prec: Option<String>,
    code: Option<i64>,
    msg: Option<String>,
    version: Option<u32>,
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    SubscribedAck {
        channel_id: ChannelId,
        symbol: Option<String>,
        precision: Option<u8>,
    },
    Heartbeat,
    LevelDiff {
        channel_id: ChannelId,
        diff: LevelDiff,
    },
    /// Full book sent right after subscribing
    Snapshot {
        channel_id: ChannelId,
        diffs: Vec<LevelDiff>,
    },
    Info {
        code: Option<i64>,
        version: Option<u32>,
    },
    Error {
        code: Option<i64>,
        msg: String,
    },
    Unrecognized,
}

/// Encode the subscribe request for `params`
pub fn encode_subscribe(params: &SubscriptionParams) -> Result<String> {
    serde_json::to_string(&SubscribeRequest::book(params))
        .map_err(|e| BookSyncError::SerializationError(e.to_string()))
}

/// Decode a raw frame
///
/// Data frames not tagged with `active_channel` decode to `Unrecognized`
/// before their payload is inspected.
pub fn decode(raw: &str, active_channel: Option<ChannelId>) -> Result<ProtocolEvent> {
    let value: Value = serde_json::from_str(raw)?;

    match value {
        Value::Object(_) => decode_event(value),
        Value::Array(items) => decode_data(&items, active_channel),
        _ => Ok(ProtocolEvent::Unrecognized),
    }
}

fn decode_event(value: Value) -> Result<ProtocolEvent> {
    let frame: EventFrame = serde_json::from_value(value)?;

    match frame.event.as_deref() {
        Some("subscribed") if frame.channel.as_deref() == Some("book") => {
            let channel_id = frame
                .chan_id
                .ok_or_else(|| BookSyncError::ParseError("subscribed event without chanId".into()))?;
            Ok(ProtocolEvent::SubscribedAck {
                channel_id,
                symbol: frame.symbol,
                precision: frame.prec.as_deref().and_then(parse_precision),
            })
        }
        Some("info") => Ok(ProtocolEvent::Info {
            code: frame.code,
            version: frame.version,
        }),
        Some("error") => Ok(ProtocolEvent::Error {
            code: frame.code,
            msg: frame.msg.unwrap_or_default(),
        }),
        _ => Ok(ProtocolEvent::Unrecognized),
    }
}

fn decode_data(items: &[Value], active_channel: Option<ChannelId>) -> Result<ProtocolEvent> {
    let channel_id = match items.first().and_then(Value::as_u64) {
        Some(id) if Some(id) == active_channel => id,
        _ => return Ok(ProtocolEvent::Unrecognized),
    };

    match items.get(1) {
        Some(Value::String(s)) if s == HEARTBEAT => Ok(ProtocolEvent::Heartbeat),
        Some(Value::Array(payload)) => {
            if payload.first().map_or(true, Value::is_array) {
                let diffs = payload
                    .iter()
                    .map(|entry| match entry {
                        Value::Array(triple) => parse_triple(triple),
                        other => Err(BookSyncError::MalformedDiff(format!(
                            "expected level triple, got {}",
                            other
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ProtocolEvent::Snapshot { channel_id, diffs })
            } else {
                Ok(ProtocolEvent::LevelDiff {
                    channel_id,
                    diff: parse_triple(payload)?,
                })
            }
        }
        // Checksum and other string frames carry nothing for the book
        Some(Value::String(_)) => Ok(ProtocolEvent::Unrecognized),
        Some(other) => Err(BookSyncError::MalformedDiff(format!(
            "unexpected payload {}",
            other
        ))),
        None => Err(BookSyncError::MalformedDiff("data frame without payload".into())),
    }
}

fn parse_triple(triple: &[Value]) -> Result<LevelDiff> {
    let [price, count, amount] = triple else {
        return Err(BookSyncError::MalformedDiff(format!(
            "expected [price, count, amount], got {} fields",
            triple.len()
        )));
    };

    let count = count
        .as_u64()
        .and_then(|c| u32::try_from(c).ok())
        .ok_or_else(|| BookSyncError::MalformedDiff(format!("invalid count {}", count)))?;

    Ok(LevelDiff {
        price: parse_decimal(price)?,
        count,
        amount: parse_decimal(amount)?,
    })
}

/// Exact decimal from a JSON number or numeric string
fn parse_decimal(value: &Value) -> Result<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => {
            return Err(BookSyncError::MalformedDiff(format!(
                "expected number, got {}",
                other
            )))
        }
    };

    let parsed = if text.contains(['e', 'E']) {
        Decimal::from_scientific(&text)
    } else {
        Decimal::from_str(&text)
    };

    parsed.map_err(|e| BookSyncError::MalformedDiff(format!("invalid number {}: {}", text, e)))
}

fn parse_precision(prec: &str) -> Option<u8> {
    prec.strip_prefix('P')?.parse().ok()
}
