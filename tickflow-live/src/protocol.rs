//! Exchange websocket protocol (Bitstamp v2 style).
//!
//! Outbound: `{"event":"bts:subscribe","data":{"channel":"live_trades_btcusd"}}`.
//!
//! Inbound events:
//! - `trade` on `live_trades_<pair>`: one executed trade
//! - `data` on `detail_order_book_<pair>`: order book snapshot, levels as strings
//! - `bts:subscription_succeeded`: a pending subscription was confirmed

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use tickflow_core::domain::Instrument;

use crate::client::FeedMessage;
use crate::error::{LiveError, Result};

pub const DEFAULT_URL: &str = "wss://ws.bitstamp.net/";
pub const TRADES_PREFIX: &str = "live_trades_";
pub const ORDER_BOOK_PREFIX: &str = "detail_order_book_";

/// `BTC/USD` → `btcusd`.
pub fn channel_pair(instrument: &Instrument) -> String {
    format!("{}{}", instrument.symbol, instrument.price_currency).to_lowercase()
}

/// `btcusd` → `BTC/USD`. Pairs are two three-letter codes.
pub fn pair_instrument(pair: &str) -> Result<Instrument> {
    if pair.len() != 6 || !pair.is_ascii() {
        return Err(LiveError::Protocol(format!("invalid channel pair '{pair}'")));
    }
    let (symbol, currency) = pair.split_at(3);
    Ok(Instrument::new(symbol.to_uppercase(), currency.to_uppercase()))
}

pub fn trades_channel(instrument: &Instrument) -> String {
    format!("{TRADES_PREFIX}{}", channel_pair(instrument))
}

pub fn order_book_channel(instrument: &Instrument) -> String {
    format!("{ORDER_BOOK_PREFIX}{}", channel_pair(instrument))
}

/// Every channel a feed for `instruments` subscribes to.
pub fn channels_for(instruments: &[Instrument]) -> Vec<String> {
    instruments
        .iter()
        .flat_map(|i| [order_book_channel(i), trades_channel(i)])
        .collect()
}

pub fn subscribe_message(channel: &str) -> String {
    json!({
        "event": "bts:subscribe",
        "data": { "channel": channel }
    })
    .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// One executed trade.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub id: u64,
    pub instrument: Instrument,
    pub price: f64,
    pub amount: f64,
    pub date_time: DateTime<Utc>,
    pub side: TradeSide,
}

impl Trade {
    pub fn is_buy(&self) -> bool {
        self.side == TradeSide::Buy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Order book snapshot for one pair.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookUpdate {
    pub instrument: Instrument,
    pub date_time: DateTime<Utc>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBookUpdate {
    pub fn bid_prices(&self) -> Vec<Decimal> {
        self.bids.iter().map(|l| l.price).collect()
    }

    pub fn bid_volumes(&self) -> Vec<Decimal> {
        self.bids.iter().map(|l| l.amount).collect()
    }

    pub fn ask_prices(&self) -> Vec<Decimal> {
        self.asks.iter().map(|l| l.price).collect()
    }

    pub fn ask_volumes(&self) -> Vec<Decimal> {
        self.asks.iter().map(|l| l.amount).collect()
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Trade(Trade),
    OrderBook(OrderBookUpdate),
    SubscriptionSucceeded(String),
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: Value,
}

/// Microsecond timestamps arrive as strings on the live API and as numbers in
/// some replays.
#[derive(Deserialize)]
#[serde(untagged)]
enum Micros {
    Text(String),
    Number(i64),
}

impl Micros {
    fn to_date_time(&self) -> Result<DateTime<Utc>> {
        let micros = match self {
            Micros::Text(s) => s
                .parse::<i64>()
                .map_err(|e| LiveError::Protocol(format!("invalid microtimestamp '{s}': {e}")))?,
            Micros::Number(n) => *n,
        };
        DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| LiveError::Protocol(format!("microtimestamp out of range: {micros}")))
    }
}

#[derive(Deserialize)]
struct TradePayload {
    id: u64,
    price: f64,
    amount: f64,
    microtimestamp: Micros,
    #[serde(rename = "type")]
    side: u8,
}

#[derive(Deserialize)]
struct BookPayload {
    microtimestamp: Micros,
    #[serde(default)]
    bids: Vec<Vec<Value>>,
    #[serde(default)]
    asks: Vec<Vec<Value>>,
}

fn channel_instrument(channel: &str, prefix: &str) -> Result<Instrument> {
    let pair = channel
        .strip_prefix(prefix)
        .ok_or_else(|| LiveError::Protocol(format!("unexpected channel '{channel}'")))?;
    pair_instrument(pair)
}

fn decimal_field(value: &Value) -> Result<Decimal> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(LiveError::Protocol(format!("invalid book value {other}"))),
    };
    text.parse()
        .map_err(|e| LiveError::Protocol(format!("invalid book value '{text}': {e}")))
}

fn levels(raw: &[Vec<Value>]) -> Result<Vec<PriceLevel>> {
    raw.iter()
        .map(|level| match level.as_slice() {
            [price, amount, ..] => Ok(PriceLevel {
                price: decimal_field(price)?,
                amount: decimal_field(amount)?,
            }),
            _ => Err(LiveError::Protocol("book level needs price and amount".into())),
        })
        .collect()
}

pub fn parse_message(text: &str) -> Result<WireEvent> {
    let envelope: Envelope = serde_json::from_str(text)?;
    match envelope.event.as_str() {
        "trade" => {
            let payload: TradePayload = serde_json::from_value(envelope.data)?;
            Ok(WireEvent::Trade(Trade {
                id: payload.id,
                instrument: channel_instrument(&envelope.channel, TRADES_PREFIX)?,
                price: payload.price,
                amount: payload.amount,
                date_time: payload.microtimestamp.to_date_time()?,
                side: if payload.side == 0 {
                    TradeSide::Buy
                } else {
                    TradeSide::Sell
                },
            }))
        }
        "data" if envelope.channel.starts_with(ORDER_BOOK_PREFIX) => {
            let payload: BookPayload = serde_json::from_value(envelope.data)?;
            Ok(WireEvent::OrderBook(OrderBookUpdate {
                instrument: channel_instrument(&envelope.channel, ORDER_BOOK_PREFIX)?,
                date_time: payload.microtimestamp.to_date_time()?,
                bids: levels(&payload.bids)?,
                asks: levels(&payload.asks)?,
            }))
        }
        "bts:subscription_succeeded" => Ok(WireEvent::SubscriptionSucceeded(envelope.channel)),
        _ => Ok(WireEvent::Unknown(text.to_string())),
    }
}

/// Per-connection subscription bookkeeping: turns raw frames into feed messages
/// and reports initialization once every channel is confirmed.
#[derive(Debug)]
pub struct Subscriptions {
    pending: HashSet<String>,
    initialized: bool,
}

impl Subscriptions {
    pub fn new(channels: &[String]) -> Self {
        Self {
            pending: channels.iter().cloned().collect(),
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Decode one text frame. Malformed and unknown frames are logged and dropped.
    pub fn handle(&mut self, text: &str) -> Option<FeedMessage> {
        match parse_message(text) {
            Ok(WireEvent::Trade(trade)) => Some(FeedMessage::Trade(trade)),
            Ok(WireEvent::OrderBook(update)) => Some(FeedMessage::OrderBook(update)),
            Ok(WireEvent::SubscriptionSucceeded(channel)) => {
                info!(%channel, "subscription succeeded");
                self.pending.remove(&channel);
                if self.pending.is_empty() && !self.initialized {
                    self.initialized = true;
                    Some(FeedMessage::Initialized)
                } else {
                    None
                }
            }
            Ok(WireEvent::Unknown(raw)) => {
                warn!(event = %raw, "unknown event");
                None
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed message");
                None
            }
        }
    }
}
