//! Error taxonomy for the engine.
//!
//! Variants are grouped by failure class:
//! - Structural: malformed bars or bar groups, rejected at construction
//! - Ordering: a subject produced a non-increasing timestamp (fatal)
//! - Capability: adjusted values requested without adjusted close data
//! - Accounting: invalid order parameters or insufficient balance (per call)
//! - Connectivity: live connection failures surfaced by live subjects

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::OrderId;

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Structural ──────────────────────────────────────────────────
    #[error("invalid instrument '{0}'")]
    InvalidInstrument(String),

    #[error("invalid bar: {0}")]
    InvalidBar(String),

    #[error("invalid bars: {0}")]
    InvalidBars(String),

    #[error("{instrument} bars are not in order. Previous datetime was {previous} and current datetime is {current}")]
    OutOfOrder {
        instrument: String,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    // ── Ordering ────────────────────────────────────────────────────
    #[error("subject '{subject}' produced non-increasing timestamps: {current} after {previous}")]
    OrderingViolation {
        subject: String,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    // ── Capability ──────────────────────────────────────────────────
    #[error("Adjusted close is not available")]
    AdjustedCloseUnavailable,

    #[error("The barfeed doesn't support adjusted close values")]
    AdjustedValuesUnsupported,

    #[error("no bar for instrument {0}")]
    MissingBar(String),

    // ── Accounting ──────────────────────────────────────────────────
    #[error("unknown instrument {0}")]
    UnknownInstrument(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("Not enough {symbol}. {required} required. {available} available")]
    InsufficientFunds {
        symbol: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("The order is not active anymore")]
    OrderNotActive(OrderId),

    #[error("Can't cancel order that has already been filled")]
    OrderAlreadyFilled(OrderId),

    #[error("Price in {currency} for {symbol} is missing")]
    MissingPrice { symbol: String, currency: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    // ── Connectivity ────────────────────────────────────────────────
    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("exchange: {0}")]
    Exchange(String),

    // ── Configuration ───────────────────────────────────────────────
    #[error("config: {0}")]
    Config(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
