//! Per-asset decimal precision.
//!
//! Every balance and fill quantity is rounded to its asset's number of decimals
//! with decimal (not binary) arithmetic, so amounts that add up to zero on paper
//! add up to exactly zero in the ledger.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_DIGITS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precision {
    default_digits: u32,
    digits: HashMap<String, u32>,
}

impl Default for Precision {
    /// 8 decimals, 2 for USD and EUR.
    fn default() -> Self {
        Self::new(DEFAULT_DIGITS)
            .with_digits("USD", 2)
            .with_digits("EUR", 2)
    }
}

impl Precision {
    pub fn new(default_digits: u32) -> Self {
        Self {
            default_digits,
            digits: HashMap::new(),
        }
    }

    pub fn with_digits(mut self, symbol: impl Into<String>, digits: u32) -> Self {
        self.digits.insert(symbol.into(), digits);
        self
    }

    pub fn set_digits(&mut self, symbol: impl Into<String>, digits: u32) {
        self.digits.insert(symbol.into(), digits);
    }

    pub fn digits(&self, symbol: &str) -> u32 {
        self.digits.get(symbol).copied().unwrap_or(self.default_digits)
    }

    /// Round `amount` to `symbol`'s precision, midpoints away from zero.
    pub fn round(&self, amount: Decimal, symbol: &str) -> Decimal {
        amount
            .round_dp_with_strategy(self.digits(symbol), RoundingStrategy::MidpointAwayFromZero)
            .normalize()
    }
}

/// Convert a bar value to a decimal using its shortest round-trip representation,
/// so `0.1_f64` becomes exactly `0.1`.
pub fn to_decimal(value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(CoreError::InvalidBar(format!("non-finite value {value}")));
    }
    Decimal::from_str(&value.to_string())
        .ok()
        .or_else(|| Decimal::from_f64(value))
        .ok_or_else(|| CoreError::InvalidBar(format!("value {value} is out of decimal range")))
}
