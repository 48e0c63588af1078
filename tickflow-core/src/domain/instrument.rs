use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, Result};

/// Separator between the traded symbol and the price currency.
pub const SEPARATOR: char = '/';

/// A tradable pair: the symbol being traded and the currency it is priced in.
///
/// `BTC/USD` trades BTC priced in USD. Equality, ordering and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instrument {
    pub symbol: String,
    pub price_currency: String,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, price_currency: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            price_currency: price_currency.into(),
        }
    }

    /// Parse the canonical `SYMBOL/CURRENCY` form.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(symbol), Some(currency), None)
                if !symbol.trim().is_empty() && !currency.trim().is_empty() =>
            {
                Ok(Self::new(symbol.trim(), currency.trim()))
            }
            _ => Err(CoreError::InvalidInstrument(s.to_string())),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.symbol, SEPARATOR, self.price_currency)
    }
}

impl FromStr for Instrument {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Instrument {
    type Error = CoreError;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Instrument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Instrument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
