//! Pre-submission trade checks.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use rust_decimal::Decimal;

use crate::domain::{Instrument, OrderAction};
use crate::error::{CoreError, Result};

/// Rejects orders before they are created.
pub trait TradeValidator: fmt::Debug {
    fn validate(
        &self,
        instrument: &Instrument,
        action: OrderAction,
        limit_price: Option<Decimal>,
        quantity: Decimal,
    ) -> Result<()>;
}

/// Restricts trading to a set of pairs and enforces minimum order sizes per asset.
///
/// A minimum on the base symbol bounds the quantity; a minimum on the price
/// currency bounds `limit_price * quantity` when a limit price is known.
#[derive(Debug, Clone, Default)]
pub struct MinimumTradeValidator {
    supported: Option<BTreeSet<Instrument>>,
    minimums: HashMap<String, Decimal>,
}

impl MinimumTradeValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only these instruments may be traded.
    pub fn with_supported<I>(mut self, instruments: I) -> Self
    where
        I: IntoIterator<Item = Instrument>,
    {
        self.supported = Some(instruments.into_iter().collect());
        self
    }

    pub fn with_minimum(mut self, symbol: impl Into<String>, minimum: Decimal) -> Self {
        self.minimums.insert(symbol.into(), minimum);
        self
    }

    pub fn minimum(&self, symbol: &str) -> Option<Decimal> {
        self.minimums.get(symbol).copied()
    }

    pub fn is_supported(&self, instrument: &Instrument) -> bool {
        self.supported
            .as_ref()
            .map_or(true, |set| set.contains(instrument))
    }
}

impl TradeValidator for MinimumTradeValidator {
    fn validate(
        &self,
        instrument: &Instrument,
        _: OrderAction,
        limit_price: Option<Decimal>,
        quantity: Decimal,
    ) -> Result<()> {
        if !self.is_supported(instrument) {
            return Err(CoreError::UnknownInstrument(format!("Unsupported pair {instrument}")));
        }
        if let Some(min) = self.minimum(&instrument.symbol) {
            if quantity < min {
                return Err(CoreError::InvalidOrder(format!(
                    "{instrument} amount must be >= {min}"
                )));
            }
        }
        if let (Some(min), Some(price)) = (self.minimum(&instrument.price_currency), limit_price) {
            if price * quantity < min {
                return Err(CoreError::InvalidOrder(format!(
                    "{} amount must be >= {}",
                    instrument.price_currency, min
                )));
            }
        }
        Ok(())
    }
}
