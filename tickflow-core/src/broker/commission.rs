//! Commission models.

use std::fmt;

use rust_decimal::Decimal;

use super::Precision;
use crate::domain::Order;

/// Commission charged for filling `quantity` of `order` at `price`.
pub trait Commission: fmt::Debug {
    fn calculate(&self, order: &Order, price: Decimal, quantity: Decimal, precision: &Precision)
        -> Decimal;
}

/// Always zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCommission;

impl Commission for NoCommission {
    fn calculate(&self, _: &Order, _: Decimal, _: Decimal, _: &Precision) -> Decimal {
        Decimal::ZERO
    }
}

/// A fixed amount for the whole order, charged on its first fill.
#[derive(Debug, Clone, Copy)]
pub struct FixedPerTrade {
    pub amount: Decimal,
}

impl Commission for FixedPerTrade {
    fn calculate(&self, order: &Order, _: Decimal, _: Decimal, _: &Precision) -> Decimal {
        if order.executions().is_empty() {
            self.amount
        } else {
            Decimal::ZERO
        }
    }
}

/// A fraction of the traded notional (`0.005` = 0.5%), rounded to the price currency.
#[derive(Debug, Clone, Copy)]
pub struct TradePercentage {
    pub percentage: Decimal,
}

impl Commission for TradePercentage {
    fn calculate(&self, order: &Order, price: Decimal, quantity: Decimal, precision: &Precision)
        -> Decimal {
        precision.round(
            price * quantity * self.percentage,
            &order.instrument().price_currency,
        )
    }
}
