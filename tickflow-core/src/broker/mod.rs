//! Brokers — order entry, matching and the multi-asset balance ledger.
//!
//! - `Broker` is the order-entry surface shared by backtesting and live brokers
//! - `BacktestBroker` matches orders against the bars of a `BarFeed`
//! - `Commission`, `FillStrategy` and `TradeValidator` are the pluggable policies
//! - `Precision` rounds every amount to its asset's decimals

pub mod backtest;
pub mod book;
pub mod commission;
pub mod fill;
pub mod precision;
pub mod validator;

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::domain::{Instrument, Order, OrderAction, OrderEvent, OrderId, OrderType};
use crate::error::{CoreError, Result};
use crate::observer::Event;

pub use backtest::{BacktestBroker, BrokerSettings};
pub use book::OrderBook;
pub use commission::{Commission, FixedPerTrade, NoCommission, TradePercentage};
pub use fill::{DefaultFillStrategy, FillInfo, FillStrategy, Slippage, DEFAULT_VOLUME_LIMIT};
pub use precision::{to_decimal, Precision};
pub use validator::{MinimumTradeValidator, TradeValidator};

/// Order entry and account queries.
///
/// `create_*` validate and submit in one step: on success the order exists and
/// its first event has been published; on failure no order is created and no
/// balance changes. Backtesting brokers publish Submitted and accept on the next
/// tick. Exchange-backed brokers learn the exchange id synchronously and publish
/// Accepted directly.
pub trait Broker {
    fn balance(&self, symbol: &str) -> Decimal;

    fn balances(&self) -> BTreeMap<String, Decimal>;

    fn active_orders(&self, instrument: Option<&Instrument>) -> Vec<Order>;

    /// Snapshot of an order, active or not.
    fn order(&self, id: OrderId) -> Option<Order>;

    fn order_events(&self) -> &Event<OrderEvent>;

    fn create_market_order(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        quantity: Decimal,
        on_close: bool,
    ) -> Result<OrderId>;

    fn create_limit_order(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        limit_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId>;

    fn create_stop_order(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        stop_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId>;

    fn create_stop_limit_order(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        stop_price: Decimal,
        limit_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId>;

    fn cancel_order(&self, id: OrderId) -> Result<()>;
}

/// Checks that only depend on the order itself.
pub fn check_order_shape(
    order_type: &OrderType,
    quantity: Decimal,
    limit_orders_only: bool,
) -> Result<()> {
    if quantity <= Decimal::ZERO {
        return Err(CoreError::InvalidOrder(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    for (name, price) in [
        ("limit", order_type.limit_price()),
        ("stop", order_type.stop_price()),
    ] {
        if let Some(price) = price {
            if price <= Decimal::ZERO {
                return Err(CoreError::InvalidOrder(format!(
                    "{name} price must be positive, got {price}"
                )));
            }
        }
    }
    if limit_orders_only {
        let unsupported = match order_type {
            OrderType::Limit { .. } => None,
            OrderType::Market { .. } => Some("Market orders are not supported"),
            OrderType::Stop { .. } => Some("Stop orders are not supported"),
            OrderType::StopLimit { .. } => Some("Stop limit orders are not supported"),
        };
        if let Some(message) = unsupported {
            return Err(CoreError::InvalidOrder(message.into()));
        }
    }
    Ok(())
}

/// Reject orders the account can't pay for.
///
/// Buys need `price * quantity + commission` of the price currency, rounded to
/// its precision. Sells need the quantity of the base asset. Without a
/// reference price buys are let through and the fill-time ledger check applies.
/// Short sells are held to the same rule as sells: the ledger has no margin.
pub fn check_funds(
    balances: &BTreeMap<String, Decimal>,
    order: &Order,
    reference_price: Option<Decimal>,
    commission: &dyn Commission,
    precision: &Precision,
) -> Result<()> {
    let instrument = order.instrument();
    let balance = |symbol: &str| balances.get(symbol).copied().unwrap_or_default();

    if order.is_buy() {
        let Some(price) = reference_price else {
            return Ok(());
        };
        let fee = commission.calculate(order, price, order.quantity(), precision);
        let required = precision.round(
            price * order.quantity() + fee,
            &instrument.price_currency,
        );
        let available = balance(&instrument.price_currency);
        if required > available {
            return Err(CoreError::InsufficientFunds {
                symbol: instrument.price_currency.clone(),
                required,
                available,
            });
        }
    } else {
        let available = balance(&instrument.symbol);
        if order.quantity() > available {
            return Err(CoreError::InsufficientFunds {
                symbol: instrument.symbol.clone(),
                required: order.quantity(),
                available,
            });
        }
    }
    Ok(())
}

/// The price a pre-submission funds check should assume.
pub fn reference_price(order_type: &OrderType, last_price: Option<Decimal>) -> Option<Decimal> {
    match order_type {
        OrderType::Limit { limit_price } | OrderType::StopLimit { limit_price, .. } => {
            Some(*limit_price)
        }
        OrderType::Stop { stop_price } => Some(*stop_price),
        OrderType::Market { .. } => last_price,
    }
}
