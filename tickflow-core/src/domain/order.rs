//! Orders, executions and order events.
//!
//! An order moves through Submitted → Accepted → (PartiallyFilled)* → Filled,
//! or to Canceled from any active state. Filled and Canceled are terminal.
//! Quantities and prices are decimals so partial fills add up exactly.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Instrument;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    Sell,
    SellShort,
}

impl OrderAction {
    pub fn is_buy(self) -> bool {
        self == OrderAction::Buy
    }

    pub fn is_sell(self) -> bool {
        !self.is_buy()
    }
}

/// What kind of order and its price parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    /// Fill at the next available price (the close when `on_close`).
    Market { on_close: bool },
    /// Fill at the limit price or better.
    Limit { limit_price: Decimal },
    /// Becomes a market order once the stop price trades.
    Stop { stop_price: Decimal },
    /// Becomes a limit order once the stop price trades.
    StopLimit {
        stop_price: Decimal,
        limit_price: Decimal,
    },
}

impl OrderType {
    pub fn limit_price(&self) -> Option<Decimal> {
        match self {
            OrderType::Limit { limit_price } | OrderType::StopLimit { limit_price, .. } => {
                Some(*limit_price)
            }
            _ => None,
        }
    }

    pub fn stop_price(&self) -> Option<Decimal> {
        match self {
            OrderType::Stop { stop_price } | OrderType::StopLimit { stop_price, .. } => {
                Some(*stop_price)
            }
            _ => None,
        }
    }
}

/// Order lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl OrderStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            OrderStatus::Submitted | OrderStatus::Accepted | OrderStatus::PartiallyFilled
        )
    }

    fn can_switch_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Submitted, Accepted)
                | (Submitted, Canceled)
                | (Accepted, PartiallyFilled)
                | (Accepted, Filled)
                | (Accepted, Canceled)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Canceled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One fill against an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderExecution {
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub date_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    action: OrderAction,
    instrument: Instrument,
    order_type: OrderType,
    quantity: Decimal,
    filled: Decimal,
    avg_fill_price: Option<Decimal>,
    commission: Decimal,
    status: OrderStatus,
    submitted_at: Option<DateTime<Utc>>,
    accepted_at: Option<DateTime<Utc>>,
    good_till_canceled: bool,
    all_or_none: bool,
    stop_hit: bool,
    exchange_id: Option<String>,
    executions: Vec<OrderExecution>,
}

impl Order {
    /// A freshly submitted order.
    pub fn new(
        id: OrderId,
        action: OrderAction,
        instrument: Instrument,
        order_type: OrderType,
        quantity: Decimal,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            action,
            instrument,
            order_type,
            quantity,
            filled: Decimal::ZERO,
            avg_fill_price: None,
            commission: Decimal::ZERO,
            status: OrderStatus::Submitted,
            submitted_at,
            accepted_at: None,
            good_till_canceled: false,
            all_or_none: false,
            stop_hit: false,
            exchange_id: None,
            executions: Vec::new(),
        }
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn action(&self) -> OrderAction {
        self.action
    }

    pub fn is_buy(&self) -> bool {
        self.action.is_buy()
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn order_type(&self) -> &OrderType {
        &self.order_type
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn filled(&self) -> Decimal {
        self.filled
    }

    /// `quantity - filled`; the two always add back up to `quantity`.
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled
    }

    pub fn avg_fill_price(&self) -> Option<Decimal> {
        self.avg_fill_price
    }

    pub fn commission(&self) -> Decimal {
        self.commission
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn is_canceled(&self) -> bool {
        self.status == OrderStatus::Canceled
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn accepted_at(&self) -> Option<DateTime<Utc>> {
        self.accepted_at
    }

    pub fn good_till_canceled(&self) -> bool {
        self.good_till_canceled
    }

    pub fn set_good_till_canceled(&mut self, gtc: bool) {
        self.good_till_canceled = gtc;
    }

    pub fn all_or_none(&self) -> bool {
        self.all_or_none
    }

    pub fn set_all_or_none(&mut self, all_or_none: bool) {
        self.all_or_none = all_or_none;
    }

    pub fn stop_hit(&self) -> bool {
        self.stop_hit
    }

    pub fn set_stop_hit(&mut self, hit: bool) {
        self.stop_hit = hit;
    }

    /// Identifier assigned by an exchange, for live orders.
    pub fn exchange_id(&self) -> Option<&str> {
        self.exchange_id.as_deref()
    }

    pub fn set_exchange_id(&mut self, id: impl Into<String>) {
        self.exchange_id = Some(id.into());
    }

    pub fn executions(&self) -> &[OrderExecution] {
        &self.executions
    }

    pub fn last_execution(&self) -> Option<&OrderExecution> {
        self.executions.last()
    }

    // ── Transitions ─────────────────────────────────────────────────

    pub fn accept(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.switch_state(OrderStatus::Accepted)?;
        self.accepted_at = Some(at);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        if self.status == OrderStatus::Filled {
            return Err(CoreError::OrderAlreadyFilled(self.id));
        }
        self.switch_state(OrderStatus::Canceled)
    }

    /// Record a fill. Moves to PartiallyFilled or Filled.
    pub fn add_execution(&mut self, execution: OrderExecution) -> Result<()> {
        if execution.quantity <= Decimal::ZERO {
            return Err(CoreError::InvalidOrder(format!(
                "execution quantity must be positive, got {}",
                execution.quantity
            )));
        }
        if execution.quantity > self.remaining() {
            return Err(CoreError::InvalidOrder(format!(
                "execution of {} exceeds remaining {} on order {}",
                execution.quantity,
                self.remaining(),
                self.id
            )));
        }

        let next = if execution.quantity == self.remaining() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.switch_state(next)?;

        let new_filled = self.filled + execution.quantity;
        self.avg_fill_price = Some(match self.avg_fill_price {
            Some(avg) => (avg * self.filled + execution.price * execution.quantity) / new_filled,
            None => execution.price,
        });
        self.filled = new_filled;
        self.commission += execution.commission;
        self.executions.push(execution);
        Ok(())
    }

    fn switch_state(&mut self, next: OrderStatus) -> Result<()> {
        if !self.status.can_switch_to(next) {
            return Err(CoreError::InvalidState(format!(
                "invalid transition for order {}: {} → {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// What happened to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEventKind {
    Submitted,
    Accepted,
    PartiallyFilled(OrderExecution),
    Filled(OrderExecution),
    Canceled(String),
}

/// Order update published by brokers. Carries a snapshot of the order after the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order: Order,
    pub kind: OrderEventKind,
}

impl OrderEvent {
    pub fn new(order: Order, kind: OrderEventKind) -> Self {
        Self { order, kind }
    }

    pub fn execution(&self) -> Option<&OrderExecution> {
        match &self.kind {
            OrderEventKind::PartiallyFilled(e) | OrderEventKind::Filled(e) => Some(e),
            _ => None,
        }
    }
}
