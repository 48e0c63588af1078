//! Trading control channel: the request/response side of an exchange account.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tickflow_core::domain::{Instrument, OrderAction};

use crate::error::Result;

/// Available (not reserved) amount per asset symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub available: BTreeMap<String, Decimal>,
}

impl AccountBalance {
    pub fn available(&self, symbol: &str) -> Decimal {
        self.available.get(symbol).copied().unwrap_or_default()
    }
}

/// An order resting on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub instrument: Instrument,
    pub action: OrderAction,
    pub price: Decimal,
    pub amount: Decimal,
    pub date_time: DateTime<Utc>,
}

/// Acknowledgement of a newly placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub id: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub date_time: DateTime<Utc>,
}

/// A fill against the account.
///
/// Amounts are signed from the account's point of view: a buy has a positive
/// `base_amount` and a negative `quote_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTransaction {
    pub id: u64,
    pub order_id: String,
    pub instrument: Instrument,
    pub base_amount: Decimal,
    pub quote_amount: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub date_time: DateTime<Utc>,
}

impl UserTransaction {
    pub fn is_buy(&self) -> bool {
        self.base_amount.is_sign_positive()
    }

    pub fn quantity(&self) -> Decimal {
        self.base_amount.abs()
    }
}

#[async_trait]
pub trait TradingClient: Send + Sync {
    async fn account_balance(&self) -> Result<AccountBalance>;

    async fn open_orders(&self) -> Result<Vec<OpenOrder>>;

    /// Recent market-trade fills, in any order.
    async fn user_transactions(&self) -> Result<Vec<UserTransaction>>;

    async fn buy_limit(
        &self,
        instrument: &Instrument,
        price: Decimal,
        amount: Decimal,
    ) -> Result<PlacedOrder>;

    async fn sell_limit(
        &self,
        instrument: &Instrument,
        price: Decimal,
        amount: Decimal,
    ) -> Result<PlacedOrder>;

    async fn cancel_order(&self, id: &str) -> Result<()>;
}
