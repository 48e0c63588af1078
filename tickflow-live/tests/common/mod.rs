//! In-process stand-ins for the exchange: a scripted websocket connector and a
//! mock trading account.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::watch;

use tickflow_core::domain::{Instrument, OrderAction};
use tickflow_live::error::{LiveError, Result};
use tickflow_live::protocol::Subscriptions;
use tickflow_live::{
    AccountBalance, Connector, FeedMessage, OpenOrder, PlacedOrder, TradingClient, UserTransaction,
};

pub fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn btc() -> Instrument {
    Instrument::new("BTC", "USD")
}

// ── Wire frames ──────────────────────────────────────────────────────

pub fn subscription_succeeded(channel: &str) -> String {
    json!({"event": "bts:subscription_succeeded", "channel": channel, "data": {}}).to_string()
}

pub fn trade_frame(id: u64, price: f64, amount: f64, micros: i64, side: u8) -> String {
    json!({
        "event": "trade",
        "channel": "live_trades_btcusd",
        "data": {
            "id": id,
            "price": price,
            "amount": amount,
            "microtimestamp": micros.to_string(),
            "type": side,
        }
    })
    .to_string()
}

pub fn book_frame(micros: i64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    json!({
        "event": "data",
        "channel": "detail_order_book_btcusd",
        "data": {
            "microtimestamp": micros.to_string(),
            "bids": bids.iter().map(|(p, a)| vec![*p, *a]).collect::<Vec<_>>(),
            "asks": asks.iter().map(|(p, a)| vec![*p, *a]).collect::<Vec<_>>(),
        }
    })
    .to_string()
}

// ── Scripted connector ───────────────────────────────────────────────

/// Confirms every subscription, replays `frames` through the same decoding as a
/// real session, then disconnects. Sessions past `max_sessions` are refused.
pub struct ScriptedConnector {
    frames: Vec<String>,
    sessions: Mutex<usize>,
    max_sessions: usize,
}

impl ScriptedConnector {
    pub fn new(frames: Vec<String>) -> Self {
        Self {
            frames,
            sessions: Mutex::new(0),
            max_sessions: usize::MAX,
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn sessions(&self) -> usize {
        *self.sessions.lock()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn run(
        &self,
        channels: Vec<String>,
        tx: flume::Sender<FeedMessage>,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock();
            *sessions += 1;
            *sessions
        };
        if session > self.max_sessions {
            let _ = tx.send_async(FeedMessage::Disconnected).await;
            return Err(LiveError::WebSocket("connection refused".into()));
        }
        let mut subscriptions = Subscriptions::new(&channels);
        let confirmations = channels.iter().map(|c| subscription_succeeded(c));
        for frame in confirmations.chain(self.frames.iter().cloned()) {
            if let Some(message) = subscriptions.handle(&frame) {
                let _ = tx.send_async(message).await;
            }
        }
        let _ = tx.send_async(FeedMessage::Disconnected).await;
        Ok(())
    }
}

// ── Mock trading account ─────────────────────────────────────────────

#[derive(Default)]
struct Account {
    balances: BTreeMap<String, Decimal>,
    open_orders: Vec<OpenOrder>,
    /// Visible from the first transactions call.
    history: Vec<UserTransaction>,
    /// Visible from the second call on.
    fresh: Vec<UserTransaction>,
    transaction_calls: usize,
    /// Newest transactions returned per call; all when unset.
    window: Option<usize>,
    next_order_id: u64,
    next_transaction_id: u64,
    placed: Vec<(OrderAction, Decimal, Decimal)>,
    canceled: Vec<String>,
}

pub struct MockTradingClient {
    account: Mutex<Account>,
}

impl MockTradingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            account: Mutex::new(Account {
                next_order_id: 100,
                next_transaction_id: 1000,
                ..Account::default()
            }),
        })
    }

    pub fn set_balance(&self, symbol: &str, amount: Decimal) {
        self.account.lock().balances.insert(symbol.to_string(), amount);
    }

    pub fn add_open_order(&self, id: &str, action: OrderAction, price: Decimal, amount: Decimal) {
        self.account.lock().open_orders.push(OpenOrder {
            id: id.to_string(),
            instrument: btc(),
            action,
            price,
            amount,
            date_time: Utc::now(),
        });
    }

    /// Return only the newest `size` transactions, like the exchange's paging.
    pub fn set_window(&self, size: usize) {
        self.account.lock().window = Some(size);
    }

    /// A transaction that already happened before the broker started.
    pub fn add_history(&self, transaction: UserTransaction) {
        self.account.lock().history.push(transaction);
    }

    /// A transaction that shows up after the broker started.
    pub fn add_fresh(&self, transaction: UserTransaction) {
        self.account.lock().fresh.push(transaction);
    }

    /// Report a fill of `base` (signed) at `price` against exchange order `order_id`.
    pub fn fill(&self, order_id: &str, base: Decimal, price: Decimal, fee: Decimal) {
        let mut account = self.account.lock();
        let id = account.next_transaction_id;
        account.next_transaction_id += 1;
        account.fresh.push(transaction(id, order_id, base, -base * price, price, fee));
    }

    pub fn placed(&self) -> Vec<(OrderAction, Decimal, Decimal)> {
        self.account.lock().placed.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.account.lock().canceled.clone()
    }

    fn place(&self, action: OrderAction, price: Decimal, amount: Decimal) -> PlacedOrder {
        let mut account = self.account.lock();
        let id = account.next_order_id;
        account.next_order_id += 1;
        account.placed.push((action, price, amount));
        PlacedOrder {
            id: id.to_string(),
            price,
            amount,
            date_time: Utc::now(),
        }
    }
}

pub fn transaction(
    id: u64,
    order_id: &str,
    base: Decimal,
    quote: Decimal,
    price: Decimal,
    fee: Decimal,
) -> UserTransaction {
    UserTransaction {
        id,
        order_id: order_id.to_string(),
        instrument: btc(),
        base_amount: base,
        quote_amount: quote,
        price,
        fee,
        date_time: Utc::now(),
    }
}

#[async_trait]
impl TradingClient for MockTradingClient {
    async fn account_balance(&self) -> Result<AccountBalance> {
        Ok(AccountBalance {
            available: self.account.lock().balances.clone(),
        })
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>> {
        Ok(self.account.lock().open_orders.clone())
    }

    async fn user_transactions(&self) -> Result<Vec<UserTransaction>> {
        let mut account = self.account.lock();
        account.transaction_calls += 1;
        let mut visible = account.history.clone();
        if account.transaction_calls > 1 {
            visible.extend(account.fresh.iter().cloned());
        }
        // Newest first, like the exchange.
        visible.reverse();
        if let Some(size) = account.window {
            visible.truncate(size);
        }
        Ok(visible)
    }

    async fn buy_limit(
        &self,
        _: &Instrument,
        price: Decimal,
        amount: Decimal,
    ) -> Result<PlacedOrder> {
        Ok(self.place(OrderAction::Buy, price, amount))
    }

    async fn sell_limit(
        &self,
        _: &Instrument,
        price: Decimal,
        amount: Decimal,
    ) -> Result<PlacedOrder> {
        Ok(self.place(OrderAction::Sell, price, amount))
    }

    async fn cancel_order(&self, id: &str) -> Result<()> {
        let mut account = self.account.lock();
        account.open_orders.retain(|o| o.id != id);
        account.canceled.push(id.to_string());
        Ok(())
    }
}
