//! Live broker: keeps local orders in step with an exchange account.
//!
//! The exchange is authoritative. Orders are placed and canceled there first and
//! only then recorded locally; fills are never predicted, they are applied when
//! the account's user transactions report them.
//!
//! On start the broker:
//! 1. refreshes balances
//! 2. registers orders already resting on the exchange as Accepted
//! 3. records the ids of transactions that already happened, so a restart never
//!    applies a fill twice
//! 4. starts a monitor task polling new transactions into a flume queue
//!
//! Each dispatch drains the queue and applies transactions by exchange order id.
//! The exchange only returns a recent window of transactions, so the ids
//! remembered for deduplication are trimmed to the oldest id it still returns.
//! Transactions for orders the broker doesn't know yet (the fill raced the
//! placement acknowledgement) are buffered and retried on later dispatches.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flume::RecvTimeoutError;
use rust_decimal::Decimal;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tickflow_core::broker::{check_order_shape, Broker, OrderBook, Precision, TradeValidator};
use tickflow_core::dispatcher::{Dispatch, DispatchPriority, Subject};
use tickflow_core::domain::{
    Instrument, Order, OrderAction, OrderEvent, OrderEventKind, OrderExecution, OrderId,
    OrderType,
};
use tickflow_core::observer::Event;
use tickflow_core::{CoreError, Result};

use crate::trading::{TradingClient, UserTransaction};

#[derive(Debug)]
pub struct LiveBrokerSettings {
    pub precision: Precision,
    pub validator: Option<Box<dyn TradeValidator>>,
    /// How often the monitor asks for new transactions.
    pub poll_interval: Duration,
    /// Longest a dispatch waits for the monitor queue.
    pub queue_timeout: Duration,
}

impl Default for LiveBrokerSettings {
    fn default() -> Self {
        Self {
            precision: Precision::default(),
            validator: None,
            poll_interval: Duration::from_secs(1),
            queue_timeout: Duration::from_millis(10),
        }
    }
}

enum MonitorMessage {
    Transaction(UserTransaction),
    /// Oldest transaction id the exchange still returns.
    Oldest(u64),
}

struct Monitor {
    rx: flume::Receiver<MonitorMessage>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    balances: BTreeMap<String, Decimal>,
    book: OrderBook,
    applied: HashSet<u64>,
    unmatched: Vec<UserTransaction>,
    started: bool,
    stopped: bool,
}

struct Inner {
    client: Arc<dyn TradingClient>,
    runtime: Runtime,
    settings: LiveBrokerSettings,
    state: RefCell<State>,
    monitor: RefCell<Option<Monitor>>,
    order_events: Event<OrderEvent>,
}

/// Cheap-clone handle, like the backtesting broker.
#[derive(Clone)]
pub struct LiveBroker {
    inner: Rc<Inner>,
}

impl LiveBroker {
    pub fn new(client: Arc<dyn TradingClient>, settings: LiveBrokerSettings) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tickflow-trading")
            .enable_all()
            .build()
            .map_err(|e| CoreError::Connectivity(format!("runtime: {e}")))?;
        Ok(Self {
            inner: Rc::new(Inner {
                client,
                runtime,
                settings,
                state: RefCell::new(State::default()),
                monitor: RefCell::new(None),
                order_events: Event::new(),
            }),
        })
    }

    /// Exchange order id of a local order.
    pub fn exchange_id(&self, id: OrderId) -> Option<String> {
        self.inner
            .state
            .borrow()
            .book
            .get(id)
            .and_then(|o| o.exchange_id().map(str::to_string))
    }

    /// Transactions waiting for their order to be registered.
    pub fn unmatched_transactions(&self) -> usize {
        self.inner.state.borrow().unmatched.len()
    }

    /// Applied transaction ids still remembered for deduplication.
    pub fn tracked_transactions(&self) -> usize {
        self.inner.state.borrow().applied.len()
    }

    fn call<F: Future>(&self, future: F) -> F::Output {
        self.inner.runtime.block_on(future)
    }

    pub fn refresh_balances(&self) -> Result<()> {
        let account = self.call(self.inner.client.account_balance())?;
        let precision = &self.inner.settings.precision;
        let balances: BTreeMap<String, Decimal> = account
            .available
            .into_iter()
            .map(|(symbol, amount)| {
                let amount = precision.round(amount, &symbol);
                (symbol, amount)
            })
            .collect();
        debug!(?balances, "balances refreshed");
        self.inner.state.borrow_mut().balances = balances;
        Ok(())
    }

    fn reconcile_open_orders(&self) -> Result<()> {
        let open = self.call(self.inner.client.open_orders())?;
        let mut state = self.inner.state.borrow_mut();
        for resting in open {
            if state.book.find_by_exchange_id(&resting.id).is_some() {
                continue;
            }
            let id = state.book.next_id();
            let mut order = Order::new(
                id,
                resting.action,
                resting.instrument.clone(),
                OrderType::Limit {
                    limit_price: resting.price,
                },
                resting.amount,
                Some(resting.date_time),
            );
            order.set_good_till_canceled(true);
            order.set_exchange_id(resting.id.clone());
            order.accept(resting.date_time)?;
            state.book.insert(order);
            info!(
                order = %id,
                exchange_id = %resting.id,
                instrument = %resting.instrument,
                "registered open order"
            );
        }
        Ok(())
    }

    fn start_monitor(&self, seen: HashSet<u64>) {
        let (tx, rx) = flume::bounded(1024);
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let client = self.inner.client.clone();
        let poll_interval = self.inner.settings.poll_interval;

        let handle = self.inner.runtime.spawn(async move {
            let mut seen = seen;
            let mut oldest_sent = None;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match client.user_transactions().await {
                        Ok(mut transactions) => {
                            transactions.sort_by_key(|t| t.id);
                            let oldest = transactions.first().map(|t| t.id);
                            for transaction in transactions {
                                if seen.insert(transaction.id)
                                    && tx
                                        .send_async(MonitorMessage::Transaction(transaction))
                                        .await
                                        .is_err()
                                {
                                    return;
                                }
                            }
                            if let Some(oldest) = oldest {
                                seen.retain(|id| *id >= oldest);
                                if oldest_sent < Some(oldest) {
                                    if tx.send_async(MonitorMessage::Oldest(oldest)).await.is_err() {
                                        return;
                                    }
                                    oldest_sent = Some(oldest);
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "polling user transactions failed"),
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *self.inner.monitor.borrow_mut() = Some(Monitor {
            rx,
            shutdown,
            handle,
        });
    }

    /// Apply new and buffered transactions. Returns the events to publish.
    fn apply_transactions(&self, incoming: Vec<MonitorMessage>) -> Vec<OrderEvent> {
        let mut state = self.inner.state.borrow_mut();
        let State {
            book,
            applied,
            unmatched,
            ..
        } = &mut *state;

        let mut oldest = None;
        for message in incoming {
            let transaction = match message {
                MonitorMessage::Transaction(transaction) => transaction,
                MonitorMessage::Oldest(id) => {
                    oldest = oldest.max(Some(id));
                    continue;
                }
            };
            if applied.contains(&transaction.id) || unmatched.iter().any(|u| u.id == transaction.id) {
                continue;
            }
            unmatched.push(transaction);
        }
        unmatched.sort_by_key(|t| t.id);

        let mut events = Vec::new();
        let mut pending = Vec::new();
        for transaction in std::mem::take(unmatched) {
            let Some(id) = book.find_by_exchange_id(&transaction.order_id) else {
                debug!(
                    transaction = transaction.id,
                    exchange_id = %transaction.order_id,
                    "buffering transaction for unknown order"
                );
                pending.push(transaction);
                continue;
            };
            applied.insert(transaction.id);

            let execution = OrderExecution {
                price: transaction.price,
                quantity: transaction.quantity(),
                commission: transaction.fee,
                date_time: transaction.date_time,
            };
            match book.fill(id, execution.clone()) {
                Ok(order) => {
                    info!(
                        order = %id,
                        transaction = transaction.id,
                        price = %execution.price,
                        quantity = %execution.quantity,
                        fee = %execution.commission,
                        "order filled"
                    );
                    let kind = if order.is_filled() {
                        OrderEventKind::Filled(execution)
                    } else {
                        OrderEventKind::PartiallyFilled(execution)
                    };
                    events.push(OrderEvent::new(order.clone(), kind));
                }
                Err(e) => warn!(
                    order = %id,
                    transaction = transaction.id,
                    error = %e,
                    "transaction does not apply to order"
                ),
            }
        }
        *unmatched = pending;
        if let Some(oldest) = oldest {
            applied.retain(|id| *id >= oldest);
        }
        events
    }

    fn unsupported(order_type: OrderType, quantity: Decimal) -> Result<OrderId> {
        check_order_shape(&order_type, quantity, true)?;
        Err(CoreError::InvalidOrder(format!(
            "unsupported order type {order_type:?}"
        )))
    }

    fn emit(&self, events: Vec<OrderEvent>) -> Result<()> {
        for event in &events {
            self.inner.order_events.emit(event)?;
        }
        Ok(())
    }
}

impl Broker for LiveBroker {
    fn balance(&self, symbol: &str) -> Decimal {
        self.inner
            .state
            .borrow()
            .balances
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }

    fn balances(&self) -> BTreeMap<String, Decimal> {
        self.inner.state.borrow().balances.clone()
    }

    fn active_orders(&self, instrument: Option<&Instrument>) -> Vec<Order> {
        self.inner
            .state
            .borrow()
            .book
            .active(instrument)
            .into_iter()
            .cloned()
            .collect()
    }

    fn order(&self, id: OrderId) -> Option<Order> {
        self.inner.state.borrow().book.get(id).cloned()
    }

    fn order_events(&self) -> &Event<OrderEvent> {
        &self.inner.order_events
    }

    fn create_market_order(
        &self,
        _: OrderAction,
        _: &Instrument,
        quantity: Decimal,
        on_close: bool,
    ) -> Result<OrderId> {
        Self::unsupported(OrderType::Market { on_close }, quantity)
    }

    /// Place the order on the exchange, then record it as Accepted.
    ///
    /// Funds are not checked locally: the exchange rejects what the account
    /// can't cover. Short sells are placed as sells.
    fn create_limit_order(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        limit_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId> {
        check_order_shape(&OrderType::Limit { limit_price }, quantity, true)?;
        let action = match action {
            OrderAction::SellShort => OrderAction::Sell,
            other => other,
        };
        let settings = &self.inner.settings;
        let quantity = settings.precision.round(quantity, &instrument.symbol);
        let limit_price = settings
            .precision
            .round(limit_price, &instrument.price_currency);
        if quantity.is_zero() {
            return Err(CoreError::InvalidOrder(format!(
                "quantity rounds to zero at {} decimals",
                settings.precision.digits(&instrument.symbol)
            )));
        }
        if let Some(validator) = &settings.validator {
            validator.validate(instrument, action, Some(limit_price), quantity)?;
        }

        let client = &self.inner.client;
        let placed = self.call(async {
            if action.is_buy() {
                client.buy_limit(instrument, limit_price, quantity).await
            } else {
                client.sell_limit(instrument, limit_price, quantity).await
            }
        })?;

        let snapshot = {
            let mut state = self.inner.state.borrow_mut();
            let id = state.book.next_id();
            let mut order = Order::new(
                id,
                action,
                instrument.clone(),
                OrderType::Limit { limit_price },
                quantity,
                Some(placed.date_time),
            );
            order.set_good_till_canceled(true);
            order.set_exchange_id(placed.id.clone());
            order.accept(placed.date_time)?;
            state.book.insert(order.clone());
            order
        };
        info!(
            order = %snapshot.id(),
            exchange_id = %placed.id,
            action = ?action,
            instrument = %instrument,
            price = %limit_price,
            quantity = %quantity,
            "order placed"
        );
        let id = snapshot.id();
        self.inner
            .order_events
            .emit(&OrderEvent::new(snapshot, OrderEventKind::Accepted))?;
        Ok(id)
    }

    fn create_stop_order(
        &self,
        _: OrderAction,
        _: &Instrument,
        stop_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId> {
        Self::unsupported(OrderType::Stop { stop_price }, quantity)
    }

    fn create_stop_limit_order(
        &self,
        _: OrderAction,
        _: &Instrument,
        stop_price: Decimal,
        limit_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId> {
        Self::unsupported(
            OrderType::StopLimit {
                stop_price,
                limit_price,
            },
            quantity,
        )
    }

    /// Cancel on the exchange first. The local order changes only if that succeeds.
    fn cancel_order(&self, id: OrderId) -> Result<()> {
        let exchange_id = {
            let state = self.inner.state.borrow();
            match state.book.get(id) {
                Some(order) if order.is_filled() => return Err(CoreError::OrderAlreadyFilled(id)),
                Some(order) if order.is_active() => order
                    .exchange_id()
                    .map(str::to_string)
                    .ok_or_else(|| CoreError::InvalidState(format!("order {id} has no exchange id")))?,
                _ => return Err(CoreError::OrderNotActive(id)),
            }
        };
        self.call(self.inner.client.cancel_order(&exchange_id))?;

        let snapshot = self.inner.state.borrow_mut().book.cancel(id)?.clone();
        info!(order = %id, exchange_id = %exchange_id, "order canceled");
        self.inner.order_events.emit(&OrderEvent::new(
            snapshot,
            OrderEventKind::Canceled("User requested cancellation".into()),
        ))
    }
}

impl Subject for LiveBroker {
    fn name(&self) -> String {
        "live-broker".into()
    }

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::Broker
    }

    fn start(&mut self) -> Result<()> {
        if self.inner.state.borrow().started {
            return Err(CoreError::InvalidState("live broker already started".into()));
        }
        self.inner.state.borrow_mut().started = true;

        self.refresh_balances()?;
        self.reconcile_open_orders()?;

        let consumed: HashSet<u64> = self
            .call(self.inner.client.user_transactions())?
            .into_iter()
            .map(|t| t.id)
            .collect();
        info!(
            open_orders = self.inner.state.borrow().book.len(),
            consumed = consumed.len(),
            "live broker reconciled"
        );
        self.inner.state.borrow_mut().applied.extend(consumed.iter().copied());
        self.start_monitor(consumed);
        Ok(())
    }

    fn stop(&mut self) {
        self.inner.state.borrow_mut().stopped = true;
        if let Some(monitor) = self.inner.monitor.borrow().as_ref() {
            let _ = monitor.shutdown.send(true);
        }
    }

    fn join(&mut self) {
        let monitor = self.inner.monitor.borrow_mut().take();
        if let Some(monitor) = monitor {
            let _ = monitor.shutdown.send(true);
            if let Err(e) = self.inner.runtime.block_on(monitor.handle) {
                warn!(error = %e, "transaction monitor did not finish cleanly");
            }
        }
    }

    fn eof(&self) -> bool {
        self.inner.state.borrow().stopped
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn dispatch(&mut self) -> Result<Dispatch> {
        let rx = match self.inner.monitor.borrow().as_ref() {
            Some(monitor) => monitor.rx.clone(),
            None => return Ok(Dispatch::Nothing),
        };

        let mut incoming = Vec::new();
        match rx.recv_timeout(self.inner.settings.queue_timeout) {
            Ok(message) => incoming.push(message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("transaction monitor stopped, no more fills will arrive");
                self.inner.state.borrow_mut().stopped = true;
            }
        }
        incoming.extend(rx.drain());

        let events = self.apply_transactions(incoming);
        if events.is_empty() {
            return Ok(Dispatch::Nothing);
        }
        self.refresh_balances()?;
        self.emit(events)?;
        Ok(Dispatch::Produced(None))
    }
}
