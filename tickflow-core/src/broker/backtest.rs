//! Backtesting broker: matches orders against the bars of a `BarFeed`.
//!
//! On every tick, before strategies see the bars, the broker:
//! 1. resets the fill strategy's per-bar volume budgets
//! 2. freezes the list of active orders (orders created while processing wait
//!    for the next tick)
//! 3. accepts submitted orders that have a bar in this tick
//! 4. expires stale day orders, tries to fill, and commits fills to the ledger
//!
//! A fill is committed only when the resulting balances stay non-negative.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{
    check_funds, check_order_shape, reference_price, to_decimal, Broker, Commission,
    DefaultFillStrategy, FillInfo, FillStrategy, NoCommission, OrderBook, Precision,
    TradeValidator,
};
use crate::dispatcher::{Dispatch, DispatchPriority, Subject};
use crate::domain::{
    Bar, Bars, Frequency, Instrument, Order, OrderAction, OrderEvent, OrderEventKind,
    OrderExecution, OrderId, OrderStatus, OrderType,
};
use crate::error::{CoreError, Result};
use crate::feed::BarFeed;
use crate::observer::Event;

/// Policies a broker is built with.
#[derive(Debug)]
pub struct BrokerSettings {
    pub commission: Box<dyn Commission>,
    pub precision: Precision,
    pub fill_strategy: Box<dyn FillStrategy>,
    pub validator: Option<Box<dyn TradeValidator>>,
    /// Reject market, stop and stop-limit orders.
    pub limit_orders_only: bool,
    /// Whether new orders are good-till-canceled.
    pub good_till_canceled: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            commission: Box::new(NoCommission),
            precision: Precision::default(),
            fill_strategy: Box::new(DefaultFillStrategy::default()),
            validator: None,
            limit_orders_only: false,
            good_till_canceled: false,
        }
    }
}

struct State {
    settings: BrokerSettings,
    balances: BTreeMap<String, Decimal>,
    /// Reference prices from `set_shares`, used until the feed has a bar.
    prices: HashMap<Instrument, Decimal>,
    book: OrderBook,
    started: bool,
}

struct Inner {
    feed: BarFeed,
    state: RefCell<State>,
    order_events: Event<OrderEvent>,
}

/// Cheap-clone handle. One clone goes to the dispatcher, others to strategies.
#[derive(Clone)]
pub struct BacktestBroker {
    inner: Rc<Inner>,
}

impl BacktestBroker {
    /// Build a broker over `feed` with starting balances per asset symbol.
    ///
    /// The broker subscribes to the feed right away, so it sees each tick before
    /// handlers subscribed after it.
    pub fn new<I, S>(balances: I, feed: &BarFeed, settings: BrokerSettings) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        let balances = balances
            .into_iter()
            .map(|(symbol, amount)| {
                let symbol = symbol.into();
                let amount = settings.precision.round(amount, &symbol);
                (symbol, amount)
            })
            .collect();

        let inner = Rc::new(Inner {
            feed: feed.clone(),
            state: RefCell::new(State {
                settings,
                balances,
                prices: HashMap::new(),
                book: OrderBook::new(),
                started: false,
            }),
            order_events: Event::new(),
        });

        let weak = Rc::downgrade(&inner);
        feed.subscribe(move |(_, bars)| match weak.upgrade() {
            Some(inner) => BacktestBroker { inner }.on_bars(bars),
            None => Ok(()),
        });

        Self { inner }
    }

    pub fn feed(&self) -> &BarFeed {
        &self.inner.feed
    }

    pub fn precision(&self) -> Precision {
        self.inner.state.borrow().settings.precision.clone()
    }

    pub fn set_good_till_canceled(&self, id: OrderId, gtc: bool) -> Result<()> {
        self.with_active(id, |order| order.set_good_till_canceled(gtc))
    }

    pub fn set_all_or_none(&self, id: OrderId, all_or_none: bool) -> Result<()> {
        self.with_active(id, |order| order.set_all_or_none(all_or_none))
    }

    /// Seed a holding and its reference price. Only allowed before the run starts.
    pub fn set_shares(&self, instrument: &Instrument, quantity: Decimal, price: Decimal) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.started {
            return Err(CoreError::InvalidState(
                "shares can only be set before the broker starts".into(),
            ));
        }
        let quantity = state.settings.precision.round(quantity, &instrument.symbol);
        state.balances.insert(instrument.symbol.clone(), quantity);
        state.prices.insert(instrument.clone(), price);
        Ok(())
    }

    /// Value of every balance in `currency`, priced at the last bar (or the
    /// `set_shares` reference price before any bar arrived).
    pub fn equity(&self, currency: &str) -> Result<Decimal> {
        let state = self.inner.state.borrow();
        let mut total = Decimal::ZERO;
        for (symbol, amount) in &state.balances {
            if amount.is_zero() {
                continue;
            }
            if symbol == currency {
                total += *amount;
                continue;
            }
            let instrument = Instrument::new(symbol.as_str(), currency);
            let price = match self.inner.feed.last_bar(&instrument) {
                Some(bar) => to_decimal(bar.price())?,
                None => state.prices.get(&instrument).copied().ok_or_else(|| {
                    CoreError::MissingPrice {
                        symbol: symbol.clone(),
                        currency: currency.to_string(),
                    }
                })?,
            };
            total += price * *amount;
        }
        Ok(state.settings.precision.round(total, currency))
    }

    fn with_active(&self, id: OrderId, f: impl FnOnce(&mut Order)) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        match state.book.get_mut(id) {
            Some(order) if order.is_active() => {
                f(order);
                Ok(())
            }
            _ => Err(CoreError::OrderNotActive(id)),
        }
    }

    fn last_price(&self, instrument: &Instrument) -> Result<Option<Decimal>> {
        match self.inner.feed.last_bar(instrument) {
            Some(bar) => to_decimal(bar.price()).map(Some),
            None => Ok(self.inner.state.borrow().prices.get(instrument).copied()),
        }
    }

    fn submit(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        order_type: OrderType,
        quantity: Decimal,
    ) -> Result<OrderId> {
        let limit_only = self.inner.state.borrow().settings.limit_orders_only;
        check_order_shape(&order_type, quantity, limit_only)?;
        if !self.inner.feed.registered_instruments().contains(instrument) {
            return Err(CoreError::UnknownInstrument(instrument.to_string()));
        }
        if matches!(order_type, OrderType::Market { on_close: true }) && self.inner.feed.is_intraday() {
            return Err(CoreError::InvalidOrder(
                "Market-on-close not supported with intraday feeds".into(),
            ));
        }
        let last_price = self.last_price(instrument)?;
        let submitted_at = self.inner.feed.current_date_time();

        let snapshot = {
            let mut state = self.inner.state.borrow_mut();
            let State {
                settings,
                balances,
                book,
                ..
            } = &mut *state;

            let quantity = settings.precision.round(quantity, &instrument.symbol);
            if quantity.is_zero() {
                return Err(CoreError::InvalidOrder(format!(
                    "quantity rounds to zero at {} decimals",
                    settings.precision.digits(&instrument.symbol)
                )));
            }
            if let Some(validator) = &settings.validator {
                validator.validate(instrument, action, order_type.limit_price(), quantity)?;
            }

            let mut order = Order::new(
                book.pending_id(),
                action,
                instrument.clone(),
                order_type,
                quantity,
                submitted_at,
            );
            order.set_good_till_canceled(settings.good_till_canceled);
            check_funds(
                balances,
                &order,
                reference_price(order.order_type(), last_price),
                settings.commission.as_ref(),
                &settings.precision,
            )?;
            book.insert(order.clone());
            order
        };

        info!(
            order = %snapshot.id(),
            action = ?snapshot.action(),
            instrument = %snapshot.instrument(),
            quantity = %snapshot.quantity(),
            "order submitted"
        );
        let id = snapshot.id();
        self.inner
            .order_events
            .emit(&OrderEvent::new(snapshot, OrderEventKind::Submitted))?;
        Ok(id)
    }

    fn on_bars(&self, bars: &Bars) -> Result<()> {
        let ids = {
            let mut state = self.inner.state.borrow_mut();
            let State { settings, book, .. } = &mut *state;
            settings.fill_strategy.on_bars(bars, &settings.precision)?;
            book.active_ids()
        };

        for id in ids {
            let (instrument, status) = match self.inner.state.borrow().book.get(id) {
                Some(order) if order.is_active() => (order.instrument().clone(), order.status()),
                _ => continue,
            };
            let Some(bar) = bars.bar(&instrument).cloned() else {
                continue;
            };

            if status == OrderStatus::Submitted {
                let snapshot = self
                    .inner
                    .state
                    .borrow_mut()
                    .book
                    .accept(id, bars.date_time())?
                    .clone();
                self.inner
                    .order_events
                    .emit(&OrderEvent::new(snapshot, OrderEventKind::Accepted))?;
            }
            self.process_order(id, &*bar)?;
        }
        Ok(())
    }

    fn process_order(&self, id: OrderId, bar: &dyn Bar) -> Result<()> {
        let bar_date = bar.date_time().date_naive();
        if self.expire_if(id, |accepted| bar_date > accepted)? {
            return Ok(());
        }

        let use_adjusted = self.inner.feed.use_adjusted_values();
        let fill = {
            let mut state = self.inner.state.borrow_mut();
            let State { settings, book, .. } = &mut *state;
            match book.get_mut(id) {
                Some(order) if order.is_active() => settings.fill_strategy.fill(
                    order,
                    bar,
                    use_adjusted,
                    &settings.precision,
                )?,
                _ => return Ok(()),
            }
        };
        if let Some(fill) = fill {
            self.commit_execution(id, fill, bar.date_time())?;
        }

        // Day orders on daily or coarser bars only get the one bar.
        if self.inner.feed.frequency() >= Frequency::Day {
            self.expire_if(id, |accepted| bar_date >= accepted)?;
        }
        Ok(())
    }

    /// Cancel a non-GTC active order as expired when `stale(accepted_date)` holds.
    fn expire_if(&self, id: OrderId, stale: impl FnOnce(NaiveDate) -> bool) -> Result<bool> {
        let snapshot = {
            let mut state = self.inner.state.borrow_mut();
            let expired = match state.book.get(id) {
                Some(order) if order.is_active() && !order.good_till_canceled() => order
                    .accepted_at()
                    .map_or(false, |at| stale(at.date_naive())),
                _ => false,
            };
            if !expired {
                return Ok(false);
            }
            state.book.cancel(id)?.clone()
        };
        debug!(order = %id, "order expired");
        self.inner.order_events.emit(&OrderEvent::new(
            snapshot,
            OrderEventKind::Canceled("Expired".into()),
        ))?;
        Ok(true)
    }

    fn commit_execution(&self, id: OrderId, fill: FillInfo, at: DateTime<Utc>) -> Result<()> {
        let (snapshot, execution) = {
            let mut state = self.inner.state.borrow_mut();
            let State {
                settings,
                balances,
                book,
                ..
            } = &mut *state;

            let order = book.get(id).ok_or(CoreError::OrderNotActive(id))?;
            let instrument = order.instrument().clone();
            let commission =
                settings
                    .commission
                    .calculate(order, fill.price, fill.quantity, &settings.precision);
            let notional = fill.price * fill.quantity;
            let (base_delta, quote_delta) = if order.is_buy() {
                (fill.quantity, -notional - commission)
            } else {
                (-fill.quantity, notional - commission)
            };

            let balance = |symbol: &str| balances.get(symbol).copied().unwrap_or_default();
            let base = settings
                .precision
                .round(balance(&instrument.symbol) + base_delta, &instrument.symbol);
            let quote = settings.precision.round(
                balance(&instrument.price_currency) + quote_delta,
                &instrument.price_currency,
            );
            if base < Decimal::ZERO || quote < Decimal::ZERO {
                debug!(
                    order = %id,
                    base = %base,
                    quote = %quote,
                    "not enough funds to fill order"
                );
                return Ok(());
            }

            let execution = OrderExecution {
                price: fill.price,
                quantity: fill.quantity,
                commission,
                date_time: at,
            };
            let snapshot = book.fill(id, execution.clone())?.clone();
            balances.insert(instrument.symbol.clone(), base);
            balances.insert(instrument.price_currency.clone(), quote);
            settings.fill_strategy.on_order_filled(&snapshot, fill.quantity);
            (snapshot, execution)
        };

        info!(
            order = %id,
            price = %execution.price,
            quantity = %execution.quantity,
            commission = %execution.commission,
            "order filled"
        );
        let kind = if snapshot.is_filled() {
            OrderEventKind::Filled(execution)
        } else {
            OrderEventKind::PartiallyFilled(execution)
        };
        self.inner.order_events.emit(&OrderEvent::new(snapshot, kind))
    }
}

impl Broker for BacktestBroker {
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
        action: OrderAction,
        instrument: &Instrument,
        quantity: Decimal,
        on_close: bool,
    ) -> Result<OrderId> {
        self.submit(action, instrument, OrderType::Market { on_close }, quantity)
    }

    fn create_limit_order(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        limit_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId> {
        self.submit(action, instrument, OrderType::Limit { limit_price }, quantity)
    }

    fn create_stop_order(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        stop_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId> {
        self.submit(action, instrument, OrderType::Stop { stop_price }, quantity)
    }

    fn create_stop_limit_order(
        &self,
        action: OrderAction,
        instrument: &Instrument,
        stop_price: Decimal,
        limit_price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId> {
        self.submit(
            action,
            instrument,
            OrderType::StopLimit {
                stop_price,
                limit_price,
            },
            quantity,
        )
    }

    fn cancel_order(&self, id: OrderId) -> Result<()> {
        let snapshot = self.inner.state.borrow_mut().book.cancel(id)?.clone();
        info!(order = %id, "order canceled");
        self.inner.order_events.emit(&OrderEvent::new(
            snapshot,
            OrderEventKind::Canceled("User requested cancellation".into()),
        ))
    }
}

impl Subject for BacktestBroker {
    fn name(&self) -> String {
        "backtest-broker".into()
    }

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::Broker
    }

    fn start(&mut self) -> Result<()> {
        self.inner.state.borrow_mut().started = true;
        Ok(())
    }

    fn stop(&mut self) {}

    fn join(&mut self) {}

    fn eof(&self) -> bool {
        Subject::eof(&self.inner.feed)
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn dispatch(&mut self) -> Result<Dispatch> {
        Ok(Dispatch::Nothing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FixedPerTrade, TradePercentage};
    use crate::domain::BasicBar;
    use crate::feed::MemorySource;
    use chrono::{Duration, TimeZone};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn orcl() -> Instrument {
        Instrument::new("ORCL", "USD")
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn daily(n: i64, open: f64, high: f64, low: f64, close: f64) -> BasicBar {
        BasicBar::new(orcl(), day(n), open, high, low, close, 1000.0, None, Frequency::Day)
            .unwrap()
    }

    fn setup(bars: Vec<BasicBar>, cash: &str, settings: BrokerSettings) -> (BarFeed, BacktestBroker) {
        let frequency = bars[0].frequency();
        let mut source = MemorySource::new(frequency);
        source.add_bars(bars).unwrap();
        let feed = BarFeed::new(source, 100);
        let broker = BacktestBroker::new([("USD", d(cash))], &feed, settings);
        (feed, broker)
    }

    fn step(feed: &BarFeed) {
        let mut subject = feed.clone();
        subject.dispatch().unwrap();
    }

    fn record(broker: &BacktestBroker) -> Rc<RefCell<Vec<OrderEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        broker.order_events().subscribe(move |e: &OrderEvent| {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });
        events
    }

    fn kinds(events: &Rc<RefCell<Vec<OrderEvent>>>) -> Vec<&'static str> {
        events
            .borrow()
            .iter()
            .map(|e| match e.kind {
                OrderEventKind::Submitted => "submitted",
                OrderEventKind::Accepted => "accepted",
                OrderEventKind::PartiallyFilled(_) => "partial",
                OrderEventKind::Filled(_) => "filled",
                OrderEventKind::Canceled(_) => "canceled",
            })
            .collect()
    }

    #[test]
    fn market_order_fills_at_next_open() {
        let (feed, broker) = setup(
            vec![daily(0, 10.0, 11.0, 9.0, 10.5), daily(1, 12.0, 13.0, 11.0, 12.5)],
            "1000",
            BrokerSettings {
                commission: Box::new(FixedPerTrade { amount: d("1") }),
                ..BrokerSettings::default()
            },
        );
        let events = record(&broker);
        step(&feed);

        let id = broker
            .create_market_order(OrderAction::Buy, &orcl(), d("10"), false)
            .unwrap();
        assert_eq!(broker.order(id).unwrap().status(), OrderStatus::Submitted);
        step(&feed);

        let order = broker.order(id).unwrap();
        assert!(order.is_filled());
        assert_eq!(order.avg_fill_price(), Some(d("12")));
        assert_eq!(broker.balance("ORCL"), d("10"));
        assert_eq!(broker.balance("USD"), d("879"));
        assert_eq!(kinds(&events), vec!["submitted", "accepted", "filled"]);
    }

    #[test]
    fn day_limit_order_expires_after_its_bar() {
        let (feed, broker) = setup(
            vec![
                daily(0, 10.0, 11.0, 9.0, 10.5),
                daily(1, 12.0, 13.0, 11.0, 12.5),
                daily(2, 8.0, 9.0, 7.0, 8.5),
            ],
            "1000",
            BrokerSettings::default(),
        );
        let events = record(&broker);
        step(&feed);
        let id = broker
            .create_limit_order(OrderAction::Buy, &orcl(), d("9"), d("1"))
            .unwrap();
        step(&feed);

        assert!(broker.order(id).unwrap().is_canceled());
        assert_eq!(kinds(&events), vec!["submitted", "accepted", "canceled"]);
        match &events.borrow()[2].kind {
            OrderEventKind::Canceled(reason) => assert_eq!(reason, "Expired"),
            other => panic!("unexpected {other:?}"),
        }
        step(&feed);
        assert_eq!(broker.balance("ORCL"), Decimal::ZERO);
    }

    #[test]
    fn gtc_limit_order_waits_for_price() {
        let (feed, broker) = setup(
            vec![
                daily(0, 10.0, 11.0, 9.0, 10.5),
                daily(1, 12.0, 13.0, 11.0, 12.5),
                daily(2, 9.5, 10.0, 8.0, 8.5),
            ],
            "1000",
            BrokerSettings {
                good_till_canceled: true,
                ..BrokerSettings::default()
            },
        );
        step(&feed);
        let id = broker
            .create_limit_order(OrderAction::Buy, &orcl(), d("9"), d("1"))
            .unwrap();
        step(&feed);
        assert_eq!(broker.order(id).unwrap().status(), OrderStatus::Accepted);
        step(&feed);
        assert_eq!(broker.order(id).unwrap().avg_fill_price(), Some(d("9")));
        assert_eq!(broker.balance("USD"), d("991"));
    }

    #[test]
    fn cancel_semantics() {
        let (feed, broker) = setup(
            vec![daily(0, 10.0, 11.0, 9.0, 10.5), daily(1, 12.0, 13.0, 11.0, 12.5)],
            "1000",
            BrokerSettings::default(),
        );
        step(&feed);
        let pending = broker
            .create_limit_order(OrderAction::Buy, &orcl(), d("1"), d("1"))
            .unwrap();
        let filled = broker
            .create_market_order(OrderAction::Buy, &orcl(), d("1"), false)
            .unwrap();
        broker.cancel_order(pending).unwrap();
        assert!(matches!(
            broker.cancel_order(pending),
            Err(CoreError::OrderNotActive(_))
        ));
        step(&feed);
        assert!(matches!(
            broker.cancel_order(filled),
            Err(CoreError::OrderAlreadyFilled(_))
        ));
        assert!(broker.active_orders(None).is_empty());
    }

    #[test]
    fn rejects_invalid_orders_without_side_effects() {
        let (feed, broker) = setup(
            vec![daily(0, 10.0, 11.0, 9.0, 10.5), daily(1, 12.0, 13.0, 11.0, 12.5)],
            "100",
            BrokerSettings {
                commission: Box::new(TradePercentage { percentage: d("0.01") }),
                ..BrokerSettings::default()
            },
        );
        let events = record(&broker);
        step(&feed);

        let err = broker
            .create_limit_order(OrderAction::Buy, &orcl(), d("10"), d("10"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Not enough USD. 101 required. 100 available");
        assert!(matches!(
            broker.create_market_order(OrderAction::Sell, &orcl(), d("1"), false),
            Err(CoreError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            broker.create_market_order(OrderAction::Buy, &Instrument::new("MSFT", "USD"), d("1"), false),
            Err(CoreError::UnknownInstrument(_))
        ));
        assert!(broker
            .create_market_order(OrderAction::Buy, &orcl(), d("0"), false)
            .is_err());

        assert!(events.borrow().is_empty());
        assert!(broker.active_orders(None).is_empty());
        assert_eq!(broker.balance("USD"), d("100"));
    }

    #[test]
    fn market_on_close_needs_daily_bars() {
        let minute = |m: i64, price: f64| {
            BasicBar::new(
                orcl(),
                day(0) + Duration::minutes(m),
                price,
                price,
                price,
                price,
                100.0,
                None,
                Frequency::Minute,
            )
            .unwrap()
        };
        let (_, broker) = setup(vec![minute(0, 10.0), minute(1, 11.0)], "1000", BrokerSettings::default());
        let err = broker
            .create_market_order(OrderAction::Buy, &orcl(), d("1"), true)
            .unwrap_err();
        assert!(err.to_string().contains("Market-on-close not supported with intraday feeds"));

        let (feed, daily_broker) = setup(
            vec![daily(0, 10.0, 11.0, 9.0, 10.5)],
            "1000",
            BrokerSettings::default(),
        );
        let id = daily_broker
            .create_market_order(OrderAction::Buy, &orcl(), d("1"), true)
            .unwrap();
        step(&feed);
        assert_eq!(daily_broker.order(id).unwrap().avg_fill_price(), Some(d("10.5")));
    }

    #[test]
    fn fill_that_would_overdraw_is_skipped() {
        let (feed, broker) = setup(
            vec![daily(0, 150.0, 150.0, 150.0, 150.0), daily(1, 90.0, 90.0, 90.0, 90.0)],
            "100",
            BrokerSettings {
                good_till_canceled: true,
                ..BrokerSettings::default()
            },
        );
        // No price known yet, so the order is accepted without a funds check.
        let id = broker
            .create_market_order(OrderAction::Buy, &orcl(), d("1"), false)
            .unwrap();
        step(&feed);
        assert_eq!(broker.order(id).unwrap().status(), OrderStatus::Accepted);
        assert_eq!(broker.balance("USD"), d("100"));
        step(&feed);
        assert!(broker.order(id).unwrap().is_filled());
        assert_eq!(broker.balance("USD"), d("10"));
    }

    #[test]
    fn shares_and_equity() {
        let (feed, broker) = setup(
            vec![daily(0, 10.0, 11.0, 9.0, 12.0)],
            "100",
            BrokerSettings::default(),
        );
        broker.set_shares(&orcl(), d("5"), d("10")).unwrap();
        assert_eq!(broker.equity("USD").unwrap(), d("150"));
        assert!(matches!(broker.equity("EUR"), Err(CoreError::MissingPrice { .. })));

        let mut subject = broker.clone();
        subject.start().unwrap();
        assert!(broker.set_shares(&orcl(), d("1"), d("1")).is_err());

        step(&feed);
        assert_eq!(broker.equity("USD").unwrap(), d("160"));
    }

    #[test]
    fn handlers_may_submit_during_events() {
        let (feed, broker) = setup(
            vec![
                daily(0, 10.0, 11.0, 9.0, 10.5),
                daily(1, 12.0, 13.0, 11.0, 12.5),
                daily(2, 13.0, 14.0, 12.0, 13.5),
            ],
            "1000",
            BrokerSettings::default(),
        );
        let inner = broker.clone();
        broker.order_events().subscribe(move |e: &OrderEvent| {
            if matches!(e.kind, OrderEventKind::Filled(_)) && e.order.is_buy() {
                inner.create_market_order(OrderAction::Sell, e.order.instrument(), e.order.quantity(), false)?;
            }
            Ok(())
        });
        step(&feed);
        broker
            .create_market_order(OrderAction::Buy, &orcl(), d("2"), false)
            .unwrap();
        step(&feed);
        // The sell was created during processing, so it waits for the next tick.
        assert_eq!(broker.active_orders(None).len(), 1);
        step(&feed);
        assert_eq!(broker.balance("ORCL"), Decimal::ZERO);
        assert_eq!(broker.balance("USD"), d("1002"));
    }
}
