//! Integration tests for the live reconciliation broker against a mock account.
//!
//! These tests run `LiveBroker` through the dispatcher and check:
//! 1. Resting exchange orders are registered on start; new transactions map onto them
//! 2. Transactions consumed before start are never reapplied, and remembered ids
//!    shrink to the exchange's window without letting a fill apply twice
//! 3. Cancellation goes to the exchange before the local transition
//! 4. A full buy/sell lifecycle with partial fills and fees
//! 5. Transactions for orders not yet registered are buffered, then applied
//! 6. Unsupported order types and exchange minimums are rejected without exchange calls

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use common::{btc, d, transaction, MockTradingClient};
use tickflow_core::broker::Broker;
use tickflow_core::dispatcher::Dispatcher;
use tickflow_core::domain::{OrderAction, OrderEvent, OrderEventKind};
use tickflow_core::CoreError;
use tickflow_live::{LiveBroker, LiveBrokerSettings, LiveConfig};

// ── Helpers ──────────────────────────────────────────────────────────

fn settings() -> LiveBrokerSettings {
    LiveBrokerSettings {
        poll_interval: Duration::from_millis(20),
        ..LiveBrokerSettings::default()
    }
}

fn record(broker: &LiveBroker) -> Rc<RefCell<Vec<OrderEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    broker.order_events().subscribe(move |e: &OrderEvent| {
        sink.borrow_mut().push(e.clone());
        Ok(())
    });
    events
}

fn kind_name(kind: &OrderEventKind) -> &'static str {
    match kind {
        OrderEventKind::Submitted => "submitted",
        OrderEventKind::Accepted => "accepted",
        OrderEventKind::PartiallyFilled(_) => "partial",
        OrderEventKind::Filled(_) => "filled",
        OrderEventKind::Canceled(_) => "canceled",
    }
}

/// Dispatcher over `broker` that stops itself after `max_idle` empty passes.
fn dispatcher_for(broker: &LiveBroker, max_idle: usize) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.add_subject(broker.clone());
    let stop = dispatcher.stop_handle();
    let idles = Cell::new(0usize);
    dispatcher.idle_event().subscribe(move |_| {
        idles.set(idles.get() + 1);
        if idles.get() >= max_idle {
            stop.stop();
        }
        Ok(())
    });
    dispatcher
}

// ── 1. Reconciliation ────────────────────────────────────────────────

#[test]
fn maps_transactions_onto_registered_open_orders() {
    let client = MockTradingClient::new();
    client.set_balance("USD", d("100"));
    client.set_balance("BTC", d("1"));
    client.add_open_order("1", OrderAction::Sell, d("578.79"), d("0.1"));
    client.add_open_order("2", OrderAction::Buy, d("567.21"), d("0.1"));
    client.add_fresh(transaction(1, "1", d("-0.04557395"), d("26.38"), d("578.79"), d("0.14")));
    client.add_fresh(transaction(2, "2", d("0.04601436"), d("-26.10"), d("567.21"), d("0.14")));

    let broker = LiveBroker::new(client.clone(), settings()).unwrap();
    let events = record(&broker);
    let mut dispatcher = dispatcher_for(&broker, 500);
    let stop = dispatcher.stop_handle();
    let seen = events.clone();
    broker.order_events().subscribe(move |_| {
        if seen.borrow().len() >= 2 {
            stop.stop();
        }
        Ok(())
    });
    dispatcher.run().unwrap();

    let events = events.borrow();
    assert_eq!(events.len(), 2, "registration publishes no events, fills do");

    let sell = &events[0];
    assert_eq!(sell.order.exchange_id(), Some("1"));
    assert_eq!(sell.order.action(), OrderAction::Sell);
    let OrderEventKind::PartiallyFilled(execution) = &sell.kind else {
        panic!("expected a partial fill, got {:?}", sell.kind);
    };
    assert_eq!(execution.price, d("578.79"));
    assert_eq!(execution.quantity, d("0.04557395"));
    assert_eq!(execution.commission, d("0.14"));
    assert_eq!(sell.order.remaining(), d("0.05442605"));

    let buy = &events[1];
    assert_eq!(buy.order.exchange_id(), Some("2"));
    assert_eq!(buy.execution().unwrap().quantity, d("0.04601436"));
    assert!(buy.order.is_active());

    assert_eq!(broker.active_orders(Some(&btc())).len(), 2);
    assert_eq!(broker.balance("USD"), d("100"));
    assert_eq!(broker.balance("BTC"), d("1"));
}

// ── 2. Restart safety ────────────────────────────────────────────────

#[test]
fn consumed_transactions_are_not_reapplied() {
    let client = MockTradingClient::new();
    client.add_open_order("1", OrderAction::Sell, d("578.79"), d("0.05442605"));
    client.add_history(transaction(1, "1", d("-0.04557395"), d("26.38"), d("578.79"), d("0.14")));

    let broker = LiveBroker::new(client.clone(), settings()).unwrap();
    let events = record(&broker);
    // Long enough for several polls.
    dispatcher_for(&broker, 30).run().unwrap();

    assert!(events.borrow().is_empty());
    let orders = broker.active_orders(None);
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].filled(), d("0"));
    assert_eq!(orders[0].quantity(), d("0.05442605"));
}

#[test]
fn remembered_ids_follow_the_exchange_window() {
    let client = MockTradingClient::new();
    client.set_window(2);
    client.add_open_order("1", OrderAction::Sell, d("600"), d("1"));
    client.add_history(transaction(1, "9", d("-0.1"), d("60"), d("600"), d("0.1")));
    client.add_history(transaction(2, "9", d("-0.1"), d("60"), d("600"), d("0.1")));
    client.fill("1", d("-0.25"), d("600"), d("0.2"));
    client.fill("1", d("-0.25"), d("600"), d("0.2"));

    let broker = LiveBroker::new(client.clone(), settings()).unwrap();
    let events = record(&broker);
    // Several polls keep returning the same two fills.
    dispatcher_for(&broker, 30).run().unwrap();

    let events = events.borrow();
    assert_eq!(events.len(), 2);
    assert_eq!(kind_name(&events[1].kind), "partial");
    let order = broker.order(events[1].order.id()).unwrap();
    assert_eq!(order.filled(), d("0.5"));
    // History ids 1 and 2 fell out of the window, only the fills remain.
    assert_eq!(broker.tracked_transactions(), 2);
}

// ── 3. Cancellation ──────────────────────────────────────────────────

#[test]
fn cancel_reaches_exchange_before_local_transition() {
    let client = MockTradingClient::new();
    client.add_open_order("1", OrderAction::Buy, d("567.21"), d("0.1"));

    let broker = LiveBroker::new(client.clone(), settings()).unwrap();
    let events = record(&broker);
    let mut dispatcher = dispatcher_for(&broker, 500);
    let stop = dispatcher.stop_handle();
    let handle = broker.clone();
    dispatcher.start_event().subscribe(move |_| {
        let id = handle.active_orders(None)[0].id();
        handle.cancel_order(id)?;
        stop.stop();
        Ok(())
    });
    dispatcher.run().unwrap();

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].kind,
        OrderEventKind::Canceled("User requested cancellation".into())
    );
    assert!(events[0].order.executions().is_empty());
    assert_eq!(client.canceled(), vec!["1".to_string()]);
    assert!(broker.active_orders(None).is_empty());
    assert_eq!(broker.balance("USD"), d("0"));

    let id = events[0].order.id();
    assert!(matches!(broker.cancel_order(id), Err(CoreError::OrderNotActive(_))));
}

// ── 4. Buy/sell lifecycle ────────────────────────────────────────────

#[test]
fn buy_then_sell_with_partial_fills() {
    let client = MockTradingClient::new();
    client.set_balance("USD", d("100"));

    let broker = LiveBroker::new(client.clone(), settings()).unwrap();
    let events = record(&broker);
    let mut dispatcher = dispatcher_for(&broker, 1000);

    let handle = broker.clone();
    dispatcher.start_event().subscribe(move |_| {
        handle.create_limit_order(OrderAction::Buy, &btc(), d("10"), d("1"))?;
        Ok(())
    });

    // The exchange side: fill what gets placed.
    let bought = Rc::new(Cell::new(false));
    let stop = dispatcher.stop_handle();
    let exchange = client.clone();
    let flag = bought.clone();
    broker.order_events().subscribe(move |e: &OrderEvent| {
        let exchange_id = e.order.exchange_id().unwrap_or_default().to_string();
        match (&e.kind, e.order.is_buy()) {
            (OrderEventKind::Accepted, true) | (OrderEventKind::PartiallyFilled(_), true) => {
                exchange.fill(&exchange_id, d("0.5"), d("10"), d("0.01"));
            }
            (OrderEventKind::Filled(_), true) => flag.set(true),
            (OrderEventKind::Accepted, false) => {
                exchange.fill(&exchange_id, d("-1"), d("11"), d("0.02"));
            }
            (OrderEventKind::Filled(_), false) => stop.stop(),
            _ => {}
        }
        Ok(())
    });

    // Orders can't be placed from inside an order event, so sell once idle.
    let handle = broker.clone();
    let sold = Cell::new(false);
    dispatcher.idle_event().subscribe(move |_| {
        if bought.get() && !sold.get() {
            sold.set(true);
            handle.create_limit_order(OrderAction::Sell, &btc(), d("11"), d("1"))?;
        }
        Ok(())
    });
    dispatcher.run().unwrap();

    let events = events.borrow();
    let kinds: Vec<&str> = events.iter().map(|e| kind_name(&e.kind)).collect();
    assert_eq!(kinds, vec!["accepted", "partial", "filled", "accepted", "filled"]);

    let buy = &events[2].order;
    assert!(buy.is_filled());
    assert_eq!(buy.avg_fill_price(), Some(d("10")));
    assert_eq!(buy.commission(), d("0.02"));
    assert_eq!(buy.executions().len(), 2);

    let sell = &events[4].order;
    assert_eq!(sell.action(), OrderAction::Sell);
    assert_eq!(sell.commission(), d("0.02"));

    assert_eq!(
        client.placed(),
        vec![
            (OrderAction::Buy, d("10"), d("1")),
            (OrderAction::Sell, d("11"), d("1")),
        ]
    );
    assert!(broker.active_orders(None).is_empty());
}

// ── 5. Unmatched transactions ────────────────────────────────────────

#[test]
fn fill_racing_the_placement_is_buffered() {
    let client = MockTradingClient::new();
    client.set_balance("USD", d("100"));
    // The mock hands out exchange ids from 100, so this fill belongs to the next order.
    client.fill("100", d("1"), d("10"), d("0.05"));

    let broker = LiveBroker::new(client.clone(), settings()).unwrap();
    let events = record(&broker);
    let mut dispatcher = dispatcher_for(&broker, 500);

    let handle = broker.clone();
    let placed = Cell::new(false);
    dispatcher.idle_event().subscribe(move |_| {
        if !placed.get() && handle.unmatched_transactions() == 1 {
            placed.set(true);
            handle.create_limit_order(OrderAction::Buy, &btc(), d("10"), d("1"))?;
        }
        Ok(())
    });
    let stop = dispatcher.stop_handle();
    broker.order_events().subscribe(move |e: &OrderEvent| {
        if e.order.is_filled() {
            stop.stop();
        }
        Ok(())
    });
    dispatcher.run().unwrap();

    let events = events.borrow();
    let kinds: Vec<&str> = events.iter().map(|e| kind_name(&e.kind)).collect();
    assert_eq!(kinds, vec!["accepted", "filled"]);
    assert_eq!(events[1].order.exchange_id(), Some("100"));
    assert_eq!(events[1].execution().unwrap().commission, d("0.05"));
    assert_eq!(broker.unmatched_transactions(), 0);
}

// ── 6. Rejections ────────────────────────────────────────────────────

#[test]
fn rejects_without_calling_the_exchange() {
    let client = MockTradingClient::new();
    let broker = LiveBroker::new(client.clone(), LiveConfig::default().broker_settings()).unwrap();
    let events = record(&broker);

    let err = broker
        .create_market_order(OrderAction::Buy, &btc(), d("1"), false)
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid order: Market orders are not supported");
    let err = broker
        .create_stop_order(OrderAction::Sell, &btc(), d("10"), d("1"))
        .unwrap_err();
    assert!(err.to_string().contains("Stop orders are not supported"));
    let err = broker
        .create_stop_limit_order(OrderAction::Sell, &btc(), d("10"), d("9"), d("1"))
        .unwrap_err();
    assert!(err.to_string().contains("Stop limit orders are not supported"));

    let err = broker
        .create_limit_order(OrderAction::Buy, &btc(), d("30000"), d("0.0001"))
        .unwrap_err();
    assert!(err.to_string().contains("BTC/USD amount must be >= 0.001"), "{err}");

    let err = broker
        .create_limit_order(OrderAction::Buy, &btc(), d("10"), d("0.000000001"))
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOrder(_)), "{err}");

    assert!(client.placed().is_empty());
    assert!(events.borrow().is_empty());
    assert!(broker.active_orders(None).is_empty());
}
