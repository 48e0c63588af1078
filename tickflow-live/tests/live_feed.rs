//! Integration tests for the live trade feed, driven by a scripted connection.
//!
//! These tests run `LiveTradeSource` behind a `BarFeed` through the dispatcher and check:
//! 1. Trades become TRADE bars with strictly increasing timestamps (collisions offset by 1µs)
//! 2. Order book snapshots are published as events
//! 3. Reconnects drop replayed trades and give up after the configured attempts
//! 4. A connection that never initializes fails startup

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use common::{book_frame, btc, d, trade_frame, ScriptedConnector};
use tickflow_core::dispatcher::Dispatcher;
use tickflow_core::domain::Bar;
use tickflow_core::feed::BarFeed;
use tickflow_core::CoreError;
use tickflow_live::{LiveFeedSettings, LiveTradeSource};

// ── Helpers ──────────────────────────────────────────────────────────

const T0: i64 = 1_600_000_000_000_000;

fn settings(reconnect: bool) -> LiveFeedSettings {
    LiveFeedSettings {
        init_timeout: Duration::from_secs(5),
        reconnect,
        max_reconnect_attempts: Some(2),
        ..LiveFeedSettings::default()
    }
}

type Recorded = Rc<RefCell<Vec<(DateTime<Utc>, f64)>>>;

fn record_bars(feed: &BarFeed) -> Recorded {
    let recorded: Recorded = Rc::new(RefCell::new(Vec::new()));
    let sink = recorded.clone();
    feed.subscribe(move |(at, bars)| {
        sink.borrow_mut().push((*at, bars.get(&btc())?.close()));
        Ok(())
    });
    recorded
}

/// Run until every subject is exhausted. Stops after `max_idle` empty passes so a
/// broken feed fails the assertions instead of hanging.
fn run(dispatcher: &mut Dispatcher, max_idle: usize) -> Result<usize, CoreError> {
    let stop = dispatcher.stop_handle();
    let idles = Rc::new(Cell::new(0usize));
    let counter = idles.clone();
    dispatcher.idle_event().subscribe(move |_| {
        counter.set(counter.get() + 1);
        if counter.get() >= max_idle {
            stop.stop();
        }
        Ok(())
    });
    dispatcher.run()?;
    Ok(idles.get())
}

// ── 1. Trades as bars ────────────────────────────────────────────────

#[test]
fn trades_become_strictly_ordered_bars() {
    let connector = ScriptedConnector::new(vec![
        trade_frame(1, 100.0, 0.5, T0, 0),
        trade_frame(2, 101.0, 0.25, T0, 1),
        trade_frame(2, 101.0, 0.25, T0, 1),
        trade_frame(3, 99.0, 1.0, T0 - 5_000_000, 0),
        trade_frame(4, 98.0, 1.0, T0 + 1_000_000, 1),
    ]);
    let source = LiveTradeSource::new(vec![btc()], Arc::new(connector), settings(false));
    let feed = BarFeed::new(source, 100);
    let bars = record_bars(&feed);

    let mut dispatcher = Dispatcher::new();
    dispatcher.add_subject(feed.clone());
    let idles = run(&mut dispatcher, 500).unwrap();
    assert!(idles < 500, "feed never reached eof");

    let bars = bars.borrow();
    let closes: Vec<f64> = bars.iter().map(|(_, c)| *c).collect();
    assert_eq!(closes, vec![100.0, 101.0, 99.0, 98.0]);

    let t0 = DateTime::from_timestamp_micros(T0).unwrap();
    let times: Vec<DateTime<Utc>> = bars.iter().map(|(at, _)| *at).collect();
    assert_eq!(times[0], t0);
    assert_eq!(times[1], t0 + chrono::Duration::microseconds(1));
    assert_eq!(times[2], t0 + chrono::Duration::microseconds(2));
    assert_eq!(times[3], t0 + chrono::Duration::seconds(1));

    let series = feed.data_series(&btc()).unwrap();
    assert_eq!(series.borrow().len(), 4);
    assert_eq!(series.borrow().volumes(), vec![0.5, 0.25, 1.0, 1.0]);
    assert!(!feed.bars_have_adj_close());
}

// ── 2. Order book events ─────────────────────────────────────────────

#[test]
fn order_book_snapshots_are_published() {
    let connector = ScriptedConnector::new(vec![
        book_frame(T0, &[("100.5", "1"), ("100", "3")], &[("101", "2")]),
        trade_frame(1, 100.75, 0.1, T0 + 10, 0),
    ]);
    let source = LiveTradeSource::new(vec![btc()], Arc::new(connector), settings(false));
    let books = source.order_book_updates();
    let feed = BarFeed::new(source, 100);
    let bars = record_bars(&feed);

    let best: Rc<RefCell<Vec<(Option<Decimal>, Option<Decimal>)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = best.clone();
    books.subscribe(move |update| {
        assert_eq!(update.instrument, btc());
        assert_eq!(update.bid_volumes(), vec![d("1"), d("3")]);
        sink.borrow_mut().push((update.best_bid(), update.best_ask()));
        Ok(())
    });

    let mut dispatcher = Dispatcher::new();
    dispatcher.add_subject(feed);
    run(&mut dispatcher, 500).unwrap();

    assert_eq!(*best.borrow(), vec![(Some(d("100.5")), Some(d("101")))]);
    assert_eq!(bars.borrow().len(), 1);
}

// ── 3. Reconnects ────────────────────────────────────────────────────

#[test]
fn reconnect_drops_replayed_trades_and_gives_up() {
    let connector = Arc::new(
        ScriptedConnector::new(vec![
            trade_frame(1, 100.0, 0.5, T0, 0),
            trade_frame(2, 101.0, 0.5, T0 + 1, 0),
        ])
        .with_max_sessions(2),
    );
    let source = LiveTradeSource::new(vec![btc()], connector.clone(), settings(true));
    let feed = BarFeed::new(source, 100);
    let bars = record_bars(&feed);

    let mut dispatcher = Dispatcher::new();
    dispatcher.add_subject(feed);
    let idles = run(&mut dispatcher, 500).unwrap();
    assert!(idles < 500, "feed never gave up reconnecting");

    // One good session, one replay, then two refused attempts.
    assert_eq!(connector.sessions(), 4);
    let closes: Vec<f64> = bars.borrow().iter().map(|(_, c)| *c).collect();
    assert_eq!(closes, vec![100.0, 101.0]);
}

// ── 4. Startup failure ───────────────────────────────────────────────

#[test]
fn refused_connection_fails_startup() {
    let connector = ScriptedConnector::new(Vec::new()).with_max_sessions(0);
    let source = LiveTradeSource::new(vec![btc()], Arc::new(connector), settings(false));
    let mut dispatcher = Dispatcher::new();
    dispatcher.add_subject(BarFeed::new(source, 100));

    let err = dispatcher.run().unwrap_err();
    assert!(matches!(err, CoreError::Connectivity(_)), "{err}");
}
