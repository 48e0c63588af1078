//! Live trade feed: one TRADE-frequency bar per exchange trade.
//!
//! `LiveTradeSource` is a realtime `BarSource`. It owns a tokio runtime running
//! the websocket session and drains the session's queue from `pump`, waiting at
//! most `queue_timeout` when it has nothing buffered. Order book snapshots are
//! published through `order_book_updates()` once the source is no longer borrowed.
//!
//! Within the stream, timestamps strictly increase: a trade colliding with (or
//! older than) the previous one is moved one microsecond past it. Trades whose
//! id was already seen, as happens when a reconnect replays recent trades, are
//! dropped.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flume::RecvTimeoutError;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tickflow_core::domain::{Bar, Bars, Frequency, Instrument};
use tickflow_core::feed::{next_distinct, BarSource, Deferred};
use tickflow_core::observer::Event;
use tickflow_core::{CoreError, Result};

use crate::client::{Connector, FeedMessage};
use crate::error::LiveError;
use crate::protocol::{channels_for, OrderBookUpdate, Trade, TradeSide};

/// A bar built from a single trade: open, high, low and close are the trade price.
#[derive(Debug, Clone)]
pub struct TradeBar {
    trade: Trade,
    date_time: DateTime<Utc>,
}

impl TradeBar {
    pub fn new(trade: Trade, date_time: DateTime<Utc>) -> Self {
        Self { trade, date_time }
    }

    pub fn trade(&self) -> &Trade {
        &self.trade
    }

    pub fn trade_id(&self) -> u64 {
        self.trade.id
    }

    pub fn side(&self) -> TradeSide {
        self.trade.side
    }

    pub fn is_buy(&self) -> bool {
        self.trade.is_buy()
    }
}

impl Bar for TradeBar {
    fn date_time(&self) -> DateTime<Utc> {
        self.date_time
    }

    fn frequency(&self) -> Frequency {
        Frequency::Trade
    }

    fn instrument(&self) -> &Instrument {
        &self.trade.instrument
    }

    fn open(&self) -> f64 {
        self.trade.price
    }

    fn high(&self) -> f64 {
        self.trade.price
    }

    fn low(&self) -> f64 {
        self.trade.price
    }

    fn close(&self) -> f64 {
        self.trade.price
    }

    fn volume(&self) -> f64 {
        self.trade.amount
    }

    fn adj_close(&self) -> Option<f64> {
        None
    }

    fn use_adjusted_value(&self) -> bool {
        false
    }

    fn set_use_adjusted_value(&self, use_adjusted: bool) -> Result<()> {
        if use_adjusted {
            return Err(CoreError::AdjustedCloseUnavailable);
        }
        Ok(())
    }

    fn typical_price(&self) -> f64 {
        self.trade.price
    }
}

/// Connection policy for a live feed.
#[derive(Debug, Clone)]
pub struct LiveFeedSettings {
    /// Bound on the wait for every subscription to be confirmed.
    pub init_timeout: Duration,
    /// Longest `pump` blocks when nothing is buffered.
    pub queue_timeout: Duration,
    pub queue_capacity: usize,
    pub reconnect: bool,
    /// Consecutive failed reconnects before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for LiveFeedSettings {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_millis(10),
            queue_capacity: 1024,
            reconnect: true,
            max_reconnect_attempts: Some(10),
        }
    }
}

struct Session {
    rx: flume::Receiver<FeedMessage>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct LiveTradeSource {
    instruments: Vec<Instrument>,
    channels: Vec<String>,
    connector: Arc<dyn Connector>,
    settings: LiveFeedSettings,
    runtime: Option<Runtime>,
    session: Option<Session>,
    finished: Vec<JoinHandle<()>>,
    bars: VecDeque<TradeBar>,
    last_trade_ids: HashMap<Instrument, u64>,
    last_date_time: Option<DateTime<Utc>>,
    current: Option<DateTime<Utc>>,
    stopped: bool,
    order_book: Rc<Event<OrderBookUpdate>>,
}

impl LiveTradeSource {
    pub fn new(
        instruments: Vec<Instrument>,
        connector: Arc<dyn Connector>,
        settings: LiveFeedSettings,
    ) -> Self {
        Self {
            channels: channels_for(&instruments),
            instruments,
            connector,
            settings,
            runtime: None,
            session: None,
            finished: Vec::new(),
            bars: VecDeque::new(),
            last_trade_ids: HashMap::new(),
            last_date_time: None,
            current: None,
            stopped: false,
            order_book: Rc::new(Event::new()),
        }
    }

    /// Order book snapshots, published from the dispatch step that drained them.
    pub fn order_book_updates(&self) -> Rc<Event<OrderBookUpdate>> {
        self.order_book.clone()
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    fn runtime(&mut self) -> Result<&Runtime> {
        if self.runtime.is_none() {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("tickflow-ws")
                .enable_all()
                .build()
                .map_err(|e| CoreError::Connectivity(format!("runtime: {e}")))?;
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| CoreError::InvalidState("runtime unavailable".into()))
    }

    /// Open a session and wait for it to initialize. Returns false on failure.
    fn connect(&mut self) -> Result<bool> {
        info!(channels = ?self.channels, "initializing websocket client");
        let (tx, rx) = flume::bounded(self.settings.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connector = self.connector.clone();
        let channels = self.channels.clone();
        let handle = self.runtime()?.spawn(async move {
            if let Err(e) = connector.run(channels, tx, shutdown_rx).await {
                debug!(error = %e, "session ended with error");
            }
        });

        info!("waiting for websocket initialization to complete");
        let deadline = Instant::now() + self.settings.init_timeout;
        let mut early = Vec::new();
        let initialized = loop {
            match rx.recv_deadline(deadline) {
                Ok(FeedMessage::Initialized) => break true,
                Ok(FeedMessage::Disconnected) => break false,
                Ok(other) => early.push(other),
                Err(_) => break false,
            }
        };

        let session = Session {
            rx,
            shutdown,
            handle,
        };
        if !initialized {
            error!("initialization failed");
            let _ = session.shutdown.send(true);
            self.finished.push(session.handle);
            return Ok(false);
        }

        info!("initialization completed");
        self.session = Some(session);
        for message in early {
            if let FeedMessage::Trade(trade) = message {
                self.on_trade(trade);
            }
        }
        Ok(true)
    }

    fn on_trade(&mut self, trade: Trade) {
        if !self.instruments.contains(&trade.instrument) {
            warn!(instrument = %trade.instrument, "trade for an unsubscribed instrument");
            return;
        }
        if let Some(last) = self.last_trade_ids.get(&trade.instrument) {
            if trade.id <= *last {
                debug!(id = trade.id, "dropping trade already seen");
                return;
            }
        }
        self.last_trade_ids.insert(trade.instrument.clone(), trade.id);
        let date_time = next_distinct(self.last_date_time, trade.date_time);
        self.last_date_time = Some(date_time);
        self.bars.push_back(TradeBar::new(trade, date_time));
    }

    fn on_disconnected(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            self.finished.push(session.handle);
        }
        if self.stopped {
            return Ok(());
        }
        if !self.settings.reconnect {
            info!("disconnected, stopping");
            self.stopped = true;
            return Ok(());
        }

        let mut attempts = 0u32;
        while !self.stopped {
            info!(attempt = attempts + 1, "reconnecting");
            if self.connect()? {
                return Ok(());
            }
            attempts += 1;
            if self
                .settings
                .max_reconnect_attempts
                .map_or(false, |max| attempts >= max)
            {
                error!(attempts, "giving up reconnecting");
                self.stopped = true;
            }
        }
        Ok(())
    }

    fn handle(&mut self, message: FeedMessage, deferred: &mut Vec<Deferred>) -> Result<()> {
        match message {
            FeedMessage::Trade(trade) => self.on_trade(trade),
            FeedMessage::OrderBook(update) => {
                let event = self.order_book.clone();
                deferred.push(Box::new(move || event.emit(&update)));
            }
            FeedMessage::Initialized => debug!("late initialization notice"),
            FeedMessage::Disconnected => self.on_disconnected()?,
        }
        Ok(())
    }
}

impl BarSource for LiveTradeSource {
    fn name(&self) -> String {
        "live-trade-feed".into()
    }

    fn frequency(&self) -> Frequency {
        Frequency::Trade
    }

    fn instruments(&self) -> Vec<Instrument> {
        self.instruments.clone()
    }

    fn start(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(CoreError::InvalidState("live feed already running".into()));
        }
        if !self.connect()? {
            self.stopped = true;
            return Err(LiveError::InitializationTimeout(self.settings.init_timeout).into());
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
        if let Some(session) = &self.session {
            info!("stopping websocket client");
            let _ = session.shutdown.send(true);
        }
    }

    fn join(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.shutdown.send(true);
            self.finished.push(session.handle);
        }
        if let Some(runtime) = &self.runtime {
            for handle in self.finished.drain(..) {
                if let Err(e) = runtime.block_on(handle) {
                    warn!(error = %e, "websocket task did not finish cleanly");
                }
            }
        }
    }

    fn eof(&self) -> bool {
        self.stopped && self.bars.is_empty()
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn current_date_time(&self) -> Option<DateTime<Utc>> {
        self.current
    }

    fn bars_have_adj_close(&self) -> bool {
        false
    }

    fn pump(&mut self) -> Result<Vec<Deferred>> {
        let mut deferred = Vec::new();
        let Some(session) = &self.session else {
            return Ok(deferred);
        };
        let rx = session.rx.clone();

        // Only block when there is nothing left to hand out.
        let first = if self.bars.is_empty() {
            rx.recv_timeout(self.settings.queue_timeout)
        } else {
            rx.try_recv().map_err(|e| match e {
                flume::TryRecvError::Empty => RecvTimeoutError::Timeout,
                flume::TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
            })
        };
        match first {
            Ok(message) => self.handle(message, &mut deferred)?,
            Err(RecvTimeoutError::Timeout) => return Ok(deferred),
            Err(RecvTimeoutError::Disconnected) => {
                self.on_disconnected()?;
                return Ok(deferred);
            }
        }

        // Whatever else already arrived. `Disconnected` is always a session's last message.
        for message in rx.drain() {
            self.handle(message, &mut deferred)?;
        }
        Ok(deferred)
    }

    fn next_bars(&mut self) -> Result<Option<Bars>> {
        let Some(bar) = self.bars.pop_front() else {
            return Ok(None);
        };
        self.current = Some(bar.date_time());
        Ok(Some(Bars::single(Arc::new(bar))))
    }
}
