//! Tickflow CLI — live watch, paper trading and offline replay.
//!
//! Commands:
//! - `watch` — stream live trades and order book snapshots through the dispatcher
//! - `paper` — paper-trade a spread strategy against the live feed
//! - `replay` — replay generated or file-declared bars through a backtesting broker
//! - `check-config` — validate a config file and print the effective settings

mod strategy;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tickflow_core::broker::{BacktestBroker, Broker};
use tickflow_core::config::EngineConfig;
use tickflow_core::dispatcher::{Dispatcher, StopHandle};
use tickflow_core::domain::{Bar, BasicBar, Frequency, Instrument, OrderEvent};
use tickflow_core::feed::{BarFeed, MemorySource, ResampledSource};
use tickflow_live::{bitstamp, LiveConfig, LiveTradeSource, OrderBookUpdate};

use strategy::{SpreadTrader, Tally};

#[derive(Parser)]
#[command(name = "tickflow", about = "Tickflow — event-driven trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live trades and order book snapshots and log them.
    Watch {
        /// TOML config file with a [live] section.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Pairs to watch (e.g. BTC/USD). Overrides the config.
        #[arg(long)]
        pair: Vec<String>,

        /// Stop after this many trades.
        #[arg(long)]
        max_trades: Option<usize>,
    },
    /// Paper-trade against the live feed with the exchange's order rules.
    Paper {
        /// TOML config file with [broker] and [live] sections.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Starting balance as SYMBOL=AMOUNT. Repeatable. Defaults to USD=1000.
        #[arg(long, value_parser = parse_balance)]
        balance: Vec<(String, Decimal)>,

        /// Fee as a fraction of the traded notional.
        #[arg(long, default_value_t = bitstamp::DEFAULT_FEE)]
        fee: Decimal,

        /// Distance from the last price at which orders are placed.
        #[arg(long, default_value = "0.001")]
        spread: Decimal,

        /// Price-currency amount per buy.
        #[arg(long, default_value = "50")]
        notional: Decimal,
    },
    /// Replay bars through a backtesting broker.
    Replay {
        /// TOML config file with [broker] and [feed] sections.
        #[arg(long)]
        config: Option<PathBuf>,

        /// TOML file declaring the bars. Without it, second bars are generated.
        #[arg(long)]
        bars: Option<PathBuf>,

        /// Number of bars to generate.
        #[arg(long, default_value_t = 3600)]
        count: usize,

        /// Instrument for generated bars.
        #[arg(long, default_value = "BTC/USD")]
        instrument: String,

        /// Trade on bars resampled to this frequency.
        #[arg(long, value_enum)]
        resample: Option<ResampleTo>,

        /// Distance from the last price at which orders are placed.
        #[arg(long, default_value = "0.002")]
        spread: Decimal,

        /// Price-currency amount per buy.
        #[arg(long, default_value = "100")]
        notional: Decimal,
    },
    /// Validate a config file and print the effective settings.
    CheckConfig {
        /// Path to the TOML config file.
        path: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ResampleTo {
    Minute,
    Hour,
    Day,
}

impl From<ResampleTo> for Frequency {
    fn from(value: ResampleTo) -> Self {
        match value {
            ResampleTo::Minute => Frequency::Minute,
            ResampleTo::Hour => Frequency::Hour,
            ResampleTo::Day => Frequency::Day,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            config,
            pair,
            max_trades,
        } => run_watch(config.as_deref(), pair, max_trades),
        Commands::Paper {
            config,
            balance,
            fee,
            spread,
            notional,
        } => run_paper(config.as_deref(), balance, fee, spread, notional),
        Commands::Replay {
            config,
            bars,
            count,
            instrument,
            resample,
            spread,
            notional,
        } => run_replay(
            config.as_deref(),
            bars.as_deref(),
            count,
            &instrument,
            resample.map(Frequency::from),
            spread,
            notional,
        ),
        Commands::CheckConfig { path } => run_check_config(&path),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tickflow_core=info,tickflow_live=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_balance(s: &str) -> std::result::Result<(String, Decimal), String> {
    let (symbol, amount) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SYMBOL=AMOUNT, got '{s}'"))?;
    let amount = Decimal::from_str(amount.trim()).map_err(|e| format!("invalid amount '{amount}': {e}"))?;
    if amount.is_sign_negative() {
        return Err(format!("balance for {symbol} is negative"));
    }
    Ok((symbol.trim().to_uppercase(), amount))
}

/// Stop the dispatcher on Ctrl-C. The signal is awaited on its own thread so the
/// dispatcher thread never enters an async context.
fn stop_on_interrupt(stop: StopHandle) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "interrupt handler unavailable");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping");
                stop.stop();
            }
        });
    });
}

fn load_live_config(path: Option<&Path>) -> Result<LiveConfig> {
    let config = match path {
        Some(path) => LiveConfig::from_file(path)?,
        None => LiveConfig::default(),
    };
    config.validate().context("invalid [live] section")?;
    Ok(config)
}

fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.broker.validate().context("invalid [broker] section")?;
    Ok(config)
}

fn live_feed(config: &LiveConfig) -> Result<(BarFeed, Rc<tickflow_core::observer::Event<OrderBookUpdate>>)> {
    let connector = config.connector().context("building websocket connector")?;
    let source = LiveTradeSource::new(config.instruments()?, Arc::new(connector), config.feed_settings());
    let books = source.order_book_updates();
    Ok((BarFeed::new(source, tickflow_core::feed::DEFAULT_MAX_LEN), books))
}

// ── watch ────────────────────────────────────────────────────────────

fn run_watch(config: Option<&Path>, pairs: Vec<String>, max_trades: Option<usize>) -> Result<()> {
    let mut config = load_live_config(config)?;
    if !pairs.is_empty() {
        config.pairs = pairs;
        config.validate().context("invalid --pair")?;
    }

    let (feed, books) = live_feed(&config)?;
    let mut dispatcher = Dispatcher::new();
    let stop = dispatcher.stop_handle();
    stop_on_interrupt(stop.clone());

    let mut trades = 0usize;
    feed.subscribe(move |(at, bars)| {
        for (instrument, bar) in bars {
            info!(%instrument, at = %at, price = bar.close(), amount = bar.volume(), "trade");
        }
        trades += 1;
        if max_trades.is_some_and(|max| trades >= max) {
            stop.stop();
        }
        Ok(())
    });
    books.subscribe(|update: &OrderBookUpdate| {
        info!(
            instrument = %update.instrument,
            bid = ?update.best_bid(),
            ask = ?update.best_ask(),
            "order book"
        );
        Ok(())
    });

    dispatcher.add_subject(feed);
    dispatcher.run().context("live feed failed")?;
    Ok(())
}

// ── paper ────────────────────────────────────────────────────────────

fn run_paper(
    config_path: Option<&Path>,
    balances: Vec<(String, Decimal)>,
    fee: Decimal,
    spread: Decimal,
    notional: Decimal,
) -> Result<()> {
    let live = load_live_config(config_path)?;
    let engine = load_engine_config(config_path)?;
    let balances = starting_balances(balances, &engine);

    let instruments = live.instruments()?;
    let Some(instrument) = instruments.first().cloned() else {
        bail!("no pair configured");
    };

    let (feed, _) = live_feed(&live)?;
    let broker = bitstamp::paper_trading_broker(balances.clone(), &feed, fee);
    let (trader, tally) = attach_strategy(&feed, &broker, instrument.clone(), spread, notional, bitstamp::precision());

    let mut dispatcher = Dispatcher::new();
    stop_on_interrupt(dispatcher.stop_handle());
    dispatcher.add_subject(feed);
    dispatcher.add_subject(broker.clone());
    info!(%instrument, ?balances, "paper trading started");
    dispatcher.run().context("paper trading failed")?;

    print_summary(&broker, &instrument, &trader.borrow(), &tally.borrow());
    Ok(())
}

fn starting_balances(cli: Vec<(String, Decimal)>, engine: &EngineConfig) -> BTreeMap<String, Decimal> {
    if !cli.is_empty() {
        return cli.into_iter().collect();
    }
    if !engine.broker.initial_balances.is_empty() {
        return engine.broker.initial_balances.clone();
    }
    BTreeMap::from([("USD".to_string(), Decimal::from(1000))])
}

type SharedTrader = Rc<RefCell<SpreadTrader<BacktestBroker>>>;

fn attach_strategy(
    feed: &BarFeed,
    broker: &BacktestBroker,
    instrument: Instrument,
    spread: Decimal,
    notional: Decimal,
    precision: tickflow_core::broker::Precision,
) -> (SharedTrader, Rc<RefCell<Tally>>) {
    let trader = Rc::new(RefCell::new(SpreadTrader::new(
        broker.clone(),
        instrument,
        spread,
        notional,
        precision,
    )));
    let handler = trader.clone();
    feed.subscribe(move |(_, bars)| handler.borrow_mut().on_bars(bars));

    let tally = Rc::new(RefCell::new(Tally::default()));
    let sink = tally.clone();
    broker.order_events().subscribe(move |event: &OrderEvent| {
        info!(order = %event.order.id(), kind = ?event.kind, "order event");
        sink.borrow_mut().record(event);
        Ok(())
    });
    (trader, tally)
}

fn print_summary(
    broker: &BacktestBroker,
    instrument: &Instrument,
    trader: &SpreadTrader<BacktestBroker>,
    tally: &Tally,
) {
    println!();
    println!("=== Run Summary ===");
    println!("Instrument:     {instrument}");
    println!("Orders placed:  {}", trader.placed());
    println!("Rejected:       {}", trader.rejected());
    println!("Submitted:      {}", tally.submitted);
    println!("Accepted:       {}", tally.accepted);
    println!("Partial fills:  {}", tally.partial_fills);
    println!("Filled:         {}", tally.fills);
    println!("Canceled:       {}", tally.canceled);
    println!("Still working:  {}", broker.active_orders(None).len());
    println!();
    println!("--- Balances ---");
    for (symbol, amount) in broker.balances() {
        println!("{symbol:<8} {amount:>20}");
    }
    match broker.equity(&instrument.price_currency) {
        Ok(equity) => println!("Equity ({}): {equity}", instrument.price_currency),
        Err(e) => println!("Equity unavailable: {e}"),
    }
    println!();
}

// ── replay ───────────────────────────────────────────────────────────

/// Bars declared in a TOML file.
///
/// ```toml
/// frequency = "MINUTE"
///
/// [[bars]]
/// instrument = "BTC/USD"
/// date_time = "2024-01-01T00:00:00Z"
/// open = 100.0
/// high = 101.0
/// low = 99.5
/// close = 100.5
/// volume = 12.0
/// ```
#[derive(Deserialize)]
struct BarsFile {
    frequency: Frequency,
    bars: Vec<BarRow>,
}

#[derive(Deserialize)]
struct BarRow {
    instrument: Instrument,
    date_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    adj_close: Option<f64>,
}

fn load_bars(path: &Path) -> Result<(Frequency, Vec<BasicBar>)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: BarsFile = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let bars = file
        .bars
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            BasicBar::new(
                row.instrument,
                row.date_time,
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
                row.adj_close,
                file.frequency,
            )
            .with_context(|| format!("bar #{i} in {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((file.frequency, bars))
}

/// A deterministic oscillating walk of second bars.
fn generate_bars(instrument: &Instrument, count: usize) -> Result<Vec<BasicBar>> {
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .context("invalid start time")?;
    let mut previous = 100.0_f64;
    (0..count)
        .map(|i| {
            let t = i as f64;
            let close = 100.0 + 2.0 * (t / 90.0).sin() + 0.5 * (t / 7.0).sin();
            let close = (close * 100.0).round() / 100.0;
            let open = previous;
            previous = close;
            BasicBar::new(
                instrument.clone(),
                start + Duration::seconds(i as i64),
                open,
                open.max(close) + 0.05,
                open.min(close) - 0.05,
                close,
                1.0 + (i % 5) as f64,
                None,
                Frequency::Second,
            )
            .map_err(Into::into)
        })
        .collect()
}

fn run_replay(
    config_path: Option<&Path>,
    bars_path: Option<&Path>,
    count: usize,
    instrument: &str,
    resample: Option<Frequency>,
    spread: Decimal,
    notional: Decimal,
) -> Result<()> {
    let engine = load_engine_config(config_path)?;
    let settings = engine.broker.settings()?;
    let precision = settings.precision.clone();
    let balances = starting_balances(Vec::new(), &engine);

    let (frequency, bars) = match bars_path {
        Some(path) => load_bars(path)?,
        None => {
            let instrument = Instrument::parse(instrument).context("--instrument")?;
            (Frequency::Second, generate_bars(&instrument, count)?)
        }
    };
    let Some(instrument) = bars.first().map(|bar| bar.instrument().clone()) else {
        bail!("no bars to replay");
    };
    let bar_count = bars.len();

    let mut source = MemorySource::new(frequency).with_name("replay");
    source.add_bars(bars)?;
    let upstream = BarFeed::new(source, engine.feed.max_len);

    let mut dispatcher = Dispatcher::new();
    stop_on_interrupt(dispatcher.stop_handle());
    dispatcher.add_subject(upstream.clone());

    let trading_feed = match resample {
        Some(frequency) => {
            let resampled = BarFeed::new(ResampledSource::new(&upstream, frequency)?, engine.feed.max_len);
            dispatcher.add_subject(resampled.clone());
            resampled
        }
        None => upstream,
    };

    let broker = BacktestBroker::new(balances, &trading_feed, settings);
    let (trader, tally) = attach_strategy(&trading_feed, &broker, instrument.clone(), spread, notional, precision);
    dispatcher.add_subject(broker.clone());

    info!(%instrument, bars = bar_count, ?frequency, ?resample, "replay started");
    dispatcher.run().context("replay failed")?;

    let traded_on = trading_feed
        .data_series(&instrument)
        .map(|series| series.borrow().len())
        .unwrap_or_default();
    println!("Bars replayed:  {bar_count} ({traded_on} traded on)");
    print_summary(&broker, &instrument, &trader.borrow(), &tally.borrow());
    Ok(())
}

// ── check-config ─────────────────────────────────────────────────────

fn run_check_config(path: &Path) -> Result<()> {
    let engine = load_engine_config(Some(path))?;
    let live = load_live_config(Some(path))?;

    println!("Config: {}", path.display());
    println!();
    println!("--- Broker ---");
    println!("Commission:        {:?}", engine.broker.commission);
    println!("Default precision: {}", engine.broker.default_precision);
    for (symbol, digits) in &engine.broker.precision {
        println!("  {symbol:<6} {digits} decimals");
    }
    println!("Volume limit:      {:?}", engine.broker.volume_budget());
    println!("Slippage:          {:?}", engine.broker.slippage);
    println!("Limit orders only: {}", engine.broker.limit_orders_only);
    println!("Good till cancel:  {}", engine.broker.good_till_canceled);
    for (symbol, amount) in &engine.broker.min_trade_amounts {
        println!("  minimum {symbol:<6} {amount}");
    }
    println!();
    println!("--- Feed ---");
    println!("Frequency:         {:?}", engine.feed.frequency);
    println!("Series length:     {}", engine.feed.max_len);
    println!();
    println!("--- Live ---");
    println!("URL:               {}", live.url);
    println!("Pairs:             {}", live.pairs.join(", "));
    println!("Reconnect:         {} (max attempts {:?})", live.reconnect, live.max_reconnect_attempts);
    println!("Queue:             {} messages, {} ms wait", live.queue_capacity, live.queue_timeout_ms);
    println!("Broker poll:       {} ms", live.poll_interval_ms);
    println!();
    println!("OK");
    Ok(())
}
