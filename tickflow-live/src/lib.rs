//! Tickflow Live — exchange connectivity for the tickflow engine.
//!
//! Live components plug into the same dispatcher as backtests:
//! - `LiveTradeSource`: a realtime `BarSource` turning websocket trades into TRADE bars
//! - `LiveBroker`: a `Subject` + `Broker` reconciling local orders with an exchange account
//! - `TradingClient`: the async control channel the live broker talks to
//! - `bitstamp`: the exchange profile and a paper-trading broker with its rules
//!
//! Network I/O runs on a tokio runtime owned by each subject. Subjects drain
//! flume queues from the dispatcher thread, so engine state is never shared
//! across threads.

pub mod bitstamp;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod feed;
pub mod protocol;
pub mod trading;

pub use broker::{LiveBroker, LiveBrokerSettings};
pub use client::{Connector, FeedMessage, WsConnector};
pub use config::LiveConfig;
pub use error::{LiveError, Result};
pub use feed::{LiveFeedSettings, LiveTradeSource, TradeBar};
pub use protocol::{OrderBookUpdate, PriceLevel, Trade, TradeSide};
pub use trading::{AccountBalance, OpenOrder, PlacedOrder, TradingClient, UserTransaction};
