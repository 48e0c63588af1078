//! `[live]` section of the configuration file.
//!
//! ```toml
//! [live]
//! url = "wss://ws.bitstamp.net/"
//! pairs = ["BTC/USD"]
//! ping_interval_secs = 15
//! init_timeout_secs = 30
//! queue_capacity = 1024
//! reconnect = true
//! max_reconnect_attempts = 10
//! queue_timeout_ms = 10
//! poll_interval_ms = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tickflow_core::domain::Instrument;
use tickflow_core::{CoreError, Result};

use crate::bitstamp;
use crate::broker::LiveBrokerSettings;
use crate::client::WsConnector;
use crate::feed::LiveFeedSettings;
use crate::protocol::DEFAULT_URL;

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    live: LiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveConfig {
    #[serde(default = "default_url")]
    pub url: String,

    /// Pairs to stream, as `SYMBOL/CURRENCY`
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Bound on waiting for every subscription to be confirmed
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_true")]
    pub reconnect: bool,

    /// Absent retries forever
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: Option<u32>,

    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// How often the live broker polls user transactions
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_pairs() -> Vec<String> {
    vec!["BTC/USD".to_string()]
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_init_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> Option<u32> {
    Some(10)
}

fn default_queue_timeout_ms() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            pairs: default_pairs(),
            ping_interval_secs: default_ping_interval_secs(),
            init_timeout_secs: default_init_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            reconnect: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            queue_timeout_ms: default_queue_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl LiveConfig {
    /// Read the `[live]` section of a config document. A missing section means defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str::<ConfigFile>(s)
            .map(|file| file.live)
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str::<ConfigFile>(&text)
            .map(|file| file.live)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.url)
            .map_err(|e| CoreError::Config(format!("invalid url '{}': {e}", self.url)))?;
        if self.pairs.is_empty() {
            return Err(CoreError::Config("at least one pair is required".into()));
        }
        for instrument in self.instruments()? {
            if !bitstamp::is_supported(&instrument) {
                return Err(CoreError::Config(format!("unsupported pair {instrument}")));
            }
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::Config("queue_capacity must be positive".into()));
        }
        if self.ping_interval_secs == 0 || self.poll_interval_ms == 0 {
            return Err(CoreError::Config("intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn instruments(&self) -> Result<Vec<Instrument>> {
        self.pairs
            .iter()
            .map(|pair| {
                Instrument::parse(pair).map_err(|e| CoreError::Config(format!("pairs: {e}")))
            })
            .collect()
    }

    pub fn feed_settings(&self) -> LiveFeedSettings {
        LiveFeedSettings {
            init_timeout: Duration::from_secs(self.init_timeout_secs),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            queue_capacity: self.queue_capacity,
            reconnect: self.reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    /// Broker settings with the exchange's precision and order rules.
    pub fn broker_settings(&self) -> LiveBrokerSettings {
        LiveBrokerSettings {
            precision: bitstamp::precision(),
            validator: Some(Box::new(bitstamp::trade_validator())),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
        }
    }

    pub fn connector(&self) -> Result<WsConnector> {
        WsConnector::new(&self.url, Duration::from_secs(self.ping_interval_secs)).map_err(Into::into)
    }
}
