//! Serializable engine configuration.
//!
//! ```toml
//! [broker]
//! commission = { type = "TRADE_PERCENTAGE", percentage = 0.005 }
//! default_precision = 8
//! precision = { USD = 2, BTC = 8 }
//! min_trade_amounts = { BTC = 0.001 }
//! volume_limit = 0.25      # 0 turns the volume budget off
//! slippage = { type = "NONE" }
//! limit_orders_only = false
//! initial_balances = { USD = 1000 }
//!
//! [feed]
//! max_len = 1024
//! frequency = "DAY"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::{
    BrokerSettings, Commission, DefaultFillStrategy, FixedPerTrade, MinimumTradeValidator,
    NoCommission, Precision, Slippage, TradePercentage, DEFAULT_VOLUME_LIMIT,
};
use crate::domain::Frequency;
use crate::error::{CoreError, Result};
use crate::feed::DEFAULT_MAX_LEN;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub feed: FeedConfig,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }
}

/// Commission configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommissionConfig {
    #[default]
    None,

    /// Charged once per order, on its first fill
    FixedPerTrade { amount: Decimal },

    /// Fraction of the traded notional (0.005 = 0.5%)
    TradePercentage { percentage: Decimal },
}

impl CommissionConfig {
    pub fn build(&self) -> Box<dyn Commission> {
        match self {
            CommissionConfig::None => Box::new(NoCommission),
            CommissionConfig::FixedPerTrade { amount } => Box::new(FixedPerTrade { amount: *amount }),
            CommissionConfig::TradePercentage { percentage } => Box::new(TradePercentage {
                percentage: *percentage,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub commission: CommissionConfig,

    /// Decimals for assets missing from `precision`
    #[serde(default = "default_precision")]
    pub default_precision: u32,

    #[serde(default = "default_precision_table")]
    pub precision: BTreeMap<String, u32>,

    #[serde(default)]
    pub min_trade_amounts: BTreeMap<String, Decimal>,

    /// Share of each bar's volume orders may take, in (0, 1]; 0 disables the budget
    #[serde(default = "default_volume_limit")]
    pub volume_limit: Option<Decimal>,

    #[serde(default)]
    pub slippage: Slippage,

    #[serde(default)]
    pub limit_orders_only: bool,

    #[serde(default)]
    pub good_till_canceled: bool,

    #[serde(default)]
    pub initial_balances: BTreeMap<String, Decimal>,
}

fn default_precision() -> u32 {
    crate::broker::precision::DEFAULT_DIGITS
}

fn default_precision_table() -> BTreeMap<String, u32> {
    BTreeMap::from([("USD".to_string(), 2), ("EUR".to_string(), 2)])
}

fn default_volume_limit() -> Option<Decimal> {
    Some(DEFAULT_VOLUME_LIMIT)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            commission: CommissionConfig::default(),
            default_precision: default_precision(),
            precision: default_precision_table(),
            min_trade_amounts: BTreeMap::new(),
            volume_limit: default_volume_limit(),
            slippage: Slippage::None,
            limit_orders_only: false,
            good_till_canceled: false,
            initial_balances: BTreeMap::new(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.volume_limit {
            if limit < Decimal::ZERO || limit > Decimal::ONE {
                return Err(CoreError::Config(format!(
                    "volume_limit must be 0 (off) or in (0, 1], got {limit}"
                )));
            }
        }
        if let Slippage::VolumeShare { price_impact } = self.slippage {
            if price_impact < Decimal::ZERO {
                return Err(CoreError::Config(format!(
                    "price_impact must not be negative, got {price_impact}"
                )));
            }
        }
        if let Some((symbol, amount)) = self.initial_balances.iter().find(|(_, v)| v.is_sign_negative()) {
            return Err(CoreError::Config(format!(
                "initial balance for {symbol} is negative: {amount}"
            )));
        }
        Ok(())
    }

    /// The per-bar volume share the fill strategy enforces, if any.
    pub fn volume_budget(&self) -> Option<Decimal> {
        self.volume_limit.filter(|limit| !limit.is_zero())
    }

    pub fn precision(&self) -> Precision {
        let mut precision = Precision::new(self.default_precision);
        for (symbol, digits) in &self.precision {
            precision.set_digits(symbol.clone(), *digits);
        }
        precision
    }

    /// Broker policies described by this config.
    pub fn settings(&self) -> Result<BrokerSettings> {
        self.validate()?;
        let validator = if self.min_trade_amounts.is_empty() {
            None
        } else {
            let validator = self
                .min_trade_amounts
                .iter()
                .fold(MinimumTradeValidator::new(), |v, (symbol, min)| {
                    v.with_minimum(symbol.clone(), *min)
                });
            Some(Box::new(validator) as Box<dyn crate::broker::TradeValidator>)
        };
        Ok(BrokerSettings {
            commission: self.commission.build(),
            precision: self.precision(),
            fill_strategy: Box::new(DefaultFillStrategy::new(self.volume_budget(), self.slippage)),
            validator,
            limit_orders_only: self.limit_orders_only,
            good_till_canceled: self.good_till_canceled,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    /// Bound on each instrument's data series
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    #[serde(default = "default_frequency")]
    pub frequency: Frequency,
}

fn default_max_len() -> usize {
    DEFAULT_MAX_LEN
}

fn default_frequency() -> Frequency {
    Frequency::Day
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
            frequency: default_frequency(),
        }
    }
}
