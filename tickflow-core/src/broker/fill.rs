//! Fill strategies: decide whether, at what price and for how much an order
//! fills against a bar.
//!
//! The default strategy models:
//! - a per-bar volume budget (`volume_limit` share of the bar volume, the whole
//!   volume for trade bars) consumed by the fills of that bar
//! - all-or-none orders, which only fill when the budget covers the remainder
//! - gap-aware trigger prices for limit and stop orders
//! - optional volume-share slippage for market and stop orders

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::precision::{to_decimal, Precision};
use crate::domain::{Bar, Bars, Frequency, Instrument, Order, OrderAction, OrderType, PriceField};
use crate::error::{CoreError, Result};

/// Price and quantity of a single fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillInfo {
    pub price: Decimal,
    pub quantity: Decimal,
}

pub trait FillStrategy: fmt::Debug {
    /// Called once per tick, before any order is processed.
    fn on_bars(&mut self, bars: &Bars, precision: &Precision) -> Result<()>;

    /// Called after a fill was committed to the ledger.
    fn on_order_filled(&mut self, order: &Order, quantity: Decimal);

    /// Try to fill `order` against `bar`. May flag the order's stop as hit.
    fn fill(
        &mut self,
        order: &mut Order,
        bar: &dyn Bar,
        use_adjusted: bool,
        precision: &Precision,
    ) -> Result<Option<FillInfo>>;
}

/// Price impact for market and stop fills.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Slippage {
    #[default]
    None,
    /// `price * (1 ± (used_volume / bar_volume)² * price_impact)`, against the order.
    VolumeShare { price_impact: Decimal },
}

impl Slippage {
    fn apply(
        &self,
        action: OrderAction,
        price: Decimal,
        quantity: Decimal,
        volume_used: Decimal,
        bar: &dyn Bar,
    ) -> Result<Decimal> {
        match self {
            Slippage::None => Ok(price),
            Slippage::VolumeShare { price_impact } => {
                let bar_volume = to_decimal(bar.volume())?;
                if bar_volume.is_zero() {
                    return Err(CoreError::InvalidBar(
                        "can't use 0 volume bars with volume share slippage".into(),
                    ));
                }
                let share = (volume_used + quantity) / bar_volume;
                let impact = share * share * price_impact;
                Ok(if action.is_buy() {
                    price * (Decimal::ONE + impact)
                } else {
                    price * (Decimal::ONE - impact)
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DefaultFillStrategy {
    volume_limit: Option<Decimal>,
    slippage: Slippage,
    volume_left: HashMap<Instrument, Decimal>,
    volume_used: HashMap<Instrument, Decimal>,
}

pub const DEFAULT_VOLUME_LIMIT: Decimal = Decimal::from_parts(25, 0, 0, false, 2);

impl Default for DefaultFillStrategy {
    fn default() -> Self {
        Self::new(Some(DEFAULT_VOLUME_LIMIT), Slippage::None)
    }
}

impl DefaultFillStrategy {
    /// `volume_limit` is the share of each bar's volume orders may take, in (0, 1].
    /// `None` disables the budget for non-trade bars.
    pub fn new(volume_limit: Option<Decimal>, slippage: Slippage) -> Self {
        Self {
            volume_limit,
            slippage,
            volume_left: HashMap::new(),
            volume_used: HashMap::new(),
        }
    }

    pub fn volume_limit(&self) -> Option<Decimal> {
        self.volume_limit
    }

    pub fn slippage(&self) -> Slippage {
        self.slippage
    }

    /// Remaining budget for `instrument` on the current bar, if budgeted.
    pub fn volume_left(&self, instrument: &Instrument) -> Option<Decimal> {
        self.volume_left.get(instrument).copied()
    }

    fn fill_size(&self, order: &Order, precision: &Precision) -> Decimal {
        let remaining = order.remaining();
        let available = match self.volume_left.get(order.instrument()) {
            Some(left) => precision.round(*left, &order.instrument().symbol),
            None => remaining,
        };
        if !order.all_or_none() {
            available.min(remaining)
        } else if remaining <= available {
            remaining
        } else {
            Decimal::ZERO
        }
    }

    fn slipped(&self, order: &Order, price: Decimal, quantity: Decimal, bar: &dyn Bar) -> Result<Decimal> {
        let used = self
            .volume_used
            .get(order.instrument())
            .copied()
            .unwrap_or_default();
        self.slippage.apply(order.action(), price, quantity, used, bar)
    }
}

impl FillStrategy for DefaultFillStrategy {
    fn on_bars(&mut self, bars: &Bars, precision: &Precision) -> Result<()> {
        for (instrument, bar) in bars {
            let left = if bar.frequency() == Frequency::Trade {
                Some(to_decimal(bar.volume())?)
            } else {
                match self.volume_limit {
                    Some(limit) => Some(precision.round(
                        to_decimal(bar.volume())? * limit,
                        &instrument.symbol,
                    )),
                    None => None,
                }
            };
            match left {
                Some(left) => self.volume_left.insert(instrument.clone(), left),
                None => self.volume_left.remove(instrument),
            };
            self.volume_used.insert(instrument.clone(), Decimal::ZERO);
        }
        Ok(())
    }

    fn on_order_filled(&mut self, order: &Order, quantity: Decimal) {
        if let Some(left) = self.volume_left.get_mut(order.instrument()) {
            *left = (*left - quantity).max(Decimal::ZERO);
        }
        *self
            .volume_used
            .entry(order.instrument().clone())
            .or_default() += quantity;
    }

    fn fill(
        &mut self,
        order: &mut Order,
        bar: &dyn Bar,
        use_adjusted: bool,
        precision: &Precision,
    ) -> Result<Option<FillInfo>> {
        let prices = BarPrices::read(bar, use_adjusted)?;
        let action = order.action();

        match order.order_type().clone() {
            OrderType::Market { on_close } => {
                let quantity = self.fill_size(order, precision);
                if quantity.is_zero() {
                    debug!(order = %order.id(), "not enough volume to fill market order");
                    return Ok(None);
                }
                let price = if on_close { prices.close } else { prices.open };
                let price = self.slipped(order, price, quantity, bar)?;
                Ok(Some(FillInfo { price, quantity }))
            }
            OrderType::Limit { limit_price } => {
                let quantity = self.fill_size(order, precision);
                if quantity.is_zero() {
                    debug!(order = %order.id(), "not enough volume to fill limit order");
                    return Ok(None);
                }
                Ok(limit_trigger(action, limit_price, &prices)
                    .map(|price| FillInfo { price, quantity }))
            }
            OrderType::Stop { stop_price } => {
                let mut trigger = None;
                if !order.stop_hit() {
                    trigger = stop_trigger(action, stop_price, &prices);
                    order.set_stop_hit(trigger.is_some());
                }
                if !order.stop_hit() {
                    return Ok(None);
                }
                let quantity = self.fill_size(order, precision);
                if quantity.is_zero() {
                    debug!(order = %order.id(), "not enough volume to fill stop order");
                    return Ok(None);
                }
                // The bar that hits the stop fills at the trigger, later bars at the open.
                let price = trigger.unwrap_or(prices.open);
                let price = self.slipped(order, price, quantity, bar)?;
                Ok(Some(FillInfo { price, quantity }))
            }
            OrderType::StopLimit {
                stop_price,
                limit_price,
            } => {
                let mut trigger = None;
                if !order.stop_hit() {
                    trigger = stop_trigger(action, stop_price, &prices);
                    order.set_stop_hit(trigger.is_some());
                }
                if !order.stop_hit() {
                    return Ok(None);
                }
                let quantity = self.fill_size(order, precision);
                if quantity.is_zero() {
                    debug!(order = %order.id(), "not enough volume to fill stop limit order");
                    return Ok(None);
                }
                let Some(mut price) = limit_trigger(action, limit_price, &prices) else {
                    return Ok(None);
                };
                // On the bar that hit the stop the limit can't fill better than the stop.
                if let Some(stop) = trigger {
                    price = if action.is_buy() {
                        stop.min(limit_price)
                    } else {
                        stop.max(limit_price)
                    };
                }
                Ok(Some(FillInfo { price, quantity }))
            }
        }
    }
}

struct BarPrices {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
}

impl BarPrices {
    fn read(bar: &dyn Bar, adjusted: bool) -> Result<Self> {
        Ok(Self {
            open: to_decimal(bar.field(PriceField::Open, adjusted)?)?,
            high: to_decimal(bar.field(PriceField::High, adjusted)?)?,
            low: to_decimal(bar.field(PriceField::Low, adjusted)?)?,
            close: to_decimal(bar.field(PriceField::Close, adjusted)?)?,
        })
    }
}

/// Fill price for a limit order on this bar. Gapping through the limit fills at the open.
fn limit_trigger(action: OrderAction, limit: Decimal, bar: &BarPrices) -> Option<Decimal> {
    if action.is_buy() {
        if bar.open <= limit {
            Some(bar.open)
        } else if bar.low <= limit {
            Some(limit)
        } else {
            None
        }
    } else if bar.open >= limit {
        Some(bar.open)
    } else if bar.high >= limit {
        Some(limit)
    } else {
        None
    }
}

/// Trigger price for a stop on this bar. Gapping through the stop triggers at the open.
fn stop_trigger(action: OrderAction, stop: Decimal, bar: &BarPrices) -> Option<Decimal> {
    if action.is_buy() {
        if bar.open >= stop {
            Some(bar.open)
        } else if bar.high >= stop {
            Some(stop)
        } else {
            None
        }
    } else if bar.open <= stop {
        Some(bar.open)
    } else if bar.low <= stop {
        Some(stop)
    } else {
        None
    }
}
