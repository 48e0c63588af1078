//! Minimal limit-order strategy driven by the `paper` and `replay` commands.
//!
//! While flat it bids `spread` below the last close for about `notional` of the
//! price currency; while holding it offers everything `spread` above the last
//! close. It never has more than one order working.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use tickflow_core::broker::{to_decimal, Broker, Precision};
use tickflow_core::domain::{Bar, Bars, Instrument, OrderAction, OrderEvent, OrderEventKind};
use tickflow_core::Result;

pub struct SpreadTrader<B> {
    broker: B,
    instrument: Instrument,
    spread: Decimal,
    notional: Decimal,
    precision: Precision,
    placed: usize,
    rejected: usize,
}

impl<B: Broker> SpreadTrader<B> {
    pub fn new(
        broker: B,
        instrument: Instrument,
        spread: Decimal,
        notional: Decimal,
        precision: Precision,
    ) -> Self {
        Self {
            broker,
            instrument,
            spread,
            notional,
            precision,
            placed: 0,
            rejected: 0,
        }
    }

    pub fn placed(&self) -> usize {
        self.placed
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Rejected orders are logged and counted; they don't end the run.
    pub fn on_bars(&mut self, bars: &Bars) -> Result<()> {
        let Some(bar) = bars.bar(&self.instrument) else {
            return Ok(());
        };
        if !self.broker.active_orders(Some(&self.instrument)).is_empty() {
            return Ok(());
        }

        let close = to_decimal(bar.close())?;
        let held = self.broker.balance(&self.instrument.symbol);
        let currency = &self.instrument.price_currency;
        let outcome = if held.is_zero() {
            let limit = self.precision.round(close * (Decimal::ONE - self.spread), currency);
            if limit <= Decimal::ZERO {
                return Ok(());
            }
            let quantity = self.precision.round(self.notional / limit, &self.instrument.symbol);
            self.broker
                .create_limit_order(OrderAction::Buy, &self.instrument, limit, quantity)
        } else {
            let limit = self.precision.round(close * (Decimal::ONE + self.spread), currency);
            self.broker
                .create_limit_order(OrderAction::Sell, &self.instrument, limit, held)
        };

        match outcome {
            Ok(id) => {
                self.placed += 1;
                debug!(order = %id, "strategy order placed");
            }
            Err(e) => {
                self.rejected += 1;
                warn!(error = %e, "strategy order rejected");
            }
        }
        Ok(())
    }
}

/// Counts of order events seen during a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tally {
    pub submitted: usize,
    pub accepted: usize,
    pub partial_fills: usize,
    pub fills: usize,
    pub canceled: usize,
}

impl Tally {
    pub fn record(&mut self, event: &OrderEvent) {
        match &event.kind {
            OrderEventKind::Submitted => self.submitted += 1,
            OrderEventKind::Accepted => self.accepted += 1,
            OrderEventKind::PartiallyFilled(_) => self.partial_fills += 1,
            OrderEventKind::Filled(_) => self.fills += 1,
            OrderEventKind::Canceled(_) => self.canceled += 1,
        }
    }
}
