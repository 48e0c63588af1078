//! Bounded per-instrument bar history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::domain::{Bar, BarRef, Frequency, Instrument, PriceField};
use crate::error::{CoreError, Result};

/// Default number of bars a data series retains.
pub const DEFAULT_MAX_LEN: usize = 1024;

/// Rolling window of the most recent bars for one instrument.
///
/// Column views (`closes`, `highs`, ...) are computed on read, so flipping the
/// adjusted-values flag affects already-buffered bars too.
#[derive(Debug)]
pub struct BarDataSeries {
    instrument: Instrument,
    frequency: Frequency,
    max_len: usize,
    bars: VecDeque<BarRef>,
    use_adjusted: bool,
}

impl BarDataSeries {
    pub fn new(instrument: Instrument, frequency: Frequency, max_len: usize) -> Self {
        Self {
            instrument,
            frequency,
            max_len: max_len.max(1),
            bars: VecDeque::new(),
            use_adjusted: false,
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Append a bar, evicting the oldest once full.
    ///
    /// Earlier datetimes are rejected. Equal datetimes are only accepted for trade bars.
    pub fn append(&mut self, bar: BarRef) -> Result<()> {
        if let Some(last) = self.bars.back() {
            let previous = last.date_time();
            let current = bar.date_time();
            let equal_allowed = self.frequency == Frequency::Trade;
            if current < previous || (current == previous && !equal_allowed) {
                return Err(CoreError::OutOfOrder {
                    instrument: self.instrument.to_string(),
                    previous,
                    current,
                });
            }
        }
        self.bars.push_back(bar);
        while self.bars.len() > self.max_len {
            self.bars.pop_front();
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }

    pub fn last(&self) -> Option<&BarRef> {
        self.bars.back()
    }

    pub fn get(&self, index: usize) -> Option<&BarRef> {
        self.bars.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BarRef> {
        self.bars.iter()
    }

    pub fn use_adjusted_values(&self) -> bool {
        self.use_adjusted
    }

    /// Fails when switching on and some held bar has no adjusted close.
    pub fn check_use_adjusted_values(&self, use_adjusted: bool) -> Result<()> {
        if use_adjusted && self.bars.iter().any(|b| b.adj_close().is_none()) {
            return Err(CoreError::AdjustedCloseUnavailable);
        }
        Ok(())
    }

    pub fn set_use_adjusted_values(&mut self, use_adjusted: bool) -> Result<()> {
        self.check_use_adjusted_values(use_adjusted)?;
        self.use_adjusted = use_adjusted;
        Ok(())
    }

    pub fn date_times(&self) -> Vec<DateTime<Utc>> {
        self.bars.iter().map(|b| b.date_time()).collect()
    }

    fn column(&self, field: PriceField) -> Vec<f64> {
        self.bars
            .iter()
            .map(|b| {
                b.field(field, self.use_adjusted)
                    .unwrap_or_else(|_| match field {
                        PriceField::Open => b.open(),
                        PriceField::High => b.high(),
                        PriceField::Low => b.low(),
                        PriceField::Close => b.close(),
                    })
            })
            .collect()
    }

    pub fn opens(&self) -> Vec<f64> {
        self.column(PriceField::Open)
    }

    pub fn highs(&self) -> Vec<f64> {
        self.column(PriceField::High)
    }

    pub fn lows(&self) -> Vec<f64> {
        self.column(PriceField::Low)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.column(PriceField::Close)
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume()).collect()
    }

    pub fn adj_closes(&self) -> Vec<Option<f64>> {
        self.bars.iter().map(|b| b.adj_close()).collect()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.bars
            .iter()
            .map(|b| match (self.use_adjusted, b.adj_close()) {
                (true, Some(adj)) => adj,
                _ => b.close(),
            })
            .collect()
    }

    /// Values of a named extra column; `None` where a bar lacks it.
    pub fn extra(&self, name: &str) -> Vec<Option<f64>> {
        self.bars
            .iter()
            .map(|b| b.extra().and_then(|e| e.get(name).copied()))
            .collect()
    }
}
