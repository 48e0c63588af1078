//! Bar — one instrument's price snapshot for a period.
//!
//! `Bar` is an open trait so data-source adapters can supply their own bar kinds
//! (the live feed builds one bar per trade). `BasicBar` is the canonical OHLCV bar.
//!
//! Bars are immutable after construction except for the adjusted-value toggle,
//! which is why it lives behind an atomic: bars are shared as `Arc<dyn Bar>`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Frequency, Instrument};
use crate::error::{CoreError, Result};

/// Shared read-only handle to a bar.
pub type BarRef = Arc<dyn Bar>;

/// OHLC column selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
}

pub trait Bar: Send + Sync + fmt::Debug {
    fn date_time(&self) -> DateTime<Utc>;
    fn frequency(&self) -> Frequency;
    fn instrument(&self) -> &Instrument;

    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
    fn volume(&self) -> f64;
    fn adj_close(&self) -> Option<f64>;

    /// Whether `price()` and `typical_price()` read adjusted values.
    fn use_adjusted_value(&self) -> bool;

    /// Fails with `AdjustedCloseUnavailable` when enabling without an adjusted close.
    fn set_use_adjusted_value(&self, use_adjusted: bool) -> Result<()>;

    /// Named extra columns, if the source provided any.
    fn extra(&self) -> Option<&BTreeMap<String, f64>> {
        None
    }

    /// Raw or adjusted OHLC value. Adjusted values are `raw * adj_close / close`.
    fn field(&self, field: PriceField, adjusted: bool) -> Result<f64> {
        let raw = match field {
            PriceField::Open => self.open(),
            PriceField::High => self.high(),
            PriceField::Low => self.low(),
            PriceField::Close => self.close(),
        };
        if !adjusted {
            return Ok(raw);
        }
        let adj_close = self.adj_close().ok_or(CoreError::AdjustedCloseUnavailable)?;
        if field == PriceField::Close {
            return Ok(adj_close);
        }
        Ok(adj_close * raw / self.close())
    }

    fn adjusted_open(&self) -> Result<f64> {
        self.field(PriceField::Open, true)
    }

    fn adjusted_high(&self) -> Result<f64> {
        self.field(PriceField::High, true)
    }

    fn adjusted_low(&self) -> Result<f64> {
        self.field(PriceField::Low, true)
    }

    /// `(high + low + close) / 3`, adjusted when the toggle is on.
    fn typical_price(&self) -> f64 {
        let adjusted = self.use_adjusted_value() && self.adj_close().is_some();
        let value = |f: PriceField| self.field(f, adjusted).unwrap_or(f64::NAN);
        (value(PriceField::High) + value(PriceField::Low) + value(PriceField::Close)) / 3.0
    }

    /// Close, or adjusted close when the toggle is on.
    fn price(&self) -> f64 {
        match (self.use_adjusted_value(), self.adj_close()) {
            (true, Some(adj)) => adj,
            _ => self.close(),
        }
    }
}

/// Canonical OHLCV bar.
#[derive(Debug)]
pub struct BasicBar {
    instrument: Instrument,
    date_time: DateTime<Utc>,
    frequency: Frequency,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    adj_close: Option<f64>,
    use_adjusted: AtomicBool,
    extra: BTreeMap<String, f64>,
}

impl BasicBar {
    /// Build a validated bar. Fails if `low <= {open, close} <= high` does not hold.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instrument: Instrument,
        date_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        adj_close: Option<f64>,
        frequency: Frequency,
    ) -> Result<Self> {
        validate_ohlc(open, high, low, close)?;
        Ok(Self {
            instrument,
            date_time,
            frequency,
            open,
            high,
            low,
            close,
            volume,
            adj_close,
            use_adjusted: AtomicBool::new(false),
            extra: BTreeMap::new(),
        })
    }

    pub fn with_extra(mut self, extra: BTreeMap<String, f64>) -> Self {
        self.extra = extra;
        self
    }

    /// Move the bar to another timestamp.
    pub fn with_date_time(mut self, date_time: DateTime<Utc>) -> Self {
        self.date_time = date_time;
        self
    }

    pub fn into_ref(self) -> BarRef {
        Arc::new(self)
    }
}

impl Clone for BasicBar {
    fn clone(&self) -> Self {
        Self {
            instrument: self.instrument.clone(),
            date_time: self.date_time,
            frequency: self.frequency,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            adj_close: self.adj_close,
            use_adjusted: AtomicBool::new(self.use_adjusted_value()),
            extra: self.extra.clone(),
        }
    }
}

impl Bar for BasicBar {
    fn date_time(&self) -> DateTime<Utc> {
        self.date_time
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn adj_close(&self) -> Option<f64> {
        self.adj_close
    }

    fn use_adjusted_value(&self) -> bool {
        self.use_adjusted.load(Ordering::Relaxed)
    }

    fn set_use_adjusted_value(&self, use_adjusted: bool) -> Result<()> {
        if use_adjusted && self.adj_close.is_none() {
            return Err(CoreError::AdjustedCloseUnavailable);
        }
        self.use_adjusted.store(use_adjusted, Ordering::Relaxed);
        Ok(())
    }

    fn extra(&self) -> Option<&BTreeMap<String, f64>> {
        if self.extra.is_empty() {
            None
        } else {
            Some(&self.extra)
        }
    }
}

/// Hard OHLC validation used by bar constructors.
pub fn validate_ohlc(open: f64, high: f64, low: f64, close: f64) -> Result<()> {
    if [open, high, low, close].iter().any(|v| !v.is_finite()) {
        return Err(CoreError::InvalidBar("non-finite price".into()));
    }
    let reason = if high < low {
        "high < low"
    } else if high < open {
        "high < open"
    } else if high < close {
        "high < close"
    } else if low > open {
        "low > open"
    } else if low > close {
        "low > close"
    } else {
        return Ok(());
    };
    Err(CoreError::InvalidBar(reason.into()))
}

/// Normalize a raw quadruple so high/low enclose open and close.
///
/// This is a separate cleanup step for vendor data; bar constructors never call it.
/// Returns `(open, high, low, close)`.
pub fn sanitize_ohlc(open: f64, high: f64, low: f64, close: f64) -> (f64, f64, f64, f64) {
    let high = high.max(open).max(close);
    let low = low.min(open).min(close);
    (open, high, low, close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    }

    fn inst() -> Instrument {
        Instrument::new("ORCL", "USD")
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Result<BasicBar> {
        BasicBar::new(inst(), dt(), open, high, low, close, 100.0, None, Frequency::Day)
    }

    #[test]
    fn valid_bar_builds() {
        let b = bar(10.0, 12.0, 9.0, 11.0).unwrap();
        assert_eq!(b.open(), 10.0);
        assert_eq!(b.typical_price(), (12.0 + 9.0 + 11.0) / 3.0);
        assert_eq!(b.price(), 11.0);
    }

    #[test]
    fn invalid_bars_report_first_violation() {
        let msg = |r: Result<BasicBar>| r.unwrap_err().to_string();
        assert_eq!(msg(bar(10.0, 8.0, 9.0, 10.0)), "invalid bar: high < low");
        assert_eq!(msg(bar(13.0, 12.0, 9.0, 10.0)), "invalid bar: high < open");
        assert_eq!(msg(bar(10.0, 12.0, 9.0, 13.0)), "invalid bar: high < close");
        assert_eq!(msg(bar(8.0, 12.0, 9.0, 10.0)), "invalid bar: low > open");
        assert_eq!(msg(bar(10.0, 12.0, 9.0, 8.0)), "invalid bar: low > close");
        assert!(bar(f64::NAN, 12.0, 9.0, 10.0).is_err());
    }

    #[test]
    fn adjusted_values_scale_by_adj_close_ratio() {
        let b = BasicBar::new(inst(), dt(), 10.0, 12.0, 8.0, 10.0, 1.0, Some(5.0), Frequency::Day)
            .unwrap();
        assert_eq!(b.adjusted_open().unwrap(), 5.0);
        assert_eq!(b.adjusted_high().unwrap(), 6.0);
        assert_eq!(b.adjusted_low().unwrap(), 4.0);
        assert_eq!(b.field(PriceField::Close, true).unwrap(), 5.0);

        b.set_use_adjusted_value(true).unwrap();
        assert_eq!(b.price(), 5.0);
        assert_eq!(b.typical_price(), 5.0);
    }

    #[test]
    fn adjusted_values_require_adj_close() {
        let b = bar(10.0, 12.0, 9.0, 11.0).unwrap();
        assert!(matches!(b.adjusted_open(), Err(CoreError::AdjustedCloseUnavailable)));
        assert!(matches!(
            b.set_use_adjusted_value(true),
            Err(CoreError::AdjustedCloseUnavailable)
        ));
        assert!(b.set_use_adjusted_value(false).is_ok());
        assert!(!b.use_adjusted_value());
    }

    #[test]
    fn extra_columns_are_optional() {
        let b = bar(10.0, 12.0, 9.0, 11.0).unwrap();
        assert!(b.extra().is_none());

        let mut extra = BTreeMap::new();
        extra.insert("open_interest".to_string(), 42.0);
        let b = b.with_extra(extra);
        assert_eq!(b.extra().unwrap()["open_interest"], 42.0);
    }

    #[test]
    fn sanitize_cases() {
        assert_eq!(sanitize_ohlc(10.0, 12.0, 9.0, 10.0), (10.0, 12.0, 9.0, 10.0));
        assert_eq!(sanitize_ohlc(10.0, 12.0, 9.0, 13.0), (10.0, 13.0, 9.0, 13.0));
        assert_eq!(sanitize_ohlc(10.0, 9.0, 9.0, 10.0), (10.0, 10.0, 9.0, 10.0));
        assert_eq!(sanitize_ohlc(10.0, 12.0, 11.0, 10.0), (10.0, 12.0, 10.0, 10.0));
        assert_eq!(sanitize_ohlc(10.0, 12.0, 10.0, 9.0), (10.0, 12.0, 9.0, 9.0));
    }

    #[test]
    fn sanitized_quadruple_always_builds() {
        let (o, h, l, c) = sanitize_ohlc(10.0, 9.0, 11.0, 10.5);
        assert!(bar(o, h, l, c).is_ok());
    }
}
