//! Resampling — aggregate bars into a coarser frequency.
//!
//! A slot starts at the bar datetime truncated to the target frequency.
//! open = first open, high = max, low = min, close = last close, volume = sum,
//! adjusted close = last adjusted close.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use super::{BarFeed, BarSource, Deferred};
use crate::dispatcher::Subject;
use crate::domain::{Bar, Bars, BasicBar, Frequency, Instrument};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
struct Slot {
    start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    adj_close: Option<f64>,
}

impl Slot {
    fn open_with(start: DateTime<Utc>, bar: &dyn Bar) -> Self {
        Self {
            start,
            open: bar.open(),
            high: bar.high(),
            low: bar.low(),
            close: bar.close(),
            volume: bar.volume(),
            adj_close: bar.adj_close(),
        }
    }

    fn merge(&mut self, bar: &dyn Bar) {
        self.high = self.high.max(bar.high());
        self.low = self.low.min(bar.low());
        self.close = bar.close();
        self.volume += bar.volume();
        self.adj_close = bar.adj_close();
    }

    fn finish(self, instrument: &Instrument, frequency: Frequency) -> Result<BasicBar> {
        BasicBar::new(
            instrument.clone(),
            self.start,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.adj_close,
            frequency,
        )
    }
}

/// Incremental aggregator with one time slot shared by every instrument.
///
/// Bars must arrive in chronological order across instruments. A bar past the
/// current slot closes it for every instrument at once, so completed bars come
/// out grouped by slot and in slot order.
#[derive(Debug)]
pub struct Resampler {
    frequency: Frequency,
    current: Option<DateTime<Utc>>,
    slots: BTreeMap<Instrument, Slot>,
}

impl Resampler {
    pub fn new(frequency: Frequency) -> Result<Self> {
        if frequency == Frequency::Trade {
            return Err(CoreError::Config("cannot resample into trade frequency".into()));
        }
        Ok(Self {
            frequency,
            current: None,
            slots: BTreeMap::new(),
        })
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    /// Start of the slot being aggregated.
    pub fn current_slot(&self) -> Option<DateTime<Utc>> {
        self.current
    }

    /// Add a bar. When `bar` opens a new slot, returns every instrument's bar
    /// for the previous one, in instrument order.
    pub fn push(&mut self, bar: &dyn Bar) -> Result<Vec<BasicBar>> {
        if bar.frequency() >= self.frequency {
            return Err(CoreError::InvalidBar(format!(
                "cannot resample {:?} bars into {:?}",
                bar.frequency(),
                self.frequency
            )));
        }
        let start = self.frequency.slot_start(bar.date_time());
        let instrument = bar.instrument();

        let done = match self.current {
            Some(current) if start < current => {
                return Err(CoreError::OutOfOrder {
                    instrument: instrument.to_string(),
                    previous: current,
                    current: bar.date_time(),
                })
            }
            Some(current) if start == current => Vec::new(),
            _ => {
                self.current = Some(start);
                self.close_slots()?
            }
        };

        match self.slots.get_mut(instrument) {
            Some(slot) => slot.merge(bar),
            None => {
                self.slots
                    .insert(instrument.clone(), Slot::open_with(start, bar));
            }
        }
        Ok(done)
    }

    /// Emit every pending bar of the current slot, in instrument order.
    pub fn flush(&mut self) -> Result<Vec<BasicBar>> {
        self.close_slots()
    }

    pub fn has_pending(&self) -> bool {
        !self.slots.is_empty()
    }

    fn close_slots(&mut self) -> Result<Vec<BasicBar>> {
        let slots = std::mem::take(&mut self.slots);
        slots
            .into_iter()
            .map(|(instrument, slot)| slot.finish(&instrument, self.frequency))
            .collect()
    }
}

/// Aggregate a finished, chronologically ordered sequence of bars.
pub fn resample<'a, I>(bars: I, frequency: Frequency) -> Result<Vec<BasicBar>>
where
    I: IntoIterator<Item = &'a dyn Bar>,
{
    let mut resampler = Resampler::new(frequency)?;
    let mut out = Vec::new();
    for bar in bars {
        out.extend(resampler.push(bar)?);
    }
    out.extend(resampler.flush()?);
    Ok(out)
}

/// A source that listens to another feed and publishes its resampled bars.
///
/// It is a realtime subject: completed slots are published on the next pass after
/// the upstream feed moves past them, and the last slot once the upstream is exhausted.
pub struct ResampledSource {
    upstream: BarFeed,
    frequency: Frequency,
    resampler: Rc<RefCell<Resampler>>,
    ready: Rc<RefCell<BTreeMap<DateTime<Utc>, Vec<BasicBar>>>>,
    last_emitted: Option<DateTime<Utc>>,
    flushed: bool,
}

impl ResampledSource {
    pub fn new(upstream: &BarFeed, frequency: Frequency) -> Result<Self> {
        if frequency <= upstream.frequency() {
            return Err(CoreError::Config(format!(
                "resampled frequency {:?} must be coarser than {:?}",
                frequency,
                upstream.frequency()
            )));
        }
        let resampler = Rc::new(RefCell::new(Resampler::new(frequency)?));
        let ready = Rc::new(RefCell::new(BTreeMap::new()));

        let (r, q) = (resampler.clone(), ready.clone());
        upstream.subscribe(move |(_, bars): &(DateTime<Utc>, Bars)| {
            let mut resampler = r.borrow_mut();
            for (_, bar) in bars {
                for done in resampler.push(&**bar)? {
                    queue_slot(&q, done);
                }
            }
            Ok(())
        });

        Ok(Self {
            upstream: upstream.clone(),
            frequency,
            resampler,
            ready,
            last_emitted: None,
            flushed: false,
        })
    }
}

impl BarSource for ResampledSource {
    fn name(&self) -> String {
        format!("resampled-{:?}", self.frequency).to_lowercase()
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    fn instruments(&self) -> Vec<Instrument> {
        self.upstream.registered_instruments()
    }

    fn eof(&self) -> bool {
        self.flushed && self.ready.borrow().is_empty()
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn current_date_time(&self) -> Option<DateTime<Utc>> {
        self.last_emitted
    }

    fn bars_have_adj_close(&self) -> bool {
        self.upstream.bars_have_adj_close()
    }

    fn pump(&mut self) -> Result<Vec<Deferred>> {
        if !self.flushed && self.upstream.eof() {
            let rest = self.resampler.borrow_mut().flush()?;
            for bar in rest {
                queue_slot(&self.ready, bar);
            }
            self.flushed = true;
        }
        Ok(Vec::new())
    }

    fn next_bars(&mut self) -> Result<Option<Bars>> {
        // Every instrument's bar for a slot is queued together and forms one tick.
        let Some((at, group)) = self.ready.borrow_mut().pop_first() else {
            return Ok(None);
        };
        if let Some(previous) = self.last_emitted {
            if at <= previous {
                return Err(CoreError::InvalidState(format!(
                    "resampled slot {at} closed after slot {previous}"
                )));
            }
        }
        self.last_emitted = Some(at);
        Bars::new(group.into_iter().map(BasicBar::into_ref).collect()).map(Some)
    }
}

fn queue_slot(ready: &RefCell<BTreeMap<DateTime<Utc>, Vec<BasicBar>>>, bar: BasicBar) {
    ready
        .borrow_mut()
        .entry(bar.date_time())
        .or_default()
        .push(bar);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BarRef;
    use chrono::TimeZone;

    fn second_bar(sec: u32, open: f64, high: f64, low: f64, close: f64, volume: f64) -> BarRef {
        BasicBar::new(
            Instrument::new("BTC", "USD"),
            Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, sec).unwrap(),
            open,
            high,
            low,
            close,
            volume,
            Some(close),
            Frequency::Second,
        )
        .unwrap()
        .into_ref()
    }

    #[test]
    fn seconds_into_one_minute() {
        let bars = vec![
            second_bar(0, 10.0, 11.0, 9.0, 10.5, 1.0),
            second_bar(1, 10.5, 14.0, 10.0, 13.0, 2.0),
            second_bar(59, 13.0, 13.5, 8.0, 9.0, 3.0),
        ];
        let out = resample(bars.iter().map(|b| b.as_ref()), Frequency::Minute).unwrap();
        assert_eq!(out.len(), 1);
        let m = &out[0];
        assert_eq!(m.date_time(), Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap());
        assert_eq!(m.open(), 10.0);
        assert_eq!(m.high(), 14.0);
        assert_eq!(m.low(), 8.0);
        assert_eq!(m.close(), 9.0);
        assert_eq!(m.volume(), 6.0);
        assert_eq!(m.adj_close(), Some(9.0));
        assert_eq!(m.frequency(), Frequency::Minute);
    }

    #[test]
    fn push_emits_previous_slot_on_rollover() {
        let mut r = Resampler::new(Frequency::Minute).unwrap();
        assert!(r.push(second_bar(0, 1.0, 1.0, 1.0, 1.0, 1.0).as_ref()).unwrap().is_empty());
        let next_minute = BasicBar::new(
            Instrument::new("BTC", "USD"),
            Utc.with_ymd_and_hms(2024, 1, 2, 10, 1, 0).unwrap(),
            2.0,
            2.0,
            2.0,
            2.0,
            1.0,
            None,
            Frequency::Second,
        )
        .unwrap();
        let done = r.push(&next_minute).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].close(), 1.0);
        assert!(r.has_pending());
        assert_eq!(r.flush().unwrap().len(), 1);
        assert!(!r.has_pending());
    }

    #[test]
    fn rejects_earlier_slot_and_coarser_input() {
        let mut r = Resampler::new(Frequency::Minute).unwrap();
        let later = BasicBar::new(
            Instrument::new("BTC", "USD"),
            Utc.with_ymd_and_hms(2024, 1, 2, 10, 5, 0).unwrap(),
            1.0,
            1.0,
            1.0,
            1.0,
            1.0,
            None,
            Frequency::Second,
        )
        .unwrap();
        r.push(&later).unwrap();
        assert!(r.push(second_bar(0, 1.0, 1.0, 1.0, 1.0, 1.0).as_ref()).is_err());

        let mut hourly = Resampler::new(Frequency::Minute).unwrap();
        let day_bar = BasicBar::new(
            Instrument::new("BTC", "USD"),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            1.0,
            1.0,
            1.0,
            1.0,
            1.0,
            None,
            Frequency::Day,
        )
        .unwrap();
        assert!(hourly.push(&day_bar).is_err());
        assert!(Resampler::new(Frequency::Trade).is_err());
    }

    fn bar_at(symbol: &str, min: u32, sec: u32, close: f64) -> BasicBar {
        BasicBar::new(
            Instrument::new(symbol, "USD"),
            Utc.with_ymd_and_hms(2024, 1, 2, 10, min, sec).unwrap(),
            close,
            close,
            close,
            close,
            1.0,
            None,
            Frequency::Second,
        )
        .unwrap()
    }

    #[test]
    fn shared_slot_closes_for_every_instrument() {
        let mut r = Resampler::new(Frequency::Minute).unwrap();
        assert!(r.push(&bar_at("AAA", 0, 0, 1.0)).unwrap().is_empty());
        assert!(r.push(&bar_at("BBB", 0, 0, 2.0)).unwrap().is_empty());

        // AAA moves on alone: BBB's minute closes too.
        let done = r.push(&bar_at("AAA", 1, 0, 3.0)).unwrap();
        let symbols: Vec<_> = done.iter().map(|b| b.instrument().symbol.clone()).collect();
        assert_eq!(symbols, vec!["AAA", "BBB"]);
        assert!(done.iter().all(|b| b.date_time() == Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap()));

        let done = r.push(&bar_at("BBB", 2, 0, 4.0)).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].instrument().symbol, "AAA");
        assert_eq!(r.current_slot(), Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 2, 0).unwrap()));

        // A bar for an already closed slot is out of order, whatever the instrument.
        assert!(matches!(
            r.push(&bar_at("AAA", 1, 30, 5.0)),
            Err(CoreError::OutOfOrder { .. })
        ));
    }
}
