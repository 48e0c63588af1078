//! Bar feeds — turn per-instrument price data into ordered `Bars` ticks.
//!
//! - `BarSource` is the override point for concrete data sources
//! - `BarFeed` wraps a source as a dispatcher subject and keeps the last-bar cache,
//!   the per-instrument data series and the adjusted-values policy
//! - `MemorySource` replays bars held in memory
//! - `Resampler` / `ResampledSource` aggregate bars into coarser frequencies

pub mod memory;
pub mod resample;
pub mod series;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::dispatcher::{Dispatch, DispatchPriority, Subject};
use crate::domain::{BarRef, Bars, Frequency, Instrument};
use crate::error::{CoreError, Result};
use crate::observer::{Event, HandlerId};

pub use memory::MemorySource;
pub use resample::{resample, ResampledSource, Resampler};
pub use series::{BarDataSeries, DEFAULT_MAX_LEN};

/// Work a source hands back to the feed to run once the source is no longer
/// borrowed, such as publishing side-channel events.
pub type Deferred = Box<dyn FnOnce() -> Result<()>>;

/// Shared handle to a data series.
pub type SharedSeries = Rc<RefCell<BarDataSeries>>;

/// Payload of the new-bars event.
pub type BarsEvent = (DateTime<Utc>, Bars);

/// A concrete data source behind a `BarFeed`.
pub trait BarSource {
    fn name(&self) -> String {
        "bar-feed".into()
    }

    fn frequency(&self) -> Frequency;

    /// Instruments known up front, used to register data series.
    fn instruments(&self) -> Vec<Instrument>;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn join(&mut self) {}

    fn eof(&self) -> bool;

    fn peek_date_time(&self) -> Option<DateTime<Utc>>;

    fn current_date_time(&self) -> Option<DateTime<Utc>>;

    fn bars_have_adj_close(&self) -> bool;

    /// Drain background events into the source. Returns deferred notifications;
    /// a non-empty list counts as having produced an event.
    fn pump(&mut self) -> Result<Vec<Deferred>> {
        Ok(Vec::new())
    }

    /// The next synchronized group, or `None` when nothing is available right now.
    fn next_bars(&mut self) -> Result<Option<Bars>>;

    /// Rewind to the beginning, where supported.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Timestamp for a new event that keeps a stream strictly increasing: colliding or
/// earlier timestamps are pushed one microsecond past the previous one.
pub fn next_distinct(previous: Option<DateTime<Utc>>, current: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if current <= prev => prev + Duration::microseconds(1),
        _ => current,
    }
}

#[derive(Default)]
struct FeedState {
    last_bars: Option<Bars>,
    last_bar: HashMap<Instrument, BarRef>,
    series: BTreeMap<Instrument, SharedSeries>,
    use_adjusted: bool,
}

struct FeedInner {
    source: RefCell<Box<dyn BarSource>>,
    state: RefCell<FeedState>,
    frequency: Frequency,
    max_len: usize,
    new_bars: Event<BarsEvent>,
}

/// Cheap-clone handle to a feed. One clone goes to the dispatcher; the others
/// are used by brokers and strategies to query the feed.
#[derive(Clone)]
pub struct BarFeed {
    inner: Rc<FeedInner>,
}

impl BarFeed {
    pub fn new<S: BarSource + 'static>(source: S, max_len: usize) -> Self {
        let frequency = source.frequency();
        let instruments = source.instruments();
        let feed = Self {
            inner: Rc::new(FeedInner {
                source: RefCell::new(Box::new(source)),
                state: RefCell::new(FeedState::default()),
                frequency,
                max_len,
                new_bars: Event::new(),
            }),
        };
        for instrument in instruments {
            feed.register_instrument(&instrument);
        }
        feed
    }

    pub fn frequency(&self) -> Frequency {
        self.inner.frequency
    }

    pub fn is_intraday(&self) -> bool {
        self.inner.frequency.is_intraday()
    }

    pub fn max_len(&self) -> usize {
        self.inner.max_len
    }

    /// Fired once per tick with `(datetime, bars)`.
    pub fn new_bars_event(&self) -> &Event<BarsEvent> {
        &self.inner.new_bars
    }

    pub fn subscribe<F>(&self, handler: F) -> HandlerId
    where
        F: FnMut(&BarsEvent) -> Result<()> + 'static,
    {
        self.inner.new_bars.subscribe(handler)
    }

    pub fn bars_have_adj_close(&self) -> bool {
        self.inner.source.borrow().bars_have_adj_close()
    }

    pub fn current_date_time(&self) -> Option<DateTime<Utc>> {
        self.inner.source.borrow().current_date_time()
    }

    pub fn use_adjusted_values(&self) -> bool {
        self.inner.state.borrow().use_adjusted
    }

    /// Switch every data series (and future bars) to adjusted values.
    ///
    /// Either every series switches or none does.
    pub fn set_use_adjusted_values(&self, use_adjusted: bool) -> Result<()> {
        if use_adjusted && !self.bars_have_adj_close() {
            return Err(CoreError::AdjustedValuesUnsupported);
        }
        let mut state = self.inner.state.borrow_mut();
        for series in state.series.values() {
            series.borrow().check_use_adjusted_values(use_adjusted)?;
        }
        for series in state.series.values() {
            series.borrow_mut().set_use_adjusted_values(use_adjusted)?;
        }
        state.use_adjusted = use_adjusted;
        Ok(())
    }

    pub fn register_instrument(&self, instrument: &Instrument) -> SharedSeries {
        let mut state = self.inner.state.borrow_mut();
        let use_adjusted = state.use_adjusted;
        state
            .series
            .entry(instrument.clone())
            .or_insert_with(|| {
                let mut series =
                    BarDataSeries::new(instrument.clone(), self.inner.frequency, self.inner.max_len);
                if let Err(err) = series.set_use_adjusted_values(use_adjusted) {
                    warn!(%instrument, error = %err, "new series keeps raw values");
                }
                Rc::new(RefCell::new(series))
            })
            .clone()
    }

    pub fn registered_instruments(&self) -> Vec<Instrument> {
        self.inner.state.borrow().series.keys().cloned().collect()
    }

    pub fn data_series(&self, instrument: &Instrument) -> Option<SharedSeries> {
        self.inner.state.borrow().series.get(instrument).cloned()
    }

    /// Last bar seen for `instrument`, regardless of feed position.
    pub fn last_bar(&self, instrument: &Instrument) -> Option<BarRef> {
        self.inner.state.borrow().last_bar.get(instrument).cloned()
    }

    pub fn last_bars(&self) -> Option<Bars> {
        self.inner.state.borrow().last_bars.clone()
    }

    /// Clear caches and data series, and rewind the source.
    pub fn reset(&self) -> Result<()> {
        self.inner.source.borrow_mut().reset()?;
        let mut state = self.inner.state.borrow_mut();
        state.last_bars = None;
        state.last_bar.clear();
        for series in state.series.values() {
            series.borrow_mut().clear();
        }
        Ok(())
    }

    /// Pull the next group from the source and update caches. Does not publish.
    pub fn advance(&self) -> Result<Option<BarsEvent>> {
        let next = self.inner.source.borrow_mut().next_bars()?;
        let Some(bars) = next else {
            return Ok(None);
        };

        let use_adjusted = self.use_adjusted_values();
        for (instrument, bar) in &bars {
            bar.set_use_adjusted_value(use_adjusted)?;
            let series = self.register_instrument(instrument);
            series.borrow_mut().append(bar.clone())?;
        }

        let mut state = self.inner.state.borrow_mut();
        for (instrument, bar) in &bars {
            state.last_bar.insert(instrument.clone(), bar.clone());
        }
        state.last_bars = Some(bars.clone());
        Ok(Some((bars.date_time(), bars)))
    }
}

impl Subject for BarFeed {
    fn name(&self) -> String {
        self.inner.source.borrow().name()
    }

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::BarFeed
    }

    fn start(&mut self) -> Result<()> {
        self.inner.source.borrow_mut().start()
    }

    fn stop(&mut self) {
        self.inner.source.borrow_mut().stop();
    }

    fn join(&mut self) {
        self.inner.source.borrow_mut().join();
    }

    fn eof(&self) -> bool {
        self.inner.source.borrow().eof()
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        self.inner.source.borrow().peek_date_time()
    }

    fn dispatch(&mut self) -> Result<Dispatch> {
        let deferred = self.inner.source.borrow_mut().pump()?;
        let pumped = !deferred.is_empty();
        for notify in deferred {
            notify()?;
        }

        match self.advance()? {
            Some(event) => {
                debug!(at = %event.0, instruments = event.1.len(), "dispatching bars");
                self.inner.new_bars.emit(&event)?;
                Ok(Dispatch::Produced(Some(event.0)))
            }
            None if pumped => Ok(Dispatch::Produced(None)),
            None => Ok(Dispatch::Nothing),
        }
    }
}
