//! In-memory replay source.
//!
//! Bars are loaded up front (per instrument, any order) and merged into one
//! timeline keyed by datetime. Each `next_bars` call yields the group for the
//! next datetime, so instruments missing at a datetime are simply absent from
//! that tick.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use chrono::{DateTime, Utc};

use super::{next_distinct, BarSource};
use crate::domain::{Bar, BarRef, Bars, BasicBar, Frequency, Instrument};
use crate::error::{CoreError, Result};

pub struct MemorySource {
    frequency: Frequency,
    timeline: BTreeMap<DateTime<Utc>, Vec<BarRef>>,
    instruments: BTreeSet<Instrument>,
    last_loaded: BTreeMap<Instrument, DateTime<Utc>>,
    cursor: Option<DateTime<Utc>>,
    have_adj_close: Option<bool>,
    name: String,
}

impl MemorySource {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            timeline: BTreeMap::new(),
            instruments: BTreeSet::new(),
            last_loaded: BTreeMap::new(),
            cursor: None,
            have_adj_close: None,
            name: "memory-feed".into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Load bars. Must happen before consumption starts.
    ///
    /// Bars are ordered per instrument by datetime (stable, so input order breaks ties).
    /// For trade bars, colliding timestamps are offset by one microsecond each so
    /// every trade stays a distinct event in input order.
    pub fn add_bars(&mut self, bars: Vec<BasicBar>) -> Result<()> {
        if self.cursor.is_some() {
            return Err(CoreError::InvalidState(
                "Can't add more bars once you started consuming bars".into(),
            ));
        }

        let mut by_instrument: BTreeMap<Instrument, Vec<BasicBar>> = BTreeMap::new();
        for bar in bars {
            if bar.frequency() != self.frequency {
                return Err(CoreError::InvalidBar(format!(
                    "{} bar at {} has frequency {:?}, feed expects {:?}",
                    bar.instrument(),
                    bar.date_time(),
                    bar.frequency(),
                    self.frequency
                )));
            }
            by_instrument
                .entry(bar.instrument().clone())
                .or_default()
                .push(bar);
        }

        for (instrument, mut bars) in by_instrument {
            bars.sort_by_key(|b| b.date_time());
            if self.have_adj_close.is_none() {
                self.have_adj_close = bars.first().map(|b| b.adj_close().is_some());
            }

            let mut previous = self.last_loaded.get(&instrument).copied();
            for bar in bars {
                let bar = if self.frequency == Frequency::Trade {
                    let at = next_distinct(previous, bar.date_time());
                    bar.with_date_time(at)
                } else {
                    bar
                };
                previous = Some(bar.date_time());
                self.timeline
                    .entry(bar.date_time())
                    .or_default()
                    .push(bar.into_ref());
            }
            if let Some(last) = previous {
                self.last_loaded.insert(instrument.clone(), last);
            }
            self.instruments.insert(instrument);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty()
    }

    fn upcoming(&self) -> Option<(&DateTime<Utc>, &Vec<BarRef>)> {
        match self.cursor {
            Some(cursor) => self
                .timeline
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .next(),
            None => self.timeline.iter().next(),
        }
    }
}

impl BarSource for MemorySource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    fn instruments(&self) -> Vec<Instrument> {
        self.instruments.iter().cloned().collect()
    }

    fn eof(&self) -> bool {
        self.upcoming().is_none()
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        self.upcoming().map(|(dt, _)| *dt)
    }

    fn current_date_time(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    fn bars_have_adj_close(&self) -> bool {
        self.have_adj_close.unwrap_or(false)
    }

    fn next_bars(&mut self) -> Result<Option<Bars>> {
        let Some((at, group)) = self.upcoming() else {
            return Ok(None);
        };
        let at = *at;
        let bars = Bars::new(group.clone())?;
        self.cursor = Some(at);
        Ok(Some(bars))
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = None;
        Ok(())
    }
}
