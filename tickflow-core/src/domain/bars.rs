//! Bars — a same-timestamp group of bars across instruments.

use std::collections::btree_map::{self, BTreeMap};

use chrono::{DateTime, Utc};

use super::{BarRef, Instrument};
use crate::error::{CoreError, Result};

/// Exactly one bar per instrument, all sharing one datetime.
///
/// Read-only after construction. Cloning is cheap: bars are shared handles.
#[derive(Debug, Clone)]
pub struct Bars {
    date_time: DateTime<Utc>,
    bars: BTreeMap<Instrument, BarRef>,
}

impl Bars {
    /// Group bars for one tick.
    ///
    /// Fails when `bars` is empty, when datetimes disagree or when an instrument repeats.
    pub fn new(bars: Vec<BarRef>) -> Result<Self> {
        let first = bars
            .first()
            .ok_or_else(|| CoreError::InvalidBars("No bars supplied".into()))?;
        let date_time = first.date_time();

        let mut map = BTreeMap::new();
        for bar in bars {
            if bar.date_time() != date_time {
                return Err(CoreError::InvalidBars(format!(
                    "Bar data times are not in sync. {} {} != {}",
                    bar.instrument(),
                    bar.date_time(),
                    date_time
                )));
            }
            let instrument = bar.instrument().clone();
            if map.contains_key(&instrument) {
                return Err(CoreError::InvalidBars(format!(
                    "Duplicate bars for {instrument}"
                )));
            }
            map.insert(instrument, bar);
        }

        Ok(Self {
            date_time,
            bars: map,
        })
    }

    /// Single-bar group.
    pub fn single(bar: BarRef) -> Self {
        let date_time = bar.date_time();
        let mut bars = BTreeMap::new();
        bars.insert(bar.instrument().clone(), bar);
        Self { date_time, bars }
    }

    pub fn date_time(&self) -> DateTime<Utc> {
        self.date_time
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.bars.keys()
    }

    pub fn contains(&self, instrument: &Instrument) -> bool {
        self.bars.contains_key(instrument)
    }

    /// Lenient lookup.
    pub fn bar(&self, instrument: &Instrument) -> Option<&BarRef> {
        self.bars.get(instrument)
    }

    /// Strict lookup: a miss is an error.
    pub fn get(&self, instrument: &Instrument) -> Result<&BarRef> {
        self.bars
            .get(instrument)
            .ok_or_else(|| CoreError::MissingBar(instrument.to_string()))
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Instrument, BarRef> {
        self.bars.iter()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

impl<'a> IntoIterator for &'a Bars {
    type Item = (&'a Instrument, &'a BarRef);
    type IntoIter = btree_map::Iter<'a, Instrument, BarRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.bars.iter()
    }
}
