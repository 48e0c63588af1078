//! Dispatcher — advances logical time across independent event sources.
//!
//! Each pass:
//! 1. Peek the next timestamp of every subject that is not exhausted
//! 2. Pick the smallest one
//! 3. Dispatch, in priority order, every subject whose peeked timestamp equals it,
//!    plus every realtime subject (one that cannot peek)
//! 4. Stop when all subjects are exhausted; fire the idle event when nothing was dispatched
//!
//! Per subject, dispatched timestamps must strictly increase. A violation aborts the run.
//! Subjects are always stopped and joined when the loop ends, whether it ended cleanly or not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::error::{CoreError, Result};
use crate::observer::Event;

/// Same-timestamp tie-break order. Bar feeds go first so brokers see a tick's
/// prices before anything reacts to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatchPriority {
    BarFeed,
    Broker,
    Other,
}

/// Outcome of one `Subject::dispatch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// No event was available.
    Nothing,
    /// Events were published; carries the tick timestamp when the event had one.
    Produced(Option<DateTime<Utc>>),
}

/// A dispatcher-schedulable event source.
pub trait Subject {
    fn name(&self) -> String;

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::Other
    }

    fn start(&mut self) -> Result<()>;

    /// Must not fail. Signals background work to wind down.
    fn stop(&mut self);

    /// Blocks until background work has terminated.
    fn join(&mut self);

    fn eof(&self) -> bool;

    /// Timestamp of the next event without consuming it. `None` for realtime subjects.
    fn peek_date_time(&self) -> Option<DateTime<Utc>>;

    fn dispatch(&mut self) -> Result<Dispatch>;
}

/// Thread-safe handle that ends a running dispatcher after its current step.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Registered {
    subject: Box<dyn Subject>,
    last_dispatched: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct Dispatcher {
    subjects: Vec<Registered>,
    stop: StopHandle,
    start_event: Event<()>,
    idle_event: Event<()>,
    current_date_time: Option<DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subject. Subjects of equal priority keep registration order.
    pub fn add_subject<S: Subject + 'static>(&mut self, subject: S) {
        let priority = subject.priority();
        let pos = self
            .subjects
            .iter()
            .position(|r| r.subject.priority() > priority)
            .unwrap_or(self.subjects.len());
        self.subjects.insert(
            pos,
            Registered {
                subject: Box::new(subject),
                last_dispatched: None,
            },
        );
    }

    pub fn subject_names(&self) -> Vec<String> {
        self.subjects.iter().map(|r| r.subject.name()).collect()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Fired once, after subjects start and before the first pass.
    pub fn start_event(&self) -> &Event<()> {
        &self.start_event
    }

    /// Fired after a pass in which no subject produced anything.
    pub fn idle_event(&self) -> &Event<()> {
        &self.idle_event
    }

    /// Timestamp of the most recent step that had one.
    pub fn current_date_time(&self) -> Option<DateTime<Utc>> {
        self.current_date_time
    }

    /// Run until every subject is exhausted, `stop()` is called, or an error occurs.
    pub fn run(&mut self) -> Result<()> {
        info!(subjects = ?self.subject_names(), "dispatcher starting");
        self.stop.reset();

        let outcome = self.run_loop();
        if let Err(e) = &outcome {
            error!(error = %e, "dispatcher aborted");
        }

        for registered in self.subjects.iter_mut() {
            registered.subject.stop();
        }
        for registered in self.subjects.iter_mut() {
            registered.subject.join();
        }
        info!("dispatcher stopped");
        outcome
    }

    fn run_loop(&mut self) -> Result<()> {
        for registered in self.subjects.iter_mut() {
            registered.subject.start()?;
        }
        self.start_event.emit(&())?;

        while !self.stop.is_stopped() {
            let (eof, dispatched) = self.dispatch_pass()?;
            if eof {
                debug!("all subjects exhausted");
                self.stop.stop();
            } else if !dispatched {
                self.idle_event.emit(&())?;
            }
        }
        Ok(())
    }

    /// One pass. Returns `(eof, dispatched)`.
    fn dispatch_pass(&mut self) -> Result<(bool, bool)> {
        let mut smallest: Option<DateTime<Utc>> = None;
        let mut eof = true;
        for registered in &self.subjects {
            if !registered.subject.eof() {
                eof = false;
                if let Some(dt) = registered.subject.peek_date_time() {
                    smallest = Some(smallest.map_or(dt, |s| s.min(dt)));
                }
            }
        }
        if eof {
            return Ok((true, false));
        }
        if smallest.is_some() {
            self.current_date_time = smallest;
        }

        let mut dispatched = false;
        for registered in self.subjects.iter_mut() {
            let subject = &mut registered.subject;
            if subject.eof() {
                continue;
            }
            let peeked = subject.peek_date_time();
            if peeked.is_some() && peeked != smallest {
                continue;
            }

            if let Dispatch::Produced(at) = subject.dispatch()? {
                dispatched = true;
                if let Some(current) = at {
                    if let Some(previous) = registered.last_dispatched {
                        if current <= previous {
                            return Err(CoreError::OrderingViolation {
                                subject: registered.subject.name(),
                                previous,
                                current,
                            });
                        }
                    }
                    registered.last_dispatched = Some(current);
                    if peeked.is_none() {
                        self.current_date_time = Some(current);
                    }
                }
            }
        }
        Ok((false, dispatched))
    }
}
