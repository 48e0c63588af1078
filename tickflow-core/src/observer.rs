//! Synchronous publish/subscribe events.
//!
//! Handlers run in subscription order on the emitting thread. There is no queueing:
//! an emit returns once every handler has run (or one of them failed).
//!
//! Handlers may subscribe, unsubscribe, or trigger other events while an emit is in
//! progress. Subscriptions made during an emit take effect from the next emit.

use std::cell::{Cell, RefCell};
use std::fmt;

use crate::error::Result;

type Handler<T> = Box<dyn FnMut(&T) -> Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct Event<T> {
    handlers: RefCell<Vec<(HandlerId, Handler<T>)>>,
    removed: RefCell<Vec<HandlerId>>,
    next_id: Cell<u64>,
    emitting: Cell<bool>,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
            removed: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            emitting: Cell::new(false),
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handlers", &self.handlers.try_borrow().map(|h| h.len()).ok())
            .field("emitting", &self.emitting.get())
            .finish()
    }
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> HandlerId
    where
        F: FnMut(&T) -> Result<()> + 'static,
    {
        let id = HandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.handlers.borrow_mut().push((id, Box::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) {
        if self.emitting.get() {
            self.removed.borrow_mut().push(id);
        } else {
            self.handlers.borrow_mut().retain(|(h, _)| *h != id);
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.handlers.borrow().is_empty() || self.emitting.get()
    }

    /// Invoke every handler with `value`. The first handler error stops the emit
    /// and is returned.
    pub fn emit(&self, value: &T) -> Result<()> {
        // Re-entrant emits of the same event see no handlers.
        if self.emitting.get() {
            return Ok(());
        }
        self.emitting.set(true);
        let mut active = std::mem::take(&mut *self.handlers.borrow_mut());

        let mut outcome = Ok(());
        for (id, handler) in active.iter_mut() {
            if self.removed.borrow().contains(id) {
                continue;
            }
            if let Err(e) = handler(value) {
                outcome = Err(e);
                break;
            }
        }

        let added = std::mem::take(&mut *self.handlers.borrow_mut());
        active.extend(added);
        let removed = std::mem::take(&mut *self.removed.borrow_mut());
        active.retain(|(id, _)| !removed.contains(id));
        *self.handlers.borrow_mut() = active;
        self.emitting.set(false);
        outcome
    }
}
