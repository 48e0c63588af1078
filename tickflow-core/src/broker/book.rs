use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::domain::{Instrument, Order, OrderExecution, OrderId};
use crate::error::{CoreError, Result};

/// OrderBook: every order a broker has created, keyed by id.
///
/// Terminal orders stay in the book so they can still be queried by id.
#[derive(Debug)]
pub struct OrderBook {
    orders: BTreeMap<OrderId, Order>,
    next_id: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            orders: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Reserve the next order id. Ids are never reused.
    pub fn next_id(&mut self) -> OrderId {
        let id = OrderId(self.next_id);
        self.next_id += 1;
        id
    }

    /// The id `next_id` would hand out, without reserving it.
    pub fn pending_id(&self) -> OrderId {
        OrderId(self.next_id)
    }

    pub fn insert(&mut self, order: Order) {
        if order.id().0 >= self.next_id {
            self.next_id = order.id().0 + 1;
        }
        self.orders.insert(order.id(), order);
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn get_mut(&mut self, id: OrderId) -> Option<&mut Order> {
        self.orders.get_mut(&id)
    }

    /// Active orders, optionally for one instrument, in submission order.
    pub fn active(&self, instrument: Option<&Instrument>) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| o.is_active())
            .filter(|o| instrument.map_or(true, |i| o.instrument() == i))
            .collect()
    }

    pub fn active_ids(&self) -> Vec<OrderId> {
        self.active(None).into_iter().map(Order::id).collect()
    }

    pub fn find_by_exchange_id(&self, exchange_id: &str) -> Option<OrderId> {
        self.orders
            .values()
            .find(|o| o.exchange_id() == Some(exchange_id))
            .map(Order::id)
    }

    pub fn accept(&mut self, id: OrderId, at: DateTime<Utc>) -> Result<&Order> {
        let order = self.active_mut(id)?;
        order.accept(at)?;
        Ok(order)
    }

    pub fn fill(&mut self, id: OrderId, execution: OrderExecution) -> Result<&Order> {
        let order = self.active_mut(id)?;
        order.add_execution(execution)?;
        Ok(order)
    }

    pub fn cancel(&mut self, id: OrderId) -> Result<&Order> {
        let order = self
            .orders
            .get_mut(&id)
            .ok_or(CoreError::OrderNotActive(id))?;
        if order.is_filled() {
            return Err(CoreError::OrderAlreadyFilled(id));
        }
        if !order.is_active() {
            return Err(CoreError::OrderNotActive(id));
        }
        order.cancel()?;
        Ok(order)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn active_mut(&mut self, id: OrderId) -> Result<&mut Order> {
        match self.orders.get_mut(&id) {
            Some(order) if order.is_active() => Ok(order),
            _ => Err(CoreError::OrderNotActive(id)),
        }
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}
