//! Domain types: instruments, frequencies, bars and orders.

pub mod bar;
pub mod bars;
pub mod frequency;
pub mod instrument;
pub mod order;

pub use bar::{sanitize_ohlc, validate_ohlc, Bar, BarRef, BasicBar, PriceField};
pub use bars::Bars;
pub use frequency::Frequency;
pub use instrument::Instrument;
pub use order::{
    Order, OrderAction, OrderEvent, OrderEventKind, OrderExecution, OrderId, OrderStatus,
    OrderType,
};
