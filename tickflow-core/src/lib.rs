//! Tickflow Core — event-ordered market data and order execution.
//!
//! This crate contains the engine shared by backtesting and live trading:
//! - Domain types (instruments, frequencies, bars, synchronized bar groups, orders)
//! - Bar feeds with per-instrument data series and resampling
//! - The dispatcher that drives every subject in timestamp order
//! - The backtesting broker: order matching, fill policies and the balance ledger
//! - Engine configuration

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod feed;
pub mod observer;

pub use error::{CoreError, Result};
