//! Errors raised by live components.
//!
//! Live subjects report through `CoreError` like every other subject, so
//! `LiveError` converts into the core connectivity and exchange variants.

use std::time::Duration;

use thiserror::Error;
use tickflow_core::CoreError;

pub type Result<T> = std::result::Result<T, LiveError>;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("initialization did not complete within {0:?}")]
    InitializationTimeout(Duration),

    #[error("trading client: {0}")]
    Client(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        LiveError::WebSocket(e.to_string())
    }
}

impl From<LiveError> for CoreError {
    fn from(e: LiveError) -> Self {
        match e {
            LiveError::WebSocket(_) | LiveError::InitializationTimeout(_) => {
                CoreError::Connectivity(e.to_string())
            }
            LiveError::Protocol(_) | LiveError::Serialization(_) | LiveError::Client(_) => {
                CoreError::Exchange(e.to_string())
            }
        }
    }
}
