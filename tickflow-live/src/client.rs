//! Websocket client task.
//!
//! A `Connector` runs one connection on the live runtime and pushes decoded
//! messages into a bounded flume channel that the owning subject drains.
//! Every session ends with a `Disconnected` message, whatever the cause.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info};
use url::Url;

use crate::error::{LiveError, Result};
use crate::protocol::{subscribe_message, OrderBookUpdate, Subscriptions, Trade};

/// What a connection hands to the subject draining it.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// Every subscription was confirmed.
    Initialized,
    Trade(Trade),
    OrderBook(OrderBookUpdate),
    /// The connection is gone. Always the last message of a session.
    Disconnected,
}

/// Opens and runs market-data connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run one session until the connection closes or `shutdown` turns true.
    async fn run(
        &self,
        channels: Vec<String>,
        tx: flume::Sender<FeedMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

pub struct WsConnector {
    url: Url,
    ping_interval: Duration,
}

impl WsConnector {
    pub fn new(url: &str, ping_interval: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| LiveError::Protocol(format!("invalid url '{url}': {e}")))?;
        Ok(Self { url, ping_interval })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn session(
        &self,
        channels: Vec<String>,
        tx: &flume::Sender<FeedMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(url = %self.url, "connecting");
        let (stream, _) = connect_async(self.url.as_str()).await?;
        info!(url = %self.url, "connected");
        let (mut write, mut read) = stream.split();

        for channel in &channels {
            info!(%channel, "subscribing");
            write.send(Message::Text(subscribe_message(channel))).await?;
        }
        let mut subscriptions = Subscriptions::new(&channels);

        let mut ping = tokio::time::interval(self.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("closing websocket");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(out) = subscriptions.handle(&text) {
                            if tx.send_async(out).await.is_err() {
                                // Nobody is draining anymore.
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "websocket closed by peer");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn run(
        &self,
        channels: Vec<String>,
        tx: flume::Sender<FeedMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let outcome = self.session(channels, &tx, shutdown).await;
        if let Err(e) = &outcome {
            error!(error = %e, "websocket session failed");
        }
        let _ = tx.send_async(FeedMessage::Disconnected).await;
        outcome
    }
}
