//! Pub/sub relay abstraction used to bootstrap direct transports.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from relay operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("relay closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Session (re)established. Server-side subscriptions from earlier sessions are gone.
    Connected,
    Disconnected,
    Message { topic: String, payload: Bytes },
    Error(RelayError),
    /// Closed by the local side; no further events.
    Closed,
}

/// Topic-addressed publish/subscribe client. Reconnects on its own after a drop.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Begin connecting. `Connected` is reported through the event receiver.
    async fn connect(&self) -> Result<(), RelayError>;

    /// Subscribe and wait for the relay's acknowledgement.
    async fn subscribe(&self, topic: &str) -> Result<(), RelayError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), RelayError>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError>;

    /// Event receiver. Available once; later calls return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>>;

    async fn close(&self);
}

/// Relay client options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub url: String,
    pub client_id: String,
    pub keepalive: Duration,
    pub reconnect_period: Duration,
}

impl RelayOptions {
    pub fn new(url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: client_id.into(),
            keepalive: Duration::from_secs(60),
            reconnect_period: Duration::from_secs(30),
        }
    }
}
