//! Message bus: `{type, data}` envelopes over the peer client, demultiplexed by kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::{PeerClient, PeerClientEvent};
use crate::identity::PeerId;
use crate::lock;

/// Discriminant of a bus message. `rpc` and `sync` carry the request and replication buses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Rpc,
    Sync,
    Event(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Rpc => "rpc",
            MessageKind::Sync => "sync",
            MessageKind::Event(name) => name,
        }
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        match s {
            "rpc" => MessageKind::Rpc,
            "sync" => MessageKind::Sync,
            other => MessageKind::Event(other.to_string()),
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "rpc" => MessageKind::Rpc,
            "sync" => MessageKind::Sync,
            _ => MessageKind::Event(s),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Event(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form of one bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: Value,
}

impl BusMessage {
    /// Parse an application value. `None` when `type` or `data` is missing or null.
    pub fn parse(value: Value) -> Option<Self> {
        let msg: BusMessage = serde_json::from_value(value).ok()?;
        (!msg.data.is_null()).then_some(msg)
    }
}

/// A message delivered to a subscriber, tagged with its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub peer: PeerId,
    pub data: Value,
}

type Handlers = Arc<Mutex<HashMap<MessageKind, Vec<mpsc::UnboundedSender<Inbound>>>>>;

#[derive(Clone)]
pub struct MessageBus {
    client: PeerClient,
    handlers: Handlers,
}

impl MessageBus {
    pub fn new(client: &PeerClient) -> Self {
        let handlers: Handlers = Arc::new(Mutex::new(HashMap::new()));
        let events = client.subscribe();
        tokio::spawn(dispatch(events, handlers.clone()));
        Self {
            client: client.clone(),
            handlers,
        }
    }

    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    /// Messages of `kind` from any peer.
    pub fn subscribe(&self, kind: impl Into<MessageKind>) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.handlers).entry(kind.into()).or_default().push(tx);
        rx
    }

    pub fn send(&self, peer: &PeerId, kind: impl Into<MessageKind>, data: Value) {
        let kind = kind.into();
        trace!("bus send {} to {}", kind, peer.short());
        self.client.send(peer, envelope(kind, data));
    }

    pub fn broadcast(&self, kind: impl Into<MessageKind>, data: Value, exclude: &[PeerId]) {
        let kind = kind.into();
        trace!("bus broadcast {}", kind);
        self.client.broadcast(envelope(kind, data), exclude);
    }
}

fn envelope(kind: MessageKind, data: Value) -> Value {
    serde_json::to_value(BusMessage { kind, data }).unwrap_or(Value::Null)
}

async fn dispatch(mut events: mpsc::UnboundedReceiver<PeerClientEvent>, handlers: Handlers) {
    while let Some(event) = events.recv().await {
        let PeerClientEvent::Data { peer, data } = event else {
            continue;
        };
        let Some(msg) = BusMessage::parse(data) else {
            debug!("ignoring untyped message from {}", peer.short());
            continue;
        };
        let mut handlers = lock(&handlers);
        match handlers.get_mut(&msg.kind) {
            Some(subs) => {
                let inbound = Inbound { peer, data: msg.data };
                subs.retain(|tx| tx.send(inbound.clone()).is_ok());
            }
            None => debug!("no subscriber for {} from {}", msg.kind, peer.short()),
        }
    }
    // Client gone: dropping the senders ends every subscription.
    lock(&handlers).clear();
}
