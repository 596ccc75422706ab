//! Signaling transport: store-and-forward delivery of negotiation payloads over a [`Relay`].
//!
//! Owns the relay session. Outbound payloads queue in FIFO order until the peer's own topic is
//! subscribed, then flush in order. A failed subscribe or publish is retried with backoff while
//! the session is up; the failed payload keeps its place at the head of the queue. Relay failures
//! surface as events, never as panics or returns.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coalesce::sleep_until;
use crate::identity::{CryptoError, PeerId, SignalKey};
use crate::protocol::RelayEnvelope;
use crate::relay::{Relay, RelayError, RelayEvent};

#[derive(Debug, Error, Clone)]
pub enum SignalingError {
    #[error("relay: {0}")]
    Relay(#[from] RelayError),
    #[error("crypto: {0}")]
    Crypto(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl From<CryptoError> for SignalingError {
    fn from(e: CryptoError) -> Self {
        SignalingError::Crypto(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Own topic subscribed. Queued payloads go out from here on, in order.
    Open,
    Message(RelayEnvelope),
    Disconnected,
    Error(SignalingError),
    Close,
}

enum Command {
    Send { peer: PeerId, envelope: RelayEnvelope },
    Publish { topic: String, payload: Bytes },
    Subscribe { topic: String, handler: mpsc::UnboundedSender<Bytes> },
    Unsubscribe { topic: String },
    Close,
}

/// Handle to the signaling task. Cheap to clone.
#[derive(Clone)]
pub struct SignalingTransport {
    local: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

impl SignalingTransport {
    /// Connect `relay` and subscribe to `local`'s topic. With a secret, envelopes are sealed.
    pub fn start(
        local: PeerId,
        relay: Arc<dyn Relay>,
        secret: Option<&str>,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let task = SignalingTask {
            local: local.clone(),
            key: secret.map(SignalKey::derive),
            relay,
            connected: false,
            subscribed: false,
            queue: VecDeque::new(),
            retry_at: None,
            retry_delay: RETRY_MIN,
            handlers: HashMap::new(),
            events: ev_tx,
        };
        tokio::spawn(task.run(cmd_rx));
        let handle = Self {
            local,
            commands: cmd_tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (handle, ev_rx)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Deliver `envelope` to `peer`'s topic, queueing while the relay is not subscribed.
    pub fn send(&self, peer: &PeerId, envelope: RelayEnvelope) {
        self.command(Command::Send {
            peer: peer.clone(),
            envelope,
        });
    }

    /// Raw publish on an arbitrary topic, unsealed. Queued like `send`.
    pub fn publish(&self, topic: impl Into<String>, payload: Bytes) {
        self.command(Command::Publish {
            topic: topic.into(),
            payload,
        });
    }

    /// Route payloads published on `topic` to `handler`. Survives relay reconnects.
    pub fn subscribe(&self, topic: impl Into<String>, handler: mpsc::UnboundedSender<Bytes>) {
        self.command(Command::Subscribe {
            topic: topic.into(),
            handler,
        });
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) {
        self.command(Command::Unsubscribe {
            topic: topic.into(),
        });
    }

    /// Close the relay session after one last attempt to flush queued payloads. Idempotent.
    /// Payloads queued while the relay is between sessions are dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn command(&self, cmd: Command) {
        if self.is_closed() {
            return;
        }
        let _ = self.commands.send(cmd);
    }
}

/// First retry after a failed subscribe or publish; doubles up to [`RETRY_MAX`].
const RETRY_MIN: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_secs(8);

struct SignalingTask {
    local: PeerId,
    key: Option<SignalKey>,
    relay: Arc<dyn Relay>,
    /// Relay session is up. Subscribe and flush retries only run while it is.
    connected: bool,
    subscribed: bool,
    /// Every outbound payload passes through here, so delivery stays FIFO across failures.
    queue: VecDeque<(String, Bytes)>,
    retry_at: Option<Instant>,
    retry_delay: Duration,
    handlers: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

impl SignalingTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let Some(mut relay_events) = self.relay.take_events() else {
            self.emit(SignalingEvent::Error(SignalingError::Relay(RelayError::Closed)));
            self.emit(SignalingEvent::Close);
            return;
        };
        if let Err(e) = self.relay.connect().await {
            warn!("relay connect failed: {}", e);
            self.emit(SignalingEvent::Error(e.into()));
        }
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Close) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                },
                ev = relay_events.recv() => match ev {
                    Some(RelayEvent::Closed) | None => break,
                    Some(ev) => self.on_relay_event(ev).await,
                },
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.retry().await;
                }
            }
        }
        debug!("signaling for {} closed", self.local.short());
        self.emit(SignalingEvent::Close);
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { peer, envelope } => match self.encode(&envelope) {
                Ok(payload) => self.publish(peer.as_str().to_string(), payload).await,
                Err(e) => {
                    warn!("dropping envelope for {}: {}", peer.short(), e);
                    self.emit(SignalingEvent::Error(e));
                }
            },
            Command::Publish { topic, payload } => self.publish(topic, payload).await,
            Command::Subscribe { topic, handler } => {
                self.handlers.insert(topic.clone(), handler);
                if self.subscribed {
                    if let Err(e) = self.relay.subscribe(&topic).await {
                        self.emit(SignalingEvent::Error(e.into()));
                    }
                }
            }
            Command::Unsubscribe { topic } => {
                self.handlers.remove(&topic);
                if self.subscribed {
                    if let Err(e) = self.relay.unsubscribe(&topic).await {
                        debug!("unsubscribe {}: {}", topic, e);
                    }
                }
            }
            Command::Close => {}
        }
    }

    fn encode(&self, envelope: &RelayEnvelope) -> Result<Bytes, SignalingError> {
        let json = serde_json::to_vec(envelope).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        match &self.key {
            Some(key) => Ok(Bytes::from(key.seal(&json)?)),
            None => Ok(Bytes::from(json)),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<RelayEnvelope, SignalingError> {
        let plain;
        let json = match &self.key {
            Some(key) => {
                plain = key.open(payload)?;
                plain.as_slice()
            }
            None => payload,
        };
        serde_json::from_slice(json).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    async fn publish(&mut self, topic: String, payload: Bytes) {
        self.queue.push_back((topic, payload));
        if self.subscribed && self.retry_at.is_none() {
            self.flush_queue().await;
        } else {
            debug!("relay not ready, {} queued", self.queue.len());
        }
    }

    /// Publish queued payloads in order. On failure the rest stays queued, front first, and a
    /// retry is scheduled.
    async fn flush_queue(&mut self) {
        if self.queue.len() > 1 {
            debug!("flushing {} queued relay messages", self.queue.len());
        }
        while let Some((topic, payload)) = self.queue.pop_front() {
            if let Err(e) = self.relay.publish(&topic, payload.clone()).await {
                warn!("publish to {} failed: {}", topic, e);
                self.queue.push_front((topic, payload));
                self.schedule_retry();
                self.emit(SignalingEvent::Error(e.into()));
                return;
            }
        }
        self.retry_delay = RETRY_MIN;
    }

    fn schedule_retry(&mut self) {
        if self.retry_at.is_some() {
            return;
        }
        debug!("relay retry in {:?}", self.retry_delay);
        self.retry_at = Some(Instant::now() + self.retry_delay);
        self.retry_delay = (self.retry_delay * 2).min(RETRY_MAX);
    }

    async fn retry(&mut self) {
        if !self.connected {
            return;
        }
        if self.subscribed {
            self.flush_queue().await;
        } else {
            self.subscribe_local().await;
        }
    }

    /// Subscribe the own topic, flush the queue, restore topic handlers.
    async fn subscribe_local(&mut self) {
        if let Err(e) = self.relay.subscribe(self.local.as_str()).await {
            warn!("subscribe {} failed: {}", self.local.short(), e);
            self.schedule_retry();
            self.emit(SignalingEvent::Error(e.into()));
            return;
        }
        info!("subscribed to {}", self.local.short());
        self.subscribed = true;
        self.flush_queue().await;
        let topics: Vec<String> = self.handlers.keys().cloned().collect();
        for topic in topics {
            if let Err(e) = self.relay.subscribe(&topic).await {
                self.emit(SignalingEvent::Error(e.into()));
            }
        }
        self.emit(SignalingEvent::Open);
    }

    /// Last flush attempt, then close the relay. Whatever the relay refuses now is dropped.
    async fn shutdown(&mut self) {
        if self.subscribed {
            self.flush_queue().await;
        }
        if !self.queue.is_empty() {
            warn!("closing with {} undelivered relay messages", self.queue.len());
            self.queue.clear();
        }
        self.relay.close().await;
    }

    async fn on_relay_event(&mut self, ev: RelayEvent) {
        match ev {
            RelayEvent::Connected => {
                debug!("relay connected");
                self.connected = true;
                self.retry_at = None;
                self.retry_delay = RETRY_MIN;
                self.subscribe_local().await;
            }
            RelayEvent::Disconnected => {
                warn!("relay disconnected");
                self.connected = false;
                self.subscribed = false;
                self.retry_at = None;
                self.emit(SignalingEvent::Disconnected);
            }
            RelayEvent::Message { topic, payload } => {
                if topic == self.local.as_str() {
                    match self.decode(&payload) {
                        Ok(envelope) => self.emit(SignalingEvent::Message(envelope)),
                        Err(e) => {
                            warn!("dropping relay message: {}", e);
                            self.emit(SignalingEvent::Error(e));
                        }
                    }
                } else if let Some(handler) = self.handlers.get(&topic) {
                    let _ = handler.send(payload);
                }
            }
            RelayEvent::Error(e) => {
                debug!("relay error: {}", e);
                self.emit(SignalingEvent::Error(e.into()));
            }
            RelayEvent::Closed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRelay, MemoryRelayHub};
    use crate::protocol::{SignalEnvelope, SignalKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Memory relay that refuses the first few subscribes or publishes.
    struct FlakyRelay {
        inner: Arc<MemoryRelay>,
        failing_subscribes: AtomicUsize,
        failing_publishes: AtomicUsize,
        subscribe_attempts: AtomicUsize,
    }

    impl FlakyRelay {
        fn new(inner: Arc<MemoryRelay>, failing_subscribes: usize, failing_publishes: usize) -> Arc<Self> {
            Arc::new(Self {
                inner,
                failing_subscribes: AtomicUsize::new(failing_subscribes),
                failing_publishes: AtomicUsize::new(failing_publishes),
                subscribe_attempts: AtomicUsize::new(0),
            })
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl Relay for FlakyRelay {
        async fn connect(&self) -> Result<(), RelayError> {
            self.inner.connect().await
        }

        async fn subscribe(&self, topic: &str) -> Result<(), RelayError> {
            self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.failing_subscribes) {
                return Err(RelayError::Subscribe("refused".into()));
            }
            self.inner.subscribe(topic).await
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), RelayError> {
            self.inner.unsubscribe(topic).await
        }

        async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError> {
            if take_failure(&self.failing_publishes) {
                return Err(RelayError::NotConnected);
            }
            self.inner.publish(topic, payload).await
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
            self.inner.take_events()
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    async fn next_message(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> RelayEnvelope {
        loop {
            match events.recv().await {
                Some(SignalingEvent::Message(env)) => return env,
                Some(_) => continue,
                None => panic!("signaling closed"),
            }
        }
    }

    async fn wait_open(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) {
        loop {
            match events.recv().await {
                Some(SignalingEvent::Open) => return,
                Some(_) => continue,
                None => panic!("signaling closed"),
            }
        }
    }

    fn heartbeat(src: &PeerId, n: u32) -> RelayEnvelope {
        RelayEnvelope::signaling(
            src.clone(),
            vec![SignalEnvelope::new(SignalKind::Heartbeat, json!({ "n": n }))],
        )
    }

    #[tokio::test]
    async fn sealed_delivery() {
        let hub = MemoryRelayHub::new();
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let (a, mut a_events) = SignalingTransport::start(a_id.clone(), hub.client("a"), Some("pw"));
        let (_b, mut b_events) = SignalingTransport::start(b_id.clone(), hub.client("b"), Some("pw"));
        wait_open(&mut a_events).await;
        wait_open(&mut b_events).await;

        a.send(&b_id, heartbeat(&a_id, 1));
        let env = next_message(&mut b_events).await;
        assert_eq!(env.src, a_id);
        assert_eq!(env.signals()[0].payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn wrong_secret_surfaces_error() {
        let hub = MemoryRelayHub::new();
        let b_id = PeerId::from("b");
        let (a, mut a_events) = SignalingTransport::start("a".into(), hub.client("a"), Some("one"));
        let (_b, mut b_events) = SignalingTransport::start(b_id.clone(), hub.client("b"), Some("two"));
        wait_open(&mut a_events).await;
        wait_open(&mut b_events).await;
        a.send(&b_id, heartbeat(&"a".into(), 1));
        loop {
            match b_events.recv().await {
                Some(SignalingEvent::Error(SignalingError::Crypto(_))) => break,
                Some(SignalingEvent::Message(_)) => panic!("decrypted with wrong key"),
                Some(_) => continue,
                None => panic!("closed"),
            }
        }
    }

    #[tokio::test]
    async fn queued_while_disconnected_flushes_in_order_once() {
        let hub = MemoryRelayHub::new();
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let (a, mut a_events) = SignalingTransport::start(a_id.clone(), hub.client("a"), None);
        let (_b, mut b_events) = SignalingTransport::start(b_id.clone(), hub.client("b"), None);
        wait_open(&mut a_events).await;
        wait_open(&mut b_events).await;

        hub.disconnect("a");
        loop {
            if let Some(SignalingEvent::Disconnected) = a_events.recv().await {
                break;
            }
        }
        for n in 0..3 {
            a.send(&b_id, heartbeat(&a_id, n));
        }
        hub.reconnect("a");
        wait_open(&mut a_events).await;

        for n in 0..3 {
            let env = next_message(&mut b_events).await;
            assert_eq!(env.signals()[0].payload, json!({ "n": n }));
        }
        a.send(&b_id, heartbeat(&a_id, 99));
        let env = next_message(&mut b_events).await;
        assert_eq!(env.signals()[0].payload, json!({"n": 99}));
    }

    #[tokio::test]
    async fn topic_handlers_resubscribe_after_reconnect() {
        let hub = MemoryRelayHub::new();
        let (a, mut a_events) = SignalingTransport::start("a".into(), hub.client("a"), None);
        let (b, mut b_events) = SignalingTransport::start("b".into(), hub.client("b"), None);
        wait_open(&mut a_events).await;
        wait_open(&mut b_events).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.subscribe("b:notify", tx);
        while hub.subscriber_count("b:notify") == 0 {
            tokio::task::yield_now().await;
        }
        b.publish("b:notify", Bytes::from_static(b"{}"));
        assert_eq!(&rx.recv().await.unwrap()[..], b"{}");

        hub.disconnect("a");
        hub.reconnect("a");
        wait_open(&mut a_events).await;
        b.publish("b:notify", Bytes::from_static(b"again"));
        assert_eq!(&rx.recv().await.unwrap()[..], b"again");

        a.unsubscribe("b:notify");
        a.close();
        a.close();
        loop {
            match a_events.recv().await {
                Some(SignalingEvent::Close) => break,
                Some(_) => continue,
                None => panic!("no close event"),
            }
        }
        assert!(a_events.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_publish_keeps_its_place() {
        let hub = MemoryRelayHub::new();
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let flaky = FlakyRelay::new(hub.client("a"), 0, 1);
        let (a, mut a_events) = SignalingTransport::start(a_id.clone(), flaky, None);
        let (_b, mut b_events) = SignalingTransport::start(b_id.clone(), hub.client("b"), None);
        wait_open(&mut a_events).await;
        wait_open(&mut b_events).await;

        for n in 0..3 {
            a.send(&b_id, heartbeat(&a_id, n));
        }
        for n in 0..3 {
            let env = tokio::time::timeout(Duration::from_secs(5), next_message(&mut b_events))
                .await
                .expect("queued heartbeat not retried");
            assert_eq!(env.signals()[0].payload, json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn failed_subscribe_is_retried() {
        let hub = MemoryRelayHub::new();
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let flaky = FlakyRelay::new(hub.client("b"), 1, 0);
        let (_b, mut b_events) = SignalingTransport::start(b_id.clone(), flaky.clone(), None);
        let (a, mut a_events) = SignalingTransport::start(a_id.clone(), hub.client("a"), None);
        wait_open(&mut a_events).await;

        tokio::time::timeout(Duration::from_secs(5), wait_open(&mut b_events))
            .await
            .expect("subscribe not retried");
        assert_eq!(flaky.subscribe_attempts.load(Ordering::SeqCst), 2);

        a.send(&b_id, heartbeat(&a_id, 5));
        let env = next_message(&mut b_events).await;
        assert_eq!(env.signals()[0].payload, json!({"n": 5}));
    }

    #[tokio::test]
    async fn close_flushes_pending_queue() {
        let hub = MemoryRelayHub::new();
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let flaky = FlakyRelay::new(hub.client("a"), 0, 1);
        let (a, mut a_events) = SignalingTransport::start(a_id.clone(), flaky, None);
        let (_b, mut b_events) = SignalingTransport::start(b_id.clone(), hub.client("b"), None);
        wait_open(&mut a_events).await;
        wait_open(&mut b_events).await;

        a.send(&b_id, heartbeat(&a_id, 7));
        a.close();
        let env = next_message(&mut b_events).await;
        assert_eq!(env.signals()[0].payload, json!({"n": 7}));
    }
}
