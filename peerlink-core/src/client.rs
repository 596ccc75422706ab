//! Peer client: per-process registry of connections and framing transports, keyed by remote peer.
//!
//! Owns the signaling transport. Inbound offers are auto-answered with the local media. One data
//! channel per peer pair carries all application data. A new connection to a peer that already
//! has one replaces it; events from a replaced connection are recognized by generation and dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent, ConnectionOptions};
use crate::framing::{StreamEvent, StreamTransport};
use crate::identity::PeerId;
use crate::lock;
use crate::negotiator::Role;
use crate::protocol::{ConnectionType, NotifyMessage, OfferPayload, RelayEnvelope, SignalKind};
use crate::relay::Relay;
use crate::signaling::{SignalingEvent, SignalingTransport};
use crate::transport::{IceConnectionState, MediaTrack, PeerConnectionFactory};

/// Local misuse of the client. Transport failures are reported as [`PeerClientEvent::Error`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("peer client stopped")]
    Stopped,
    #[error("cannot call own identity")]
    SelfCall,
}

#[derive(Debug, Clone)]
pub enum PeerClientEvent {
    /// Relay ready under this identity.
    Open(PeerId),
    Close,
    Error(String),
    Call { peer: PeerId, role: Role },
    Stream { peer: PeerId, track: MediaTrack },
    Hangup(PeerId),
    /// The peer's data channel opened; `send` to it now delivers.
    DataConnection(PeerId),
    Data { peer: PeerId, data: Value },
    DataDisconnect(PeerId),
    IceStateChanged { peer: PeerId, state: IceConnectionState },
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub data_only: bool,
    /// Media for this call instead of the client's local media.
    pub tracks: Option<Vec<MediaTrack>>,
}

impl CallOptions {
    pub fn data_only() -> Self {
        Self {
            data_only: true,
            tracks: None,
        }
    }
}

enum Command {
    Call { peer: PeerId, options: CallOptions },
    Hangup(PeerId),
    DataDisconnect(PeerId),
    Send { peer: PeerId, data: Value },
    Broadcast { data: Value, exclude: Vec<PeerId> },
    SetLocalMedia(Vec<MediaTrack>),
    Stop,
}

enum Internal {
    Connection { peer: PeerId, generation: u64, event: ConnectionEvent },
    Stream { peer: PeerId, generation: u64, event: StreamEvent },
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<PeerClientEvent>>>>;

/// Handle to the client task. Cheap to clone.
#[derive(Clone)]
pub struct PeerClient {
    local: PeerId,
    signaling: SignalingTransport,
    commands: mpsc::UnboundedSender<Command>,
    subscribers: Subscribers,
    connected: Arc<Mutex<HashSet<PeerId>>>,
    stopped: Arc<AtomicBool>,
}

impl PeerClient {
    /// Bring up signaling under `identity` (random if `None`) and start serving calls.
    pub fn start(
        config: Config,
        identity: Option<PeerId>,
        relay: Arc<dyn Relay>,
        factory: Arc<dyn PeerConnectionFactory>,
        secret: Option<&str>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerClientEvent>) {
        let local = identity.unwrap_or_else(PeerId::random);
        info!("starting peer {}", local);
        let (signaling, signaling_events) = SignalingTransport::start(local.clone(), relay, secret);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::new(Mutex::new(vec![first_tx]));
        let connected = Arc::new(Mutex::new(HashSet::new()));

        let task = ClientTask {
            local: local.clone(),
            config,
            factory,
            signaling: signaling.clone(),
            slots: HashMap::new(),
            next_generation: 0,
            local_tracks: Vec::new(),
            internal: internal_tx,
            subscribers: subscribers.clone(),
            connected: connected.clone(),
            stopping: false,
        };
        tokio::spawn(task.run(cmd_rx, signaling_events, internal_rx));

        let client = Self {
            local,
            signaling,
            commands: cmd_tx,
            subscribers,
            connected,
            stopped: Arc::new(AtomicBool::new(false)),
        };
        (client, first_rx)
    }

    pub fn id(&self) -> &PeerId {
        &self.local
    }

    /// Additional event receiver. Sees events from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Peers whose data channel is open.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.connected).iter().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        lock(&self.connected).contains(peer)
    }

    /// Originate a connection to `peer`, replacing any existing one.
    pub fn call(&self, peer: &PeerId, options: CallOptions) -> Result<(), ClientError> {
        if peer == &self.local {
            return Err(ClientError::SelfCall);
        }
        self.command(Command::Call {
            peer: peer.clone(),
            options,
        })
    }

    /// Close the peer's connection and emit `Hangup`.
    pub fn hangup(&self, peer: &PeerId) {
        let _ = self.command(Command::Hangup(peer.clone()));
    }

    /// Close the peer's connection and transport without a `Hangup`.
    pub fn data_disconnect(&self, peer: &PeerId) {
        let _ = self.command(Command::DataDisconnect(peer.clone()));
    }

    /// Send to one peer. A peer without an open transport is skipped silently.
    pub fn send(&self, peer: &PeerId, data: Value) {
        let _ = self.command(Command::Send {
            peer: peer.clone(),
            data,
        });
    }

    /// Send to every peer with an open transport, except `exclude`.
    pub fn broadcast(&self, data: Value, exclude: &[PeerId]) {
        let _ = self.command(Command::Broadcast {
            data,
            exclude: exclude.to_vec(),
        });
    }

    /// Media attached to later answers; also swapped into existing media connections.
    pub fn set_local_media(&self, tracks: Vec<MediaTrack>) {
        let _ = self.command(Command::SetLocalMedia(tracks));
    }

    /// Publish a presence notification on this peer's notify topic.
    pub fn notify(&self, kind: &str, message: Value) {
        publish_notify(&self.signaling, &self.local, NotifyMessage::new(kind, message));
    }

    /// Presence notifications published by `peer`, delivered over the relay.
    pub fn watch(&self, peer: &PeerId) -> mpsc::UnboundedReceiver<NotifyMessage> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Bytes>();
        let (tx, rx) = mpsc::unbounded_channel();
        self.signaling.subscribe(peer.notify_topic(), raw_tx);
        let topic = peer.notify_topic();
        tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                match serde_json::from_slice::<NotifyMessage>(&raw) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("bad notify message on {}: {}", topic, e),
                }
            }
        });
        rx
    }

    pub fn unwatch(&self, peer: &PeerId) {
        self.signaling.unsubscribe(peer.notify_topic());
    }

    /// Close every connection, announce `disconnected`, and close signaling. Idempotent.
    ///
    /// The `disconnected` notice is best-effort: signaling makes one last flush attempt before it
    /// closes, and a notice still queued while the relay is between sessions is dropped.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Stop);
    }

    fn command(&self, cmd: Command) -> Result<(), ClientError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        self.commands.send(cmd).map_err(|_| ClientError::Stopped)
    }
}

fn publish_notify(signaling: &SignalingTransport, local: &PeerId, msg: NotifyMessage) {
    match serde_json::to_vec(&msg) {
        Ok(json) => signaling.publish(local.notify_topic(), Bytes::from(json)),
        Err(e) => warn!("notify encode: {}", e),
    }
}

struct PeerSlot {
    generation: u64,
    connection: Connection,
    transport: Option<StreamTransport>,
    open: bool,
}

impl PeerSlot {
    fn is_media(&self) -> bool {
        self.connection.connection_type() == ConnectionType::Media
    }
}

struct ClientTask {
    local: PeerId,
    config: Config,
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: SignalingTransport,
    slots: HashMap<PeerId, PeerSlot>,
    next_generation: u64,
    local_tracks: Vec<MediaTrack>,
    internal: mpsc::UnboundedSender<Internal>,
    subscribers: Subscribers,
    connected: Arc<Mutex<HashSet<PeerId>>>,
    stopping: bool,
}

impl ClientTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv(), if !self.stopping => {
                    self.on_command(cmd.unwrap_or(Command::Stop)).await
                }
                ev = signaling_events.recv() => match ev {
                    Some(SignalingEvent::Close) | None => break,
                    Some(ev) => self.on_signaling(ev).await,
                },
                Some(msg) = internal.recv() => self.on_internal(msg),
            }
        }
        for peer in self.slots.keys().cloned().collect::<Vec<_>>() {
            self.remove_slot(&peer);
        }
        info!("peer {} closed", self.local.short());
        self.emit(PeerClientEvent::Close);
    }

    fn emit(&self, event: PeerClientEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn connection_options(&self, data_only: bool, tracks: Vec<MediaTrack>) -> ConnectionOptions {
        ConnectionOptions {
            data_only,
            tracks,
            ice: self.config.ice_config(),
            signal_batch_delay: self.config.signal_batch_delay(),
            signal_batch_threshold: self.config.signal_batch_threshold,
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { peer, options } => self.call(peer, options).await,
            Command::Hangup(peer) => {
                if let Some(slot) = self.remove_slot(&peer) {
                    info!("hangup {}", peer.short());
                    if slot.open {
                        self.emit(PeerClientEvent::DataDisconnect(peer.clone()));
                    }
                    self.emit(PeerClientEvent::Hangup(peer));
                }
            }
            Command::DataDisconnect(peer) => {
                if let Some(slot) = self.remove_slot(&peer) {
                    info!("data disconnect {}", peer.short());
                    if slot.open {
                        self.emit(PeerClientEvent::DataDisconnect(peer));
                    }
                }
            }
            Command::Send { peer, data } => match self.slots.get(&peer) {
                Some(PeerSlot {
                    transport: Some(t),
                    open: true,
                    ..
                }) => {
                    if let Err(e) = t.send(&data) {
                        debug!("send to {} dropped: {}", peer.short(), e);
                    }
                }
                _ => debug!("no open transport to {}, dropping", peer.short()),
            },
            Command::Broadcast { data, exclude } => {
                for (peer, slot) in &self.slots {
                    if !slot.open || exclude.contains(peer) {
                        continue;
                    }
                    if let Some(t) = &slot.transport {
                        if let Err(e) = t.send(&data) {
                            debug!("broadcast to {} dropped: {}", peer.short(), e);
                        }
                    }
                }
            }
            Command::SetLocalMedia(tracks) => {
                debug!("local media set ({} tracks)", tracks.len());
                for slot in self.slots.values().filter(|s| s.is_media()) {
                    slot.connection.replace_tracks(tracks.clone());
                }
                self.local_tracks = tracks;
            }
            Command::Stop => {
                info!("stopping peer {}", self.local.short());
                self.stopping = true;
                for peer in self.slots.keys().cloned().collect::<Vec<_>>() {
                    self.remove_slot(&peer);
                }
                publish_notify(
                    &self.signaling,
                    &self.local,
                    NotifyMessage::new(NotifyMessage::DISCONNECTED, Value::Null),
                );
                self.signaling.close();
            }
        }
    }

    async fn call(&mut self, peer: PeerId, options: CallOptions) {
        self.replace(&peer);
        let tracks = options.tracks.unwrap_or_else(|| self.local_tracks.clone());
        let opts = self.connection_options(options.data_only, tracks);
        match Connection::open(peer.clone(), self.signaling.clone(), self.factory.as_ref(), opts).await {
            Ok((connection, events)) => {
                self.insert_slot(peer.clone(), connection, events);
                self.emit(PeerClientEvent::Call {
                    peer,
                    role: Role::Originator,
                });
            }
            Err(e) => {
                error!("call to {} failed: {}", peer.short(), e);
                self.emit(PeerClientEvent::Error(format!("call {}: {}", peer, e)));
            }
        }
    }

    async fn on_offer(&mut self, peer: PeerId, payload: Value) {
        let offer: OfferPayload = match serde_json::from_value(payload) {
            Ok(o) => o,
            Err(e) => {
                warn!("malformed offer from {}: {}", peer.short(), e);
                self.emit(PeerClientEvent::Error(format!("offer from {}: {}", peer, e)));
                return;
            }
        };
        self.replace(&peer);
        let opts = self.connection_options(false, Vec::new());
        match Connection::incoming(peer.clone(), offer, self.signaling.clone(), self.factory.as_ref(), opts).await {
            Ok((connection, events)) => {
                connection.answer(self.local_tracks.clone());
                self.insert_slot(peer.clone(), connection, events);
                self.emit(PeerClientEvent::Call {
                    peer,
                    role: Role::Answerer,
                });
            }
            Err(e) => {
                error!("answering {} failed: {}", peer.short(), e);
                self.emit(PeerClientEvent::Error(format!("answer {}: {}", peer, e)));
            }
        }
    }

    /// Close any existing entry for `peer` ahead of a new connection.
    fn replace(&mut self, peer: &PeerId) {
        if let Some(slot) = self.remove_slot(peer) {
            warn!("replacing existing connection to {}", peer.short());
            if slot.open {
                self.emit(PeerClientEvent::DataDisconnect(peer.clone()));
            }
        }
    }

    fn insert_slot(
        &mut self,
        peer: PeerId,
        connection: Connection,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let internal = self.internal.clone();
        let fwd_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let msg = Internal::Connection {
                    peer: fwd_peer.clone(),
                    generation,
                    event,
                };
                if internal.send(msg).is_err() {
                    break;
                }
            }
        });
        self.slots.insert(
            peer,
            PeerSlot {
                generation,
                connection,
                transport: None,
                open: false,
            },
        );
    }

    fn remove_slot(&mut self, peer: &PeerId) -> Option<PeerSlot> {
        let slot = self.slots.remove(peer)?;
        if let Some(t) = &slot.transport {
            t.close();
        }
        slot.connection.close();
        lock(&self.connected).remove(peer);
        Some(slot)
    }

    async fn on_signaling(&mut self, ev: SignalingEvent) {
        match ev {
            SignalingEvent::Open => {
                info!("peer {} online", self.local);
                self.emit(PeerClientEvent::Open(self.local.clone()));
                publish_notify(
                    &self.signaling,
                    &self.local,
                    NotifyMessage::new(NotifyMessage::CONNECTED, Value::Null),
                );
            }
            SignalingEvent::Message(env) => self.on_relay_envelope(env).await,
            SignalingEvent::Disconnected => warn!("relay lost, sends will queue"),
            SignalingEvent::Error(e) => {
                error!("signaling error: {}", e);
                self.emit(PeerClientEvent::Error(e.to_string()));
            }
            SignalingEvent::Close => {}
        }
    }

    async fn on_relay_envelope(&mut self, env: RelayEnvelope) {
        if !env.is_signaling() {
            debug!("ignoring relay envelope of type {}", env.kind);
            return;
        }
        let src = env.src.clone();
        for signal in env.signals() {
            if signal.kind == SignalKind::Offer {
                if self.stopping {
                    continue;
                }
                self.on_offer(src.clone(), signal.payload).await;
                continue;
            }
            match self.slots.get(&src) {
                Some(slot) => slot.connection.deliver(signal),
                None => debug!("{:?} from {} without a connection", signal.kind, src.short()),
            }
        }
    }

    fn is_current(&self, peer: &PeerId, generation: u64) -> bool {
        self.slots.get(peer).is_some_and(|s| s.generation == generation)
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connection {
                peer,
                generation,
                event,
            } => {
                if self.is_current(&peer, generation) {
                    self.on_connection_event(peer, generation, event);
                }
            }
            Internal::Stream {
                peer,
                generation,
                event,
            } => {
                if self.is_current(&peer, generation) {
                    self.on_stream_event(peer, event);
                }
            }
        }
    }

    fn on_connection_event(&mut self, peer: PeerId, generation: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::DataChannel(dc) => {
                let (transport, mut events) = StreamTransport::new(
                    dc,
                    self.config.chunk_size,
                    self.config.watermarks(),
                );
                let internal = self.internal.clone();
                let fwd_peer = peer.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let msg = Internal::Stream {
                            peer: fwd_peer.clone(),
                            generation,
                            event,
                        };
                        if internal.send(msg).is_err() {
                            break;
                        }
                    }
                });
                if let Some(slot) = self.slots.get_mut(&peer) {
                    if let Some(old) = slot.transport.replace(transport) {
                        old.close();
                    }
                }
            }
            ConnectionEvent::Stream(track) => {
                info!("stream from {}", peer.short());
                self.emit(PeerClientEvent::Stream { peer, track });
            }
            ConnectionEvent::IceStateChanged(state) => {
                debug!("ice {} with {}", state.as_str(), peer.short());
                self.emit(PeerClientEvent::IceStateChanged { peer, state });
            }
            ConnectionEvent::Closed => {
                if let Some(slot) = self.remove_slot(&peer) {
                    info!("connection to {} closed", peer.short());
                    if slot.open {
                        self.emit(PeerClientEvent::DataDisconnect(peer.clone()));
                    }
                    if slot.is_media() {
                        self.emit(PeerClientEvent::Hangup(peer));
                    }
                }
            }
        }
    }

    fn on_stream_event(&mut self, peer: PeerId, event: StreamEvent) {
        match event {
            StreamEvent::Open => {
                if let Some(slot) = self.slots.get_mut(&peer) {
                    slot.open = true;
                }
                lock(&self.connected).insert(peer.clone());
                info!("data channel to {} open", peer.short());
                self.emit(PeerClientEvent::DataConnection(peer));
            }
            StreamEvent::Data(data) => self.emit(PeerClientEvent::Data { peer, data }),
            StreamEvent::Error(e) => {
                warn!("data channel to {}: {}", peer.short(), e);
                self.emit(PeerClientEvent::Error(format!("{}: {}", peer, e)));
            }
            StreamEvent::Close => {
                let Some(slot) = self.slots.get_mut(&peer) else { return };
                let was_open = std::mem::replace(&mut slot.open, false);
                slot.transport = None;
                let data_only = !slot.is_media();
                lock(&self.connected).remove(&peer);
                info!("data channel to {} closed", peer.short());
                if was_open {
                    self.emit(PeerClientEvent::DataDisconnect(peer.clone()));
                }
                if data_only {
                    self.remove_slot(&peer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemoryRelayHub};
    use crate::transport::TrackKind;
    use serde_json::json;
    use std::time::Duration;

    struct Net {
        hub: MemoryRelayHub,
        net: MemoryNetwork,
    }

    impl Net {
        pub fn new() -> Self {
            Self {
                hub: MemoryRelayHub::new(),
                net: MemoryNetwork::new(),
            }
        }

        pub fn peer(&self, id: &str) -> (PeerClient, mpsc::UnboundedReceiver<PeerClientEvent>) {
            PeerClient::start(
                Config::default(),
                Some(id.into()),
                self.hub.client(id),
                Arc::new(self.net.clone()),
                None,
            )
        }
    }

    async fn until<T>(
        events: &mut mpsc::UnboundedReceiver<PeerClientEvent>,
        mut f: impl FnMut(PeerClientEvent) -> Option<T>,
    ) -> T {
        let fut = async {
            loop {
                match events.recv().await {
                    Some(ev) => {
                        if let Some(v) = f(ev) {
                            return v;
                        }
                    }
                    None => panic!("client events ended"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out waiting for event")
    }

    async fn online(events: &mut mpsc::UnboundedReceiver<PeerClientEvent>) {
        until(events, |ev| matches!(ev, PeerClientEvent::Open(_)).then_some(())).await;
    }

    #[tokio::test]
    async fn data_only_call_opens_before_data() {
        let net = Net::new();
        let (a, mut a_events) = net.peer("a");
        let (_b, mut b_events) = net.peer("b");
        online(&mut a_events).await;
        online(&mut b_events).await;

        a.call(&"b".into(), CallOptions::data_only()).unwrap();
        until(&mut a_events, |ev| match ev {
            PeerClientEvent::DataConnection(p) => Some(p),
            PeerClientEvent::Data { .. } => panic!("data before open"),
            _ => None,
        })
        .await;
        a.send(&"b".into(), json!({"hello": 1}));

        let mut opened = false;
        let data = until(&mut b_events, |ev| match ev {
            PeerClientEvent::Call { role, .. } => {
                assert_eq!(role, Role::Answerer);
                None
            }
            PeerClientEvent::DataConnection(p) => {
                assert_eq!(p, PeerId::from("a"));
                opened = true;
                None
            }
            PeerClientEvent::Data { peer, data } => {
                assert!(opened, "data before open");
                assert_eq!(peer, PeerId::from("a"));
                Some(data)
            }
            _ => None,
        })
        .await;
        assert_eq!(data, json!({"hello": 1}));
        assert!(a.is_connected(&"b".into()));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_silent() {
        let net = Net::new();
        let (a, mut a_events) = net.peer("a");
        online(&mut a_events).await;
        a.send(&"ghost".into(), json!(1));
        a.broadcast(json!(2), &[]);
        assert_eq!(a.call(&"a".into(), CallOptions::default()), Err(ClientError::SelfCall));
    }

    #[tokio::test]
    async fn new_call_replaces_existing() {
        let net = Net::new();
        let (a, mut a_events) = net.peer("a");
        let (_b, mut b_events) = net.peer("b");
        online(&mut a_events).await;
        online(&mut b_events).await;

        a.call(&"b".into(), CallOptions::data_only()).unwrap();
        until(&mut b_events, |ev| matches!(ev, PeerClientEvent::DataConnection(_)).then_some(())).await;

        a.call(&"b".into(), CallOptions::data_only()).unwrap();
        until(&mut b_events, |ev| matches!(ev, PeerClientEvent::DataDisconnect(_)).then_some(())).await;
        until(&mut b_events, |ev| matches!(ev, PeerClientEvent::DataConnection(_)).then_some(())).await;
        until(&mut a_events, |ev| matches!(ev, PeerClientEvent::DataConnection(_)).then_some(())).await;

        a.send(&"b".into(), json!("after"));
        let data = until(&mut b_events, |ev| match ev {
            PeerClientEvent::Data { data, .. } => Some(data),
            _ => None,
        })
        .await;
        assert_eq!(data, json!("after"));
        while net.net.live_connections() != 2 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn broadcast_honours_exclusion() {
        let net = Net::new();
        let (hub, mut hub_events) = net.peer("hub");
        let (_x, mut x_events) = net.peer("x");
        let (_y, mut y_events) = net.peer("y");
        online(&mut hub_events).await;
        online(&mut x_events).await;
        online(&mut y_events).await;

        hub.call(&"x".into(), CallOptions::data_only()).unwrap();
        hub.call(&"y".into(), CallOptions::data_only()).unwrap();
        for _ in 0..2 {
            until(&mut hub_events, |ev| matches!(ev, PeerClientEvent::DataConnection(_)).then_some(())).await;
        }
        assert_eq!(hub.connected_peers(), vec![PeerId::from("x"), PeerId::from("y")]);

        hub.broadcast(json!("first"), &["x".into()]);
        hub.broadcast(json!("second"), &[]);
        let first_y = until(&mut y_events, |ev| match ev {
            PeerClientEvent::Data { data, .. } => Some(data),
            _ => None,
        })
        .await;
        assert_eq!(first_y, json!("first"));
        let first_x = until(&mut x_events, |ev| match ev {
            PeerClientEvent::Data { data, .. } => Some(data),
            _ => None,
        })
        .await;
        assert_eq!(first_x, json!("second"));
    }

    #[tokio::test]
    async fn hangup_emits_events_on_both_sides() {
        let net = Net::new();
        let (a, mut a_events) = net.peer("a");
        let (_b, mut b_events) = net.peer("b");
        online(&mut a_events).await;
        online(&mut b_events).await;
        let mic = MediaTrack {
            id: "mic".into(),
            stream_id: "s".into(),
            kind: TrackKind::Audio,
        };
        a.call(
            &"b".into(),
            CallOptions {
                data_only: false,
                tracks: Some(vec![mic.clone()]),
            },
        )
        .unwrap();
        let track = until(&mut b_events, |ev| match ev {
            PeerClientEvent::Stream { track, .. } => Some(track),
            _ => None,
        })
        .await;
        assert_eq!(track, mic);
        until(&mut a_events, |ev| matches!(ev, PeerClientEvent::DataConnection(_)).then_some(())).await;

        a.hangup(&"b".into());
        until(&mut a_events, |ev| matches!(ev, PeerClientEvent::Hangup(_)).then_some(())).await;
        until(&mut b_events, |ev| matches!(ev, PeerClientEvent::Hangup(_)).then_some(())).await;
        assert!(!a.is_connected(&"b".into()));
    }

    #[tokio::test]
    async fn presence_notifications() {
        let net = Net::new();
        let (a, mut a_events) = net.peer("a");
        let (b, mut b_events) = net.peer("b");
        online(&mut a_events).await;
        online(&mut b_events).await;

        let mut presence = a.watch(&"b".into());
        while net.hub.subscriber_count("b:notify") == 0 {
            tokio::task::yield_now().await;
        }
        b.notify("status", json!({"busy": false}));
        let msg = presence.recv().await.unwrap();
        assert_eq!(msg.kind, "status");
        assert_eq!(msg.message, json!({"busy": false}));

        b.stop();
        b.stop();
        let msg = presence.recv().await.unwrap();
        assert_eq!(msg.kind, NotifyMessage::DISCONNECTED);
        until(&mut b_events, |ev| matches!(ev, PeerClientEvent::Close).then_some(())).await;
        assert_eq!(b.call(&"a".into(), CallOptions::default()), Err(ClientError::Stopped));
    }
}
