//! One negotiated direct transport to a remote peer: the peer connection, its data channel, and
//! optional media tracks. Runs the negotiator against the transport in its own task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coalesce::{self, Coalescer};
use crate::identity::PeerId;
use crate::negotiator::{Action, Input, Negotiator, Role};
use crate::protocol::{
    ConnectionType, IceConfig, OfferPayload, RelayEnvelope, SignalEnvelope, SignalKind,
    DATA_CHANNEL_LABEL,
};
use crate::signaling::SignalingTransport;
use crate::transport::{
    DataChannel, IceConnectionState, MediaTrack, PeerConnection, PeerConnectionFactory, PeerEvent,
    TransportError,
};

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Negotiate a data channel only, no media.
    pub data_only: bool,
    /// Local media to attach (originator, or answerer via [`Connection::answer`]).
    pub tracks: Vec<MediaTrack>,
    pub ice: IceConfig,
    pub signal_batch_delay: Duration,
    pub signal_batch_threshold: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            data_only: false,
            tracks: Vec::new(),
            ice: IceConfig::default(),
            signal_batch_delay: Duration::from_millis(16),
            signal_batch_threshold: 10,
        }
    }
}

#[derive(Clone)]
pub enum ConnectionEvent {
    /// The multiplexed data channel. Raised as soon as it exists; it opens later.
    DataChannel(Arc<dyn DataChannel>),
    Stream(MediaTrack),
    IceStateChanged(IceConnectionState),
    /// Emitted exactly once.
    Closed,
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::Stream(t) => f.debug_tuple("Stream").field(t).finish(),
            Self::IceStateChanged(s) => f.debug_tuple("IceStateChanged").field(s).finish(),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

enum Command {
    Answer(Vec<MediaTrack>),
    Deliver(SignalEnvelope),
    Signal {
        kind: SignalKind,
        payload: Value,
        immediate: bool,
    },
    ReplaceTracks(Vec<MediaTrack>),
    Close,
}

/// Handle to a connection task. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    peer: PeerId,
    role: Role,
    connection_type: ConnectionType,
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Originate a connection to `peer`: create the transport and data channel, then offer.
    pub async fn open(
        peer: PeerId,
        signaling: SignalingTransport,
        factory: &dyn PeerConnectionFactory,
        options: ConnectionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), TransportError> {
        let (pc, pc_events) = factory.create(&options.ice).await?;
        let connection_type = if options.data_only {
            ConnectionType::Data
        } else {
            ConnectionType::Media
        };
        if !options.data_only && !options.tracks.is_empty() {
            pc.add_tracks(&options.tracks).await?;
        }
        let dc = pc.create_data_channel(DATA_CHANNEL_LABEL).await?;
        let negotiator = Negotiator::originator(peer.clone(), connection_type, options.ice.clone());

        let (handle, events, mut task) =
            Self::spawn_parts(peer, Role::Originator, connection_type, signaling, pc, negotiator, &options);
        info!("calling {} ({:?})", handle.peer.short(), connection_type);
        task.emit(ConnectionEvent::DataChannel(dc));
        task.pending.push_back(Input::Start {
            data_only: options.data_only,
        });
        tokio::spawn(task.run(pc_events));
        Ok((handle, events))
    }

    /// Answer-side connection for an inbound offer. Negotiation waits for [`Connection::answer`].
    /// The offer's ICE configuration wins over the local one.
    pub async fn incoming(
        peer: PeerId,
        offer: OfferPayload,
        signaling: SignalingTransport,
        factory: &dyn PeerConnectionFactory,
        options: ConnectionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), TransportError> {
        let ice = offer.config.clone().unwrap_or_else(|| options.ice.clone());
        let (pc, pc_events) = factory.create(&ice).await?;
        let connection_type = offer.connection_type;
        let negotiator = Negotiator::answerer(peer.clone());

        let (handle, events, mut task) =
            Self::spawn_parts(peer, Role::Answerer, connection_type, signaling, pc, negotiator, &options);
        info!("incoming {:?} call from {}", connection_type, handle.peer.short());
        task.pending.push_back(Input::OfferReceived(offer));
        tokio::spawn(task.run(pc_events));
        Ok((handle, events))
    }

    fn spawn_parts(
        peer: PeerId,
        role: Role,
        connection_type: ConnectionType,
        signaling: SignalingTransport,
        pc: Arc<dyn PeerConnection>,
        negotiator: Negotiator,
        options: &ConnectionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>, ConnectionTask) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let task = ConnectionTask {
            peer: peer.clone(),
            connection_type,
            signaling,
            pc,
            negotiator,
            signals: Coalescer::new(options.signal_batch_delay, options.signal_batch_threshold),
            seq: 0,
            pending: VecDeque::new(),
            commands: cmd_rx,
            events: ev_tx,
            closed: closed.clone(),
            finished: false,
        };
        let handle = Self {
            peer,
            role,
            connection_type,
            commands: cmd_tx,
            closed,
        };
        (handle, ev_rx, task)
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Accept the pending offer, attaching `tracks` first (ignored for data-only offers).
    pub fn answer(&self, tracks: Vec<MediaTrack>) {
        self.command(Command::Answer(tracks));
    }

    /// Hand an inbound signaling envelope from this connection's peer to the negotiator.
    pub fn deliver(&self, envelope: SignalEnvelope) {
        self.command(Command::Deliver(envelope));
    }

    /// Send a signal to the peer. Non-immediate signals are batched.
    pub fn signal(&self, kind: SignalKind, payload: Value, immediate: bool) {
        self.command(Command::Signal {
            kind,
            payload,
            immediate,
        });
    }

    pub fn replace_tracks(&self, tracks: Vec<MediaTrack>) {
        self.command(Command::ReplaceTracks(tracks));
    }

    /// Tear down the transport. Idempotent; `Closed` is emitted once.
    pub fn close(&self) {
        self.command(Command::Close);
    }

    fn command(&self, cmd: Command) {
        if self.is_closed() {
            return;
        }
        let _ = self.commands.send(cmd);
    }
}

struct ConnectionTask {
    peer: PeerId,
    connection_type: ConnectionType,
    signaling: SignalingTransport,
    pc: Arc<dyn PeerConnection>,
    negotiator: Negotiator,
    signals: Coalescer<u64, SignalEnvelope>,
    seq: u64,
    pending: VecDeque<Input>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
    finished: bool,
}

impl ConnectionTask {
    async fn run(mut self, mut pc_events: mpsc::UnboundedReceiver<PeerEvent>) {
        self.drive().await;
        while !self.finished {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => self.shutdown("handle dropped").await,
                },
                ev = pc_events.recv() => match ev {
                    Some(ev) => self.on_peer_event(ev),
                    None => self.shutdown("transport gone").await,
                },
                _ = coalesce::sleep_until(self.signals.deadline()) => {
                    if let Some(batch) = self.signals.poll_expired(Instant::now()) {
                        self.flush_signals(batch);
                    }
                }
            }
            self.drive().await;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Answer(tracks) => {
                if self.connection_type == ConnectionType::Media && !tracks.is_empty() {
                    if let Err(e) = self.pc.add_tracks(&tracks).await {
                        self.pending.push_back(Input::StepFailed(e.to_string()));
                        return;
                    }
                }
                self.pending.push_back(Input::Accept);
            }
            Command::Deliver(env) => self.pending.push_back(Input::Signal(env)),
            Command::Signal {
                kind,
                payload,
                immediate,
            } => self.signal(SignalEnvelope::new(kind, payload), immediate),
            Command::ReplaceTracks(tracks) => {
                if let Err(e) = self.pc.replace_tracks(&tracks).await {
                    warn!("replace tracks for {}: {}", self.peer.short(), e);
                }
            }
            Command::Close => self.shutdown("closed locally").await,
        }
    }

    fn on_peer_event(&mut self, ev: PeerEvent) {
        match ev {
            PeerEvent::IceCandidate(c) => self.pending.push_back(Input::LocalCandidate(c)),
            PeerEvent::IceStateChanged(s) => self.pending.push_back(Input::IceState(s)),
            PeerEvent::DataChannel(dc) => {
                let label = dc.label();
                if label == DATA_CHANNEL_LABEL {
                    debug!("data channel from {}", self.peer.short());
                    self.emit(ConnectionEvent::DataChannel(dc));
                } else {
                    debug!("ignoring data channel {:?} from {}", label, self.peer.short());
                }
            }
            PeerEvent::Track(t) => {
                debug!("remote {:?} track from {}", t.kind, self.peer.short());
                self.emit(ConnectionEvent::Stream(t));
            }
        }
    }

    /// Feed queued inputs to the negotiator and execute its actions until quiescent.
    async fn drive(&mut self) {
        while let Some(input) = self.pending.pop_front() {
            if self.finished {
                self.pending.clear();
                return;
            }
            for action in self.negotiator.handle(input) {
                self.execute(action).await;
            }
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::CreateOffer { receive_media } => {
                let next = match self.pc.create_offer(receive_media).await {
                    Ok(desc) => Input::LocalDescription(desc),
                    Err(e) => Input::StepFailed(format!("create offer: {}", e)),
                };
                self.pending.push_back(next);
            }
            Action::CreateAnswer => {
                let next = match self.pc.create_answer().await {
                    Ok(desc) => Input::LocalDescription(desc),
                    Err(e) => Input::StepFailed(format!("create answer: {}", e)),
                };
                self.pending.push_back(next);
            }
            Action::ApplyRemoteDescription(desc) => {
                let next = match self.pc.set_remote_description(desc).await {
                    Ok(()) => Input::RemoteDescriptionApplied,
                    Err(e) => Input::StepFailed(format!("set remote description: {}", e)),
                };
                self.pending.push_back(next);
            }
            Action::AddCandidate(c) => {
                if let Err(e) = self.pc.add_ice_candidate(c).await {
                    warn!("candidate from {} rejected: {}", self.peer.short(), e);
                }
            }
            Action::Signal {
                kind,
                payload,
                immediate,
            } => self.signal(SignalEnvelope::new(kind, payload), immediate),
            Action::IceStateChanged(s) => self.emit(ConnectionEvent::IceStateChanged(s)),
            Action::Connected => info!("connected to {}", self.peer.short()),
            Action::Close { reason } => self.shutdown(&reason).await,
        }
    }

    fn signal(&mut self, env: SignalEnvelope, immediate: bool) {
        if self.finished {
            return;
        }
        self.seq += 1;
        if immediate {
            let batch = self.signals.push_immediate(self.seq, env);
            self.flush_signals(batch);
        } else if let Some(batch) = self.signals.push(self.seq, env, Instant::now()) {
            self.flush_signals(batch);
        }
    }

    fn flush_signals(&self, batch: Vec<(u64, SignalEnvelope)>) {
        if batch.is_empty() {
            return;
        }
        let envelopes = batch.into_iter().map(|(_, env)| env).collect();
        let relay_env = RelayEnvelope::signaling(self.signaling.local_id().clone(), envelopes);
        self.signaling.send(&self.peer, relay_env);
    }

    async fn shutdown(&mut self, reason: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.closed.store(true, Ordering::SeqCst);
        self.negotiator.close();
        self.signals.take();
        debug!("closing connection to {}: {}", self.peer.short(), reason);
        if !self.pc.is_closed() {
            self.pc.close().await;
        }
        self.emit(ConnectionEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemoryRelayHub};
    use crate::signaling::SignalingEvent;
    use crate::transport::{ChannelEvent, TrackKind};

    struct Side {
        signaling: SignalingTransport,
        events: mpsc::UnboundedReceiver<SignalingEvent>,
    }

    async fn side(hub: &MemoryRelayHub, id: &str) -> Side {
        let (signaling, mut events) = SignalingTransport::start(id.into(), hub.client(id), None);
        loop {
            if let Some(SignalingEvent::Open) = events.recv().await {
                break;
            }
        }
        Side { signaling, events }
    }

    async fn next_relay(side: &mut Side) -> RelayEnvelope {
        loop {
            if let Some(SignalingEvent::Message(env)) = side.events.recv().await {
                return env;
            }
        }
    }

    /// Route relay envelopes between two connections until the relay goes quiet.
    async fn pump(a: &mut Side, a_conn: &Connection, b: &mut Side, b_conn: &Connection, rounds: usize) {
        for _ in 0..rounds {
            tokio::select! {
                Some(SignalingEvent::Message(env)) = a.events.recv() => {
                    for s in env.signals() { a_conn.deliver(s); }
                }
                Some(SignalingEvent::Message(env)) = b.events.recv() => {
                    for s in env.signals() { b_conn.deliver(s); }
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => break,
            }
        }
    }

    async fn wait_channel(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Arc<dyn DataChannel> {
        loop {
            match events.recv().await {
                Some(ConnectionEvent::DataChannel(dc)) => return dc,
                Some(_) => continue,
                None => panic!("connection events ended"),
            }
        }
    }

    #[tokio::test]
    async fn data_only_call_negotiates() {
        let hub = MemoryRelayHub::new();
        let net = MemoryNetwork::new();
        let mut a = side(&hub, "a").await;
        let mut b = side(&hub, "b").await;

        let opts = ConnectionOptions {
            data_only: true,
            ..ConnectionOptions::default()
        };
        let (a_conn, mut a_events) =
            Connection::open("b".into(), a.signaling.clone(), &net, opts.clone()).await.unwrap();
        let dc_a = wait_channel(&mut a_events).await;

        let offer_env = next_relay(&mut b).await;
        assert_eq!(offer_env.src, PeerId::from("a"));
        let offer = offer_env.signals().remove(0);
        assert_eq!(offer.kind, SignalKind::Offer);
        let payload: OfferPayload = serde_json::from_value(offer.payload).unwrap();
        assert_eq!(payload.connection_type, ConnectionType::Data);

        let (b_conn, mut b_events) =
            Connection::incoming("a".into(), payload, b.signaling.clone(), &net, opts).await.unwrap();
        b_conn.answer(Vec::new());

        pump(&mut a, &a_conn, &mut b, &b_conn, 8).await;

        let dc_b = wait_channel(&mut b_events).await;
        assert_eq!(dc_b.label(), DATA_CHANNEL_LABEL);
        let mut a_ch = dc_a.take_events().unwrap();
        assert!(matches!(a_ch.recv().await, Some(ChannelEvent::Open)));

        a_conn.close();
        a_conn.close();
        let mut closed = 0;
        while let Some(ev) = a_events.recv().await {
            if let ConnectionEvent::Closed = ev {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert!(a_conn.is_closed());

        loop {
            match b_events.recv().await {
                Some(ConnectionEvent::Closed) => break,
                Some(_) => continue,
                None => panic!("answerer never closed"),
            }
        }
    }

    #[tokio::test]
    async fn media_call_delivers_remote_track() {
        let hub = MemoryRelayHub::new();
        let net = MemoryNetwork::new();
        let mut a = side(&hub, "a").await;
        let mut b = side(&hub, "b").await;
        let cam = MediaTrack {
            id: "cam".into(),
            stream_id: "s1".into(),
            kind: TrackKind::Video,
        };
        let opts = ConnectionOptions {
            tracks: vec![cam.clone()],
            ..ConnectionOptions::default()
        };
        let (a_conn, _a_events) =
            Connection::open("b".into(), a.signaling.clone(), &net, opts).await.unwrap();
        let offer = next_relay(&mut b).await.signals().remove(0);
        let payload: OfferPayload = serde_json::from_value(offer.payload).unwrap();
        assert_eq!(payload.connection_type, ConnectionType::Media);
        let (b_conn, mut b_events) = Connection::incoming(
            "a".into(),
            payload,
            b.signaling.clone(),
            &net,
            ConnectionOptions::default(),
        )
        .await
        .unwrap();
        b_conn.answer(Vec::new());
        pump(&mut a, &a_conn, &mut b, &b_conn, 8).await;

        loop {
            match b_events.recv().await {
                Some(ConnectionEvent::Stream(t)) => {
                    assert_eq!(t, cam);
                    break;
                }
                Some(_) => continue,
                None => panic!("no stream"),
            }
        }
    }

    #[tokio::test]
    async fn failed_negotiation_closes() {
        let hub = MemoryRelayHub::new();
        let net = MemoryNetwork::new();
        let b = side(&hub, "b").await;
        let bogus = OfferPayload {
            sdp: crate::protocol::SessionDescription::offer("not-a-memory-offer"),
            connection_type: ConnectionType::Data,
            config: None,
        };
        let (conn, mut events) = Connection::incoming(
            "a".into(),
            bogus,
            b.signaling.clone(),
            &net,
            ConnectionOptions::default(),
        )
        .await
        .unwrap();
        conn.answer(Vec::new());
        loop {
            match events.recv().await {
                Some(ConnectionEvent::Closed) => break,
                Some(_) => continue,
                None => panic!("no close"),
            }
        }
        assert!(conn.is_closed());
    }
}
