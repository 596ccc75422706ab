//! In-memory relay and peer network
//!
//! Implements [`Relay`] and [`PeerConnectionFactory`] with process-local channels so the whole
//! stack runs in one process. Negotiation is simulated: descriptions carry the connection's
//! registry id, and the link is made when the originator applies the answer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::lock;
use crate::protocol::{IceCandidate, IceConfig, SdpType, SessionDescription};
use crate::relay::{Relay, RelayError, RelayEvent};
use crate::transport::{
    ChannelEvent, ChannelState, DataChannel, IceConnectionState, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerEvent, TransportError,
};

// ============================================================================
// Relay
// ============================================================================

struct ClientSlot {
    connected: bool,
    topics: HashSet<String>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

/// Shared broker. Clients created from the same hub see each other's publishes.
#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    clients: Arc<Mutex<HashMap<String, ClientSlot>>>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. It stays offline until [`Relay::connect`].
    pub fn client(&self, client_id: &str) -> Arc<MemoryRelay> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.clients).insert(
            client_id.to_string(),
            ClientSlot {
                connected: false,
                topics: HashSet::new(),
                events: tx,
            },
        );
        Arc::new(MemoryRelay {
            client_id: client_id.to_string(),
            hub: self.clone(),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Drop a client's session. Its subscriptions are forgotten, like a broker without persistent sessions.
    pub fn disconnect(&self, client_id: &str) {
        if let Some(slot) = lock(&self.clients).get_mut(client_id) {
            if slot.connected {
                slot.connected = false;
                slot.topics.clear();
                let _ = slot.events.send(RelayEvent::Disconnected);
            }
        }
    }

    /// Re-establish a dropped session.
    pub fn reconnect(&self, client_id: &str) {
        if let Some(slot) = lock(&self.clients).get_mut(client_id) {
            if !slot.connected {
                slot.connected = true;
                let _ = slot.events.send(RelayEvent::Connected);
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.clients)
            .values()
            .filter(|c| c.connected && c.topics.contains(topic))
            .count()
    }
}

pub struct MemoryRelay {
    client_id: String,
    hub: MemoryRelayHub,
    events: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
}

impl MemoryRelay {
    fn with_slot<R>(&self, f: impl FnOnce(&mut ClientSlot) -> Result<R, RelayError>) -> Result<R, RelayError> {
        let mut clients = lock(&self.hub.clients);
        match clients.get_mut(&self.client_id) {
            Some(slot) if slot.connected => f(slot),
            Some(_) => Err(RelayError::NotConnected),
            None => Err(RelayError::Closed),
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn connect(&self) -> Result<(), RelayError> {
        match lock(&self.hub.clients).get_mut(&self.client_id) {
            Some(slot) => {
                if !slot.connected {
                    slot.connected = true;
                    let _ = slot.events.send(RelayEvent::Connected);
                }
                Ok(())
            }
            None => Err(RelayError::Closed),
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<(), RelayError> {
        self.with_slot(|slot| {
            slot.topics.insert(topic.to_string());
            Ok(())
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), RelayError> {
        self.with_slot(|slot| {
            slot.topics.remove(topic);
            Ok(())
        })
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError> {
        let mut clients = lock(&self.hub.clients);
        match clients.get(&self.client_id) {
            Some(slot) if slot.connected => {}
            Some(_) => return Err(RelayError::NotConnected),
            None => return Err(RelayError::Closed),
        }
        for slot in clients.values_mut() {
            if slot.connected && slot.topics.contains(topic) {
                let _ = slot.events.send(RelayEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        lock(&self.events).take()
    }

    async fn close(&self) {
        if let Some(slot) = lock(&self.hub.clients).remove(&self.client_id) {
            let _ = slot.events.send(RelayEvent::Closed);
        }
    }
}

// ============================================================================
// Data channel
// ============================================================================

struct ChannelInner {
    label: String,
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<ChannelInner>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    /// Bytes accepted by `send` but not yet handed to the peer.
    buffered: AtomicUsize,
    drained: Notify,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl ChannelInner {
    fn new(label: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            buffered: AtomicUsize::new(0),
            drained: Notify::new(),
            outbound: Mutex::new(None),
        })
    }

    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    /// Connect two ends and start their delivery tasks.
    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.peer) = Arc::downgrade(b);
        *lock(&b.peer) = Arc::downgrade(a);
        Self::start_drain(a);
        Self::start_drain(b);
    }

    /// Messages leave the send buffer one scheduler turn at a time, so the buffered amount is observable.
    fn start_drain(ch: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        *lock(&ch.outbound) = Some(tx);
        let weak = Arc::downgrade(ch);
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                tokio::task::yield_now().await;
                let Some(ch) = weak.upgrade() else { break };
                let len = data.len();
                if let Some(peer) = lock(&ch.peer).upgrade() {
                    peer.deliver(data);
                }
                ch.buffered.fetch_sub(len, Ordering::SeqCst);
                ch.drained.notify_waiters();
            }
        });
    }

    fn open(&self) {
        let mut st = lock(&self.state);
        if *st == ChannelState::Connecting {
            *st = ChannelState::Open;
            let _ = self.events_tx.send(ChannelEvent::Open);
        }
    }

    fn deliver(&self, data: Bytes) {
        if self.state() == ChannelState::Open {
            let _ = self.events_tx.send(ChannelEvent::Message(data));
        }
    }

    fn shutdown(&self) {
        {
            let mut st = lock(&self.state);
            if *st == ChannelState::Closed {
                return;
            }
            *st = ChannelState::Closed;
        }
        lock(&self.outbound).take();
        let _ = self.events_tx.send(ChannelEvent::Closed);
        self.drained.notify_waiters();
        let peer = lock(&self.peer).upgrade();
        if let Some(peer) = peer {
            peer.shutdown();
        }
    }
}

pub struct MemoryDataChannel(Arc<ChannelInner>);

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> String {
        self.0.label.clone()
    }

    fn state(&self) -> ChannelState {
        self.0.state()
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.0.state() != ChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        let len = data.len();
        let outbound = lock(&self.0.outbound);
        let tx = outbound.as_ref().ok_or(TransportError::Closed)?;
        self.0.buffered.fetch_add(len, Ordering::SeqCst);
        tx.send(data).map_err(|_| {
            self.0.buffered.fetch_sub(len, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    async fn buffered_amount(&self) -> usize {
        self.0.buffered.load(Ordering::SeqCst)
    }

    async fn buffered_amount_low(&self, threshold: usize) {
        loop {
            let notified = self.0.drained.notified();
            if self.0.buffered.load(Ordering::SeqCst) <= threshold
                || self.0.state() == ChannelState::Closed
            {
                return;
            }
            notified.await;
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        lock(&self.0.events_rx).take()
    }

    async fn close(&self) {
        self.0.shutdown();
    }
}

// ============================================================================
// Peer connections
// ============================================================================

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

#[derive(Default)]
struct NetState {
    next_id: u64,
    peers: HashMap<u64, Weak<PcInner>>,
}

/// Factory whose connections can only reach other connections from the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections created and not yet closed.
    pub fn live_connections(&self) -> usize {
        lock(&self.state)
            .peers
            .values()
            .filter(|w| w.upgrade().is_some_and(|pc| !pc.closed.load(Ordering::SeqCst)))
            .count()
    }

    fn lookup(&self, id: u64) -> Option<Arc<PcInner>> {
        lock(&self.state).peers.get(&id).and_then(Weak::upgrade)
    }
}

#[derive(Default)]
struct PcState {
    local_set: bool,
    remote_set: bool,
    channels: Vec<Arc<ChannelInner>>,
    tracks: Vec<MediaTrack>,
    linked: Weak<PcInner>,
}

struct PcInner {
    id: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    closed: AtomicBool,
    st: Mutex<PcState>,
}

impl PcInner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn local_candidate(&self) {
        self.emit(PeerEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:memory {} 1 udp 1 127.0.0.1 9 typ host", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }
}

pub struct MemoryPeerConnection {
    inner: Arc<PcInner>,
    net: MemoryNetwork,
}

fn parse_id(desc: &SessionDescription, prefix: &str) -> Result<u64, TransportError> {
    desc.sdp
        .strip_prefix(prefix)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::Negotiation(format!("unrecognized description: {}", desc.sdp)))
}

impl MemoryPeerConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Join the originator (self) with the answerer that produced `remote_id`'s answer.
    fn link(&self, remote_id: u64) -> Result<(), TransportError> {
        let remote = self
            .net
            .lookup(remote_id)
            .filter(|r| !r.closed.load(Ordering::SeqCst))
            .ok_or_else(|| TransportError::ConnectionFailed("remote connection gone".to_string()))?;

        let (local_channels, local_tracks) = {
            let mut st = lock(&self.inner.st);
            st.linked = Arc::downgrade(&remote);
            (st.channels.clone(), st.tracks.clone())
        };
        let mut remote_channels = Vec::with_capacity(local_channels.len());
        let remote_tracks = {
            let mut st = lock(&remote.st);
            st.linked = Arc::downgrade(&self.inner);
            for ch in &local_channels {
                let theirs = ChannelInner::new(&ch.label);
                ChannelInner::pair(ch, &theirs);
                st.channels.push(theirs.clone());
                remote_channels.push(theirs);
            }
            st.tracks.clone()
        };

        for pc in [&self.inner, &remote] {
            pc.emit(PeerEvent::IceStateChanged(IceConnectionState::Checking));
            pc.emit(PeerEvent::IceStateChanged(IceConnectionState::Connected));
        }
        for ch in &remote_channels {
            remote.emit(PeerEvent::DataChannel(Arc::new(MemoryDataChannel(ch.clone()))));
        }
        for t in local_tracks {
            remote.emit(PeerEvent::Track(t));
        }
        for t in remote_tracks {
            self.inner.emit(PeerEvent::Track(t));
        }
        for ch in local_channels.iter().chain(remote_channels.iter()) {
            ch.open();
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.ensure_open()?;
        let ch = ChannelInner::new(label);
        lock(&self.inner.st).channels.push(ch.clone());
        Ok(Arc::new(MemoryDataChannel(ch)))
    }

    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.inner.st).tracks.extend_from_slice(tracks);
        Ok(())
    }

    async fn replace_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let remote = {
            let mut st = lock(&self.inner.st);
            st.tracks = tracks.to_vec();
            st.linked.upgrade()
        };
        if let Some(remote) = remote {
            for t in tracks {
                remote.emit(PeerEvent::Track(t.clone()));
            }
        }
        Ok(())
    }

    async fn create_offer(&self, _receive_media: bool) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        lock(&self.inner.st).local_set = true;
        self.inner.local_candidate();
        Ok(SessionDescription::offer(format!("{}{}", OFFER_PREFIX, self.inner.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        {
            let mut st = lock(&self.inner.st);
            if !st.remote_set {
                return Err(TransportError::Negotiation("no remote offer".to_string()));
            }
            st.local_set = true;
        }
        self.inner.local_candidate();
        Ok(SessionDescription::answer(format!("{}{}", ANSWER_PREFIX, self.inner.id)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        match desc.sdp_type {
            SdpType::Offer => {
                parse_id(&desc, OFFER_PREFIX)?;
                lock(&self.inner.st).remote_set = true;
                Ok(())
            }
            SdpType::Answer => {
                let remote_id = parse_id(&desc, ANSWER_PREFIX)?;
                {
                    let mut st = lock(&self.inner.st);
                    if !st.local_set {
                        return Err(TransportError::Negotiation("answer without local offer".to_string()));
                    }
                    st.remote_set = true;
                }
                self.link(remote_id)
            }
        }
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !lock(&self.inner.st).remote_set {
            return Err(TransportError::Negotiation("remote description not set".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (channels, remote) = {
            let st = lock(&self.inner.st);
            (st.channels.clone(), st.linked.upgrade())
        };
        for ch in channels {
            ch.shutdown();
        }
        if let Some(remote) = remote {
            if !remote.closed.load(Ordering::SeqCst) {
                remote.emit(PeerEvent::IceStateChanged(IceConnectionState::Closed));
            }
        }
        lock(&self.net.state).peers.remove(&self.inner.id);
    }
}

#[async_trait]
impl PeerConnectionFactory for MemoryNetwork {
    async fn create(
        &self,
        _config: &IceConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = {
            let mut st = lock(&self.state);
            st.next_id += 1;
            let inner = Arc::new(PcInner {
                id: st.next_id,
                events: tx,
                closed: AtomicBool::new(false),
                st: Mutex::new(PcState::default()),
            });
            st.peers.insert(inner.id, Arc::downgrade(&inner));
            inner
        };
        let pc = MemoryPeerConnection {
            inner,
            net: self.clone(),
        };
        Ok((Arc::new(pc), rx))
    }
}
