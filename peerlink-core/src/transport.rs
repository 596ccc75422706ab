//! Direct transport abstraction
//!
//! Traits for the negotiated peer connection and its data channel, implemented by the
//! WebRTC backend in the node and by the in-memory network in [`crate::memory`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IceCandidate, IceConfig, SessionDescription};

/// Errors from direct transport operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("channel not open")]
    NotOpen,
    #[error("closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Event surface of a data channel, delivered in order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Closed,
}

/// Ordered, reliable byte-message channel inside a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn state(&self) -> ChannelState;

    /// Queue one message. Does not wait for the peer.
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Resolve once the buffered amount is at or below `threshold`, or the channel is closed.
    async fn buffered_amount_low(&self, threshold: usize);

    /// Event receiver. Available once; later calls return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to a local or remote media track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// Failure or closure; the connection will not recover.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

/// Events raised by a peer connection.
#[derive(Clone)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    /// Remote side opened a data channel (answerer side).
    DataChannel(Arc<dyn DataChannel>),
    Track(MediaTrack),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::IceStateChanged(s) => f.debug_tuple("IceStateChanged").field(s).finish(),
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::Track(t) => f.debug_tuple("Track").field(t).finish(),
        }
    }
}

/// One negotiated peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError>;

    /// Swap the local tracks on an established connection.
    async fn replace_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError>;

    /// Create an offer and apply it as the local description.
    /// `receive_media` requests remote audio/video even without local tracks.
    async fn create_offer(&self, receive_media: bool) -> Result<SessionDescription, TransportError>;

    /// Create an answer and apply it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Creates peer connections for a given ICE configuration.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &IceConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), TransportError>;
}
