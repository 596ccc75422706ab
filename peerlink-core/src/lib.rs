//! PeerLink peer transport and messaging stack.
//! Relay-bootstrapped direct connections, framed data channels, and typed event, request and
//! replication buses on top. Transports are trait seams; `memory` backs them in-process.

use std::sync::{Mutex, MutexGuard};

pub mod chunk;
pub mod coalesce;
pub mod config;
pub mod identity;
pub mod memory;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod wire;

pub mod bus;
pub mod client;
pub mod connection;
pub mod framing;
pub mod negotiator;
pub mod rpc;
pub mod signaling;
pub mod sync;

pub use bus::{BusMessage, Inbound, MessageBus, MessageKind};
pub use client::{CallOptions, ClientError, PeerClient, PeerClientEvent};
pub use config::Config;
pub use identity::{CryptoError, PeerId, SignalKey};
pub use protocol::{IceConfig, NotifyMessage, RelayEnvelope, SignalEnvelope, SignalKind};
pub use relay::{Relay, RelayError, RelayEvent, RelayOptions};
pub use rpc::{RequestBus, RpcEnvelope, RpcError, RpcMethod};
pub use sync::{ReplicationBus, SyncHandle, SyncOptions};
pub use transport::{DataChannel, MediaTrack, PeerConnection, PeerConnectionFactory, TransportError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
