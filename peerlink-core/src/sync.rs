//! Replication bus: last-write-wins keyed values over `sync` bus messages.
//!
//! Each entry travels as `[key, value, ts]`. `ts == 0` asks the receiver for its current value.
//! A newer timestamp is adopted and re-broadcast to every bound peer except the sender, so
//! updates reach peers one hop away from the origin. Older or equal timestamps are discarded.
//! Outbound entries are batched, keeping only the newest entry per key: one batch for broadcasts
//! and one per destination peer for pull replies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{Inbound, MessageBus, MessageKind};
use crate::coalesce::{sleep_until, Coalescer};
use crate::identity::PeerId;

/// Wire entry: key, value, logical timestamp.
pub type SyncEntry = (String, Value, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Pull the current value from peers on bind instead of claiming the local one.
    pub initialize: bool,
    /// Broadcast local changes.
    pub auto_push: bool,
    /// Accept remote entries and answer pulls for this key.
    pub auto_pull: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            initialize: false,
            auto_push: true,
            auto_pull: true,
        }
    }
}

/// Milliseconds since the Unix epoch, strictly above `last`.
fn next_timestamp(last: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    now.max(last.saturating_add(1))
}

enum Command {
    Bind {
        key: String,
        value: Arc<watch::Sender<Value>>,
        timestamp: Arc<AtomicU64>,
        options: SyncOptions,
    },
    Unbind(String),
    Changed { key: String, generation: u64 },
    Pull(String),
    Push(String),
    AddPeer(PeerId),
    RemovePeer(PeerId),
    SetDelay(Duration),
}

#[derive(Clone)]
pub struct ReplicationBus {
    commands: mpsc::UnboundedSender<Command>,
}

impl ReplicationBus {
    pub fn new(bus: &MessageBus, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = SyncTask {
            bus: bus.clone(),
            commands: tx.clone(),
            peers: Vec::new(),
            bindings: HashMap::new(),
            next_generation: 0,
            delay,
            broadcast: Coalescer::with_window(delay),
            direct: HashMap::new(),
        };
        tokio::spawn(task.run(rx, bus.subscribe(MessageKind::Sync)));
        Self { commands: tx }
    }

    /// Replicate `value` under `key`. Replaces an existing binding for the same key.
    pub fn bind(&self, key: &str, value: watch::Sender<Value>, options: SyncOptions) -> SyncHandle {
        let value = Arc::new(value);
        let ts = if options.initialize { 0 } else { next_timestamp(0) };
        let timestamp = Arc::new(AtomicU64::new(ts));
        let _ = self.commands.send(Command::Bind {
            key: key.to_string(),
            value: value.clone(),
            timestamp: timestamp.clone(),
            options,
        });
        SyncHandle {
            key: key.to_string(),
            value,
            timestamp,
            commands: self.commands.clone(),
        }
    }

    pub fn unbind(&self, key: &str) {
        let _ = self.commands.send(Command::Unbind(key.to_string()));
    }

    /// Accept sync messages from `peer` and include it in broadcasts.
    pub fn add_peer(&self, peer: &PeerId) {
        let _ = self.commands.send(Command::AddPeer(peer.clone()));
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        let _ = self.commands.send(Command::RemovePeer(peer.clone()));
    }

    /// Batch window for later entries.
    pub fn set_delay(&self, delay: Duration) {
        let _ = self.commands.send(Command::SetDelay(delay));
    }
}

/// Local side of one bound key.
pub struct SyncHandle {
    key: String,
    value: Arc<watch::Sender<Value>>,
    timestamp: Arc<AtomicU64>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SyncHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> Value {
        self.value.borrow().clone()
    }

    /// Local change; broadcast when `auto_push` is set.
    pub fn set(&self, value: Value) {
        self.value.send_replace(value);
    }

    /// Observe the value, including adopted remote updates.
    pub fn watch(&self) -> watch::Receiver<Value> {
        self.value.subscribe()
    }

    /// Timestamp of the value currently held. Zero until a value is known.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    /// Ask every bound peer for its current value.
    pub fn pull(&self) {
        let _ = self.commands.send(Command::Pull(self.key.clone()));
    }

    /// Broadcast the current value under a fresh timestamp.
    pub fn push(&self) {
        let _ = self.commands.send(Command::Push(self.key.clone()));
    }

    /// Stop replicating this key locally. Remote peers keep their state.
    ///
    /// This drops the whole binding, not only the inbound side: remote entries and pulls for the
    /// key are ignored, and later local changes are no longer broadcast. `pull` and `push` on an
    /// unsynced handle do nothing. Bind the key again to resume.
    pub fn unsync(&self) {
        let _ = self.commands.send(Command::Unbind(self.key.clone()));
    }
}

struct Binding {
    value: Arc<watch::Sender<Value>>,
    timestamp: Arc<AtomicU64>,
    options: SyncOptions,
    generation: u64,
    /// Value written from a remote entry, not yet seen by the change watcher.
    applied: Option<Value>,
    watcher: AbortHandle,
}

impl Binding {
    fn ts(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    fn set_ts(&self, ts: u64) {
        self.timestamp.store(ts, Ordering::SeqCst);
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Broadcast batch value: entry plus the peer it must not go back to.
struct Outgoing {
    value: Value,
    ts: u64,
    exclude: Option<PeerId>,
}

struct SyncTask {
    bus: MessageBus,
    commands: mpsc::UnboundedSender<Command>,
    peers: Vec<PeerId>,
    bindings: HashMap<String, Binding>,
    next_generation: u64,
    delay: Duration,
    broadcast: Coalescer<String, Outgoing>,
    direct: HashMap<PeerId, Coalescer<String, (Value, u64)>>,
}

impl SyncTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                Some(cmd) = commands.recv() => self.on_command(cmd),
                msg = inbound.recv() => match msg {
                    Some(Inbound { peer, data }) => self.on_sync(peer, data),
                    None => break,
                },
                _ = sleep_until(deadline) => self.flush_expired(Instant::now()),
            }
        }
        debug!("replication bus stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.direct
            .values()
            .filter_map(|q| q.deadline())
            .chain(self.broadcast.deadline())
            .min()
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Bind {
                key,
                value,
                timestamp,
                options,
            } => self.bind(key, value, timestamp, options),
            Command::Unbind(key) => {
                if self.bindings.remove(&key).is_some() {
                    debug!("sync unbound {}", key);
                }
            }
            Command::Changed { key, generation } => self.on_local_change(key, generation),
            Command::Pull(key) => {
                if self.bindings.contains_key(&key) {
                    self.queue_broadcast(key, Value::Null, 0, None);
                }
            }
            Command::Push(key) => {
                let Some(binding) = self.bindings.get(&key) else { return };
                let ts = next_timestamp(binding.ts());
                binding.set_ts(ts);
                let value = binding.value.borrow().clone();
                self.queue_broadcast(key, value, ts, None);
            }
            Command::AddPeer(peer) => {
                if !self.peers.contains(&peer) {
                    info!("sync peer added {}", peer.short());
                    self.peers.push(peer);
                }
            }
            Command::RemovePeer(peer) => {
                self.peers.retain(|p| p != &peer);
                self.direct.remove(&peer);
            }
            Command::SetDelay(delay) => {
                self.delay = delay;
                self.broadcast.set_window(delay);
                for queue in self.direct.values_mut() {
                    queue.set_window(delay);
                }
            }
        }
    }

    fn bind(&mut self, key: String, value: Arc<watch::Sender<Value>>, timestamp: Arc<AtomicU64>, options: SyncOptions) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let mut changes = value.subscribe();
        let commands = self.commands.clone();
        let watched = key.clone();
        let watcher = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let cmd = Command::Changed {
                    key: watched.clone(),
                    generation,
                };
                if commands.send(cmd).is_err() {
                    break;
                }
            }
        })
        .abort_handle();
        debug!("sync bound {}", key);
        self.bindings.insert(
            key.clone(),
            Binding {
                value,
                timestamp,
                options,
                generation,
                applied: None,
                watcher,
            },
        );
        if options.initialize {
            self.queue_broadcast(key, Value::Null, 0, None);
        }
    }

    fn on_local_change(&mut self, key: String, generation: u64) {
        let Some(binding) = self.bindings.get_mut(&key) else { return };
        if binding.generation != generation {
            return;
        }
        let current = binding.value.borrow().clone();
        if binding.applied.take().as_ref() == Some(&current) {
            return;
        }
        let ts = next_timestamp(binding.ts());
        binding.set_ts(ts);
        if binding.options.auto_push {
            self.queue_broadcast(key, current, ts, None);
        }
    }

    fn on_sync(&mut self, peer: PeerId, data: Value) {
        if !self.peers.contains(&peer) {
            debug!("sync from unbound peer {} ignored", peer.short());
            return;
        }
        let entries: Vec<SyncEntry> = match serde_json::from_value(data) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("bad sync payload from {}: {}", peer.short(), e);
                return;
            }
        };
        debug!("sync download from {}: {} entries", peer.short(), entries.len());
        for (key, value, ts) in entries {
            self.on_entry(&peer, key, value, ts);
        }
    }

    fn on_entry(&mut self, src: &PeerId, key: String, value: Value, ts: u64) {
        let Some(binding) = self.bindings.get_mut(&key) else { return };
        if !binding.options.auto_pull {
            return;
        }
        let local_ts = binding.ts();
        if ts == 0 {
            // Nothing to offer until a value is known; a zero reply would read as another pull.
            if local_ts == 0 {
                return;
            }
            let current = binding.value.borrow().clone();
            self.queue_direct(src, key, current, local_ts);
            return;
        }
        if ts <= local_ts {
            debug!("sync {} at {} not newer than {}, dropped", key, ts, local_ts);
            return;
        }
        binding.set_ts(ts);
        binding.applied = Some(value.clone());
        binding.value.send_replace(value.clone());
        self.queue_broadcast(key, value, ts, Some(src.clone()));
    }

    fn queue_broadcast(&mut self, key: String, value: Value, ts: u64, exclude: Option<PeerId>) {
        let entry = Outgoing { value, ts, exclude };
        if let Some(batch) = self.broadcast.push(key, entry, Instant::now()) {
            self.send_broadcast(batch);
        }
    }

    fn queue_direct(&mut self, peer: &PeerId, key: String, value: Value, ts: u64) {
        let delay = self.delay;
        let queue = self
            .direct
            .entry(peer.clone())
            .or_insert_with(|| Coalescer::with_window(delay));
        if let Some(batch) = queue.push(key, (value, ts), Instant::now()) {
            self.send_direct(peer, batch);
        }
    }

    fn flush_expired(&mut self, now: Instant) {
        if let Some(batch) = self.broadcast.poll_expired(now) {
            self.send_broadcast(batch);
        }
        let mut due = Vec::new();
        self.direct.retain(|peer, queue| match queue.poll_expired(now) {
            Some(batch) => {
                due.push((peer.clone(), batch));
                false
            }
            None => true,
        });
        for (peer, batch) in due {
            self.send_direct(&peer, batch);
        }
    }

    fn send_broadcast(&self, batch: Vec<(String, Outgoing)>) {
        for peer in &self.peers {
            let entries: Vec<SyncEntry> = batch
                .iter()
                .filter(|(_, out)| out.exclude.as_ref() != Some(peer))
                .map(|(key, out)| (key.clone(), out.value.clone(), out.ts))
                .collect();
            if !entries.is_empty() {
                self.upload(peer, entries);
            }
        }
    }

    fn send_direct(&self, peer: &PeerId, batch: Vec<(String, (Value, u64))>) {
        let entries: Vec<SyncEntry> = batch.into_iter().map(|(key, (value, ts))| (key, value, ts)).collect();
        self.upload(peer, entries);
    }

    fn upload(&self, peer: &PeerId, entries: Vec<SyncEntry>) {
        debug!("sync upload to {}: {} entries", peer.short(), entries.len());
        match serde_json::to_value(&entries) {
            Ok(data) => self.bus.send(peer, MessageKind::Sync, data),
            Err(e) => warn!("sync encode: {}", e),
        }
    }
}
