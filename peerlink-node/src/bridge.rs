//! Line bridge between a terminal and the peer stack.
//!
//! Plain lines go to every connected peer as `term` events; `term` events from peers are printed.
//! Slash commands drive the client. Each node replicates its status under `status:{id}` and pulls
//! the status of every peer it connects to. Peers answer a `ping` request. A followed peer is
//! called once signaling is up and again whenever it announces itself.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use peerlink_core::{
    CallOptions, Inbound, MessageBus, NotifyMessage, PeerClient, PeerClientEvent, PeerId,
    ReplicationBus, RequestBus, SyncHandle, SyncOptions,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub const TERM_EVENT: &str = "term";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Say(String),
    Call(PeerId),
    Hangup(PeerId),
    Ping(PeerId),
    Peers,
    Quit,
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Result<Input, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(cmd) = line.strip_prefix('/') else {
            return Ok(if line.trim().is_empty() {
                Input::Empty
            } else {
                Input::Say(line.to_string())
            });
        };
        let mut parts = cmd.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let mut peer = || {
            parts
                .next()
                .map(PeerId::from)
                .ok_or_else(|| format!("/{} needs a peer id", name))
        };
        match name {
            "call" => Ok(Input::Call(peer()?)),
            "hangup" => Ok(Input::Hangup(peer()?)),
            "ping" => Ok(Input::Ping(peer()?)),
            "peers" => Ok(Input::Peers),
            "quit" => Ok(Input::Quit),
            other => Err(format!("unknown command /{}", other)),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct Bridge {
    client: PeerClient,
    bus: MessageBus,
    rpc: RequestBus,
    sync: ReplicationBus,
    status: SyncHandle,
    remote_status: HashMap<PeerId, SyncHandle>,
    follow: Option<(PeerId, mpsc::UnboundedReceiver<NotifyMessage>)>,
    out: mpsc::UnboundedSender<String>,
}

async fn next_notify(follow: &mut Option<(PeerId, mpsc::UnboundedReceiver<NotifyMessage>)>) -> Option<NotifyMessage> {
    match follow {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Bridge {
    pub fn new(client: &PeerClient, core: &peerlink_core::Config, out: mpsc::UnboundedSender<String>) -> Self {
        let bus = MessageBus::new(client);
        let rpc = RequestBus::new(&bus, core.rpc_timeout());
        let sync = ReplicationBus::new(&bus, core.sync_delay());

        let local = client.id().clone();
        rpc.bind("ping", move |_params, src| {
            let local = local.clone();
            async move {
                debug!("ping from {}", src.short());
                Ok(json!({"pong": local.as_str(), "ts": now_ms()}))
            }
        });

        let (status_tx, _) = watch::channel(Value::Null);
        let status = sync.bind(&format!("status:{}", client.id()), status_tx, SyncOptions::default());
        let bridge = Self {
            client: client.clone(),
            bus,
            rpc,
            sync,
            status,
            remote_status: HashMap::new(),
            follow: None,
            out,
        };
        bridge.publish_status();
        bridge
    }

    /// Keep a data connection to `peer`: call it on open and whenever it comes online.
    pub fn follow(&mut self, peer: PeerId) {
        let notes = self.client.watch(&peer);
        self.follow = Some((peer, notes));
    }

    fn call_followed(&self) {
        let Some((peer, _)) = &self.follow else { return };
        if self.client.is_connected(peer) {
            return;
        }
        info!("calling {}", peer);
        if let Err(e) = self.client.call(peer, CallOptions::data_only()) {
            self.say(format!("! {}", e));
        }
    }

    fn say(&self, line: String) {
        let _ = self.out.send(line);
    }

    fn publish_status(&self) {
        let peers: Vec<String> = self
            .client
            .connected_peers()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        self.status.set(json!({"peer": self.client.id().as_str(), "peers": peers}));
    }

    /// Run until the input ends, `/quit`, or the client closes. Stops the client on the way out.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PeerClientEvent>,
        mut lines: mpsc::UnboundedReceiver<String>,
    ) -> anyhow::Result<()> {
        let mut term = self.bus.subscribe(TERM_EVENT);
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(PeerClientEvent::Close) | None => break,
                    Some(ev) => self.on_event(ev),
                },
                note = next_notify(&mut self.follow) => match note {
                    Some(note) => self.on_notify(note),
                    None => self.follow = None,
                },
                Some(Inbound { peer, data }) = term.recv() => {
                    if let Some(text) = data.as_str() {
                        self.say(format!("{}> {}", peer, text));
                    }
                }
                line = lines.recv() => match line {
                    None => break,
                    Some(line) => match Input::parse(&line) {
                        Ok(Input::Quit) => break,
                        Ok(input) => self.on_input(input),
                        Err(e) => self.say(format!("! {}", e)),
                    },
                },
            }
        }
        info!("bridge stopping");
        self.client.stop();
        Ok(())
    }

    fn on_event(&mut self, ev: PeerClientEvent) {
        match ev {
            PeerClientEvent::Open(id) => {
                self.say(format!("* online as {}", id));
                self.call_followed();
            }
            PeerClientEvent::DataConnection(peer) => {
                self.sync.add_peer(&peer);
                self.watch_status(&peer);
                self.publish_status();
                self.say(format!("* {} connected", peer));
            }
            PeerClientEvent::DataDisconnect(peer) => {
                self.sync.remove_peer(&peer);
                if let Some(handle) = self.remote_status.remove(&peer) {
                    handle.unsync();
                }
                self.publish_status();
                self.say(format!("* {} disconnected", peer));
            }
            PeerClientEvent::Hangup(peer) => self.say(format!("* {} hung up", peer)),
            PeerClientEvent::Error(e) => self.say(format!("! {}", e)),
            _ => {}
        }
    }

    fn on_notify(&mut self, note: NotifyMessage) {
        let Some((peer, _)) = &self.follow else { return };
        self.say(format!("* {} is {}", peer, note.kind));
        if note.kind == NotifyMessage::CONNECTED {
            self.call_followed();
        }
    }

    /// Pull the peer's status key and print its updates.
    fn watch_status(&mut self, peer: &PeerId) {
        let (tx, mut rx) = watch::channel(Value::Null);
        let options = SyncOptions {
            initialize: true,
            auto_push: false,
            auto_pull: true,
        };
        let handle = self.sync.bind(&format!("status:{}", peer), tx, options);
        if let Some(old) = self.remote_status.insert(peer.clone(), handle) {
            old.unsync();
        }
        let out = self.out.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().clone();
                let _ = out.send(format!("* status {}: {}", peer, status));
            }
        });
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Say(text) => self.bus.broadcast(TERM_EVENT, json!(text), &[]),
            Input::Call(peer) => {
                if let Err(e) = self.client.call(&peer, CallOptions::data_only()) {
                    self.say(format!("! {}", e));
                }
            }
            Input::Hangup(peer) => self.client.hangup(&peer),
            Input::Ping(peer) => {
                let call = self.rpc.call_on(&peer, "ping");
                let out = self.out.clone();
                tokio::spawn(async move {
                    let line = match call.invoke(None).await {
                        Ok(v) => format!("* ping {}: {}", call.peer(), v),
                        Err(e) => format!("! ping {}: {}", call.peer(), e),
                    };
                    let _ = out.send(line);
                });
            }
            Input::Peers => {
                let peers = self.client.connected_peers();
                if peers.is_empty() {
                    self.say("* no peers".to_string());
                }
                for peer in peers {
                    self.say(format!("* {}", peer));
                }
            }
            Input::Quit | Input::Empty => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::memory::{MemoryNetwork, MemoryRelayHub};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn parse_lines() {
        assert_eq!(Input::parse("hello there\n").unwrap(), Input::Say("hello there".into()));
        assert_eq!(Input::parse("   ").unwrap(), Input::Empty);
        assert_eq!(Input::parse("/call bob").unwrap(), Input::Call("bob".into()));
        assert_eq!(Input::parse("/quit").unwrap(), Input::Quit);
        assert!(Input::parse("/ping").is_err());
        assert!(Input::parse("/dance").is_err());
    }

    struct Node {
        lines: mpsc::UnboundedSender<String>,
        out: mpsc::UnboundedReceiver<String>,
    }

    fn node(id: &str, hub: &MemoryRelayHub, net: &MemoryNetwork) -> Node {
        let core = peerlink_core::Config::default();
        let (client, events) = PeerClient::start(
            core.clone(),
            Some(id.into()),
            hub.client(id),
            Arc::new(net.clone()),
            None,
        );
        let (out_tx, out) = mpsc::unbounded_channel();
        let (lines, lines_rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(&client, &core, out_tx);
        tokio::spawn(bridge.run(events, lines_rx));
        Node { lines, out }
    }

    async fn expect_line(node: &mut Node, f: impl Fn(&str) -> bool) -> String {
        let fut = async {
            loop {
                let line = node.out.recv().await.expect("bridge ended");
                if f(&line) {
                    return line;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out waiting for output")
    }

    #[tokio::test]
    async fn term_lines_ping_and_status() {
        let hub = MemoryRelayHub::new();
        let net = MemoryNetwork::new();
        let mut a = node("a", &hub, &net);
        let mut b = node("b", &hub, &net);
        expect_line(&mut a, |l| l == "* online as a").await;
        expect_line(&mut b, |l| l == "* online as b").await;

        a.lines.send("/call b".into()).unwrap();
        expect_line(&mut a, |l| l == "* b connected").await;
        expect_line(&mut b, |l| l == "* a connected").await;

        a.lines.send("ls -la".into()).unwrap();
        expect_line(&mut b, |l| l == "a> ls -la").await;

        b.lines.send("/ping a".into()).unwrap();
        let pong = expect_line(&mut b, |l| l.starts_with("* ping a")).await;
        assert!(pong.contains(r#""pong":"a""#));

        let status = expect_line(&mut b, |l| l.starts_with("* status a:")).await;
        assert!(status.contains(r#""peer":"a""#));

        a.lines.send("/quit".into()).unwrap();
        expect_line(&mut b, |l| l == "* a disconnected").await;
    }
}
