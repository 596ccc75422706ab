//! Embedded WebSocket pub/sub broker for `--serve-relay`.
//! Fan-out only: nothing is stored for topics without subscribers.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::relay_wire::{decode_payload, RelayFrame};

type ClientId = u64;

#[derive(Default)]
struct Broker {
    next_client: ClientId,
    clients: HashMap<ClientId, mpsc::UnboundedSender<String>>,
    topics: HashMap<String, HashSet<ClientId>>,
}

impl Broker {
    fn register(&mut self, tx: mpsc::UnboundedSender<String>) -> ClientId {
        self.next_client += 1;
        self.clients.insert(self.next_client, tx);
        self.next_client
    }

    fn unregister(&mut self, id: ClientId) {
        self.clients.remove(&id);
        self.topics.retain(|_, subs| {
            subs.remove(&id);
            !subs.is_empty()
        });
    }

    /// Deliver to every subscriber of `topic`. Returns the number reached.
    fn fan_out(&self, topic: &str, text: &str) -> usize {
        let Some(subs) = self.topics.get(topic) else { return 0 };
        subs.iter()
            .filter_map(|id| self.clients.get(id))
            .filter(|tx| tx.send(text.to_string()).is_ok())
            .count()
    }
}

type SharedBroker = Arc<Mutex<Broker>>;

pub async fn run(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("relay listening on ws://{}", listener.local_addr()?);
    serve(listener).await
}

pub async fn serve(listener: TcpListener) -> anyhow::Result<()> {
    let broker: SharedBroker = Arc::new(Mutex::new(Broker::default()));
    loop {
        let (stream, addr) = listener.accept().await?;
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, addr, broker).await {
                warn!("relay client {}: {}", addr, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, broker: SharedBroker) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = broker.lock().await.register(tx.clone());
    debug!("relay client {} connected from {}", id, addr);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let result = async {
        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Text(text) => on_frame(id, &text, &broker, &tx).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    broker.lock().await.unregister(id);
    drop(tx);
    let _ = writer.await;
    debug!("relay client {} gone", id);
    result
}

async fn on_frame(id: ClientId, text: &str, broker: &SharedBroker, reply: &mpsc::UnboundedSender<String>) {
    let frame = match RelayFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("relay client {} sent a bad frame: {}", id, e);
            return;
        }
    };
    let ack = match frame {
        RelayFrame::Subscribe { id: req, topic } => {
            broker.lock().await.topics.entry(topic).or_default().insert(id);
            RelayFrame::ack(req, None)
        }
        RelayFrame::Unsubscribe { id: req, topic } => {
            let mut b = broker.lock().await;
            if let Some(subs) = b.topics.get_mut(&topic) {
                subs.remove(&id);
                if subs.is_empty() {
                    b.topics.remove(&topic);
                }
            }
            RelayFrame::ack(req, None)
        }
        RelayFrame::Publish { id: req, topic, payload } => {
            if let Err(e) = decode_payload(&payload) {
                RelayFrame::ack(req, Some(e.to_string()))
            } else {
                match (RelayFrame::Message { topic: topic.clone(), payload }).to_text() {
                    Ok(out) => {
                        let reached = broker.lock().await.fan_out(&topic, &out);
                        debug!("relay publish on {} reached {}", topic, reached);
                        RelayFrame::ack(req, None)
                    }
                    Err(e) => RelayFrame::ack(req, Some(e.to_string())),
                }
            }
        }
        RelayFrame::Ack { .. } | RelayFrame::Message { .. } => return,
    };
    if let Ok(text) = ack.to_text() {
        let _ = reply.send(text);
    }
}
