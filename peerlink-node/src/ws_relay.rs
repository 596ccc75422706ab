//! Relay client over WebSocket. One session at a time; reconnects after `reconnect_period`.
//! Subscribe, unsubscribe and publish wait for the broker's ack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use peerlink_core::relay::{Relay, RelayError, RelayEvent, RelayOptions};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::relay_wire::{decode_payload, RelayFrame};

type Reply = oneshot::Sender<Result<(), RelayError>>;

enum Request {
    Subscribe(String),
    Unsubscribe(String),
    Publish(String, Bytes),
}

impl Request {
    fn into_frame(self, id: u64) -> RelayFrame {
        match self {
            Request::Subscribe(topic) => RelayFrame::Subscribe { id, topic },
            Request::Unsubscribe(topic) => RelayFrame::Unsubscribe { id, topic },
            Request::Publish(topic, payload) => RelayFrame::publish(id, &topic, &payload),
        }
    }

    fn kind(&self) -> RequestKind {
        match self {
            Request::Subscribe(_) | Request::Unsubscribe(_) => RequestKind::Subscription,
            Request::Publish(..) => RequestKind::Publish,
        }
    }
}

/// Kept per in-flight request to map a broker error to the right kind.
#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Subscription,
    Publish,
}

impl RequestKind {
    fn failure(self, reason: String) -> RelayError {
        match self {
            RequestKind::Subscription => RelayError::Subscribe(reason),
            RequestKind::Publish => RelayError::Publish(reason),
        }
    }
}

enum Op {
    Request { request: Request, reply: Reply },
    Close,
}

pub struct WsRelay {
    options: RelayOptions,
    ops: mpsc::UnboundedSender<Op>,
    ops_rx: Mutex<Option<mpsc::UnboundedReceiver<Op>>>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    closed: AtomicBool,
}

impl WsRelay {
    pub fn new(options: RelayOptions) -> Self {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            options,
            ops,
            ops_rx: Mutex::new(Some(ops_rx)),
            events_tx,
            events: Mutex::new(Some(events)),
            closed: AtomicBool::new(false),
        }
    }

    async fn request(&self, request: Request) -> Result<(), RelayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(Op::Request { request, reply })
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)?
    }
}

#[async_trait]
impl Relay for WsRelay {
    async fn connect(&self) -> Result<(), RelayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let ops = self
            .ops_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ops) = ops {
            tokio::spawn(run(self.options.clone(), ops, self.events_tx.clone()));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), RelayError> {
        self.request(Request::Subscribe(topic.to_string())).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), RelayError> {
        self.request(Request::Unsubscribe(topic.to_string())).await
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError> {
        self.request(Request::Publish(topic.to_string(), payload)).await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let never_started = self
            .ops_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if never_started {
            let _ = self.events_tx.send(RelayEvent::Closed);
        } else {
            let _ = self.ops.send(Op::Close);
        }
    }
}

enum SessionEnd {
    Closed,
    Dropped(String),
}

async fn run(options: RelayOptions, mut ops: mpsc::UnboundedReceiver<Op>, events: mpsc::UnboundedSender<RelayEvent>) {
    loop {
        match tokio_tungstenite::connect_async(options.url.as_str()).await {
            Ok((ws, _)) => {
                info!("relay {} connected as {}", options.url, options.client_id);
                let _ = events.send(RelayEvent::Connected);
                match session(ws, &options, &mut ops, &events).await {
                    SessionEnd::Closed => break,
                    SessionEnd::Dropped(reason) => {
                        warn!("relay session dropped: {}", reason);
                        let _ = events.send(RelayEvent::Disconnected);
                    }
                }
            }
            Err(e) => {
                warn!("relay connect to {} failed: {}", options.url, e);
                let _ = events.send(RelayEvent::Error(RelayError::Connect(e.to_string())));
            }
        }

        let wait = tokio::time::sleep(options.reconnect_period);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                op = ops.recv() => match op {
                    Some(Op::Request { reply, .. }) => {
                        let _ = reply.send(Err(RelayError::NotConnected));
                    }
                    Some(Op::Close) | None => {
                        let _ = events.send(RelayEvent::Closed);
                        return;
                    }
                },
            }
        }
        debug!("relay reconnecting to {}", options.url);
    }
    info!("relay {} closed", options.url);
    let _ = events.send(RelayEvent::Closed);
}

async fn session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    options: &RelayOptions,
    ops: &mut mpsc::UnboundedReceiver<Op>,
    events: &mpsc::UnboundedSender<RelayEvent>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut pending: HashMap<u64, (RequestKind, Reply)> = HashMap::new();
    let mut next_id = 0u64;
    let mut keepalive = tokio::time::interval(options.keepalive);
    keepalive.tick().await;

    let end = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => on_frame(&text, &mut pending, events),
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Dropped("closed by relay".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd::Dropped(e.to_string()),
            },
            op = ops.recv() => match op {
                Some(Op::Request { request, reply }) => {
                    next_id += 1;
                    let kind = request.kind();
                    let frame = match request.into_frame(next_id).to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            let _ = reply.send(Err(kind.failure(e.to_string())));
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        let _ = reply.send(Err(RelayError::NotConnected));
                        break SessionEnd::Dropped(e.to_string());
                    }
                    pending.insert(next_id, (kind, reply));
                }
                Some(Op::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break SessionEnd::Closed;
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    break SessionEnd::Dropped(e.to_string());
                }
            }
        }
    };
    for (_, (_, reply)) in pending.drain() {
        let _ = reply.send(Err(RelayError::NotConnected));
    }
    end
}

fn on_frame(text: &str, pending: &mut HashMap<u64, (RequestKind, Reply)>, events: &mpsc::UnboundedSender<RelayEvent>) {
    let frame = match RelayFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("relay sent a bad frame: {}", e);
            return;
        }
    };
    match frame {
        RelayFrame::Ack { id, error } => {
            let Some((kind, reply)) = pending.remove(&id) else {
                debug!("relay ack {} matches no request", id);
                return;
            };
            let result = match error {
                Some(reason) => Err(kind.failure(reason)),
                None => Ok(()),
            };
            let _ = reply.send(result);
        }
        RelayFrame::Message { topic, payload } => match decode_payload(&payload) {
            Ok(payload) => {
                let _ = events.send(RelayEvent::Message { topic, payload });
            }
            Err(e) => warn!("relay message on {}: {}", topic, e),
        },
        other => debug!("unexpected relay frame {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_server;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn next_event(events: &mut mpsc::UnboundedReceiver<RelayEvent>) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for relay event")
            .expect("relay events ended")
    }

    #[test]
    fn acks_resolve_their_own_request() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut pending = HashMap::new();
        let (sub_tx, mut sub_rx) = oneshot::channel();
        let (pub_tx, mut pub_rx) = oneshot::channel();
        pending.insert(1, (RequestKind::Subscription, sub_tx));
        pending.insert(2, (RequestKind::Publish, pub_tx));

        let text = |frame: RelayFrame| frame.to_text().unwrap();
        on_frame(&text(RelayFrame::ack(2, Some("too big".into()))), &mut pending, &events_tx);
        on_frame(&text(RelayFrame::ack(7, None)), &mut pending, &events_tx);
        on_frame(&text(RelayFrame::ack(1, None)), &mut pending, &events_tx);
        on_frame("not json", &mut pending, &events_tx);

        assert_eq!(pub_rx.try_recv().unwrap(), Err(RelayError::Publish("too big".into())));
        assert_eq!(sub_rx.try_recv().unwrap(), Ok(()));
        assert!(pending.is_empty());

        on_frame(&text(RelayFrame::message("t", b"hi")), &mut pending, &events_tx);
        match events.try_recv().unwrap() {
            RelayEvent::Message { topic, payload } => {
                assert_eq!(topic, "t");
                assert_eq!(&payload[..], b"hi");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_before_connect() {
        let relay = WsRelay::new(RelayOptions::new("ws://127.0.0.1:1", "idle"));
        let mut events = relay.take_events().unwrap();
        assert!(relay.take_events().is_none());
        relay.close().await;
        relay.close().await;
        assert!(matches!(next_event(&mut events).await, RelayEvent::Closed));
        assert_eq!(relay.connect().await, Err(RelayError::Closed));
        assert_eq!(relay.subscribe("t").await, Err(RelayError::Closed));
    }

    #[tokio::test]
    async fn dropped_session_fails_pending_then_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        // First session: read one frame, never ack it, hang up. Then serve normally.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            drop(ws);
            let _ = relay_server::serve(listener).await;
        });

        let mut options = RelayOptions::new(url.as_str(), "a");
        options.reconnect_period = Duration::from_millis(300);
        let relay = WsRelay::new(options);
        let mut events = relay.take_events().unwrap();
        relay.connect().await.unwrap();
        assert!(matches!(next_event(&mut events).await, RelayEvent::Connected));

        assert_eq!(relay.subscribe("t").await, Err(RelayError::NotConnected));
        assert!(matches!(next_event(&mut events).await, RelayEvent::Disconnected));
        assert_eq!(relay.publish("t", Bytes::new()).await, Err(RelayError::NotConnected));

        assert!(matches!(next_event(&mut events).await, RelayEvent::Connected));
        relay.subscribe("t").await.unwrap();
        relay.publish("t", Bytes::from_static(b"back")).await.unwrap();
        match next_event(&mut events).await {
            RelayEvent::Message { topic, payload } => {
                assert_eq!(topic, "t");
                assert_eq!(&payload[..], b"back");
            }
            other => panic!("unexpected {:?}", other),
        }

        relay.close().await;
        assert!(matches!(next_event(&mut events).await, RelayEvent::Closed));
        assert_eq!(relay.subscribe("t").await, Err(RelayError::Closed));
    }
}
