//! Request bus: correlated request/response over `rpc` bus messages.
//!
//! Requests carry `{ver: 1, id, method, params}`; responses carry the same id and exactly one
//! of `result` or `error`. Ids are per caller and matched per responding peer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{Inbound, MessageBus, MessageKind};
use crate::identity::PeerId;
use crate::lock;

pub const RPC_VERSION: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RpcError {
    #[error("no destination peer configured")]
    NoDestination,
    #[error("request timed out")]
    Timeout,
    #[error("remote error: {0}")]
    Remote(Value),
    #[error("request bus closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub ver: u32,
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// A present field is `Some`, even when it holds `null`.
fn present<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
}

impl RpcEnvelope {
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            ver: RPC_VERSION,
            id,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: u64, outcome: Result<Value, Value>) -> Self {
        let (result, error) = match outcome {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            ver: RPC_VERSION,
            id,
            method: None,
            params: None,
            result,
            error,
        }
    }
}

type Handler = Arc<dyn Fn(Option<Value>, PeerId) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;

#[derive(Default)]
struct State {
    default_peer: Option<PeerId>,
    next_id: u64,
    pending: HashMap<(PeerId, u64), oneshot::Sender<Result<Value, Value>>>,
    handlers: HashMap<String, Handler>,
}

impl State {
    /// Next id not held by an in-flight request to `peer`.
    fn allocate(&mut self, peer: &PeerId) -> u64 {
        loop {
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.pending.contains_key(&(peer.clone(), self.next_id)) {
                return self.next_id;
            }
        }
    }
}

#[derive(Clone)]
pub struct RequestBus {
    bus: MessageBus,
    state: Arc<Mutex<State>>,
    timeout: Option<Duration>,
}

impl RequestBus {
    /// `timeout` of `None` waits for responses indefinitely.
    pub fn new(bus: &MessageBus, timeout: Option<Duration>) -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let inbound = bus.subscribe(MessageKind::Rpc);
        tokio::spawn(serve(inbound, bus.clone(), state.clone()));
        Self {
            bus: bus.clone(),
            state,
            timeout,
        }
    }

    pub fn set_default_peer(&self, peer: &PeerId) {
        lock(&self.state).default_peer = Some(peer.clone());
    }

    /// Method stub bound to the default peer. Fails now if none is configured.
    pub fn call(&self, method: &str) -> Result<RpcMethod, RpcError> {
        let peer = lock(&self.state)
            .default_peer
            .clone()
            .ok_or(RpcError::NoDestination)?;
        Ok(self.call_on(&peer, method))
    }

    /// Method stub bound to an explicit peer.
    pub fn call_on(&self, peer: &PeerId, method: &str) -> RpcMethod {
        RpcMethod {
            rpc: self.clone(),
            peer: peer.clone(),
            method: method.to_string(),
        }
    }

    /// Serve `method`. The handler sees the request params and the caller's identity.
    pub fn bind<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>, PeerId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params, peer| Box::pin(handler(params, peer)));
        lock(&self.state).handlers.insert(method.to_string(), handler);
    }

    pub fn unbind(&self, method: &str) {
        lock(&self.state).handlers.remove(method);
    }

    async fn request(&self, peer: &PeerId, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = lock(&self.state);
            let id = state.allocate(peer);
            state.pending.insert((peer.clone(), id), tx);
            id
        };
        let _guard = PendingGuard {
            state: self.state.clone(),
            key: (peer.clone(), id),
        };
        info!("rpc request [{}] {} to {}", id, method, peer.short());
        let envelope = RpcEnvelope::request(id, method, params);
        self.bus
            .send(peer, MessageKind::Rpc, serde_json::to_value(vec![envelope]).unwrap_or_default());

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                warn!("rpc [{}] {} to {} timed out", id, method, peer.short());
                RpcError::Timeout
            })?,
            None => rx.await,
        };
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(RpcError::Remote(error)),
            Err(_) => Err(RpcError::Closed),
        }
    }
}

/// Frees the request id when the call resolves, times out, or is dropped.
struct PendingGuard {
    state: Arc<Mutex<State>>,
    key: (PeerId, u64),
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.state).pending.remove(&self.key);
    }
}

/// A remote method bound to a destination peer.
#[derive(Clone)]
pub struct RpcMethod {
    rpc: RequestBus,
    peer: PeerId,
    method: String,
}

impl RpcMethod {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub async fn invoke(&self, params: Option<Value>) -> Result<Value, RpcError> {
        self.rpc.request(&self.peer, &self.method, params).await
    }
}

async fn serve(mut inbound: mpsc::UnboundedReceiver<Inbound>, bus: MessageBus, state: Arc<Mutex<State>>) {
    while let Some(Inbound { peer, data }) = inbound.recv().await {
        let Value::Array(items) = data else {
            debug!("rpc payload from {} is not a list", peer.short());
            continue;
        };
        for item in items {
            let envelope: RpcEnvelope = match serde_json::from_value(item) {
                Ok(env) => env,
                Err(e) => {
                    debug!("bad rpc envelope from {}: {}", peer.short(), e);
                    continue;
                }
            };
            if envelope.ver != RPC_VERSION || envelope.id == 0 {
                continue;
            }
            on_envelope(&bus, &state, &peer, envelope);
        }
    }
    // Bus gone: fail every in-flight call.
    lock(&state).pending.clear();
}

fn on_envelope(bus: &MessageBus, state: &Arc<Mutex<State>>, peer: &PeerId, envelope: RpcEnvelope) {
    let id = envelope.id;
    if let Some(method) = envelope.method {
        info!("rpc serve [{}] {} from {}", id, method, peer.short());
        let handler = lock(state).handlers.get(&method).cloned();
        let bus = bus.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let outcome = match handler {
                Some(h) => h(envelope.params, peer.clone()).await,
                None => Err(Value::String(format!("unknown method: {}", method))),
            };
            if let Err(e) = &outcome {
                debug!("rpc [{}] {} failed: {}", id, method, e);
            }
            let reply = RpcEnvelope::response(id, outcome);
            bus.send(&peer, MessageKind::Rpc, serde_json::to_value(vec![reply]).unwrap_or_default());
        });
        return;
    }
    let outcome = match (envelope.result, envelope.error) {
        (_, Some(error)) => Err(error),
        (Some(result), None) => Ok(result),
        (None, None) => return,
    };
    match lock(state).pending.remove(&(peer.clone(), id)) {
        Some(tx) => {
            info!("rpc response [{}] from {}", id, peer.short());
            let _ = tx.send(outcome);
        }
        None => debug!("rpc response [{}] from {} matches no request", id, peer.short()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pair, Pair};
    use serde_json::json;

    #[test]
    fn envelope_shapes() {
        let req = serde_json::to_value(RpcEnvelope::request(3, "add", Some(json!([1, 2])))).unwrap();
        assert_eq!(req, json!({"ver": 1, "id": 3, "method": "add", "params": [1, 2]}));
        let resp = serde_json::to_value(RpcEnvelope::response(3, Ok(Value::Null))).unwrap();
        assert_eq!(resp, json!({"ver": 1, "id": 3, "result": null}));
        let back: RpcEnvelope = serde_json::from_value(resp).unwrap();
        assert_eq!(back.result, Some(Value::Null));
        let err: RpcEnvelope = serde_json::from_value(json!({"ver": 1, "id": 4, "error": "no"})).unwrap();
        assert_eq!(err.error, Some(json!("no")));
        assert_eq!(err.result, None);
    }

    #[test]
    fn ids_skip_in_flight() {
        let mut state = State::default();
        let peer = PeerId::from("p");
        let (tx, _rx) = oneshot::channel();
        state.pending.insert((peer.clone(), 2), tx);
        assert_eq!(state.allocate(&peer), 1);
        assert_eq!(state.allocate(&peer), 3);
    }

    #[tokio::test]
    async fn call_without_destination_fails_immediately() {
        let Pair { a, .. } = pair().await;
        let rpc = RequestBus::new(&MessageBus::new(&a), None);
        assert!(matches!(rpc.call("anything"), Err(RpcError::NoDestination)));
    }

    #[tokio::test]
    async fn request_response_matches_ids() {
        let Pair { a, b, .. } = pair().await;
        let client = RequestBus::new(&MessageBus::new(&a), None);
        let server = RequestBus::new(&MessageBus::new(&b), None);
        server.bind("add", |params, _src| async move {
            let args = params.unwrap_or_default();
            match (args[0].as_i64(), args[1].as_i64()) {
                (Some(x), Some(y)) => Ok(json!(x + y)),
                _ => Err(json!("bad args")),
            }
        });
        server.bind("whoami", |_params, src| async move { Ok(json!(src.as_str())) });

        client.set_default_peer(b.id());
        let add = client.call("add").unwrap();
        let (three, ten) = tokio::join!(add.invoke(Some(json!([1, 2]))), add.invoke(Some(json!([4, 6]))));
        assert_eq!(three.unwrap(), json!(3));
        assert_eq!(ten.unwrap(), json!(10));
        assert_eq!(
            add.invoke(Some(json!(["x"]))).await,
            Err(RpcError::Remote(json!("bad args")))
        );
        let who = client.call_on(b.id(), "whoami").invoke(None).await.unwrap();
        assert_eq!(who, json!(a.id().as_str()));
        assert!(matches!(
            client.call("missing").unwrap().invoke(None).await,
            Err(RpcError::Remote(_))
        ));
        assert!(lock(&client.state).pending.is_empty());
    }

    #[tokio::test]
    async fn stray_response_is_ignored() {
        let Pair { a, b, .. } = pair().await;
        let bus_a = MessageBus::new(&a);
        let client = RequestBus::new(&bus_a, None);
        let bus_b = MessageBus::new(&b);
        let mut requests = bus_b.subscribe(MessageKind::Rpc);

        client.set_default_peer(b.id());
        let call = client.call("slow").unwrap();
        let pending = tokio::spawn(async move { call.invoke(None).await });

        let req = requests.recv().await.unwrap();
        let id = req.data[0]["id"].as_u64().unwrap();
        bus_b.send(a.id(), MessageKind::Rpc, json!([{"ver": 1, "id": id + 100, "result": "stray"}]));
        bus_b.send(a.id(), MessageKind::Rpc, json!([{"ver": 2, "id": id, "result": "old version"}]));
        bus_b.send(a.id(), MessageKind::Rpc, json!([{"ver": 1, "id": id, "result": "real"}]));
        assert_eq!(pending.await.unwrap().unwrap(), json!("real"));
    }

    #[tokio::test]
    async fn timeout_frees_id() {
        let Pair { a, b, .. } = pair().await;
        let client = RequestBus::new(&MessageBus::new(&a), Some(Duration::from_millis(50)));
        // b has no request bus, so nothing answers.
        let result = client.call_on(b.id(), "void").invoke(None).await;
        assert_eq!(result, Err(RpcError::Timeout));
        assert!(lock(&client.state).pending.is_empty());
    }
}
