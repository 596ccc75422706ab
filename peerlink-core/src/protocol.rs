//! Relay wire protocol: signaling envelopes, session descriptions, presence notifications.
//! Relay payloads are UTF-8 JSON; see `signaling` for the optional sealing layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::PeerId;

/// Label of the single data channel negotiated per peer pair. Channels with other labels are ignored.
pub const DATA_CHANNEL_LABEL: &str = "dc:peerlink";

/// Envelope type carried on a peer's relay topic.
pub const SIGNALING_TYPE: &str = "signaling";

/// Signaling envelope discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Heartbeat,
    Open,
    Error,
    IdTaken,
    InvalidKey,
    Leave,
    Expire,
}

/// One negotiation message between two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: Value,
}

impl SignalEnvelope {
    pub fn new(kind: SignalKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

/// Batch of signaling envelopes published to the destination peer's topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub src: PeerId,
    #[serde(default)]
    pub data: Vec<Value>,
}

impl RelayEnvelope {
    pub fn signaling(src: PeerId, batch: Vec<SignalEnvelope>) -> Self {
        let data = batch
            .into_iter()
            .filter_map(|env| serde_json::to_value(env).ok())
            .collect();
        Self {
            kind: SIGNALING_TYPE.to_string(),
            src,
            data,
        }
    }

    /// Decoded envelopes, in batch order. Entries with an unknown or malformed type are skipped.
    pub fn signals(&self) -> Vec<SignalEnvelope> {
        self.data
            .iter()
            .filter_map(|v| match serde_json::from_value::<SignalEnvelope>(v.clone()) {
                Ok(env) => Some(env),
                Err(e) => {
                    tracing::debug!("ignoring signal entry from {}: {}", self.src.short(), e);
                    None
                }
            })
            .collect()
    }

    pub fn is_signaling(&self) -> bool {
        self.kind == SIGNALING_TYPE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Whether the originator negotiated media tracks or a data channel only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Media,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE configuration handed to the direct transport. Also sent alongside an offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl IceConfig {
    pub fn from_urls(urls: &[String]) -> Self {
        Self {
            ice_servers: urls
                .iter()
                .map(|u| IceServer {
                    urls: vec![u.clone()],
                    username: None,
                    credential: None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<IceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

/// Presence notification published on `{identity}:notify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Value,
}

impl NotifyMessage {
    pub const CONNECTED: &'static str = "connected";
    pub const DISCONNECTED: &'static str = "disconnected";

    pub fn new(kind: impl Into<String>, message: Value) -> Self {
        Self {
            kind: kind.into(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signal_kind_wire_names() {
        let env = SignalEnvelope::new(SignalKind::IdTaken, Value::Null);
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "id-taken");
        let parsed: SignalEnvelope =
            serde_json::from_value(json!({"type": "candidate", "payload": {"x": 1}})).unwrap();
        assert_eq!(parsed.kind, SignalKind::Candidate);
    }

    #[test]
    fn relay_envelope_shape() {
        let env = RelayEnvelope::signaling(
            PeerId::from("a"),
            vec![SignalEnvelope::new(SignalKind::Heartbeat, json!({}))],
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "signaling");
        assert_eq!(v["src"], "a");
        assert_eq!(v["data"][0]["type"], "heartbeat");
    }

    #[test]
    fn unknown_signal_entries_skipped() {
        let env: RelayEnvelope = serde_json::from_value(json!({
            "type": "signaling",
            "src": "b",
            "data": [{"type": "bogus"}, {"type": "leave", "payload": null}]
        }))
        .unwrap();
        let signals = env.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::Leave);
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["sdpMid"], "0");
        assert_eq!(v["sdpMLineIndex"], 0);
        assert!(v.get("usernameFragment").is_none());
    }

    #[test]
    fn offer_payload_carries_type_and_config() {
        let offer = OfferPayload {
            sdp: SessionDescription::offer("v=0"),
            connection_type: ConnectionType::Data,
            config: Some(IceConfig::from_urls(&["stun:example.org".into()])),
        };
        let v = serde_json::to_value(&offer).unwrap();
        assert_eq!(v["type"], "data");
        assert_eq!(v["sdp"]["type"], "offer");
        assert_eq!(v["config"]["iceServers"][0]["urls"][0], "stun:example.org");
    }
}
