//! WebSocket relay frames: one JSON object per text message, tagged by `op`.
//! Payloads are opaque bytes carried as base64.

use bytes::Bytes;
use data_encoding::BASE64;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RelayFrame {
    Subscribe {
        id: u64,
        topic: String,
    },
    Unsubscribe {
        id: u64,
        topic: String,
    },
    Publish {
        id: u64,
        topic: String,
        payload: String,
    },
    /// Broker reply to a request with the same id.
    Ack {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Broker delivery of a publish on a subscribed topic.
    Message {
        topic: String,
        payload: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RelayWireError {
    #[error("bad frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad payload encoding: {0}")]
    Payload(#[from] data_encoding::DecodeError),
}

impl RelayFrame {
    pub fn publish(id: u64, topic: &str, payload: &[u8]) -> Self {
        RelayFrame::Publish {
            id,
            topic: topic.to_string(),
            payload: BASE64.encode(payload),
        }
    }

    pub fn message(topic: &str, payload: &[u8]) -> Self {
        RelayFrame::Message {
            topic: topic.to_string(),
            payload: BASE64.encode(payload),
        }
    }

    pub fn ack(id: u64, error: Option<String>) -> Self {
        RelayFrame::Ack { id, error }
    }

    pub fn parse(text: &str) -> Result<Self, RelayWireError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, RelayWireError> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn decode_payload(payload: &str) -> Result<Bytes, RelayWireError> {
    Ok(Bytes::from(BASE64.decode(payload.as_bytes())?))
}
