//! Wire protocol shared by both transports.
//!
//! Every call, in either direction, travels as the same JSON object:
//!
//! ```text
//! {"S": bool, "R": relay, "M": method, "A": [args...], "C": connection id}
//! ```
//!
//! `S = true` is a client invoking a server relay method; `S = false` is a
//! call destined for a client-side proxy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "S", default)]
    pub is_server_call: bool,
    #[serde(rename = "R")]
    pub relay: String,
    #[serde(rename = "M")]
    pub method: String,
    #[serde(rename = "A", default)]
    pub arguments: Vec<Value>,
    #[serde(rename = "C", default)]
    pub connection_id: String,
}

impl Envelope {
    /// A call from a client to a method on a server relay.
    pub fn server_call(
        relay: impl Into<String>,
        method: impl Into<String>,
        arguments: Vec<Value>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            is_server_call: true,
            relay: relay.into(),
            method: method.into(),
            arguments,
            connection_id: connection_id.into(),
        }
    }

    /// A call addressed to the client-side proxy of `connection_id`.
    pub fn client_call(
        relay: impl Into<String>,
        method: impl Into<String>,
        arguments: Vec<Value>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            is_server_call: false,
            relay: relay.into(),
            method: method.into(),
            arguments,
            connection_id: connection_id.into(),
        }
    }

    pub fn decode(text: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The transport a client asked for during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "websocket")]
    WebSocket,
    #[serde(rename = "longpoll")]
    LongPoll,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::LongPoll => "longpoll",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websocket" => Ok(TransportKind::WebSocket),
            "longpoll" => Ok(TransportKind::LongPoll),
            other => Err(RelayError::UnknownTransport(other.to_string())),
        }
    }
}

/// Body of a negotiate request: `{"T": "websocket"}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Negotiation {
    #[serde(rename = "T", default)]
    pub transport: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationResponse {
    #[serde(rename = "ConnectionID")]
    pub connection_id: String,
}
