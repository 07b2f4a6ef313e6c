//! Wire messages exchanged with the relay over the tunnel connection.
//!
//! Every frame is a JSON object whose `type` field selects the variant.
//! Field names are camelCase on the wire.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum accepted frame size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Path of the duplex endpoint, relative to the configured base URL
pub const TUNNEL_PATH: &str = "/ws/tunnel";

/// Header map as carried on the wire (name -> value)
pub type Headers = BTreeMap<String, String>;

const KNOWN_TYPES: &[&str] = &[
    "CONNECT",
    "CONNECTED",
    "ERROR",
    "PING",
    "PONG",
    "REQUEST",
    "RESPONSE",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame of {0} bytes exceeds the 16 MB limit")]
    TooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no `type` field")]
    MissingTag,

    #[error("frame `type` field is not a string")]
    InvalidTag,

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("invalid {kind} message: {reason}")]
    InvalidFields { kind: String, reason: String },
}

impl DecodeError {
    /// Unknown message types are skipped rather than treated as corruption.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, DecodeError::UnknownType(_))
    }
}

/// A tunnel protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// Handshake sent by the client once the transport is open
    #[serde(rename_all = "camelCase")]
    Connect {
        token: String,
        tunnel_id: String,
        local_port: u16,
    },
    /// Handshake accepted
    #[serde(rename_all = "camelCase")]
    Connected {
        tunnel_id: String,
        #[serde(default)]
        message: String,
    },
    /// Relay-side failure, including handshake rejection
    Error { message: String },
    /// Keepalive ping from the relay
    Ping,
    /// Keepalive reply
    Pong,
    /// Inbound HTTP request to forward locally
    Request(RequestMessage),
    /// Result of a forwarded request
    Response(ResponseMessage),
}

/// How a string body is encoded on the wire. Absent means plain text or JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// Raw bytes that are not valid UTF-8, standard base64
    Base64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default, deserialize_with = "lenient_headers")]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<BodyEncoding>,
    #[serde(default)]
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<BodyEncoding>,
}

impl WireMessage {
    /// Decode a single frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(DecodeError::TooLarge(bytes.len()));
        }

        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let tag = match value.as_object() {
            None => return Err(DecodeError::NotAnObject),
            Some(obj) => match obj.get("type") {
                None => return Err(DecodeError::MissingTag),
                Some(Value::String(tag)) => tag.clone(),
                Some(_) => return Err(DecodeError::InvalidTag),
            },
        };

        if !KNOWN_TYPES.contains(&tag.as_str()) {
            return Err(DecodeError::UnknownType(tag));
        }

        serde_json::from_value(value).map_err(|e| DecodeError::InvalidFields {
            kind: tag,
            reason: e.to_string(),
        })
    }

    /// Encode into a text frame.
    pub fn encode(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Protocol(e.to_string()))
    }

    /// Wire tag of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Connect { .. } => "CONNECT",
            WireMessage::Connected { .. } => "CONNECTED",
            WireMessage::Error { .. } => "ERROR",
            WireMessage::Ping => "PING",
            WireMessage::Pong => "PONG",
            WireMessage::Request(_) => "REQUEST",
            WireMessage::Response(_) => "RESPONSE",
        }
    }
}

/// Accept header values that are strings, numbers or booleans; drop the rest.
fn lenient_headers<'de, D>(deserializer: D) -> Result<Headers, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, value)| scalar_to_string(&value).map(|v| (name, v)))
        .collect())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Ordered query parameters. Repeated keys are allowed.
///
/// On the wire this is a JSON object; a key with several values is
/// carried as an array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query(Vec<(String, String)>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Query {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Query(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Group by key, keeping first-seen key order.
        let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
        for (key, value) in &self.0 {
            match grouped.iter_mut().find(|(k, _)| *k == key.as_str()) {
                Some((_, values)) => values.push(value.as_str()),
                None => grouped.push((key.as_str(), vec![value.as_str()])),
            }
        }

        let mut map = serializer.serialize_map(Some(grouped.len()))?;
        for (key, values) in grouped {
            if let [single] = values.as_slice() {
                map.serialize_entry(key, single)?;
            } else {
                map.serialize_entry(key, &values)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Query {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(QueryVisitor)
    }
}

struct QueryVisitor;

impl<'de> Visitor<'de> for QueryVisitor {
    type Value = Query;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of query parameters")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Query, E> {
        Ok(Query::new())
    }

    fn visit_none<E: de::Error>(self) -> Result<Query, E> {
        Ok(Query::new())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Query, A::Error> {
        let mut query = Query::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            match value {
                Value::Array(items) => {
                    for item in &items {
                        if let Some(v) = scalar_to_string(item) {
                            query.push(key.clone(), v);
                        }
                    }
                }
                other => {
                    if let Some(v) = scalar_to_string(&other) {
                        query.push(key, v);
                    }
                }
            }
        }
        Ok(query)
    }
}
