pub mod memory;
pub mod stream;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::{fmt, io, rc::Rc};
use thiserror::Error;

/// Wire discriminant carried in every frame's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Init = 1,
    Signal = 2,
    PropertyUpdate = 3,
    InvokeMethod = 4,
    ConnectToSignal = 5,
    DisconnectFromSignal = 6,
    SetProperty = 7,
    Response = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match raw {
            1 => Init,
            2 => Signal,
            3 => PropertyUpdate,
            4 => InvokeMethod,
            5 => ConnectToSignal,
            6 => DisconnectFromSignal,
            7 => SetProperty,
            8 => Response,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One frame's worth of protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum Message {
    Init {
        id: u64,
    },
    Signal {
        object: String,
        signal: String,
        args: Vec<Value>,
    },
    PropertyUpdate {
        data: Vec<ObjectUpdate>,
    },
    InvokeMethod {
        id: u64,
        object: String,
        method: String,
        args: Vec<Value>,
    },
    ConnectToSignal {
        id: u64,
        object: String,
        signal: String,
    },
    DisconnectFromSignal {
        id: u64,
        object: String,
        signal: String,
    },
    SetProperty {
        id: u64,
        object: String,
        property: String,
        value: Value,
    },
    /// `data: None` is the "undefined" sentinel: the field was absent on the
    /// wire. A present `null` decodes to `Some(Value::Null)`.
    Response {
        id: u64,
        data: Option<Value>,
    },
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Init { .. } => MessageType::Init,
            Message::Signal { .. } => MessageType::Signal,
            Message::PropertyUpdate { .. } => MessageType::PropertyUpdate,
            Message::InvokeMethod { .. } => MessageType::InvokeMethod,
            Message::ConnectToSignal { .. } => MessageType::ConnectToSignal,
            Message::DisconnectFromSignal { .. } => MessageType::DisconnectFromSignal,
            Message::SetProperty { .. } => MessageType::SetProperty,
            Message::Response { .. } => MessageType::Response,
        }
    }

    /// Correlation id; unsolicited messages have none.
    pub fn id(&self) -> Option<u64> {
        match self {
            Message::Init { id }
            | Message::InvokeMethod { id, .. }
            | Message::ConnectToSignal { id, .. }
            | Message::DisconnectFromSignal { id, .. }
            | Message::SetProperty { id, .. }
            | Message::Response { id, .. } => Some(*id),
            Message::Signal { .. } | Message::PropertyUpdate { .. } => None,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A request as built by a proxy, before the channel gives it an id.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Init,
    InvokeMethod {
        object: String,
        method: String,
        args: Vec<Value>,
    },
    SetProperty {
        object: String,
        property: String,
        value: Value,
    },
    ConnectToSignal {
        object: String,
        signal: String,
    },
    DisconnectFromSignal {
        object: String,
        signal: String,
    },
}

impl Request {
    pub fn kind(&self) -> MessageType {
        match self {
            Request::Init => MessageType::Init,
            Request::InvokeMethod { .. } => MessageType::InvokeMethod,
            Request::SetProperty { .. } => MessageType::SetProperty,
            Request::ConnectToSignal { .. } => MessageType::ConnectToSignal,
            Request::DisconnectFromSignal { .. } => MessageType::DisconnectFromSignal,
        }
    }

    pub(crate) fn into_message(self, id: u64) -> Message {
        match self {
            Request::Init => Message::Init { id },
            Request::InvokeMethod {
                object,
                method,
                args,
            } => Message::InvokeMethod {
                id,
                object,
                method,
                args,
            },
            Request::SetProperty {
                object,
                property,
                value,
            } => Message::SetProperty {
                id,
                object,
                property,
                value,
            },
            Request::ConnectToSignal { object, signal } => Message::ConnectToSignal {
                id,
                object,
                signal,
            },
            Request::DisconnectFromSignal { object, signal } => Message::DisconnectFromSignal {
                id,
                object,
                signal,
            },
        }
    }
}

/// One object's share of a PropertyUpdate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub object: String,
    #[serde(default, deserialize_with = "map_or_null")]
    pub properties: Map<String, Value>,
    /// Signal name to argument sequence.
    #[serde(default, deserialize_with = "map_or_null")]
    pub signals: Map<String, Value>,
}

// A `null` section is an empty one.
fn map_or_null<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Map<String, Value>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("{kind} message without `{field}`")]
    MissingField {
        kind: MessageType,
        field: &'static str,
    },

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: MessageType,
        source: serde_json::Error,
    },
}

/// The flat JSON shape shared by every message kind.
#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<Value>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    value: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    data: Option<Value>,
}

impl Envelope {
    fn bare(kind: MessageType, id: Option<u64>) -> Self {
        Self {
            kind: kind as u8,
            id,
            object: None,
            method: None,
            property: None,
            signal: None,
            args: None,
            value: None,
            data: None,
        }
    }
}

// Keeps `null` distinct from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn required<T>(
    kind: MessageType,
    field: &'static str,
    v: Option<T>,
) -> Result<T, ProtocolError> {
    v.ok_or(ProtocolError::MissingField { kind, field })
}

impl TryFrom<Envelope> for Message {
    type Error = ProtocolError;

    fn try_from(env: Envelope) -> Result<Self, Self::Error> {
        let kind = MessageType::try_from(env.kind)?;
        let id = || required(kind, "id", env.id);
        Ok(match kind {
            MessageType::Init => Message::Init { id: id()? },
            MessageType::Signal => Message::Signal {
                object: required(kind, "object", env.object)?,
                signal: required(kind, "signal", env.signal)?,
                args: env.args.unwrap_or_default(),
            },
            MessageType::PropertyUpdate => {
                let entries: Vec<Value> = match env.data {
                    Some(Value::Null) | None => Vec::new(),
                    Some(data) => serde_json::from_value(data)
                        .map_err(|source| ProtocolError::Payload { kind, source })?,
                };
                let data = entries
                    .into_iter()
                    .filter_map(|entry| match serde_json::from_value::<ObjectUpdate>(entry) {
                        Ok(update) => Some(update),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed update entry");
                            None
                        }
                    })
                    .collect();
                Message::PropertyUpdate { data }
            }
            MessageType::InvokeMethod => Message::InvokeMethod {
                id: id()?,
                object: required(kind, "object", env.object)?,
                method: required(kind, "method", env.method)?,
                args: env.args.unwrap_or_default(),
            },
            MessageType::ConnectToSignal => Message::ConnectToSignal {
                id: id()?,
                object: required(kind, "object", env.object)?,
                signal: required(kind, "signal", env.signal)?,
            },
            MessageType::DisconnectFromSignal => Message::DisconnectFromSignal {
                id: id()?,
                object: required(kind, "object", env.object)?,
                signal: required(kind, "signal", env.signal)?,
            },
            MessageType::SetProperty => Message::SetProperty {
                id: id()?,
                object: required(kind, "object", env.object)?,
                property: required(kind, "property", env.property)?,
                value: env.value.unwrap_or(Value::Null),
            },
            MessageType::Response => Message::Response {
                id: id()?,
                data: env.data,
            },
        })
    }
}

impl From<Message> for Envelope {
    fn from(msg: Message) -> Self {
        let mut env = Envelope::bare(msg.kind(), msg.id());
        match msg {
            Message::Init { .. } => {}
            Message::Signal {
                object,
                signal,
                args,
            } => {
                env.object = Some(object);
                env.signal = Some(signal);
                env.args = Some(args);
            }
            Message::PropertyUpdate { data } => {
                env.data = Some(Value::Array(
                    data.into_iter()
                        .map(|update| {
                            let mut entry = Map::new();
                            entry.insert("object".into(), Value::String(update.object));
                            entry.insert("properties".into(), Value::Object(update.properties));
                            entry.insert("signals".into(), Value::Object(update.signals));
                            Value::Object(entry)
                        })
                        .collect(),
                ));
            }
            Message::InvokeMethod {
                object,
                method,
                args,
                ..
            } => {
                env.object = Some(object);
                env.method = Some(method);
                env.args = Some(args);
            }
            Message::ConnectToSignal { object, signal, .. }
            | Message::DisconnectFromSignal { object, signal, .. } => {
                env.object = Some(object);
                env.signal = Some(signal);
            }
            Message::SetProperty {
                object,
                property,
                value,
                ..
            } => {
                env.object = Some(object);
                env.property = Some(property);
                env.value = Some(value);
            }
            Message::Response { data, .. } => env.data = data,
        }
        env
    }
}

/// An inbound frame as a transport hands it over: still text, or already
/// parsed by the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Json(Value),
}

impl Frame {
    pub fn decode(self) -> Result<Message, serde_json::Error> {
        match self {
            Frame::Text(text) => serde_json::from_str(&text),
            Frame::Json(value) => serde_json::from_value(value),
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_owned())
    }
}

impl From<Value> for Frame {
    fn from(value: Value) -> Self {
        Frame::Json(value)
    }
}

/// Where a transport delivers inbound frames.
pub type MessageHook = Rc<dyn Fn(Frame)>;

/// The channel's view of the wire: send a text frame, and hand inbound frames
/// to whatever hook was installed last.
pub trait Transport {
    fn send(&self, frame: String) -> Result<(), TransportError>;
    fn set_message_hook(&self, hook: MessageHook);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("framing: {0}")]
    Codec(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
