//! Client side of a remote-object channel.
//!
//! A [`Channel`] asks the peer for the schema of every object it exports and
//! builds a [`RemoteObject`] proxy for each. Proxies invoke remote methods,
//! cache remote properties and relay remote signals to local listeners. The
//! wire is any [`Transport`] that can move JSON text frames.

pub mod channel;
pub mod config;
pub mod interface;
mod macros;
pub mod net;
pub mod proxy;
pub mod types;

pub use channel::{Channel, ChannelError, PendingReply, Registry};
pub use config::ChannelConfig;
pub use interface::{PropertyRef, SignalRef};
pub use net::{Frame, Message, MessageHook, MessageType, Request, Transport, TransportError};
pub use proxy::{
    CallError, Invocation, Listener, ListenerId, MethodCall, ProxyError, RemoteObject,
};
pub use serde_json::Value;
pub use types::{MethodSchema, ObjectSchema, PropertySchema, SignalSchema};
