#![allow(dead_code)]

use serde_json::{json, Value};
use webchannel::{
    net::memory::{self, MemoryPeer},
    remote_interface, Channel, Message,
};

remote_interface! {
    /// The calculator object the test peers export.
    pub struct Calculator {
        fn add(a: i64, b: i64) -> i64;
        fn reset() -> ();
        fn lookup(key: String) -> Option<String>;
        property count: i64;
        property label: String;
        signal count_changed as "countChanged";
        signal overflow;
    }
}

pub fn calc_schema() -> Value {
    json!({
        "calc": {
            "methods": [
                {"name": "add", "paramNames": ["a", "b"], "returnType": "int"},
                {"name": "reset", "paramNames": [], "returnType": ""},
                {"name": "lookup", "paramNames": ["key"], "returnType": "QString"}
            ],
            "properties": [
                {"name": "count", "type": "int", "notifySignal": "countChanged"},
                {"name": "label", "type": "QString"}
            ],
            "signals": [
                {"name": "countChanged", "paramNames": ["count"]},
                {"name": "overflow", "paramNames": ["limit", "value"]}
            ]
        }
    })
}

pub fn no_args() -> Vec<Value> {
    Vec::new()
}

/// Runs the Init exchange over an in-memory link, then answers whatever the
/// channel sent while building its proxies so nothing is left pending.
pub fn handshake(schema: Value) -> (Channel, MemoryPeer) {
    let (transport, peer) = memory::pair();
    let channel = Channel::new(transport, |_| {}).unwrap();
    assert_eq!(peer.take_sent(), vec![Message::Init { id: 0 }]);
    respond(&peer, 0, schema);
    assert!(channel.is_ready());
    for id in peer.take_sent().iter().filter_map(Message::id) {
        respond_undefined(&peer, id);
    }
    assert_eq!(channel.pending_requests(), 0);
    (channel, peer)
}

pub fn respond(peer: &MemoryPeer, id: u64, data: Value) {
    assert!(peer.deliver(json!({"type": 8, "id": id, "data": data})));
}

pub fn respond_undefined(peer: &MemoryPeer, id: u64) {
    assert!(peer.deliver(json!({"type": 8, "id": id})));
}

/// The id of the single frame sent since the last drain.
pub fn only_request_id(peer: &MemoryPeer) -> u64 {
    let sent = peer.take_sent();
    assert_eq!(sent.len(), 1, "expected exactly one frame, got {sent:?}");
    sent[0].id().unwrap()
}
