mod common;

use common::{calc_schema, handshake, no_args, respond, respond_undefined};
use serde_json::{json, Value};
use std::{cell::RefCell, rc::Rc};
use webchannel::{
    CallError, Channel, ChannelError, Frame, Message, MessageHook, ProxyError, RemoteObject,
    Transport, TransportError,
};

#[tokio::test]
async fn add_resolves_with_the_response_payload() {
    let (channel, peer) = handshake(json!({
        "calc": {
            "methods": [{"name": "add", "paramNames": ["a", "b"], "returnType": "int"}],
            "properties": [],
            "signals": []
        }
    }));
    let calc = channel.object("calc").unwrap();

    let call = calc
        .invoke("add", [json!(2), json!(3)])
        .unwrap()
        .into_call()
        .unwrap();

    let frames = peer.take_frames();
    assert_eq!(frames.len(), 1);
    let wire: Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(
        wire,
        json!({"type": 4, "id": 1, "object": "calc", "method": "add", "args": [2, 3]})
    );

    peer.deliver(json!({"type": 8, "id": 1, "data": 5}));
    assert_eq!(call.await.unwrap(), json!(5));
}

#[test]
fn arguments_are_cut_or_padded_to_the_declared_count() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();

    let _short = calc.invoke("lookup", no_args()).unwrap();
    let _long = calc.invoke("add", [json!(1), json!(2), json!(3)]).unwrap();
    let _falsy = calc.invoke("add", [json!(0)]).unwrap();

    let args: Vec<_> = peer
        .take_sent()
        .into_iter()
        .map(|msg| match msg {
            Message::InvokeMethod { args, .. } => args,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(
        args,
        vec![
            vec![Value::Null],
            vec![json!(1), json!(2)],
            vec![json!(0), Value::Null],
        ]
    );
}

#[tokio::test]
async fn void_methods_are_fire_and_forget() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();

    let invocation = calc.invoke("reset", no_args()).unwrap();
    assert!(!invocation.is_pending());
    assert!(invocation.into_call().is_none());
    assert!(matches!(
        peer.take_sent().as_slice(),
        [Message::InvokeMethod { method, args, .. }] if method == "reset" && args.is_empty()
    ));

    assert_eq!(calc.call("reset", no_args()).await.unwrap(), Value::Null);
}

#[tokio::test]
async fn undefined_reply_rejects_but_null_resolves() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();

    let undefined = calc
        .invoke("lookup", [json!("a")])
        .unwrap()
        .into_call()
        .unwrap();
    let null = calc
        .invoke("lookup", [json!("b")])
        .unwrap()
        .into_call()
        .unwrap();

    respond_undefined(&peer, undefined.id());
    respond(&peer, null.id(), Value::Null);

    assert!(matches!(undefined.await, Err(CallError::Rejected)));
    assert_eq!(null.await.unwrap(), Value::Null);
}

#[test]
fn unknown_members_fail_locally() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();

    assert!(matches!(
        calc.invoke("divide", no_args()),
        Err(ProxyError::NoSuchMethod(name)) if name == "divide"
    ));
    assert!(matches!(
        calc.set_property("missing", json!(1)),
        Err(ProxyError::NoSuchProperty(_))
    ));
    assert!(matches!(
        calc.connect("missing", |_| {}),
        Err(ProxyError::NoSuchSignal(_))
    ));
    assert_eq!(peer.pending_frames(), 0);
}

#[test]
fn setting_the_cached_value_sends_nothing() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();
    assert_eq!(calc.property("label").unwrap(), None);

    assert!(calc.set_property("label", json!("ready")).unwrap());
    assert_eq!(calc.property("label").unwrap(), Some(json!("ready")));
    assert!(matches!(
        peer.take_sent().as_slice(),
        [Message::SetProperty { property, value, .. }] if property == "label" && value == "ready"
    ));

    assert!(!calc.set_property("label", json!("ready")).unwrap());
    assert_eq!(peer.pending_frames(), 0);

    assert!(calc.set_property("label", json!("done")).unwrap());
    assert_eq!(peer.pending_frames(), 1);
}

#[test]
fn second_listener_does_not_resubscribe() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();

    let first = calc.connect("overflow", |_| {}).unwrap();
    assert!(matches!(
        peer.take_sent().as_slice(),
        [Message::ConnectToSignal { object, signal, .. }] if object == "calc" && signal == "overflow"
    ));

    let second = calc.connect("overflow", |_| {}).unwrap();
    assert_eq!(peer.pending_frames(), 0);
    assert_eq!(calc.listener_count("overflow"), 2);

    assert!(calc.disconnect("overflow", first).unwrap());
    assert_eq!(peer.pending_frames(), 0);
    assert!(!calc.disconnect("overflow", first).unwrap());

    assert!(calc.disconnect("overflow", second).unwrap());
    assert!(matches!(
        peer.take_sent().as_slice(),
        [Message::DisconnectFromSignal { signal, .. }] if signal == "overflow"
    ));

    assert!(!calc.disconnect("overflow", second).unwrap());
    assert_eq!(peer.pending_frames(), 0);

    // resubscribes from scratch
    calc.connect("overflow", |_| {}).unwrap();
    assert_eq!(peer.take_sent().len(), 1);
}

#[test]
fn listeners_run_in_connection_order() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();
    let calls = Rc::new(RefCell::new(Vec::new()));

    for tag in ["a", "b", "c"] {
        let calls = calls.clone();
        calc.connect("overflow", move |args| {
            calls.borrow_mut().push((tag, args.to_vec()))
        })
        .unwrap();
    }

    peer.deliver(json!({"type": 2, "object": "calc", "signal": "overflow", "args": [10, 11]}));

    let expected: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|tag| (tag, vec![json!(10), json!(11)]))
        .collect();
    assert_eq!(*calls.borrow(), expected);
}

#[test]
fn a_panicking_listener_does_not_stop_the_rest() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();
    let reached = Rc::new(RefCell::new(false));

    calc.connect("overflow", |_| panic!("listener blew up")).unwrap();
    let flag = reached.clone();
    calc
        .connect("overflow", move |_| *flag.borrow_mut() = true)
        .unwrap();

    peer.deliver(json!({"type": 2, "object": "calc", "signal": "overflow", "args": []}));
    assert!(*reached.borrow());
}

#[test]
fn listeners_may_disconnect_during_emission() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();
    let runs = Rc::new(RefCell::new(0));

    let own_id = Rc::new(RefCell::new(None));
    let (object, slot, counter) = (calc.clone(), own_id.clone(), runs.clone());
    let id = calc
        .connect("overflow", move |_| {
            *counter.borrow_mut() += 1;
            if let Some(id) = slot.borrow_mut().take() {
                object.disconnect("overflow", id).unwrap();
            }
        })
        .unwrap();
    *own_id.borrow_mut() = Some(id);

    let signal = json!({"type": 2, "object": "calc", "signal": "overflow", "args": []});
    peer.deliver(signal.clone());
    peer.deliver(signal);

    assert_eq!(*runs.borrow(), 1);
    assert_eq!(calc.listener_count("overflow"), 0);
}

#[test]
fn notify_signal_subscribes_during_handshake() {
    let (transport, peer) = webchannel::net::memory::pair();
    let channel = Channel::new(transport, |_| {}).unwrap();
    peer.take_frames();
    respond(&peer, 0, calc_schema());

    assert_eq!(
        peer.take_sent(),
        vec![Message::ConnectToSignal {
            id: 1,
            object: "calc".into(),
            signal: "countChanged".into()
        }]
    );
    assert_eq!(channel.object("calc").unwrap().listener_count("countChanged"), 1);
}

#[test]
fn property_update_refreshes_cache_then_notifies() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (object, log) = (calc.clone(), seen.clone());
    calc.connect("countChanged", move |args| {
        let cached = object.property("count").unwrap();
        log.borrow_mut().push((args.to_vec(), cached));
    })
    .unwrap();
    // already subscribed on behalf of the `count` property
    assert_eq!(peer.pending_frames(), 0);

    peer.deliver(json!({
        "type": 3,
        "data": [{"object": "calc", "properties": {"count": 7}, "signals": {"countChanged": [7]}}]
    }));

    assert_eq!(calc.property("count").unwrap(), Some(json!(7)));
    assert_eq!(*seen.borrow(), vec![(vec![json!(7)], Some(json!(7)))]);
    // cache writes from the peer are not echoed back
    assert_eq!(peer.pending_frames(), 0);
}

#[test]
fn bundled_property_writes_land_before_any_signal() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();
    let seen = Rc::new(RefCell::new(None));

    let (object, slot) = (calc.clone(), seen.clone());
    calc.connect("overflow", move |_| {
        *slot.borrow_mut() = object.property("label").unwrap();
    })
    .unwrap();

    peer.deliver(json!({
        "type": 3,
        "data": [{"object": "calc", "signals": {"overflow": [1, 2]}, "properties": {"label": "full"}}]
    }));

    assert_eq!(*seen.borrow(), Some(json!("full")));
}

#[test]
fn notify_signal_alone_refreshes_cache() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();

    peer.deliver(json!({"type": 2, "object": "calc", "signal": "countChanged", "args": [42]}));
    assert_eq!(calc.property("count").unwrap(), Some(json!(42)));

    peer.deliver(json!({"type": 2, "object": "calc", "signal": "countChanged", "args": []}));
    assert_eq!(calc.property("count").unwrap(), None);
}

#[test]
fn messages_for_unknown_objects_are_ignored() {
    let (channel, peer) = handshake(calc_schema());

    peer.deliver(json!({"type": 2, "object": "ghost", "signal": "overflow", "args": [1]}));
    peer.deliver(json!({
        "type": 3,
        "data": [
            {"object": "ghost", "properties": {"count": 1}},
            {"object": "calc", "properties": {"count": 3}}
        ]
    }));

    assert!(channel.object("ghost").is_none());
    assert_eq!(
        channel.object("calc").unwrap().property("count").unwrap(),
        Some(json!(3))
    );
}

#[test]
fn schema_values_seed_the_cache() {
    let (channel, _peer) = handshake(json!({
        "thermo": {
            "properties": [
                {"name": "celsius", "type": "double", "notifySignal": ["celsiusChanged", 4], "value": 21.5}
            ]
        }
    }));
    let thermo = channel.object("thermo").unwrap();

    assert_eq!(thermo.property("celsius").unwrap(), Some(json!(21.5)));
    assert_eq!(thermo.property_type("celsius").as_deref(), Some("double"));
    // undeclared notify signal gets declared implicitly
    assert_eq!(thermo.signal_names(), ["celsiusChanged"]);
}

#[test]
fn numbers_compare_by_value_when_setting() {
    let (channel, peer) = handshake(json!({
        "thermo": {
            "properties": [{"name": "celsius", "type": "double"}]
        }
    }));
    let thermo = channel.object("thermo").unwrap();

    peer.deliver(json!({
        "type": 3,
        "data": [{"object": "thermo", "properties": {"celsius": 21}}]
    }));
    assert!(!thermo.set_property("celsius", json!(21.0)).unwrap());
    assert_eq!(peer.pending_frames(), 0);

    let celsius = webchannel::PropertyRef::<f64>::new(&thermo, "celsius");
    assert!(!celsius.set(&21.0).unwrap());
    assert_eq!(peer.pending_frames(), 0);

    assert!(celsius.set(&21.5).unwrap());
    assert!(!thermo.set_property("celsius", json!(21.5)).unwrap());
    assert_eq!(peer.take_sent().len(), 1);
}

#[test]
fn a_malformed_update_entry_spares_its_siblings() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();
    let fired = Rc::new(RefCell::new(0));
    let counter = fired.clone();
    calc
        .connect("overflow", move |_| *counter.borrow_mut() += 1)
        .unwrap();

    peer.deliver(json!({
        "type": 3,
        "data": [
            {"object": "calc", "properties": {"count": 3}},
            {"object": "calc", "properties": {"label": "x"}, "signals": null},
            {"object": ["not", "a", "name"], "properties": {"count": 99}},
            {"object": "calc", "properties": null, "signals": {"overflow": []}}
        ]
    }));

    assert_eq!(calc.property("count").unwrap(), Some(json!(3)));
    assert_eq!(calc.property("label").unwrap(), Some(json!("x")));
    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn fire_and_forget_replies_free_their_slots() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();

    calc.set_property("label", json!("x")).unwrap();
    let id = calc.connect("overflow", |_| {}).unwrap();
    assert!(!calc.invoke("reset", no_args()).unwrap().is_pending());
    calc.disconnect("overflow", id).unwrap();

    let ids: Vec<u64> = peer.take_sent().iter().filter_map(Message::id).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(channel.pending_requests(), 4);

    for id in ids {
        respond_undefined(&peer, id);
    }
    assert_eq!(channel.pending_requests(), 0);
}

#[test]
fn proxies_report_a_closed_channel() {
    let (channel, _peer) = handshake(calc_schema());
    let calc: RemoteObject = channel.object("calc").unwrap();
    drop(channel);

    assert!(matches!(
        calc.invoke("add", no_args()),
        Err(ProxyError::Channel(ChannelError::Closed))
    ));
    // reads still work off the cache
    assert_eq!(calc.property("label").unwrap(), None);
}

/// Records, for every outbound frame, what the proxy's `label` cache held at
/// the moment the frame was handed to the transport.
#[derive(Clone, Default)]
struct SpyTransport {
    hook: Rc<RefCell<Option<MessageHook>>>,
    watched: Rc<RefCell<Option<RemoteObject>>>,
    seen: Rc<RefCell<Vec<(Message, Option<Value>)>>>,
}

impl Transport for SpyTransport {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        let cached = self
            .watched
            .borrow()
            .as_ref()
            .and_then(|object| object.property("label").unwrap());
        let message = Frame::Text(frame).decode().unwrap();
        self.seen.borrow_mut().push((message, cached));
        Ok(())
    }

    fn set_message_hook(&self, hook: MessageHook) {
        *self.hook.borrow_mut() = Some(hook);
    }
}

#[test]
fn cache_is_updated_before_the_frame_leaves() {
    let transport = SpyTransport::default();
    let spy = transport.clone();
    let channel = Channel::new(transport, |_| {}).unwrap();

    let hook = spy.hook.borrow().clone().unwrap();
    hook(json!({"type": 8, "id": 0, "data": calc_schema()}).into());
    *spy.watched.borrow_mut() = channel.object("calc");

    let calc = channel.object("calc").unwrap();
    calc.set_property("label", json!("x")).unwrap();

    let seen = spy.seen.borrow();
    let (message, cached) = seen.last().unwrap();
    assert!(matches!(message, Message::SetProperty { value, .. } if value == "x"));
    assert_eq!(cached, &Some(json!("x")));
}

#[tokio::test]
async fn responses_settle_the_right_call_when_reordered() {
    let (channel, peer) = handshake(calc_schema());
    let calc = channel.object("calc").unwrap();

    let slow = calc
        .invoke("add", [json!(1), json!(1)])
        .unwrap()
        .into_call()
        .unwrap();
    let fast = calc
        .invoke("add", [json!(2), json!(2)])
        .unwrap()
        .into_call()
        .unwrap();

    respond(&peer, fast.id(), json!(4));
    respond(&peer, slow.id(), json!(2));

    assert_eq!(slow.await.unwrap(), json!(2));
    assert_eq!(fast.await.unwrap(), json!(4));
    assert_eq!(channel.pending_requests(), 0);
}
