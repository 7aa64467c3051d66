use crate::{
    channel::{Channel, ChannelError, PendingReply, WeakChannel},
    net::Request,
    types::{MethodSchema, NotifySignal, ObjectSchema, PropertySchema, SignalSchema},
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;

/// Stand-in for a positional argument the caller did not supply. Goes out
/// as `null`.
pub const ABSENT: Value = Value::Null;

/// A signal listener; receives the signal's arguments in order.
pub type Listener = Rc<dyn Fn(&[Value])>;

/// Returned by [`RemoteObject::connect`], used to disconnect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Local proxy for one object living on the remote peer.
///
/// Members are looked up by name in tables built from the object's schema.
/// Properties are cached locally: reads never touch the wire and writes are
/// applied to the cache before the peer has seen them, so the cache is only
/// eventually consistent with the remote state.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Rc<ObjectInner>,
}

struct ObjectInner {
    name: String,
    channel: WeakChannel,
    methods: BTreeMap<String, MethodSchema>,
    properties: RefCell<BTreeMap<String, PropertySlot>>,
    signals: RefCell<BTreeMap<String, SignalSlot>>,
    next_listener: Cell<u64>,
}

struct PropertySlot {
    schema: PropertySchema,
    value: Option<Value>,
}

struct SignalSlot {
    schema: SignalSchema,
    listeners: Vec<(ListenerId, Listener)>,
}

impl SignalSlot {
    fn new(schema: SignalSchema) -> Self {
        Self {
            schema,
            listeners: Vec::new(),
        }
    }
}

impl RemoteObject {
    pub(crate) fn new(name: String, schema: ObjectSchema, channel: WeakChannel) -> Self {
        let ObjectSchema {
            methods,
            properties,
            signals,
        } = schema;

        let mut signal_slots: BTreeMap<_, _> = signals
            .into_iter()
            .map(|signal| (signal.name.clone(), SignalSlot::new(signal)))
            .collect();

        let notify: Vec<(String, String)> = properties
            .iter()
            .filter_map(|prop| {
                let signal = prop.notify_signal.as_ref().and_then(NotifySignal::name)?;
                Some((prop.name.clone(), signal.to_owned()))
            })
            .collect();
        for (property, signal) in &notify {
            signal_slots.entry(signal.clone()).or_insert_with(|| {
                tracing::debug!(
                    object = %name, %property, %signal,
                    "declaring undeclared notify signal"
                );
                SignalSlot::new(SignalSchema {
                    name: signal.clone(),
                    param_names: Vec::new(),
                })
            });
        }

        let property_slots = properties
            .into_iter()
            .map(|schema| {
                let slot = PropertySlot {
                    value: schema.value.clone(),
                    schema,
                };
                (slot.schema.name.clone(), slot)
            })
            .collect();

        let object = RemoteObject {
            inner: Rc::new(ObjectInner {
                name,
                channel,
                methods: methods
                    .into_iter()
                    .map(|method| (method.name.clone(), method))
                    .collect(),
                properties: RefCell::new(property_slots),
                signals: RefCell::new(signal_slots),
                next_listener: Cell::new(0),
            }),
        };

        for (property, signal) in notify {
            let listener = notify_listener(Rc::downgrade(&object.inner), property);
            if let Err(e) = object.connect_listener(&signal, listener) {
                tracing::warn!(
                    object = %object.name(), %signal, error = %e,
                    "notify subscription failed"
                );
            }
        }
        object
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn method(&self, name: &str) -> Option<&MethodSchema> {
        self.inner.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.inner.methods.keys().map(String::as_str)
    }

    pub fn property_names(&self) -> Vec<String> {
        self.inner.properties.borrow().keys().cloned().collect()
    }

    pub fn signal_names(&self) -> Vec<String> {
        self.inner.signals.borrow().keys().cloned().collect()
    }

    /// Sends an InvokeMethod for `method`.
    ///
    /// `args` is cut or padded with [`ABSENT`] to the declared parameter
    /// count. Void methods are fire-and-forget and yield
    /// [`Invocation::Sent`]; everything else yields a [`MethodCall`] to await.
    pub fn invoke<I>(&self, method: &str, args: I) -> Result<Invocation, ProxyError>
    where
        I: IntoIterator<Item = Value>,
    {
        let schema = self
            .inner
            .methods
            .get(method)
            .ok_or_else(|| ProxyError::NoSuchMethod(method.to_owned()))?;
        let channel = self.channel()?;

        let mut args: Vec<Value> = args.into_iter().take(schema.arity()).collect();
        args.resize(schema.arity(), ABSENT);

        let request = Request::InvokeMethod {
            object: self.name().to_owned(),
            method: method.to_owned(),
            args,
        };
        if schema.is_void() {
            channel.send(request, |_| {})?;
            Ok(Invocation::Sent)
        } else {
            let reply = channel.request(request)?;
            Ok(Invocation::Pending(MethodCall { reply }))
        }
    }

    /// Invokes `method` and waits for its value. Void methods complete at once
    /// with `null`.
    pub async fn call<I>(&self, method: &str, args: I) -> Result<Value, CallError>
    where
        I: IntoIterator<Item = Value>,
    {
        match self.invoke(method, args)? {
            Invocation::Sent => Ok(Value::Null),
            Invocation::Pending(call) => call.await,
        }
    }

    pub async fn call_as<T, I>(&self, method: &str, args: I) -> Result<T, CallError>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = Value>,
    {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    #[doc(hidden)]
    pub fn encode_arg<T>(arg: &T) -> Result<Value, CallError>
    where
        T: Serialize + ?Sized,
    {
        Ok(serde_json::to_value(arg)?)
    }

    /// The cached value; `None` until the peer has told us one.
    pub fn property(&self, name: &str) -> Result<Option<Value>, ProxyError> {
        self.inner
            .properties
            .borrow()
            .get(name)
            .map(|slot| slot.value.clone())
            .ok_or_else(|| ProxyError::NoSuchProperty(name.to_owned()))
    }

    pub fn property_type(&self, name: &str) -> Option<String> {
        self.inner
            .properties
            .borrow()
            .get(name)
            .map(|slot| slot.schema.type_name.clone())
    }

    /// Writes through to the peer. Returns `false` without sending anything
    /// when `value` equals the cached value. The cache takes the new value
    /// before the SetProperty frame leaves.
    pub fn set_property(&self, name: &str, value: Value) -> Result<bool, ProxyError> {
        let channel = self.channel()?;
        let previous = {
            let mut properties = self.inner.properties.borrow_mut();
            let slot = properties
                .get_mut(name)
                .ok_or_else(|| ProxyError::NoSuchProperty(name.to_owned()))?;
            if slot.value.as_ref().is_some_and(|cached| same_value(cached, &value)) {
                return Ok(false);
            }
            slot.value.replace(value.clone())
        };

        let request = Request::SetProperty {
            object: self.name().to_owned(),
            property: name.to_owned(),
            value,
        };
        if let Err(e) = channel.send(request, |_| {}) {
            if let Some(slot) = self.inner.properties.borrow_mut().get_mut(name) {
                slot.value = previous;
            }
            return Err(e.into());
        }
        Ok(true)
    }

    /// Adds a listener to `signal`. The first listener subscribes on the
    /// peer; later ones only join the local list.
    pub fn connect<F>(&self, signal: &str, listener: F) -> Result<ListenerId, ProxyError>
    where
        F: Fn(&[Value]) + 'static,
    {
        self.connect_listener(signal, Rc::new(listener))
    }

    pub fn connect_listener(
        &self,
        signal: &str,
        listener: Listener,
    ) -> Result<ListenerId, ProxyError> {
        let channel = self.channel()?;
        let id = ListenerId(self.inner.next_listener.get());

        let first = {
            let mut signals = self.inner.signals.borrow_mut();
            let slot = signals
                .get_mut(signal)
                .ok_or_else(|| ProxyError::NoSuchSignal(signal.to_owned()))?;
            slot.listeners.push((id, listener));
            slot.listeners.len() == 1
        };
        self.inner.next_listener.set(id.0 + 1);

        if first {
            let request = Request::ConnectToSignal {
                object: self.name().to_owned(),
                signal: signal.to_owned(),
            };
            if let Err(e) = channel.send(request, |_| {}) {
                self.remove_listener(signal, id);
                return Err(e.into());
            }
            tracing::debug!(object = %self.name(), signal, "subscribed");
        }
        Ok(id)
    }

    /// Removes a listener. Returns `false` if it was not connected. Removing
    /// the last listener unsubscribes on the peer.
    pub fn disconnect(&self, signal: &str, id: ListenerId) -> Result<bool, ProxyError> {
        if !self.inner.signals.borrow().contains_key(signal) {
            return Err(ProxyError::NoSuchSignal(signal.to_owned()));
        }
        let Some(now_empty) = self.remove_listener(signal, id) else {
            return Ok(false);
        };

        if now_empty {
            let request = Request::DisconnectFromSignal {
                object: self.name().to_owned(),
                signal: signal.to_owned(),
            };
            self.channel()?.send(request, |_| {})?;
            tracing::debug!(object = %self.name(), signal, "unsubscribed");
        }
        Ok(true)
    }

    // Some(emptied) if the listener was found.
    fn remove_listener(&self, signal: &str, id: ListenerId) -> Option<bool> {
        let mut signals = self.inner.signals.borrow_mut();
        let slot = signals.get_mut(signal)?;
        let pos = slot.listeners.iter().position(|(l, _)| *l == id)?;
        slot.listeners.remove(pos);
        Some(slot.listeners.is_empty())
    }

    pub fn listener_count(&self, signal: &str) -> usize {
        self.inner
            .signals
            .borrow()
            .get(signal)
            .map_or(0, |slot| slot.listeners.len())
    }

    pub fn signal_params(&self, signal: &str) -> Option<Vec<String>> {
        self.inner
            .signals
            .borrow()
            .get(signal)
            .map(|slot| slot.schema.param_names.clone())
    }

    /// Runs every listener of `signal` in connection order.
    ///
    /// Works on a snapshot of the listener list, so listeners may connect or
    /// disconnect while it runs. A panicking listener is logged and the rest
    /// still run.
    pub fn emit(&self, signal: &str, args: &[Value]) {
        let listeners: Vec<Listener> = match self.inner.signals.borrow().get(signal) {
            Some(slot) => slot.listeners.iter().map(|(_, l)| l.clone()).collect(),
            None => {
                tracing::trace!(object = %self.name(), signal, "emission of undeclared signal");
                return;
            }
        };

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(args))).is_err() {
                tracing::error!(object = %self.name(), signal, "signal listener panicked");
            }
        }
    }

    /// One object's share of a PropertyUpdate: every property lands in the
    /// cache before any signal fires.
    ///
    /// Values go straight into the cache. Unlike clients that assign through
    /// the property setter, no SetProperty is echoed back to the peer.
    pub fn apply_update(&self, properties: Map<String, Value>, signals: Map<String, Value>) {
        {
            let mut cache = self.inner.properties.borrow_mut();
            for (name, value) in properties {
                match cache.get_mut(&name) {
                    Some(slot) => slot.value = Some(value),
                    None => {
                        tracing::trace!(
                            object = %self.name(), property = %name,
                            "update for undeclared property"
                        )
                    }
                }
            }
        }

        for (name, args) in signals {
            let args = match args {
                Value::Array(args) => args,
                Value::Null => Vec::new(),
                arg => vec![arg],
            };
            self.emit(&name, &args);
        }
    }

    fn channel(&self) -> Result<Channel, ProxyError> {
        self.inner
            .channel
            .upgrade()
            .ok_or(ProxyError::Channel(ChannelError::Closed))
    }
}

// Numbers compare by value, so `21` and `21.0` are the same.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_f64() || y.is_f64() => {
            x.as_f64() == y.as_f64()
        }
        _ => a == b,
    }
}

fn notify_listener(object: Weak<ObjectInner>, property: String) -> Listener {
    Rc::new(move |args: &[Value]| {
        let Some(object) = object.upgrade() else {
            return;
        };
        let mut properties = object.properties.borrow_mut();
        if let Some(slot) = properties.get_mut(&property) {
            slot.value = args.first().cloned();
        }
    })
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("name", &self.inner.name)
            .field("methods", &self.inner.methods.keys().collect::<Vec<_>>())
            .field("properties", &self.property_names())
            .field("signals", &self.signal_names())
            .finish()
    }
}

/// What [`RemoteObject::invoke`] started.
#[must_use]
pub enum Invocation {
    /// Void method: sent, nothing to wait for.
    Sent,
    Pending(MethodCall),
}

impl Invocation {
    pub fn is_pending(&self) -> bool {
        matches!(self, Invocation::Pending(_))
    }

    pub fn into_call(self) -> Option<MethodCall> {
        match self {
            Invocation::Sent => None,
            Invocation::Pending(call) => Some(call),
        }
    }
}

/// Reply to a value-returning method. Fails with [`CallError::Rejected`]
/// when the response has no `data`.
#[must_use = "dropping a MethodCall cancels it"]
pub struct MethodCall {
    reply: PendingReply,
}

impl MethodCall {
    pub fn id(&self) -> u64 {
        self.reply.id()
    }
}

impl Future for MethodCall {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|reply| reply.and_then(|data| data.ok_or(CallError::Rejected)))
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no method `{0}`")]
    NoSuchMethod(String),

    #[error("no property `{0}`")]
    NoSuchProperty(String),

    #[error("no signal `{0}`")]
    NoSuchSignal(String),

    #[error("channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("decoding value: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("remote call produced no value")]
    Rejected,

    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    #[error("call cancelled before a reply arrived")]
    Cancelled,

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("decoding value: {0}")]
    Decode(#[from] serde_json::Error),
}
