use crate::{
    config::ChannelConfig,
    net::{Frame, Message, MessageHook, ObjectUpdate, Request, Transport, TransportError},
    proxy::{CallError, RemoteObject},
    types::ObjectSchema,
};
use futures::channel::oneshot;
use serde_json::Value;
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tokio::time::{Instant, Sleep};

type ResponseCallback = Box<dyn FnOnce(Option<Value>)>;

/// Owns the transport and pairs every outbound request with its response.
///
/// Created with [`Channel::new`], which immediately sends Init. Once the
/// peer answers, a [`RemoteObject`] is built for every object in the returned
/// schema and the ready callback runs. Cloning is cheap and every clone
/// refers to the same channel.
///
/// Single-threaded: neither the channel nor its proxies are `Send`.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<ChannelInner>,
}

struct ChannelInner {
    transport: Box<dyn Transport>,
    config: ChannelConfig,
    state: RefCell<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    pending: HashMap<u64, ResponseCallback>,
    next_id: u64,
    objects: Registry,
    ready: bool,
}

/// What proxies hold on to, so they never keep their channel alive.
#[derive(Clone)]
pub(crate) struct WeakChannel(Weak<ChannelInner>);

impl WeakChannel {
    pub(crate) fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    pub fn new<T, F>(transport: T, on_ready: F) -> Result<Self, ChannelError>
    where
        T: Transport + 'static,
        F: FnOnce(&Channel) + 'static,
    {
        Self::with_config(transport, ChannelConfig::default(), on_ready)
    }

    pub fn with_config<T, F>(
        transport: T,
        config: ChannelConfig,
        on_ready: F,
    ) -> Result<Self, ChannelError>
    where
        T: Transport + 'static,
        F: FnOnce(&Channel) + 'static,
    {
        let channel = Channel {
            inner: Rc::new(ChannelInner {
                transport: Box::new(transport),
                config,
                state: RefCell::default(),
            }),
        };

        let weak = channel.downgrade();
        let hook: MessageHook = Rc::new(move |frame: Frame| {
            if let Some(channel) = weak.upgrade() {
                channel.receive(frame);
            }
        });
        channel.inner.transport.set_message_hook(hook);

        let weak = channel.downgrade();
        channel.send(Request::Init, move |data| {
            if let Some(channel) = weak.upgrade() {
                channel.finish_init(data, on_ready);
            }
        })?;
        Ok(channel)
    }

    /// Builds a channel and waits for the handshake to complete.
    ///
    /// The transport must be delivering inbound frames while this is awaited,
    /// e.g. a [`StreamDriver`](crate::net::stream::StreamDriver) spawned on
    /// the same `LocalSet`.
    pub async fn connect<T>(transport: T, config: ChannelConfig) -> Result<Self, ChannelError>
    where
        T: Transport + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let timeout = config.call_timeout;
        let channel = Self::with_config(transport, config, move |_| {
            let _ = tx.send(());
        })?;

        let ready = async { rx.await.map_err(|_| ChannelError::InitFailed) };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, ready)
                .await
                .map_err(|_| ChannelError::TimedOut)??,
            None => ready.await?,
        }
        Ok(channel)
    }

    /// Sends `request` under a fresh id; `callback` gets the response payload
    /// (`None` if the peer left `data` out). Returns the id used.
    pub fn send<F>(&self, request: Request, callback: F) -> Result<u64, ChannelError>
    where
        F: FnOnce(Option<Value>) + 'static,
    {
        let kind = request.kind();
        let id = {
            let mut state = self.inner.state.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;
            state.pending.insert(id, Box::new(callback));
            id
        };

        let sent = request
            .into_message(id)
            .to_text()
            .map_err(ChannelError::Encode)
            .and_then(|text| Ok(self.inner.transport.send(text)?));

        if let Err(e) = sent {
            self.inner.state.borrow_mut().pending.remove(&id);
            tracing::warn!(id, %kind, error = %e, "request not sent");
            return Err(e);
        }
        tracing::debug!(id, %kind, "request sent");
        Ok(id)
    }

    /// Like [`send`](Self::send), but hands back a future for the response.
    pub fn request(&self, request: Request) -> Result<PendingReply, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let id = self.send(request, move |data| {
            let _ = tx.send(data);
        })?;
        Ok(PendingReply {
            id,
            rx,
            channel: self.downgrade(),
            timeout: self.inner.config.call_timeout.map(|d| (Instant::now(), d)),
            deadline: None,
            done: false,
        })
    }

    /// Drops the callback waiting on `id`. A response arriving later is
    /// ignored. Returns whether anything was waiting.
    pub fn cancel(&self, id: u64) -> bool {
        self.inner.state.borrow_mut().pending.remove(&id).is_some()
    }

    /// Inbound entry point; transports call this through the installed hook.
    pub fn receive(&self, frame: impl Into<Frame>) {
        let message = match frame.into().decode() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable frame");
                return;
            }
        };

        match message {
            Message::Signal {
                object,
                signal,
                args,
            } => self.handle_signal(&object, &signal, &args),
            Message::Response { id, data } => self.handle_response(id, data),
            Message::PropertyUpdate { data } => self.handle_property_update(data),
            other => {
                tracing::warn!(kind = %other.kind(), "dropping unexpected inbound message")
            }
        }
    }

    fn handle_response(&self, id: u64, data: Option<Value>) {
        let callback = self.inner.state.borrow_mut().pending.remove(&id);
        match callback {
            Some(callback) => callback(data),
            None => tracing::trace!(id, "response for unknown or settled request"),
        }
    }

    fn handle_signal(&self, object: &str, signal: &str, args: &[Value]) {
        match self.object(object) {
            Some(proxy) => {
                tracing::trace!(object, signal, "routing signal");
                proxy.emit(signal, args);
            }
            None => tracing::trace!(object, signal, "signal for unknown object"),
        }
    }

    fn handle_property_update(&self, updates: Vec<ObjectUpdate>) {
        for update in updates {
            match self.object(&update.object) {
                Some(proxy) => proxy.apply_update(update.properties, update.signals),
                None => {
                    tracing::trace!(object = %update.object, "property update for unknown object")
                }
            }
        }
    }

    fn finish_init<F>(&self, data: Option<Value>, on_ready: F)
    where
        F: FnOnce(&Channel),
    {
        let schemas = match data {
            Some(Value::Object(schemas)) => schemas,
            other => {
                tracing::error!(payload = ?other, "init response carried no object map");
                return;
            }
        };

        let mut objects = BTreeMap::new();
        for (name, schema) in schemas {
            match serde_json::from_value::<ObjectSchema>(schema) {
                Ok(schema) => {
                    let proxy = RemoteObject::new(name.clone(), schema, self.downgrade());
                    objects.insert(name, proxy);
                }
                Err(e) => {
                    tracing::warn!(object = %name, error = %e, "skipping undecodable schema")
                }
            }
        }

        {
            let mut state = self.inner.state.borrow_mut();
            state.objects = Registry { objects };
            state.ready = true;
            tracing::debug!(objects = state.objects.len(), "handshake complete");
        }
        on_ready(self);
    }

    /// Every proxied object. Empty until the handshake completes.
    pub fn objects(&self) -> Registry {
        self.inner.state.borrow().objects.clone()
    }

    pub fn object(&self, name: &str) -> Option<RemoteObject> {
        self.inner.state.borrow().objects.get(name)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.borrow().ready
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakChannel {
        WeakChannel(Rc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Channel")
            .field("ready", &state.ready)
            .field("next_id", &state.next_id)
            .field("pending", &state.pending.len())
            .field("objects", &state.objects)
            .finish()
    }
}

/// Object name to proxy, as handed out by the Init response.
#[derive(Clone, Default)]
pub struct Registry {
    objects: BTreeMap<String, RemoteObject>,
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<RemoteObject> {
        self.objects.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RemoteObject)> {
        self.objects.iter().map(|(name, obj)| (name.as_str(), obj))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// The raw response to one request.
///
/// Resolves to the response's `data`, `None` meaning the field was absent.
/// Dropping it before it resolves forgets the request on the channel, so a
/// late response is ignored and nothing stays behind in the pending map.
#[must_use = "dropping a PendingReply cancels it"]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Option<Value>>,
    channel: WeakChannel,
    timeout: Option<(Instant, Duration)>,
    deadline: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn forget(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.cancel(self.id);
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Option<Value>, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(data)) => {
                this.done = true;
                return Poll::Ready(Ok(data));
            }
            // The callback was dropped: cancelled, or the channel went away.
            Poll::Ready(Err(oneshot::Canceled)) => {
                this.done = true;
                return Poll::Ready(Err(CallError::Cancelled));
            }
            Poll::Pending => {}
        }

        if let Some((started, limit)) = this.timeout {
            let deadline = this
                .deadline
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(started + limit)));
            if deadline.as_mut().poll(cx).is_ready() {
                this.done = true;
                this.forget();
                tracing::debug!(id = this.id, ?limit, "reply timed out");
                return Poll::Ready(Err(CallError::TimedOut(limit)));
            }
        }
        Poll::Pending
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.done {
            self.forget();
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("encoding request: {0}")]
    Encode(serde_json::Error),

    #[error("handshake failed: init response carried no usable schema")]
    InitFailed,

    #[error("handshake timed out")]
    TimedOut,

    #[error("channel closed")]
    Closed,
}
