use super::{Frame, MessageHook, Transport, TransportError};
use async_bincode::tokio::AsyncBincodeStream;
use futures::{channel::mpsc, SinkExt, StreamExt};
use std::{cell::RefCell, rc::Rc};
use tokio::io::{AsyncRead, AsyncWrite, BufStream};

type SharedHook = Rc<RefCell<Option<MessageHook>>>;

/// Carries JSON text frames over a byte stream, one length-prefixed bincode
/// string per frame.
///
/// Sends are queued without waiting; nothing moves until the paired
/// [`StreamDriver`] is running.
pub struct StreamTransport {
    outbound: mpsc::UnboundedSender<String>,
    hook: SharedHook,
}

/// Pumps frames between a [`StreamTransport`] and its byte stream.
pub struct StreamDriver<S> {
    io: S,
    outbound: mpsc::UnboundedReceiver<String>,
    hook: SharedHook,
}

impl StreamTransport {
    pub fn new<S>(io: S) -> (Self, StreamDriver<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, rx) = mpsc::unbounded();
        let hook = SharedHook::default();
        let transport = Self {
            outbound: tx,
            hook: hook.clone(),
        };
        let driver = StreamDriver {
            io,
            outbound: rx,
            hook,
        };
        (transport, driver)
    }
}

impl Transport for StreamTransport {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outbound
            .unbounded_send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn set_message_hook(&self, hook: MessageHook) {
        *self.hook.borrow_mut() = Some(hook);
    }
}

impl<S> StreamDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs until the peer hangs up or every [`StreamTransport`] handle is
    /// gone. The hook is `!Send`, so spawn this with `spawn_local`.
    pub async fn run(self) -> Result<(), TransportError> {
        let Self {
            io,
            mut outbound,
            hook,
        } = self;

        let sock =
            AsyncBincodeStream::<_, String, String, _>::from(BufStream::new(io)).for_async();
        let (mut sink, mut inbound) = sock.split();

        loop {
            tokio::select! {
                frame = outbound.next() => match frame {
                    Some(frame) => sink
                        .send(frame)
                        .await
                        .map_err(|e| TransportError::Codec(e.to_string()))?,
                    None => {
                        tracing::debug!("stream transport dropped, closing");
                        break;
                    }
                },
                frame = inbound.next() => match frame {
                    Some(Ok(text)) => {
                        let hook = hook.borrow().clone();
                        match hook {
                            Some(hook) => hook(Frame::Text(text)),
                            None => {
                                tracing::warn!("frame arrived before a hook was installed, dropping")
                            }
                        }
                    }
                    Some(Err(e)) => return Err(TransportError::Codec(e.to_string())),
                    None => {
                        tracing::debug!("peer closed the stream");
                        break;
                    }
                },
            }
        }
        Ok(())
    }
}
