//! In-process transport: frames sent by the channel queue up on the
//! [`MemoryPeer`] side, and the peer delivers inbound frames by calling
//! straight into the channel's hook.

use super::{Frame, Message, MessageHook, Transport, TransportError};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

#[derive(Default)]
struct Shared {
    sent: RefCell<VecDeque<String>>,
    hook: RefCell<Option<MessageHook>>,
    closed: Cell<bool>,
}

/// The channel's end of an in-memory link.
pub struct MemoryTransport {
    shared: Rc<Shared>,
}

/// The remote end of an in-memory link, driven by hand.
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Rc<Shared>,
}

pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let shared = Rc::new(Shared::default());
    (
        MemoryTransport {
            shared: shared.clone(),
        },
        MemoryPeer { shared },
    )
}

impl Transport for MemoryTransport {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.shared.closed.get() {
            return Err(TransportError::Closed);
        }
        self.shared.sent.borrow_mut().push_back(frame);
        Ok(())
    }

    fn set_message_hook(&self, hook: MessageHook) {
        *self.shared.hook.borrow_mut() = Some(hook);
    }
}

impl MemoryPeer {
    /// Hands a frame to the channel. Returns false if no hook is installed or
    /// the link is closed.
    pub fn deliver(&self, frame: impl Into<Frame>) -> bool {
        if self.shared.closed.get() {
            return false;
        }
        let hook = self.shared.hook.borrow().clone();
        match hook {
            Some(hook) => {
                hook(frame.into());
                true
            }
            None => false,
        }
    }

    /// Drains every frame the channel has sent so far, as raw text.
    pub fn take_frames(&self) -> Vec<String> {
        self.shared.sent.borrow_mut().drain(..).collect()
    }

    /// Like [`take_frames`](Self::take_frames), decoded. Frames that fail to
    /// decode are skipped.
    pub fn take_sent(&self) -> Vec<Message> {
        self.take_frames()
            .into_iter()
            .filter_map(|text| Frame::Text(text).decode().ok())
            .collect()
    }

    pub fn pending_frames(&self) -> usize {
        self.shared.sent.borrow().len()
    }

    /// Refuses every later send and delivery.
    pub fn close(&self) {
        self.shared.closed.set(true);
    }
}
