//! Fire-and-forget event channel from the worker to the caller.

use std::sync::mpsc::{self, Receiver, Sender};

/// Sending half of an event channel.
///
/// Sending never blocks and never fails: once the caller drops the receiver
/// the worker keeps going and events are discarded.
#[derive(Debug)]
pub struct EventSender<E> {
    tx: Sender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSender<E> {
    /// Send an event; returns false when nobody is listening any more
    pub fn send(&self, event: E) -> bool {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped; discarding event");
            return false;
        }
        true
    }
}

/// Create an unbounded event channel
pub fn event_channel<E>() -> (EventSender<E>, Receiver<E>) {
    let (tx, rx) = mpsc::channel();
    (EventSender { tx }, rx)
}
