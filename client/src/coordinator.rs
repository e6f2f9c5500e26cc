//! Request/response coordinator.
//!
//! DESIGN
//! ======
//! Three inbound patterns multiplex over one socket:
//!
//! - request/response: the outbound `uid` matches one pending entry, which
//!   is resolved and removed;
//! - subscriptions: the `uid` is retained, and every inbound frame with it
//!   flows to the subscription's channel;
//! - server pings: answered immediately by the supervisor, no callback.
//!
//! `uid` comes from a monotonic counter that never resets for the lifetime
//! of the process, so correlation survives reconnects.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

use messages::ServerMessage;

/// Where [`Coordinator::route`] delivered a frame.
#[derive(Debug)]
pub enum Routed {
    /// Server-initiated ping; the supervisor replies `PONG` immediately.
    Ping,
    /// Resolved a pending request or forwarded to a subscription channel.
    Delivered,
    /// No registered consumer; the supervisor inspects it (e.g. the reply
    /// to its own connection-open `AUTH`).
    Unclaimed(ServerMessage),
}

#[derive(Default)]
pub struct Coordinator {
    next_uid: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<ServerMessage>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next correlation id. Monotonic, never reused.
    #[must_use]
    pub fn next_uid(&self) -> String {
        self.next_uid.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Register a one-shot request awaiting the reply carrying `uid`.
    #[must_use]
    pub fn register_request(&self, uid: &str) -> oneshot::Receiver<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(uid.to_owned(), tx);
        rx
    }

    /// Drop a pending request, e.g. after its timeout elapsed.
    pub fn abandon_request(&self, uid: &str) {
        self.pending.lock().expect("pending map poisoned").remove(uid);
    }

    /// Register a subscription channel. The `uid` stays claimed until
    /// [`Coordinator::forget_subscription`].
    #[must_use]
    pub fn register_subscription(&self, uid: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .expect("subscription map poisoned")
            .insert(uid.to_owned(), tx);
        rx
    }

    pub fn forget_subscription(&self, uid: &str) {
        self.subscriptions
            .lock()
            .expect("subscription map poisoned")
            .remove(uid);
    }

    /// Route one inbound frame. Pending requests win over subscriptions for
    /// the same `uid`; a subscription whose receiver is gone is unregistered
    /// on the spot.
    pub fn route(&self, message: ServerMessage) -> Routed {
        if matches!(message, ServerMessage::Ping) {
            return Routed::Ping;
        }

        let Some(uid) = message.uid().map(ToOwned::to_owned) else {
            return Routed::Unclaimed(message);
        };

        if let Some(tx) = self.pending.lock().expect("pending map poisoned").remove(&uid) {
            // The requester may have timed out and dropped the receiver;
            // that is not an error.
            let _ = tx.send(message);
            return Routed::Delivered;
        }

        let mut subscriptions = self.subscriptions.lock().expect("subscription map poisoned");
        if let Some(tx) = subscriptions.get(&uid) {
            if tx.send(message).is_err() {
                subscriptions.remove(&uid);
            }
            return Routed::Delivered;
        }

        Routed::Unclaimed(message)
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod tests;
