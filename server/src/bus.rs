//! Typed event bus feeding the subscription dispatcher.
//!
//! DESIGN
//! ======
//! The platform the gateway was carved out of used one string-keyed emitter
//! for lifecycle events and `<module>.create|update|delete` wildcards. Here
//! the surface is typed: one broadcast channel of [`ChangeEvent`] for
//! everything the dispatcher reacts to (data mutations plus the synthetic
//! presence/focus events), and a second channel of [`LifecycleEvent`] for
//! observers. The fourteen per-module registrations collapse into the
//! [`SYSTEM_MODULES`] table.

use messages::{ClientMessage, SubscriptionEvent};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Data-service modules whose mutations the gateway fans out, next to the
/// user-defined `items` collections. Each maps to a `sys_<module>` collection.
pub const SYSTEM_MODULES: &[&str] = &[
    "activity",
    "collections",
    "fields",
    "files",
    "folders",
    "permissions",
    "presets",
    "relations",
    "revisions",
    "roles",
    "settings",
    "users",
    "webhooks",
];

/// The system collection presence `status` events are scoped to.
pub const USERS_COLLECTION: &str = "sys_users";

/// Collection name for a system module.
#[must_use]
pub fn system_collection(module: &str) -> String {
    format!("sys_{module}")
}

/// A data mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    /// The subscription-frame event this mutation surfaces as.
    #[must_use]
    pub fn subscription_event(self) -> SubscriptionEvent {
        match self {
            Self::Create => SubscriptionEvent::Create,
            Self::Update => SubscriptionEvent::Update,
            Self::Delete => SubscriptionEvent::Delete,
        }
    }
}

/// Everything the dispatcher re-evaluates subscriptions for.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A collection changed in the data service.
    Mutation {
        collection: String,
        action: MutationAction,
        keys: Vec<Value>,
    },
    /// A user's focus record on this collection was added, moved, or removed.
    Focus { collection: String },
    /// The online-users set changed.
    Status,
}

impl ChangeEvent {
    /// The collection whose registry bucket this event targets.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Mutation { collection, .. } | Self::Focus { collection } => collection,
            Self::Status => USERS_COLLECTION,
        }
    }
}

/// Connection lifecycle notifications for observers (logging, tests).
/// The dispatcher does not consume these.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Connected { client: Uuid, user: Option<Uuid> },
    Message { client: Uuid, message: ClientMessage },
    AuthSuccess { client: Uuid, user: Option<Uuid> },
    AuthFailure { client: Uuid },
    Closed { client: Uuid },
    Errored { client: Uuid },
}

const CHANGE_CAPACITY: usize = 1024;
const LIFECYCLE_CAPACITY: usize = 256;

/// Broadcast bus shared by the gateway, the data-service shim, and tests.
///
/// Senders never block; a receiver that falls behind observes a lag error
/// and continues from the oldest retained event.
#[derive(Clone)]
pub struct Bus {
    changes: broadcast::Sender<ChangeEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self { changes, lifecycle }
    }

    /// Publish a change event. Dropped silently when nothing subscribes.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }

    /// Publish a data mutation on a collection.
    pub fn publish_mutation(&self, collection: impl Into<String>, action: MutationAction, keys: Vec<Value>) {
        self.publish(ChangeEvent::Mutation { collection: collection.into(), action, keys });
    }

    /// Publish a lifecycle notification.
    pub fn notify(&self, event: LifecycleEvent) {
        let _ = self.lifecycle.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    #[must_use]
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod tests;
