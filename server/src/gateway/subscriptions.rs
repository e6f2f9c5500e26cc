//! Subscription registry and dispatcher.
//!
//! DESIGN
//! ======
//! The registry buckets subscriptions by collection; dispatch snapshots one
//! bucket and never holds the lock across I/O. Subscriptions reference
//! clients by [`ClientId`] only — a handle that fails to resolve means the
//! client disconnected, and the delivery is dropped silently.
//!
//! Every delivery re-reads the data service under the subscriber's
//! *refreshed* accountability instead of relaying the mutation payload:
//! row-level permission filters may exclude the mutated row for this
//! subscriber, and grants may have changed since connect.
//!
//! ORDERING
//! ========
//! The `init` frame is enqueued before the subscription enters the
//! registry, so no mutation-driven frame can precede it. The dispatcher
//! consumes bus events one at a time and fans a single event out
//! concurrently, which preserves per-collection order toward any one
//! client.

use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::ChangeEvent;
use crate::errors::{self, GatewayError};
use crate::gateway::Gateway;
use crate::gateway::connection::{ClientHandle, ClientId};
use messages::{
    FocusRecord, Query, ServerMessage, SubscribeRequest, SubscriptionEvent, UnsubscribeRequest,
};

/// One registered subscription. `query` is stored post-sanitization.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub client: ClientId,
    pub collection: String,
    pub item: Option<Value>,
    pub query: Query,
    pub status: bool,
    pub uid: Option<String>,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Collection-indexed subscription store.
pub(crate) struct Registry {
    buckets: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self { buckets: RwLock::new(HashMap::new()) }
    }

    pub(crate) async fn insert(&self, subscription: Subscription) {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(subscription.collection.clone())
            .or_default()
            .push(subscription);
    }

    /// Remove the subscription owned by `client` with exactly this `uid`,
    /// searching every collection. `uid` is unique per client, but sweeping
    /// all buckets keeps the removal correct even across a replace that
    /// changed collections.
    pub(crate) async fn remove_where_uid(
        &self,
        client: ClientId,
        uid: Option<&str>,
    ) -> Vec<Subscription> {
        let mut buckets = self.buckets.write().await;
        let mut removed = Vec::new();
        for bucket in buckets.values_mut() {
            let mut kept = Vec::with_capacity(bucket.len());
            for sub in bucket.drain(..) {
                if sub.client == client && sub.uid.as_deref() == uid {
                    removed.push(sub);
                } else {
                    kept.push(sub);
                }
            }
            *bucket = kept;
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    /// Remove every subscription owned by `client`.
    pub(crate) async fn remove_all(&self, client: ClientId) -> Vec<Subscription> {
        let mut buckets = self.buckets.write().await;
        let mut removed = Vec::new();
        for bucket in buckets.values_mut() {
            let mut kept = Vec::with_capacity(bucket.len());
            for sub in bucket.drain(..) {
                if sub.client == client {
                    removed.push(sub);
                } else {
                    kept.push(sub);
                }
            }
            *bucket = kept;
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    pub(crate) async fn snapshot(&self, collection: &str) -> Vec<Subscription> {
        self.buckets
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn count(&self, collection: &str) -> usize {
        self.buckets
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }
}

// =============================================================================
// SUBSCRIBE / UNSUBSCRIBE
// =============================================================================

/// Handle a `SUBSCRIBE` command: gate on the schema, sanitize the query,
/// run the first read, then register and answer with `init`. A failed read
/// registers nothing.
pub(crate) async fn subscribe(
    gateway: &Gateway,
    client: &ClientHandle,
    request: SubscribeRequest,
) -> Result<(), GatewayError> {
    let accountability = client.accountability();
    let acc = accountability.as_ref();
    let services = gateway.services();

    let schema = services.schema.schema_for(acc).await?;
    let is_admin = acc.is_some_and(|a| a.admin);
    if !is_admin && !schema.has_collection(&request.collection) {
        return Err(GatewayError::InvalidCollection(request.collection));
    }

    let query = services.schema.sanitize_query(request.query.unwrap_or_default(), acc);
    let subscription = Subscription {
        client: client.id(),
        collection: request.collection,
        item: request.item,
        query,
        status: request.status,
        uid: request.uid,
    };

    // First read happens before anything is registered.
    let (payload, meta) = read_subscription(gateway, &subscription, acc).await?;
    let status = subscription.status.then(|| gateway.presence().snapshot());

    // Idempotent replace: a prior subscription with this uid goes first.
    gateway
        .registry()
        .remove_where_uid(client.id(), subscription.uid.as_deref())
        .await;

    // init is enqueued before registration so it precedes any delta.
    client
        .safe_send(ServerMessage::Subscription {
            event: SubscriptionEvent::Init,
            payload,
            meta,
            status,
            uid: subscription.uid.clone(),
        })
        .await;

    let focus = subscription.item.clone().map(|item| FocusRecord {
        collection: subscription.collection.clone(),
        item: Some(item),
        field: None,
    });
    info!(
        client_id = %client.id(),
        collection = %subscription.collection,
        uid = subscription.uid.as_deref().unwrap_or("-"),
        "subscription registered"
    );
    gateway.registry().insert(subscription).await;

    // Single-item subscriptions double as a focus declaration.
    if let (Some(user), Some(record)) = (client.user(), focus) {
        gateway.presence().set_focus(user, record);
    }
    Ok(())
}

/// Handle `UNSUBSCRIBE`: with a uid, remove that one subscription; without,
/// remove all of the caller's. Re-running it is a no-op, never an error.
pub(crate) async fn unsubscribe(
    gateway: &Gateway,
    client: &ClientHandle,
    request: &UnsubscribeRequest,
) {
    let removed = match request.uid.as_deref() {
        Some(uid) => gateway.registry().remove_where_uid(client.id(), Some(uid)).await,
        None => gateway.registry().remove_all(client.id()).await,
    };

    for subscription in removed {
        debug!(
            client_id = %client.id(),
            collection = %subscription.collection,
            "subscription removed"
        );
        gateway
            .bus()
            .publish(ChangeEvent::Focus { collection: subscription.collection });
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Consume bus events for the lifetime of the gateway.
pub fn spawn_dispatcher(gateway: &Gateway) -> JoinHandle<()> {
    let gateway = gateway.clone();
    let mut rx = gateway.bus().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => dispatch(&gateway, &event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "dispatcher lagged behind the bus; events skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Fan one event out to its collection bucket. Synthetic-event filters run
/// before any read so uninterested subscriptions cost nothing.
pub(crate) async fn dispatch(gateway: &Gateway, event: &ChangeEvent) {
    let collection = event.collection();
    let subscriptions = gateway.registry().snapshot(collection).await;
    if subscriptions.is_empty() {
        return;
    }

    let kind = match event {
        ChangeEvent::Mutation { action, .. } => action.subscription_event(),
        ChangeEvent::Focus { .. } => SubscriptionEvent::Focus,
        ChangeEvent::Status => SubscriptionEvent::Status,
    };

    let deliveries = subscriptions
        .into_iter()
        .filter(|sub| match kind {
            SubscriptionEvent::Focus => sub.status,
            SubscriptionEvent::Status => sub.status && sub.item.is_none(),
            _ => true,
        })
        .map(|sub| deliver(gateway, sub, kind));
    join_all(deliveries).await;
}

/// Re-evaluate one subscription and push the result. Permission failures
/// are reported to the client; the subscription is retained either way.
async fn deliver(gateway: &Gateway, subscription: Subscription, event: SubscriptionEvent) {
    let Some(client) = gateway.client(subscription.client).await else {
        // Client disconnected between snapshot and delivery.
        return;
    };

    let services = gateway.services();
    let result: Result<_, GatewayError> = async {
        let accountability = match client.accountability() {
            Some(current) => Some(services.access.refresh(&current).await?),
            None => None,
        };
        let acc = accountability.as_ref();

        let schema = services.schema.schema_for(acc).await?;
        let is_admin = acc.is_some_and(|a| a.admin);
        if !is_admin && !schema.has_collection(&subscription.collection) {
            return Err(GatewayError::Forbidden(format!(
                "no read access to `{}`",
                subscription.collection
            )));
        }

        read_subscription(gateway, &subscription, acc).await
    }
    .await;

    match result {
        Ok((payload, meta)) => {
            let status = subscription.status.then(|| gateway.presence().snapshot());
            client
                .safe_send(ServerMessage::Subscription {
                    event,
                    payload,
                    meta,
                    status,
                    uid: subscription.uid.clone(),
                })
                .await;
        }
        Err(err) => errors::report(&client, &err, subscription.uid.clone()).await,
    }
}

/// Execute a subscription's read: single-item or query mode, plus meta
/// aggregates when the query asked for them.
async fn read_subscription(
    gateway: &Gateway,
    subscription: &Subscription,
    acc: Option<&crate::services::Accountability>,
) -> Result<(Value, Option<Value>), GatewayError> {
    let data = &gateway.services().data;
    if let Some(item) = &subscription.item {
        let payload = data
            .read_one(&subscription.collection, acc, item, &subscription.query)
            .await?;
        Ok((payload, None))
    } else {
        let rows = data
            .read_by_query(&subscription.collection, acc, &subscription.query)
            .await?;
        let meta = if subscription.query.meta.is_some() {
            Some(
                data.meta_for_query(&subscription.collection, acc, &subscription.query)
                    .await?,
            )
        } else {
            None
        };
        Ok((Value::Array(rows), meta))
    }
}

#[cfg(test)]
#[path = "subscriptions_test.rs"]
mod tests;
