//! Inbound frame routing.
//!
//! DESIGN
//! ======
//! One entry point per text frame: parse, then dispatch by message type.
//! Handlers return `Result<(), GatewayError>` and never touch the socket
//! directly; every failure funnels through `errors::report`, which keeps
//! the connection alive. Parse failures answer `INVALID_PAYLOAD` without
//! closing — a misbehaving client is corrected, not evicted.

use serde_json::Value;
use tracing::debug;

use crate::auth;
use crate::bus::{LifecycleEvent, MutationAction};
use crate::errors::{self, GatewayError};
use crate::gateway::Gateway;
use crate::gateway::connection::ClientHandle;
use messages::{
    AuthRequest, ClientMessage, CrudAction, ErrorBody, FocusRecord, FocusRequest, ItemsRequest,
    ServerMessage,
};

/// Handle one inbound text frame in arrival order.
pub(crate) async fn handle_text(gateway: &Gateway, client: &ClientHandle, text: &str) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(err) => {
            errors::report(client, &GatewayError::InvalidPayload(err.to_string()), None).await;
            return;
        }
    };

    gateway.bus().notify(LifecycleEvent::Message {
        client: client.id().as_uuid(),
        message: message.clone(),
    });

    match message {
        ClientMessage::Auth(request) => {
            handle_auth(gateway, client, &request).await;
        }
        ClientMessage::Subscribe(request) => {
            let uid = request.uid.clone();
            if let Err(err) = super::subscriptions::subscribe(gateway, client, request).await {
                errors::report(client, &err, uid).await;
            }
        }
        ClientMessage::Unsubscribe(request) => {
            super::subscriptions::unsubscribe(gateway, client, &request).await;
        }
        ClientMessage::Focus(request) => {
            let uid = request.uid.clone();
            if let Err(err) = handle_focus(gateway, client, request) {
                errors::report(client, &err, uid).await;
            }
        }
        ClientMessage::Items(request) => {
            let uid = request.uid.clone();
            if let Err(err) = handle_items(gateway, client, request).await {
                errors::report(client, &err, uid).await;
            }
        }
        ClientMessage::Pong => client.mark_pong(),
    }
}

// =============================================================================
// AUTH
// =============================================================================

/// Run an `AUTH` message inline. Success replaces the epoch wholesale and
/// restarts the expiry timer; failure clears the epoch but keeps the socket
/// open so the client can retry.
pub(crate) async fn handle_auth(
    gateway: &Gateway,
    client: &ClientHandle,
    request: &AuthRequest,
) -> bool {
    let uid = request.uid.clone();
    let prior_user = client.user();

    match auth::authenticate(gateway.services(), request).await {
        Ok(outcome) => {
            let new_user = outcome.accountability.user;
            client.install_epoch(gateway, outcome.accountability, outcome.expires_at);

            if let Some(user) = prior_user.filter(|prior| Some(*prior) != new_user) {
                gateway.presence_exit_if_last(user, client.id()).await;
            }
            if let Some(user) = new_user {
                gateway.presence_enter(user);
            }

            client
                .safe_send(ServerMessage::auth_ok(outcome.refresh_token, uid))
                .await;
            gateway.bus().notify(LifecycleEvent::AuthSuccess {
                client: client.id().as_uuid(),
                user: new_user,
            });
            true
        }
        Err(err) => {
            debug!(client_id = %client.id(), error = %err, "authentication failed");
            client.clear_epoch();
            if let Some(user) = prior_user {
                gateway.presence_exit_if_last(user, client.id()).await;
            }

            client
                .safe_send(ServerMessage::auth_error(
                    ErrorBody::new(err.code(), err.public_message()),
                    uid,
                ))
                .await;
            gateway
                .bus()
                .notify(LifecycleEvent::AuthFailure { client: client.id().as_uuid() });
            false
        }
    }
}

// =============================================================================
// FOCUS
// =============================================================================

fn handle_focus(
    gateway: &Gateway,
    client: &ClientHandle,
    request: FocusRequest,
) -> Result<(), GatewayError> {
    let Some(user) = client.user() else {
        return Err(GatewayError::Forbidden("focus requires an authenticated user".into()));
    };

    gateway.presence().set_focus(
        user,
        FocusRecord { collection: request.collection, item: request.item, field: request.field },
    );
    Ok(())
}

// =============================================================================
// ITEMS
// =============================================================================

/// CRUD over the socket, under the caller's accountability. Successful
/// writes publish the matching mutation event so subscriptions converge.
async fn handle_items(
    gateway: &Gateway,
    client: &ClientHandle,
    request: ItemsRequest,
) -> Result<(), GatewayError> {
    let accountability = client.accountability();
    let acc = accountability.as_ref();
    let services = gateway.services();
    let collection = request.collection.as_str();
    let query = services
        .schema
        .sanitize_query(request.query.clone().unwrap_or_default(), acc);

    let payload = match request.action {
        CrudAction::Create => {
            let data = request
                .data
                .ok_or_else(|| GatewayError::InvalidPayload("items create requires `data`".into()))?;
            let created = match data {
                Value::Array(rows) => {
                    Value::Array(services.data.create_many(collection, acc, rows).await?)
                }
                row => services.data.create_one(collection, acc, row).await?,
            };
            let keys = extract_keys(gateway, collection, acc, &created).await;
            gateway
                .bus()
                .publish_mutation(collection, MutationAction::Create, keys);
            created
        }
        CrudAction::Read => {
            if let Some(ids) = &request.ids {
                Value::Array(services.data.read_many(collection, acc, ids, &query).await?)
            } else if let Some(id) = &request.id {
                services.data.read_one(collection, acc, id, &query).await?
            } else {
                Value::Array(services.data.read_by_query(collection, acc, &query).await?)
            }
        }
        CrudAction::Update => {
            let data = request
                .data
                .ok_or_else(|| GatewayError::InvalidPayload("items update requires `data`".into()))?;
            let updated = if let Some(ids) = &request.ids {
                Value::Array(services.data.update_many(collection, acc, ids, data).await?)
            } else if let Some(id) = &request.id {
                services.data.update_one(collection, acc, id, data).await?
            } else {
                return Err(GatewayError::InvalidPayload(
                    "items update requires `id` or `ids`".into(),
                ));
            };
            let keys = extract_keys(gateway, collection, acc, &updated).await;
            gateway
                .bus()
                .publish_mutation(collection, MutationAction::Update, keys);
            updated
        }
        CrudAction::Delete => {
            let keys: Vec<Value> = if let Some(ids) = &request.ids {
                ids.clone()
            } else if let Some(id) = &request.id {
                vec![id.clone()]
            } else {
                return Err(GatewayError::InvalidPayload(
                    "items delete requires `id` or `ids`".into(),
                ));
            };
            services.data.delete_many(collection, acc, &keys).await?;
            gateway
                .bus()
                .publish_mutation(collection, MutationAction::Delete, keys.clone());
            Value::Array(keys)
        }
    };

    client
        .safe_send(ServerMessage::Items { payload, uid: request.uid })
        .await;
    Ok(())
}

/// Pull primary-key values out of a write result for the mutation event.
async fn extract_keys(
    gateway: &Gateway,
    collection: &str,
    acc: Option<&crate::services::Accountability>,
    payload: &Value,
) -> Vec<Value> {
    let primary_key = gateway
        .services()
        .schema
        .schema_for(acc)
        .await
        .ok()
        .and_then(|schema| schema.collections.get(collection).map(|c| c.primary_key.clone()))
        .unwrap_or_else(|| "id".to_owned());

    let key_of = |item: &Value| item.get(&primary_key).cloned();
    match payload {
        Value::Array(items) => items.iter().filter_map(key_of).collect(),
        item => key_of(item).into_iter().collect(),
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
