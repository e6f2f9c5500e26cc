//! Shared wire model for the Conduit realtime gateway.
//!
//! ARCHITECTURE
//! ============
//! This crate owns the message envelope both sides of the socket speak.
//! Frames are JSON text messages with a `type` discriminator: clients send
//! commands (`AUTH`, `SUBSCRIBE`, ...), the server answers with lowercase
//! frame types (`auth`, `subscription`, ...). The server and client crates
//! both depend on this crate and never re-declare wire shapes.
//!
//! DESIGN
//! ======
//! - `type` is case-insensitive on ingress: [`ClientMessage::parse`]
//!   uppercases before matching, so `"subscribe"` and `"SUBSCRIBE"` are the
//!   same command.
//! - Replies correlate to requests via the client-chosen `uid` string.
//! - Payloads stay flexible (`serde_json::Value`); only the envelope is
//!   strongly typed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code carried in the `error.code` field of error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// JSON parse failure or a missing required field.
    InvalidPayload,
    /// Bad credentials, bad token, or a handshake that never authenticated.
    AuthenticationFailed,
    /// The connection's auth epoch expired.
    TokenExpired,
    /// SUBSCRIBE on a collection the schema does not expose to the caller.
    InvalidCollection,
    /// A permission failure at dispatch or CRUD time.
    Forbidden,
    /// Anything else. Logged server-side; generic on the wire.
    Internal,
}

/// Structured error body inside error frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

// =============================================================================
// QUERY
// =============================================================================

/// Subset of the data-service query language carried on subscriptions and
/// CRUD commands. The gateway never interprets `filter` itself; it passes
/// the query through sanitization and hands it to the data service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Requested meta aggregates, e.g. `"total_count"` or `"*"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
}

// =============================================================================
// CLIENT COMMANDS
// =============================================================================

/// Credentials for an `AUTH` command. Exactly one shape is expected:
/// email+password, refresh token, or raw access token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Explicit expiry override in epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// A `SUBSCRIBE` command. `item` present means single-item mode; `status`
/// opts the subscription into the presence/focus side channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
    #[serde(default)]
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// An `UNSUBSCRIBE` command. Without `uid`, all of the caller's
/// subscriptions are removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// A `FOCUS` command declaring what the user is currently looking at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusRequest {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// CRUD verb on an `ITEMS` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudAction {
    Create,
    Read,
    Update,
    Delete,
}

/// An `ITEMS` command: CRUD over the socket under the caller's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemsRequest {
    pub collection: String,
    pub action: CrudAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Every command a client can send. Serializes with an UPPERCASE `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ClientMessage {
    Auth(AuthRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Focus(FocusRequest),
    Items(ItemsRequest),
    Pong,
}

/// Error returned by [`ClientMessage::parse`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message must be a json object")]
    NotAnObject,
    #[error("message is missing a `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` message: {source}")]
    InvalidFields {
        kind: &'static str,
        source: serde_json::Error,
    },
}

impl ClientMessage {
    /// Parse one inbound text frame. The `type` field is matched
    /// case-insensitively; everything else is strict serde.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(ParseError::NotAnObject);
        };

        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingType)?
            .to_uppercase();

        let body = Value::Object(map);
        let invalid = |kind: &'static str| move |source| ParseError::InvalidFields { kind, source };

        match kind.as_str() {
            "AUTH" => serde_json::from_value(body).map(Self::Auth).map_err(invalid("AUTH")),
            "SUBSCRIBE" => serde_json::from_value(body)
                .map(Self::Subscribe)
                .map_err(invalid("SUBSCRIBE")),
            "UNSUBSCRIBE" => serde_json::from_value(body)
                .map(Self::Unsubscribe)
                .map_err(invalid("UNSUBSCRIBE")),
            "FOCUS" => serde_json::from_value(body).map(Self::Focus).map_err(invalid("FOCUS")),
            "ITEMS" => serde_json::from_value(body).map(Self::Items).map_err(invalid("ITEMS")),
            "PONG" => Ok(Self::Pong),
            other => Err(ParseError::UnknownType(other.to_owned())),
        }
    }

    /// The client-chosen correlation id, if the command carries one.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        match self {
            Self::Auth(m) => m.uid.as_deref(),
            Self::Subscribe(m) => m.uid.as_deref(),
            Self::Unsubscribe(m) => m.uid.as_deref(),
            Self::Focus(m) => m.uid.as_deref(),
            Self::Items(m) => m.uid.as_deref(),
            Self::Pong => None,
        }
    }
}

// =============================================================================
// SERVER FRAMES
// =============================================================================

/// `ok` / `error` marker on auth replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Event discriminator on `subscription` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionEvent {
    /// First frame after a successful SUBSCRIBE.
    Init,
    Create,
    Update,
    Delete,
    /// A user's editing locus changed on this collection.
    Focus,
    /// The online-users set changed.
    Status,
}

/// One user's declared editing locus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusRecord {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Presence side channel attached to subscription frames that requested it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub online: Vec<Uuid>,
    pub focus: BTreeMap<Uuid, FocusRecord>,
}

/// Every frame the server can send. Serializes with a lowercase `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Auth {
        status: ReplyStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
    },
    Subscription {
        event: SubscriptionEvent,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<PresenceSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
    },
    Items {
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
    },
    Error {
        error: ErrorBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
    },
    Ping,
}

impl ServerMessage {
    /// Build an error frame.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>, uid: Option<String>) -> Self {
        Self::Error { error: ErrorBody::new(code, message), uid }
    }

    /// Build a successful auth reply.
    #[must_use]
    pub fn auth_ok(refresh_token: Option<String>, uid: Option<String>) -> Self {
        Self::Auth { status: ReplyStatus::Ok, error: None, refresh_token, uid }
    }

    /// Build a failed auth reply.
    #[must_use]
    pub fn auth_error(error: ErrorBody, uid: Option<String>) -> Self {
        Self::Auth { status: ReplyStatus::Error, error: Some(error), refresh_token: None, uid }
    }

    /// The correlation id this frame carries, if any.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        match self {
            Self::Auth { uid, .. }
            | Self::Subscription { uid, .. }
            | Self::Items { uid, .. }
            | Self::Error { uid, .. } => uid.as_deref(),
            Self::Ping => None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
