//! External collaborator seam.
//!
//! SYSTEM CONTEXT
//! ==============
//! The gateway does not own authentication, permissions, schemas, or data.
//! Those live in the surrounding platform and are consumed through the
//! traits here, injected as `Arc<dyn …>` at construction. The in-memory
//! implementation in [`memory`] backs the dev harness and every test.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use messages::Query;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// The resolved identity a connection operates under. Immutable for the
/// duration of one auth epoch; replaced wholesale on re-auth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accountability {
    pub user: Option<Uuid>,
    pub role: Option<Uuid>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Per-collection shape the gateway needs: just the primary key field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub primary_key: String,
}

/// The collections visible to one accountability.
#[derive(Debug, Clone, Default)]
pub struct SchemaOverview {
    pub collections: BTreeMap<String, CollectionSchema>,
}

impl SchemaOverview {
    #[must_use]
    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }
}

/// Result of a password login.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch seconds, when the platform bounds the session.
    pub expires_at: Option<i64>,
}

/// Result of a refresh-token exchange. Expiry is derived from the token.
#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub access_token: String,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Failures surfaced by the platform services.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid token")]
    InvalidToken,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("collection `{0}` does not exist")]
    UnknownCollection(String),
    #[error("item not found in `{0}`")]
    NotFound(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("service failure: {0}")]
    Internal(String),
}

// =============================================================================
// TRAITS
// =============================================================================

/// Credential exchange with the platform auth service.
#[async_trait]
pub trait AuthenticationService: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResult, ServiceError>;
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResult, ServiceError>;
}

/// Token and role resolution.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Resolve an access token to the identity it represents.
    async fn accountability_for_token(&self, token: &str) -> Result<Accountability, ServiceError>;

    /// Re-resolve an identity against current role/permission state. Called
    /// on every dispatch because grants may have changed since connect.
    async fn refresh(&self, accountability: &Accountability) -> Result<Accountability, ServiceError>;
}

/// Schema visibility and query sanitization.
#[async_trait]
pub trait SchemaService: Send + Sync {
    async fn schema_for(
        &self,
        accountability: Option<&Accountability>,
    ) -> Result<SchemaOverview, ServiceError>;

    /// Strip privilege-escalating fields and clamp limits under the caller's
    /// identity. Infallible: unknown constructs are dropped, not rejected.
    fn sanitize_query(&self, query: Query, accountability: Option<&Accountability>) -> Query;
}

/// The items/meta surface of the data service. Every call runs under the
/// caller's accountability so row-level permissions apply.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn read_one(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        key: &Value,
        query: &Query,
    ) -> Result<Value, ServiceError>;

    async fn read_many(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        keys: &[Value],
        query: &Query,
    ) -> Result<Vec<Value>, ServiceError>;

    async fn read_by_query(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        query: &Query,
    ) -> Result<Vec<Value>, ServiceError>;

    async fn create_one(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        data: Value,
    ) -> Result<Value, ServiceError>;

    async fn create_many(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        data: Vec<Value>,
    ) -> Result<Vec<Value>, ServiceError>;

    async fn update_one(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        key: &Value,
        data: Value,
    ) -> Result<Value, ServiceError>;

    async fn update_many(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        keys: &[Value],
        data: Value,
    ) -> Result<Vec<Value>, ServiceError>;

    async fn delete_one(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        key: &Value,
    ) -> Result<(), ServiceError>;

    async fn delete_many(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        keys: &[Value],
    ) -> Result<(), ServiceError>;

    /// Aggregates requested via `query.meta` (e.g. `total_count`).
    async fn meta_for_query(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        query: &Query,
    ) -> Result<Value, ServiceError>;
}

/// The injected collaborator bundle.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthenticationService>,
    pub access: Arc<dyn AccessControl>,
    pub schema: Arc<dyn SchemaService>,
    pub data: Arc<dyn DataService>,
}
