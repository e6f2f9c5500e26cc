//! In-memory platform backend.
//!
//! DESIGN
//! ======
//! One struct implements all four collaborator traits over a single
//! `RwLock`-guarded state: seeded collections, a user table, and minted
//! tokens. `main` wires it as the dev harness; tests use it as the fixture
//! backend. Query evaluation is deliberately naive (equality and range
//! filters, field projection, string/number sort, limit/offset) — just
//! enough to exercise the gateway, never a real data service.
//!
//! Visibility is three-tiered per collection: public, authenticated, or
//! admin-only. Admin accountabilities see everything.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use messages::Query;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{
    AccessControl, Accountability, AuthenticationService, CollectionSchema, DataService,
    LoginResult, RefreshResult, SchemaOverview, SchemaService, ServiceError, Services,
};

const MAX_LIMIT: i64 = 100;

/// Who can see a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Authenticated,
    AdminOnly,
}

struct CollectionState {
    schema: CollectionSchema,
    visibility: Visibility,
    items: Vec<Value>,
}

struct MemoryUser {
    password: String,
    accountability: Accountability,
}

#[derive(Default)]
struct PlatformState {
    collections: BTreeMap<String, CollectionState>,
    users: HashMap<String, MemoryUser>,
    tokens: HashMap<String, Accountability>,
    refresh_tokens: HashMap<String, String>,
}

/// The whole platform in one struct. Clone the `Arc` into [`Services`] via
/// [`MemoryPlatform::services`].
#[derive(Default)]
pub struct MemoryPlatform {
    state: RwLock<PlatformState>,
}

impl MemoryPlatform {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bundle this platform as all four injected collaborators.
    #[must_use]
    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            auth: self.clone(),
            access: self.clone(),
            schema: self.clone(),
            data: self.clone(),
        }
    }

    pub fn seed_collection(
        &self,
        name: impl Into<String>,
        visibility: Visibility,
        primary_key: impl Into<String>,
        items: Vec<Value>,
    ) {
        let mut state = self.state.write().expect("platform state poisoned");
        state.collections.insert(
            name.into(),
            CollectionState {
                schema: CollectionSchema { primary_key: primary_key.into() },
                visibility,
                items,
            },
        );
    }

    pub fn seed_user(&self, email: impl Into<String>, password: impl Into<String>, accountability: Accountability) {
        let mut state = self.state.write().expect("platform state poisoned");
        state
            .users
            .insert(email.into(), MemoryUser { password: password.into(), accountability });
    }

    /// Register a static token, e.g. for strict-mode upgrade tests.
    pub fn seed_token(&self, token: impl Into<String>, accountability: Accountability) {
        let mut state = self.state.write().expect("platform state poisoned");
        state.tokens.insert(token.into(), accountability);
    }

    /// Change who can see a collection. Existing subscriptions observe the
    /// change on their next dispatch.
    pub fn set_visibility(&self, collection: &str, visibility: Visibility) {
        let mut state = self.state.write().expect("platform state poisoned");
        if let Some(col) = state.collections.get_mut(collection) {
            col.visibility = visibility;
        }
    }

    /// Seed the demo dataset `main` serves when no real platform is wired.
    #[must_use]
    pub fn demo() -> Arc<Self> {
        let platform = Self::new();

        let admin_id = Uuid::new_v4();
        let admin = Accountability { user: Some(admin_id), admin: true, ..Accountability::default() };
        platform.seed_user("admin@example.com", "admin", admin.clone());
        platform.seed_token("dev-admin-token", admin);

        let editor_id = Uuid::new_v4();
        let editor = Accountability { user: Some(editor_id), ..Accountability::default() };
        platform.seed_user("editor@example.com", "editor", editor.clone());
        platform.seed_token("dev-editor-token", editor);

        platform.seed_collection(
            "articles",
            Visibility::Public,
            "id",
            vec![
                json!({"id": 1, "title": "Hello gateway", "published": true}),
                json!({"id": 2, "title": "Draft post", "published": false}),
            ],
        );
        platform.seed_collection(
            "sys_users",
            Visibility::Authenticated,
            "id",
            vec![
                json!({"id": admin_id, "email": "admin@example.com"}),
                json!({"id": editor_id, "email": "editor@example.com"}),
            ],
        );

        platform
    }

    fn visible(visibility: Visibility, accountability: Option<&Accountability>) -> bool {
        match visibility {
            Visibility::Public => true,
            Visibility::Authenticated => accountability.is_some_and(|a| a.user.is_some()),
            Visibility::AdminOnly => accountability.is_some_and(|a| a.admin),
        }
    }

    fn mint_token() -> String {
        format!("mem-{}", Uuid::new_v4())
    }
}

// =============================================================================
// QUERY EVALUATION
// =============================================================================

fn matches_filter(item: &Value, filter: &Value) -> bool {
    let Value::Object(clauses) = filter else {
        return true;
    };

    clauses.iter().all(|(key, condition)| match key.as_str() {
        "_and" => condition
            .as_array()
            .is_some_and(|parts| parts.iter().all(|part| matches_filter(item, part))),
        "_or" => condition
            .as_array()
            .is_some_and(|parts| parts.iter().any(|part| matches_filter(item, part))),
        field => matches_condition(item.get(field), condition),
    })
}

fn matches_condition(actual: Option<&Value>, condition: &Value) -> bool {
    use std::cmp::Ordering;

    let actual = actual.unwrap_or(&Value::Null);
    let Value::Object(ops) = condition else {
        // Bare value means equality.
        return loose_eq(actual, condition);
    };

    ops.iter().all(|(op, expected)| match op.as_str() {
        "_eq" => loose_eq(actual, expected),
        "_neq" => !loose_eq(actual, expected),
        "_in" => expected
            .as_array()
            .is_some_and(|values| values.iter().any(|v| loose_eq(actual, v))),
        "_null" => expected.as_bool() == Some(actual.is_null()),
        "_gt" => order_values(actual, expected) == Some(Ordering::Greater),
        "_gte" => matches!(
            order_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "_lt" => order_values(actual, expected) == Some(Ordering::Less),
        "_lte" => matches!(
            order_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        // Unknown operators never match; sanitization should have dropped them.
        _ => false,
    })
}

/// Ordering for range operators. Numbers compare numerically; strings
/// lexicographically, which is also correct for RFC 3339 UTC timestamps
/// (the format `$NOW` resolves to).
fn order_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Equality that tolerates the string/number mismatches JSON clients produce
/// for primary keys.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(s), other) | (other, Value::String(s)) => match other {
            Value::Number(n) => s == &n.to_string(),
            _ => false,
        },
        _ => false,
    }
}

fn matches_search(item: &Value, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    let Value::Object(map) = item else {
        return false;
    };
    map.values()
        .any(|v| v.as_str().is_some_and(|s| s.to_lowercase().contains(&needle)))
}

fn sort_items(items: &mut [Value], sort: &[String]) {
    items.sort_by(|a, b| {
        for spec in sort {
            let (field, desc) = match spec.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (spec.as_str(), false),
            };
            let ordering = compare_values(a.get(field), b.get(field));
            let ordering = if desc { ordering.reverse() } else { ordering };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn project(item: &Value, fields: &[String]) -> Value {
    if fields.iter().any(|f| f == "*") {
        return item.clone();
    }
    let Value::Object(map) = item else {
        return item.clone();
    };
    let mut out = Map::new();
    for field in fields {
        if let Some(value) = map.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    Value::Object(out)
}

fn apply_query(items: &[Value], query: &Query) -> Vec<Value> {
    let mut selected: Vec<Value> = items
        .iter()
        .filter(|item| query.filter.as_ref().is_none_or(|f| matches_filter(item, f)))
        .filter(|item| query.search.as_deref().is_none_or(|s| matches_search(item, s)))
        .cloned()
        .collect();

    if let Some(sort) = &query.sort {
        sort_items(&mut selected, sort);
    }

    let offset = query.offset.unwrap_or(0).max(0) as usize;
    let selected: Vec<Value> = match query.limit {
        Some(limit) if limit >= 0 => selected.into_iter().skip(offset).take(limit as usize).collect(),
        _ => selected.into_iter().skip(offset).collect(),
    };

    match &query.fields {
        Some(fields) => selected.iter().map(|item| project(item, fields)).collect(),
        None => selected,
    }
}

/// Replace `"$CURRENT_USER"` and `"$NOW"` strings anywhere in the filter
/// tree. `now` is resolved once per query so every occurrence agrees.
fn resolve_placeholders(value: &mut Value, accountability: Option<&Accountability>, now: &str) {
    match value {
        Value::String(s) if s == "$CURRENT_USER" => {
            *value = match accountability.and_then(|a| a.user) {
                Some(user) => Value::String(user.to_string()),
                None => Value::Null,
            };
        }
        Value::String(s) if s == "$NOW" => {
            *value = Value::String(now.to_owned());
        }
        Value::Array(parts) => {
            for part in parts {
                resolve_placeholders(part, accountability, now);
            }
        }
        Value::Object(map) => {
            for part in map.values_mut() {
                resolve_placeholders(part, accountability, now);
            }
        }
        _ => {}
    }
}

// =============================================================================
// TRAIT IMPLEMENTATIONS
// =============================================================================

#[async_trait]
impl AuthenticationService for MemoryPlatform {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResult, ServiceError> {
        let mut state = self.state.write().expect("platform state poisoned");
        let accountability = match state.users.get(email) {
            Some(user) if user.password == password => user.accountability.clone(),
            _ => return Err(ServiceError::InvalidCredentials),
        };

        let access_token = Self::mint_token();
        let refresh_token = Self::mint_token();
        state.tokens.insert(access_token.clone(), accountability);
        state.refresh_tokens.insert(refresh_token.clone(), access_token.clone());

        Ok(LoginResult { access_token, refresh_token, expires_at: None })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResult, ServiceError> {
        let mut state = self.state.write().expect("platform state poisoned");
        let prior = state
            .refresh_tokens
            .get(refresh_token)
            .cloned()
            .ok_or(ServiceError::InvalidToken)?;
        let accountability = state.tokens.get(&prior).cloned().ok_or(ServiceError::InvalidToken)?;

        let access_token = Self::mint_token();
        state.tokens.insert(access_token.clone(), accountability);
        state.refresh_tokens.insert(refresh_token.to_owned(), access_token.clone());
        Ok(RefreshResult { access_token })
    }
}

#[async_trait]
impl AccessControl for MemoryPlatform {
    async fn accountability_for_token(&self, token: &str) -> Result<Accountability, ServiceError> {
        let state = self.state.read().expect("platform state poisoned");
        state.tokens.get(token).cloned().ok_or(ServiceError::InvalidToken)
    }

    async fn refresh(&self, accountability: &Accountability) -> Result<Accountability, ServiceError> {
        // The memory platform has no mutable role store; grant changes are
        // modeled through collection visibility instead.
        Ok(accountability.clone())
    }
}

#[async_trait]
impl SchemaService for MemoryPlatform {
    async fn schema_for(
        &self,
        accountability: Option<&Accountability>,
    ) -> Result<SchemaOverview, ServiceError> {
        let state = self.state.read().expect("platform state poisoned");
        let collections = state
            .collections
            .iter()
            .filter(|(_, col)| Self::visible(col.visibility, accountability))
            .map(|(name, col)| (name.clone(), col.schema.clone()))
            .collect();
        Ok(SchemaOverview { collections })
    }

    fn sanitize_query(&self, mut query: Query, accountability: Option<&Accountability>) -> Query {
        query.limit = Some(query.limit.map_or(MAX_LIMIT, |l| l.clamp(0, MAX_LIMIT)));
        if let Some(filter) = &mut query.filter {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            resolve_placeholders(filter, accountability, &now);
        }
        query
    }
}

#[async_trait]
impl DataService for MemoryPlatform {
    async fn read_one(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        key: &Value,
        query: &Query,
    ) -> Result<Value, ServiceError> {
        let state = self.state.read().expect("platform state poisoned");
        let col = lookup(&state, collection, accountability)?;

        let item = col
            .items
            .iter()
            .find(|item| loose_eq(item.get(&col.schema.primary_key).unwrap_or(&Value::Null), key))
            .filter(|item| query.filter.as_ref().is_none_or(|f| matches_filter(item, f)))
            .ok_or_else(|| ServiceError::NotFound(collection.to_owned()))?;

        Ok(match &query.fields {
            Some(fields) => project(item, fields),
            None => item.clone(),
        })
    }

    async fn read_many(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        keys: &[Value],
        query: &Query,
    ) -> Result<Vec<Value>, ServiceError> {
        let state = self.state.read().expect("platform state poisoned");
        let col = lookup(&state, collection, accountability)?;

        let keyed: Vec<Value> = col
            .items
            .iter()
            .filter(|item| {
                let pk = item.get(&col.schema.primary_key).unwrap_or(&Value::Null);
                keys.iter().any(|key| loose_eq(pk, key))
            })
            .cloned()
            .collect();
        Ok(apply_query(&keyed, query))
    }

    async fn read_by_query(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        query: &Query,
    ) -> Result<Vec<Value>, ServiceError> {
        let state = self.state.read().expect("platform state poisoned");
        let col = lookup(&state, collection, accountability)?;
        Ok(apply_query(&col.items, query))
    }

    async fn create_one(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        data: Value,
    ) -> Result<Value, ServiceError> {
        let mut state = self.state.write().expect("platform state poisoned");
        let col = lookup_mut(&mut state, collection, accountability)?;

        let Value::Object(mut map) = data else {
            return Err(ServiceError::InvalidQuery("item payload must be an object".into()));
        };
        map.entry(col.schema.primary_key.clone())
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));

        let item = Value::Object(map);
        col.items.push(item.clone());
        Ok(item)
    }

    async fn create_many(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        data: Vec<Value>,
    ) -> Result<Vec<Value>, ServiceError> {
        let mut created = Vec::with_capacity(data.len());
        for item in data {
            created.push(self.create_one(collection, accountability, item).await?);
        }
        Ok(created)
    }

    async fn update_one(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        key: &Value,
        data: Value,
    ) -> Result<Value, ServiceError> {
        let mut state = self.state.write().expect("platform state poisoned");
        let col = lookup_mut(&mut state, collection, accountability)?;

        let Value::Object(patch) = data else {
            return Err(ServiceError::InvalidQuery("item patch must be an object".into()));
        };

        let pk = col.schema.primary_key.clone();
        let item = col
            .items
            .iter_mut()
            .find(|item| loose_eq(item.get(&pk).unwrap_or(&Value::Null), key))
            .ok_or_else(|| ServiceError::NotFound(collection.to_owned()))?;

        if let Value::Object(map) = item {
            for (field, value) in patch {
                if field != pk {
                    map.insert(field, value);
                }
            }
        }
        Ok(item.clone())
    }

    async fn update_many(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        keys: &[Value],
        data: Value,
    ) -> Result<Vec<Value>, ServiceError> {
        let mut updated = Vec::with_capacity(keys.len());
        for key in keys {
            updated.push(self.update_one(collection, accountability, key, data.clone()).await?);
        }
        Ok(updated)
    }

    async fn delete_one(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        key: &Value,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.write().expect("platform state poisoned");
        let col = lookup_mut(&mut state, collection, accountability)?;

        let pk = col.schema.primary_key.clone();
        let before = col.items.len();
        col.items.retain(|item| !loose_eq(item.get(&pk).unwrap_or(&Value::Null), key));
        if col.items.len() == before {
            return Err(ServiceError::NotFound(collection.to_owned()));
        }
        Ok(())
    }

    async fn delete_many(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        keys: &[Value],
    ) -> Result<(), ServiceError> {
        for key in keys {
            self.delete_one(collection, accountability, key).await?;
        }
        Ok(())
    }

    async fn meta_for_query(
        &self,
        collection: &str,
        accountability: Option<&Accountability>,
        query: &Query,
    ) -> Result<Value, ServiceError> {
        let state = self.state.read().expect("platform state poisoned");
        let col = lookup(&state, collection, accountability)?;

        let filtered = col
            .items
            .iter()
            .filter(|item| query.filter.as_ref().is_none_or(|f| matches_filter(item, f)))
            .count();
        Ok(json!({
            "total_count": col.items.len(),
            "filter_count": filtered,
        }))
    }
}

fn lookup<'a>(
    state: &'a PlatformState,
    collection: &str,
    accountability: Option<&Accountability>,
) -> Result<&'a CollectionState, ServiceError> {
    let col = state
        .collections
        .get(collection)
        .ok_or_else(|| ServiceError::UnknownCollection(collection.to_owned()))?;
    if !MemoryPlatform::visible(col.visibility, accountability) {
        return Err(ServiceError::Forbidden(format!("no read access to `{collection}`")));
    }
    Ok(col)
}

fn lookup_mut<'a>(
    state: &'a mut PlatformState,
    collection: &str,
    accountability: Option<&Accountability>,
) -> Result<&'a mut CollectionState, ServiceError> {
    let col = state
        .collections
        .get_mut(collection)
        .ok_or_else(|| ServiceError::UnknownCollection(collection.to_owned()))?;
    if !MemoryPlatform::visible(col.visibility, accountability) {
        return Err(ServiceError::Forbidden(format!("no write access to `{collection}`")));
    }
    Ok(col)
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
