//! Cache key derivation.
//!
//! ## Key Format
//!
//! `{prefix}:user:{user_id}:role:{role}:query:{query_json}`
//!
//! e.g. `gigs:user:u1:role:student:query:{"category":"Math"}`
//!
//! The query part keeps parameters in the order the client sent them, so
//! `?a=1&b=2` and `?b=2&a=1` are separate entries.

use std::fmt;

use serde_json::{Map, Value};

use super::glob;

/// User segment used when no caller is authenticated.
pub const ANONYMOUS_USER: &str = "anonymous";
/// Role segment used when the caller has no role.
pub const GUEST_ROLE: &str = "guest";

/// The authenticated caller, as resolved by the auth layer.
///
/// Put into request extensions before the cache middleware runs. A request
/// without it is cached as `anonymous` / `guest`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub role: Option<String>,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: Some(role.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user_segment(&self) -> &str {
        non_empty(self.user_id.as_deref()).unwrap_or(ANONYMOUS_USER)
    }

    pub fn role_segment(&self) -> &str {
        non_empty(self.role.as_deref()).unwrap_or(GUEST_ROLE)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// A fully derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(prefix: &str, identity: &CallerIdentity, query: Option<&str>) -> Self {
        Self(format!(
            "{prefix}:user:{}:role:{}:query:{}",
            identity.user_segment(),
            identity.role_segment(),
            canonical_query(query)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Serialize a raw query string as a JSON object.
///
/// Parameters appear in first-seen order; a repeated parameter becomes an
/// array of its values. No query yields `{}`.
pub fn canonical_query(query: Option<&str>) -> String {
    let mut params = Map::new();
    if let Some(query) = query {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Value::String(value.into_owned());
            match params.get_mut(&*name) {
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    params.insert(name.into_owned(), value);
                }
            }
        }
    }
    Value::Object(params).to_string()
}

/// Pattern matching every entry of one user in a resource family,
/// optionally narrowed to one role.
pub fn user_pattern(prefix: &str, user_id: &str, role: Option<&str>) -> String {
    match role {
        Some(role) => format!(
            "{}:user:{}:role:{}:*",
            glob::escape(prefix),
            glob::escape(user_id),
            glob::escape(role)
        ),
        None => format!("{}:user:{}:*", glob::escape(prefix), glob::escape(user_id)),
    }
}

/// Pattern matching every entry of a resource family.
pub fn prefix_pattern(prefix: &str) -> String {
    format!("{}:*", glob::escape(prefix))
}
