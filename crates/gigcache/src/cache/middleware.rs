//! Read-through response caching for GET routes.
//!
//! Attach per route with the prefix that invalidation will later target:
//!
//! ```ignore
//! let gigs = ResponseCache::new(store.clone(), "gigs").with_ttl(Duration::from_secs(600));
//! Router::new().route(
//!     "/gigs",
//!     get(list_gigs).layer(axum::middleware::from_fn_with_state(gigs, cache_responses)),
//! );
//! ```
//!
//! ## Request Flow
//!
//! ```text
//! non-GET or store unavailable ──────────────────────────→ downstream (untouched)
//! GET → key → store.get ─ hit ─→ stored JSON + cached/cacheTimestamp
//!                        └ miss → downstream → 2xx JSON? → spawn store.set (not awaited)
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header::CONTENT_TYPE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use super::key::{CacheKey, CallerIdentity};
use super::store::{CacheStore, DEFAULT_TTL};
use crate::config::CacheConfig;

/// Response header set on every cache hit.
pub const CACHE_STATUS_HEADER: &str = "x-cache";
/// Top-level field marking a payload served from cache.
pub const CACHED_FIELD: &str = "cached";
/// Top-level field holding the RFC 3339 time the cached copy was served.
pub const CACHE_TIMESTAMP_FIELD: &str = "cacheTimestamp";
/// Member holding both markers when the payload already uses either name.
pub const CACHE_NAMESPACE_FIELD: &str = "_cache";
/// Response header carrying the serve time on every hit.
pub const CACHE_TIMESTAMP_HEADER: &str = "x-cache-timestamp";

/// Default bound on the detached write of a fresh response.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-route cache settings, passed as middleware state.
#[derive(Clone)]
pub struct ResponseCache {
    store: CacheStore,
    prefix: Arc<str>,
    ttl: Duration,
    store_timeout: Duration,
}

impl ResponseCache {
    pub fn new(store: CacheStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: Arc::from(prefix.into()),
            ttl: DEFAULT_TTL,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Settings for `prefix` using the configured default TTL and write timeout.
    pub fn from_config(store: CacheStore, prefix: impl Into<String>, config: &CacheConfig) -> Self {
        Self::new(store, prefix)
            .with_ttl(config.default_ttl())
            .with_store_timeout(config.store_timeout())
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Key this route would use for `identity` and a raw query string.
    pub fn key_for(&self, identity: &CallerIdentity, query: Option<&str>) -> CacheKey {
        CacheKey::new(&self.prefix, identity, query)
    }
}

/// Caching middleware; use with `axum::middleware::from_fn_with_state`.
///
/// Never fails a request on account of the cache: store errors, unreadable
/// entries and unavailable backends all fall back to running the handler.
pub async fn cache_responses(
    State(cache): State<ResponseCache>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // Availability is checked once here, not again mid-flow.
    if req.method() != Method::GET || !cache.store.is_available() {
        return next.run(req).await;
    }

    let identity = req
        .extensions()
        .get::<CallerIdentity>()
        .cloned()
        .unwrap_or_default();
    let key = cache.key_for(&identity, req.uri().query());

    if let Some(raw) = cache.store.get(key.as_str()).await {
        match serde_json::from_str::<Value>(&raw) {
            Ok(payload) => {
                tracing::debug!(key = %key, "cache hit");
                crate::metrics::record_cache_hit(cache.prefix());
                return hit_response(payload);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding unreadable cache entry");
            }
        }
    }

    tracing::debug!(key = %key, "cache miss");
    crate::metrics::record_cache_miss(cache.prefix());

    let response = next.run(req).await;
    if !response.status().is_success() || !is_json(&response) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to read response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match std::str::from_utf8(&bytes) {
        Ok(text) if serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok() => {
            store_in_background(&cache, key, text.to_owned());
        }
        _ => {
            tracing::debug!(key = %key, "response body is not valid JSON, not caching");
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

/// Write a fresh response to the store without holding up the caller.
fn store_in_background(cache: &ResponseCache, key: CacheKey, body: String) {
    let store = cache.store.clone();
    let ttl = cache.ttl;
    let timeout = cache.store_timeout;

    tokio::spawn(async move {
        match tokio::time::timeout(timeout, store.set(key.as_str(), &body, Some(ttl))).await {
            Ok(true) => {
                tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "cached response");
                crate::metrics::record_cache_write("stored");
            }
            Ok(false) => {
                tracing::debug!(key = %key, "cache write skipped");
                crate::metrics::record_cache_write("failed");
            }
            Err(_) => {
                tracing::warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "cache write timed out");
                crate::metrics::record_cache_write("timeout");
            }
        }
    });
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v.starts_with("application/json") || v.contains("+json")
        })
        .unwrap_or(false)
}

fn hit_response(payload: Value) -> Response {
    let served_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let mut response = (StatusCode::OK, Json(annotate(payload, &served_at))).into_response();
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(CACHE_STATUS_HEADER),
        HeaderValue::from_static("HIT"),
    );
    if let Ok(value) = HeaderValue::from_str(&served_at) {
        headers.insert(HeaderName::from_static(CACHE_TIMESTAMP_HEADER), value);
    }
    response
}

/// Add the hit marker and timestamp to an object payload.
///
/// - object without `cached`/`cacheTimestamp`: both added at the top level
/// - object already using either name: both added under `_cache`, domain
///   fields untouched
/// - arrays and scalars: body untouched; the `x-cache` and
///   `x-cache-timestamp` headers carry the markers
fn annotate(payload: Value, served_at: &str) -> Value {
    let markers = || {
        [
            (CACHED_FIELD.to_string(), Value::Bool(true)),
            (
                CACHE_TIMESTAMP_FIELD.to_string(),
                Value::String(served_at.to_string()),
            ),
        ]
    };

    match payload {
        Value::Object(mut fields) => {
            if !fields.contains_key(CACHED_FIELD) && !fields.contains_key(CACHE_TIMESTAMP_FIELD) {
                fields.extend(markers());
            } else if !fields.contains_key(CACHE_NAMESPACE_FIELD) {
                fields.insert(
                    CACHE_NAMESPACE_FIELD.to_string(),
                    Value::Object(markers().into_iter().collect()),
                );
            } else {
                tracing::debug!("cached payload already uses every marker field, leaving body as is");
            }
            Value::Object(fields)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::caller_identity_from_headers;
    use axum::{Router, body::to_bytes, middleware, routing::get};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn app(store: CacheStore, status: StatusCode, payload: Value) -> (Router, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                let payload = payload.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (status, Json(payload))
                }
            }
        };

        let cache = ResponseCache::new(store, "gigs");
        let router = Router::new()
            .route("/gigs", get(handler.clone()).post(handler))
            .layer(middleware::from_fn_with_state(cache, cache_responses))
            .layer(middleware::from_fn(caller_identity_from_headers));
        (router, calls)
    }

    fn request(method: Method, uri: &str, user: Option<(&str, &str)>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = user {
            builder = builder.header("x-user-id", id).header("x-user-role", role);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_for_entry(store: &CacheStore, key: &str) -> Option<String> {
        for _ in 0..100 {
            if let Some(value) = store.get(key).await {
                return Some(value);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    const GIGS_KEY: &str = r#"gigs:user:u1:role:student:query:{"category":"Math"}"#;

    #[tokio::test]
    async fn miss_stores_then_hit_short_circuits() {
        let store = CacheStore::local();
        let (app, calls) = app(store.clone(), StatusCode::OK, json!({"data": [1, 2, 3]}));

        let first = app
            .clone()
            .oneshot(request(Method::GET, "/gigs?category=Math", Some(("u1", "student"))))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(first.headers().get(CACHE_STATUS_HEADER).is_none());
        assert_eq!(body_json(first).await, json!({"data": [1, 2, 3]}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stored = wait_for_entry(&store, GIGS_KEY).await.expect("entry stored");
        assert_eq!(serde_json::from_str::<Value>(&stored).unwrap(), json!({"data": [1, 2, 3]}));

        let second = app
            .oneshot(request(Method::GET, "/gigs?category=Math", Some(("u1", "student"))))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers().get(CACHE_STATUS_HEADER).unwrap(), "HIT");
        let body = body_json(second).await;
        assert_eq!(body["data"], json!([1, 2, 3]));
        assert_eq!(body[CACHED_FIELD], json!(true));
        let served_at = body[CACHE_TIMESTAMP_FIELD].as_str().expect("timestamp");
        assert!(OffsetDateTime::parse(served_at, &Rfc3339).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_get_requests_pass_through() {
        let store = CacheStore::local();
        let (app, calls) = app(store.clone(), StatusCode::OK, json!({"ok": true}));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request(Method::POST, "/gigs", Some(("u1", "student"))))
                .await
                .unwrap();
            assert_eq!(body_json(response).await, json!({"ok": true}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.delete_by_pattern("gigs:*").await, 0);
    }

    #[tokio::test]
    async fn server_errors_are_not_cached() {
        let store = CacheStore::local();
        let (app, calls) = app(
            store.clone(),
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "boom"}),
        );

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/gigs?category=Math", Some(("u1", "student"))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(GIGS_KEY).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_store_is_pure_passthrough() {
        let store = CacheStore::disabled();
        let (app, calls) = app(store.clone(), StatusCode::OK, json!({"data": []}));

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/gigs?category=Math", Some(("u1", "student"))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await, json!({"data": []}));
            assert!(!store.is_available());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn callers_never_see_each_others_entries() {
        let store = CacheStore::local();
        let (app, calls) = app(store.clone(), StatusCode::OK, json!({"data": "fresh"}));

        app.clone()
            .oneshot(request(Method::GET, "/gigs?category=Math", Some(("u1", "student"))))
            .await
            .unwrap();
        wait_for_entry(&store, GIGS_KEY).await.expect("entry stored");

        let others = [
            Some(("u2", "student")),
            Some(("u1", "teacher")),
            Some(("u1", "guest")),
            None,
        ];
        for (i, caller) in others.into_iter().enumerate() {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/gigs?category=Math", caller))
                .await
                .unwrap();
            assert!(response.headers().get(CACHE_STATUS_HEADER).is_none());
            assert_eq!(calls.load(Ordering::SeqCst), i + 2);
        }
    }

    #[tokio::test]
    async fn unreadable_entry_counts_as_miss() {
        let store = CacheStore::local();
        store.set(GIGS_KEY, "{not json", None).await;
        let (app, calls) = app(store.clone(), StatusCode::OK, json!({"data": "fresh"}));

        let response = app
            .oneshot(request(Method::GET, "/gigs?category=Math", Some(("u1", "student"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"data": "fresh"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The fresh response replaces the broken entry.
        for _ in 0..100 {
            if store.get(GIGS_KEY).await.as_deref() == Some(r#"{"data":"fresh"}"#) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broken entry was not replaced");
    }

    #[tokio::test]
    async fn query_order_produces_distinct_entries() {
        let store = CacheStore::local();
        let (app, calls) = app(store.clone(), StatusCode::OK, json!({"data": []}));

        app.clone()
            .oneshot(request(Method::GET, "/gigs?a=1&b=2", Some(("u1", "student"))))
            .await
            .unwrap();
        wait_for_entry(&store, r#"gigs:user:u1:role:student:query:{"a":"1","b":"2"}"#)
            .await
            .expect("entry stored");

        let response = app
            .oneshot(request(Method::GET, "/gigs?b=2&a=1", Some(("u1", "student"))))
            .await
            .unwrap();
        assert!(response.headers().get(CACHE_STATUS_HEADER).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn annotate_adds_marker_fields_to_objects() {
        let annotated = annotate(json!({"data": [1]}), "2026-01-01T00:00:00Z");
        assert_eq!(
            annotated,
            json!({"data": [1], "cached": true, "cacheTimestamp": "2026-01-01T00:00:00Z"})
        );
    }

    #[test]
    fn annotate_namespaces_markers_on_conflict() {
        assert_eq!(
            annotate(json!({"cached": "domain value"}), "t"),
            json!({"cached": "domain value", "_cache": {"cached": true, "cacheTimestamp": "t"}})
        );
        assert_eq!(
            annotate(json!({"cacheTimestamp": 1, "_cache": 2}), "t"),
            json!({"cacheTimestamp": 1, "_cache": 2})
        );
    }

    #[test]
    fn annotate_leaves_arrays_alone() {
        assert_eq!(annotate(json!([1, 2]), "t"), json!([1, 2]));
        assert_eq!(annotate(json!("text"), "t"), json!("text"));
    }

    #[tokio::test]
    async fn array_hits_carry_markers_in_headers() {
        let store = CacheStore::local();
        let (app, calls) = app(store.clone(), StatusCode::OK, json!([1, 2, 3]));
        let key = "gigs:user:u1:role:student:query:{}";

        app.clone()
            .oneshot(request(Method::GET, "/gigs", Some(("u1", "student"))))
            .await
            .unwrap();
        wait_for_entry(&store, key).await.expect("entry stored");

        let hit = app
            .oneshot(request(Method::GET, "/gigs", Some(("u1", "student"))))
            .await
            .unwrap();
        assert_eq!(hit.headers().get(CACHE_STATUS_HEADER).unwrap(), "HIT");
        let served_at = hit
            .headers()
            .get(CACHE_TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .expect("timestamp header")
            .to_string();
        assert!(OffsetDateTime::parse(&served_at, &Rfc3339).is_ok());
        assert_eq!(body_json(hit).await, json!([1, 2, 3]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn builder_sets_ttl_and_prefix() {
        let cache = ResponseCache::new(CacheStore::disabled(), "bookings")
            .with_ttl(Duration::from_secs(30));
        assert_eq!(cache.prefix(), "bookings");
        assert_eq!(cache.ttl(), Duration::from_secs(30));

        let from_config =
            ResponseCache::from_config(CacheStore::disabled(), "gigs", &CacheConfig::default());
        assert_eq!(from_config.ttl(), DEFAULT_TTL);
    }

    #[test]
    fn from_config_reads_cache_settings() {
        let config = CacheConfig {
            default_ttl_secs: 45,
            store_timeout_ms: 250,
            admin_routes: false,
        };
        let cache = ResponseCache::from_config(CacheStore::disabled(), "gigs", &config);
        assert_eq!(cache.ttl(), Duration::from_secs(45));
        assert_eq!(cache.store_timeout, Duration::from_millis(250));
    }
}
