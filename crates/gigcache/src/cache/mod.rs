//! Per-caller response caching.
//!
//! ## Architecture
//!
//! - **Store** ([`CacheStore`]): fail-soft adapter over Redis (or a local map)
//! - **Middleware** ([`cache_responses`]): read-through caching of GET routes,
//!   keyed by prefix, caller, role and query
//! - **Invalidation** ([`CacheInvalidator`]): pattern deletes fired after writes
//!
//! ## Graceful Degradation
//!
//! Any store failure turns into a miss or a no-op. With Redis down or not
//! configured, routes behave exactly as if they had no cache in front of them.

pub mod glob;
pub mod invalidation;
pub mod key;
pub mod middleware;
pub mod store;

pub use invalidation::CacheInvalidator;
pub use key::{ANONYMOUS_USER, CacheKey, CallerIdentity, GUEST_ROLE};
pub use middleware::{
    CACHE_NAMESPACE_FIELD, CACHE_STATUS_HEADER, CACHE_TIMESTAMP_FIELD, CACHE_TIMESTAMP_HEADER,
    CACHED_FIELD, ResponseCache, cache_responses,
};
pub use store::{CacheStore, CachedEntry, DEFAULT_TTL, LOCAL_SWEEP_INTERVAL, StoreStatus};
