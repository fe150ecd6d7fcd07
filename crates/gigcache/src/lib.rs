pub mod cache;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use cache::{
    CacheInvalidator, CacheKey, CacheStore, CallerIdentity, ResponseCache, StoreStatus,
    cache_responses,
};
pub use config::{AppConfig, CacheConfig, RedisConfig, ServerConfig};
pub use middleware::caller_identity_from_headers;
pub use observability::{apply_logging_level, init_tracing};
pub use server::{AppState, GigcacheServer, ServerBuilder, build_app};
