//! Fail-soft key-value store adapter.
//!
//! [`CacheStore`] is the only handle the rest of the crate uses to talk to
//! the backing store. Every operation returns a neutral value (`None`,
//! `false`, `0`) instead of an error: a struggling cache tier must behave
//! like a disabled one, only slower.
//!
//! ## Backends
//!
//! - **Disabled**: no endpoint configured, every call is a no-op
//! - **Local**: in-process `DashMap` with per-entry expiry (single instance, tests)
//! - **Redis**: deadpool pool shared by all requests, plus a health monitor
//!   that restores readiness with bounded backoff after transport failures

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use deadpool_redis::{Connection, Pool, Runtime};
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::glob::Glob;
use crate::config::RedisConfig;

/// TTL used when a caller doesn't supply one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 500;
/// Keys per `DEL` command when bulk deleting.
const DELETE_CHUNK: usize = 1000;
/// Linear step between reconnect attempts, capped by `max_backoff`.
const RECONNECT_STEP: Duration = Duration::from_millis(50);
/// How often the local backend drops expired entries.
pub const LOCAL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Errors raised inside the adapter. They never cross the public API.
#[derive(Debug, thiserror::Error)]
enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("store is read-only: {0}")]
    ReadOnly(RedisError),

    #[error("command failed: {0}")]
    Command(RedisError),
}

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.kind() == ErrorKind::ReadOnly || e.code() == Some("READONLY") {
            StoreError::ReadOnly(e)
        } else {
            StoreError::Command(e)
        }
    }
}

impl StoreError {
    /// Whether the failure says something about the connection rather than
    /// the command itself.
    fn is_transport(&self) -> bool {
        match self {
            StoreError::Pool(_) | StoreError::Timeout(_) => true,
            StoreError::ReadOnly(_) => false,
            StoreError::Command(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
        }
    }
}

/// Externally visible state of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// No endpoint configured
    Disabled,
    /// Live, ready connection
    Available,
    /// Configured but currently unreachable (or disconnected)
    Unavailable,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Disabled => "disabled",
            StoreStatus::Available => "available",
            StoreStatus::Unavailable => "unavailable",
        }
    }
}

/// A cached value with its expiry deadline.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub value: Arc<str>,
    pub expires_at: Instant,
}

impl CachedEntry {
    pub fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: Arc::from(value),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Shared handle to the response store.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<Backend>,
}

enum Backend {
    Disabled,
    Local(LocalStore),
    Redis(RedisStore),
}

impl CacheStore {
    /// A store that never caches anything.
    pub fn disabled() -> Self {
        Self {
            backend: Arc::new(Backend::Disabled),
        }
    }

    /// An in-process store with per-entry expiry.
    ///
    /// Expired entries are swept every [`LOCAL_SWEEP_INTERVAL`] when a Tokio
    /// runtime is available.
    pub fn local() -> Self {
        Self::local_with_sweep(LOCAL_SWEEP_INTERVAL)
    }

    /// An in-process store sweeping expired entries every `interval`.
    pub fn local_with_sweep(interval: Duration) -> Self {
        Self {
            backend: Arc::new(Backend::Local(LocalStore::new(interval))),
        }
    }

    /// Connect to the configured Redis endpoint.
    ///
    /// Never fails:
    /// - no URL → disabled (logged once, here)
    /// - invalid URL → disabled
    /// - unreachable server → unavailable, the health monitor keeps retrying
    pub async fn connect(config: &RedisConfig) -> Self {
        let Some(url) = config.url.as_deref() else {
            tracing::warn!("Redis URL not configured, response caching disabled");
            return Self::disabled();
        };

        tracing::info!(url = %redact_url(url), "Connecting to Redis");

        let mut redis_config = deadpool_redis::Config::from_url(url);
        let mut pool_config = redis_config.get_pool_config();
        let pool_timeout = Duration::from_millis(config.timeout_ms);
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(pool_timeout);
        pool_config.timeouts.create = Some(pool_timeout);
        pool_config.timeouts.recycle = Some(pool_timeout);
        redis_config.pool = Some(pool_config);

        let pool = match redis_config.create_pool(Some(Runtime::Tokio1)) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create Redis pool, response caching disabled");
                return Self::disabled();
            }
        };

        let store = RedisStore::new(pool, config.command_timeout());
        match store.ping().await {
            Ok(()) => {
                store.health.mark_ready();
                tracing::info!("Connected to Redis");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Redis unreachable, serving uncached until it comes back"
                );
            }
        }
        crate::metrics::set_store_available(store.health.is_ready());

        store.spawn_monitor(config.max_backoff());

        Self {
            backend: Arc::new(Backend::Redis(store)),
        }
    }

    /// True only when a live, ready connection exists.
    pub fn is_available(&self) -> bool {
        match self.backend.as_ref() {
            Backend::Disabled => false,
            Backend::Local(_) => true,
            Backend::Redis(store) => store.is_usable(),
        }
    }

    pub fn status(&self) -> StoreStatus {
        match self.backend.as_ref() {
            Backend::Disabled => StoreStatus::Disabled,
            _ if self.is_available() => StoreStatus::Available,
            _ => StoreStatus::Unavailable,
        }
    }

    /// Fetch a value. `None` on miss, error, or when unavailable.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.backend.as_ref() {
            Backend::Disabled => None,
            Backend::Local(local) => {
                let entry = local.map.get(key)?;
                if entry.is_expired() {
                    drop(entry);
                    local.map.remove_if(key, |_, e| e.is_expired());
                    return None;
                }
                Some(entry.value.to_string())
            }
            Backend::Redis(store) => {
                if !store.is_usable() {
                    return None;
                }
                match store.get(key).await {
                    Ok(value) => value,
                    Err(e) => {
                        store.degrade("GET", key, e);
                        None
                    }
                }
            }
        }
    }

    /// Store `value` under `key`, expiring after `ttl` ([`DEFAULT_TTL`] when `None`).
    ///
    /// Returns `false` on any failure, including a zero TTL.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(DEFAULT_TTL);
        if ttl.is_zero() {
            tracing::debug!(key = %key, "refusing to store entry with zero TTL");
            return false;
        }

        match self.backend.as_ref() {
            Backend::Disabled => false,
            Backend::Local(local) => {
                local.map.insert(key.to_string(), CachedEntry::new(value, ttl));
                true
            }
            Backend::Redis(store) => {
                if !store.is_usable() {
                    return false;
                }
                match store.set(key, value, ttl).await {
                    Ok(()) => true,
                    Err(e) => {
                        store.degrade("SET", key, e);
                        false
                    }
                }
            }
        }
    }

    /// Delete a single key. `true` when the delete command succeeded.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.as_ref() {
            Backend::Disabled => false,
            Backend::Local(local) => {
                local.map.remove(key);
                true
            }
            Backend::Redis(store) => {
                if !store.is_usable() {
                    return false;
                }
                match store.delete(key).await {
                    Ok(()) => true,
                    Err(e) => {
                        store.degrade("DEL", key, e);
                        false
                    }
                }
            }
        }
    }

    /// Delete every key matching the glob `pattern`.
    ///
    /// Enumerate-then-delete, not atomic: keys written concurrently may
    /// survive. Returns the number of keys removed, `0` on failure.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        match self.backend.as_ref() {
            Backend::Disabled => 0,
            Backend::Local(local) => {
                let glob = match Glob::new(pattern) {
                    Ok(glob) => glob,
                    Err(e) => {
                        tracing::warn!(pattern = %pattern, error = %e, "Invalid invalidation pattern");
                        return 0;
                    }
                };
                let mut deleted = 0;
                local.map.retain(|key, entry| {
                    if glob.is_match(key) {
                        if !entry.is_expired() {
                            deleted += 1;
                        }
                        false
                    } else {
                        true
                    }
                });
                deleted
            }
            Backend::Redis(store) => {
                if !store.is_usable() {
                    return 0;
                }
                match store.delete_by_pattern(pattern).await {
                    Ok(deleted) => deleted,
                    Err(e) => {
                        store.degrade("SCAN/DEL", pattern, e);
                        0
                    }
                }
            }
        }
    }

    /// Close the connection. Further operations behave as unavailable.
    pub async fn disconnect(&self) {
        match self.backend.as_ref() {
            Backend::Disabled => {}
            Backend::Local(local) => local.close(),
            Backend::Redis(store) => store.close(),
        }
    }
}

struct LocalStore {
    map: Arc<DashMap<String, CachedEntry>>,
    shutdown: CancellationToken,
    _sweeper_guard: DropGuard,
}

impl LocalStore {
    fn new(sweep_interval: Duration) -> Self {
        let map = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(sweep_expired(
                    Arc::clone(&map),
                    sweep_interval,
                    shutdown.clone(),
                ));
            }
            Err(_) => {
                tracing::debug!("No Tokio runtime, local cache entries expire on read only");
            }
        }
        Self {
            map,
            _sweeper_guard: shutdown.clone().drop_guard(),
            shutdown,
        }
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.map.clear();
    }
}

/// Drop expired entries every `interval` until `shutdown` fires.
async fn sweep_expired(
    map: Arc<DashMap<String, CachedEntry>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let before = map.len();
                map.retain(|_, entry| !entry.is_expired());
                let removed = before.saturating_sub(map.len());
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired local cache entries");
                }
            }
        }
    }
}

/// Readiness flag shared with the health monitor.
struct Health {
    ready: AtomicBool,
    wake: Notify,
}

impl Health {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::AcqRel) {
            crate::metrics::set_store_available(true);
        }
    }

    fn mark_down(&self) {
        if self.ready.swap(false, Ordering::AcqRel) {
            crate::metrics::set_store_available(false);
            self.wake.notify_one();
        }
    }
}

struct RedisStore {
    pool: Pool,
    health: Arc<Health>,
    command_timeout: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
    // Cancels the monitor if the store is dropped without `disconnect`.
    _monitor_guard: DropGuard,
}

impl RedisStore {
    fn new(pool: Pool, command_timeout: Duration) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            pool,
            health: Arc::new(Health {
                ready: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            command_timeout,
            closed: AtomicBool::new(false),
            _monitor_guard: shutdown.clone().drop_guard(),
            shutdown,
        }
    }

    fn is_usable(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.health.is_ready()
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        ping(&self.pool, self.command_timeout).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        // Millisecond precision so sub-second TTLs behave the same as locally.
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_ms);
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.del::<_, ()>(key)).await
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut scan = redis::cmd("SCAN");
            scan.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) =
                self.bounded(scan.query_async(&mut conn)).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(0);
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();

        let mut deleted = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let mut del = redis::cmd("DEL");
            for key in chunk {
                del.arg(key);
            }
            let removed: u64 = self.bounded(del.query_async(&mut conn)).await?;
            deleted += removed;
        }
        Ok(deleted)
    }

    /// Convert a failure into its side effects. The caller returns the neutral value.
    fn degrade(&self, op: &'static str, key: &str, err: StoreError) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match err {
            StoreError::ReadOnly(ref e) => {
                tracing::warn!(op, key = %key, error = %e, "Redis is read-only, reconnecting");
                self.reconnect();
            }
            ref e if e.is_transport() => {
                tracing::warn!(op, key = %key, error = %e, "Redis unavailable");
                self.health.mark_down();
            }
            ref e => {
                tracing::warn!(op, key = %key, error = %e, "Redis command error");
            }
        }
    }

    /// Drop every pooled connection and let the monitor establish fresh ones.
    fn reconnect(&self) {
        let _ = self.pool.retain(|_, _| false);
        self.health.mark_down();
    }

    fn spawn_monitor(&self, max_backoff: Duration) {
        let monitor = HealthMonitor {
            pool: self.pool.clone(),
            health: Arc::clone(&self.health),
            shutdown: self.shutdown.clone(),
            command_timeout: self.command_timeout,
            max_backoff,
        };
        tokio::spawn(monitor.run());
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.health.mark_down();
        self.pool.close();
        tracing::info!("Disconnected from Redis");
    }
}

/// Background task that restores readiness after the store goes down.
///
/// Sleeps while the store is ready; once marked down it pings with a
/// linearly growing delay (50 ms per attempt, capped at `max_backoff`).
struct HealthMonitor {
    pool: Pool,
    health: Arc<Health>,
    shutdown: CancellationToken,
    command_timeout: Duration,
    max_backoff: Duration,
}

impl HealthMonitor {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            if self.health.is_ready() {
                attempt = 0;
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.health.wake.notified() => continue,
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = reconnect_delay(attempt, self.max_backoff);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to Redis");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match ping(&self.pool, self.command_timeout).await {
                Ok(()) => {
                    self.health.mark_ready();
                    tracing::info!(attempt, "Redis connection restored");
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Redis still unreachable");
                }
            }
        }
        tracing::debug!("Redis health monitor stopped");
    }
}

async fn ping(pool: &Pool, timeout: Duration) -> Result<(), StoreError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))?;
    let cmd = redis::cmd("PING");
    match tokio::time::timeout(timeout, cmd.query_async(&mut conn)).await {
        Ok(result) => result.map(|_: String| ()).map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
fn reconnect_delay(attempt: u32, max_backoff: Duration) -> Duration {
    RECONNECT_STEP.saturating_mul(attempt).min(max_backoff)
}

/// Strip credentials from a connection URL before logging it.
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("redacted"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
