//! Pattern-based invalidation fired by domain writes.
//!
//! Call after the write has committed. Invalidation is best-effort: a reader
//! may still see the old entry until the pattern delete finishes, and a
//! failed delete leaves entries to expire by TTL.
//!
//! ```ignore
//! // booking accepted: both parties' booking lists are stale
//! invalidator
//!     .invalidate_for_many([&booking.student_id, &booking.teacher_id], "bookings")
//!     .await;
//! ```

use super::key::{prefix_pattern, user_pattern};
use super::store::CacheStore;

#[derive(Clone)]
pub struct CacheInvalidator {
    store: CacheStore,
}

impl CacheInvalidator {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// Drop one user's entries in a resource family, optionally only for one role.
    ///
    /// Returns the number of keys removed.
    pub async fn invalidate_for_user(&self, user_id: &str, prefix: &str, role: Option<&str>) -> u64 {
        if !self.store.is_available() {
            return 0;
        }

        let pattern = user_pattern(prefix, user_id, role);
        let deleted = self.store.delete_by_pattern(&pattern).await;
        if deleted > 0 {
            tracing::info!(pattern = %pattern, deleted, "Invalidated cached responses");
            crate::metrics::record_invalidated_keys(prefix, deleted);
        }
        deleted
    }

    /// Drop every entry of a resource family.
    ///
    /// Walks the whole keyspace; reserve it for changes that affect every
    /// caller, not routine writes.
    pub async fn invalidate_all_for_prefix(&self, prefix: &str) -> u64 {
        if !self.store.is_available() {
            return 0;
        }

        let pattern = prefix_pattern(prefix);
        let deleted = self.store.delete_by_pattern(&pattern).await;
        if deleted > 0 {
            tracing::info!(prefix = %prefix, deleted, "Invalidated all cached responses for prefix");
            crate::metrics::record_invalidated_keys(prefix, deleted);
        }
        deleted
    }

    /// Invalidate several users in turn, for events touching more than one party.
    ///
    /// Returns the total number of keys removed.
    pub async fn invalidate_for_many<I, S>(&self, user_ids: I, prefix: &str) -> u64
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.store.is_available() {
            return 0;
        }

        let mut total = 0;
        for user_id in user_ids {
            total += self.invalidate_for_user(user_id.as_ref(), prefix, None).await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seeded_store() -> CacheStore {
        let store = CacheStore::local();
        for key in [
            "bookings:user:u1:role:student:query:{}",
            r#"bookings:user:u1:role:student:query:{"status":"pending"}"#,
            "bookings:user:u1:role:teacher:query:{}",
            "bookings:user:u2:role:student:query:{}",
            "bookings:user:u3:role:teacher:query:{}",
            "gigs:user:u1:role:student:query:{}",
        ] {
            assert!(store.set(key, "{}", Some(Duration::from_secs(60))).await);
        }
        store
    }

    #[tokio::test]
    async fn user_and_role_scoping() {
        let store = seeded_store().await;
        let invalidator = CacheInvalidator::new(store.clone());

        let deleted = invalidator
            .invalidate_for_user("u1", "bookings", Some("student"))
            .await;
        assert_eq!(deleted, 2);

        assert!(store.get("bookings:user:u1:role:student:query:{}").await.is_none());
        assert!(store.get("bookings:user:u1:role:teacher:query:{}").await.is_some());
        assert!(store.get("bookings:user:u2:role:student:query:{}").await.is_some());
        assert!(store.get("gigs:user:u1:role:student:query:{}").await.is_some());
    }

    #[tokio::test]
    async fn without_role_every_role_goes() {
        let store = seeded_store().await;
        let invalidator = CacheInvalidator::new(store.clone());

        assert_eq!(invalidator.invalidate_for_user("u1", "bookings", None).await, 3);
        assert!(store.get("bookings:user:u2:role:student:query:{}").await.is_some());
    }

    #[tokio::test]
    async fn wildcard_user_ids_are_literal() {
        let store = seeded_store().await;
        let invalidator = CacheInvalidator::new(store.clone());

        assert_eq!(invalidator.invalidate_for_user("*", "bookings", None).await, 0);
        assert!(store.get("bookings:user:u1:role:student:query:{}").await.is_some());
    }

    #[tokio::test]
    async fn whole_prefix() {
        let store = seeded_store().await;
        let invalidator = CacheInvalidator::new(store.clone());

        assert_eq!(invalidator.invalidate_all_for_prefix("bookings").await, 5);
        assert!(store.get("gigs:user:u1:role:student:query:{}").await.is_some());
    }

    #[tokio::test]
    async fn many_users_sum_their_deletes() {
        let store = seeded_store().await;
        let invalidator = CacheInvalidator::new(store.clone());

        let total = invalidator
            .invalidate_for_many(["u1", "u3", "nobody"], "bookings")
            .await;
        assert_eq!(total, 4);
        assert!(store.get("bookings:user:u2:role:student:query:{}").await.is_some());
    }

    #[tokio::test]
    async fn unavailable_store_deletes_nothing() {
        let invalidator = CacheInvalidator::new(CacheStore::disabled());
        assert_eq!(invalidator.invalidate_for_user("u1", "bookings", None).await, 0);
        assert_eq!(invalidator.invalidate_all_for_prefix("bookings").await, 0);
        assert_eq!(
            invalidator
                .invalidate_for_many(vec!["u1".to_string(), "u2".to_string()], "bookings")
                .await,
            0
        );
    }
}
