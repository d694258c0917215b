//! Denial notice flood protection
//!
//! Users that are refused (not on the allow-list, or rate limited) get a
//! notice at most once per cooldown; everything after that is silent so the
//! bot itself does not run into Telegram's limits.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which notice was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// User is not on the allow-list
    AccessDenied,
    /// User exceeded the request quota
    TooManyRequests,
}

/// Cache of recently sent denial notices
#[derive(Clone)]
pub struct DenialNoticeCache {
    /// `(user_id, kind)` -> () with the cooldown as TTL
    cache: Cache<(i64, NoticeKind), ()>,
    cooldown: Duration,
    silenced_count: Arc<AtomicU64>,
}

impl DenialNoticeCache {
    /// Create a cache with `cooldown_secs` between notices of the same kind
    /// to the same user.
    ///
    /// # Examples
    ///
    /// ```
    /// use oxide_fetch::bot::DenialNoticeCache;
    ///
    /// let cache = DenialNoticeCache::new(900, 10_000);
    /// assert_eq!(cache.cooldown().as_secs(), 900);
    /// ```
    #[must_use]
    pub fn new(cooldown_secs: u64, max_capacity: u64) -> Self {
        let cooldown = Duration::from_secs(cooldown_secs);
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(cooldown)
            .build();

        Self {
            cache,
            cooldown,
            silenced_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether a notice of `kind` should be sent to `user_id` now.
    ///
    /// Only every 100th silenced attempt is logged.
    pub async fn should_send(&self, user_id: i64, kind: NoticeKind) -> bool {
        if self.cache.get(&(user_id, kind)).await.is_none() {
            return true;
        }

        let count = self.silenced_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(
                silenced = count,
                user_id,
                ?kind,
                "Silenced denial notices"
            );
        }
        false
    }

    /// Start the cooldown after a notice was delivered.
    pub async fn mark_sent(&self, user_id: i64, kind: NoticeKind) {
        self.cache.insert((user_id, kind), ()).await;
    }

    /// Total number of silenced notices
    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced_count.load(Ordering::Relaxed)
    }

    /// Configured cooldown
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }
}
