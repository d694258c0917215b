//! Access guard: IP blocklist and per-user rate limiting.
//!
//! Every inbound request passes through [`AccessGuard::admit`] before the
//! session registry is consulted.

use crate::config::{
    RATE_LIMIT_BLOCK_SECS, RATE_LIMIT_CACHE_MAX_SIZE, RATE_LIMIT_POINTS, RATE_LIMIT_WINDOW_SECS,
};
use crate::download::OwnerId;
use moka::future::Cache;
use moka::ops::compute::Op;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessDenied {
    /// Origin address is on the blocklist
    #[error("Access denied from {ip}")]
    Blocked {
        /// Offending address
        ip: IpAddr,
    },
    /// Too many requests
    #[error("Too many requests, retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// Remaining block time
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

impl Bucket {
    const fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            blocked_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Verdict {
    Allowed,
    Tripped,
    Blocked(Duration),
}

/// Fixed-window limiter with a penalty block
///
/// Buckets live in a `moka` cache whose TTL covers a full window plus a
/// full block.
#[derive(Debug)]
pub struct RateLimiter {
    points: u32,
    window: Duration,
    block: Duration,
    buckets: Cache<OwnerId, Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(
            RATE_LIMIT_POINTS,
            Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            Duration::from_secs(RATE_LIMIT_BLOCK_SECS),
        )
    }
}

impl RateLimiter {
    /// `points` actions per `window`; exceeding it blocks for `block`.
    #[must_use]
    pub fn new(points: u32, window: Duration, block: Duration) -> Self {
        let buckets = Cache::builder()
            .max_capacity(RATE_LIMIT_CACHE_MAX_SIZE)
            .time_to_live(window + block)
            .build();
        Self {
            points,
            window,
            block,
            buckets,
        }
    }

    /// Consume one action for `user`.
    ///
    /// # Errors
    ///
    /// Returns the remaining block time when the user is over quota.
    pub async fn consume(&self, user: OwnerId) -> Result<(), Duration> {
        let now = Instant::now();
        let mut verdict = Verdict::Allowed;
        self.buckets
            .entry(user)
            .and_compute_with(|current| {
                let (bucket, outcome) = self.step(current.map(moka::Entry::into_value), now);
                verdict = outcome;
                std::future::ready(Op::Put(bucket))
            })
            .await;

        match verdict {
            Verdict::Allowed => Ok(()),
            Verdict::Tripped => {
                warn!(user_id = user, block_secs = self.block.as_secs(), "User exceeded request quota");
                Err(self.block)
            }
            Verdict::Blocked(remaining) => Err(remaining),
        }
    }

    fn step(&self, current: Option<Bucket>, now: Instant) -> (Bucket, Verdict) {
        let mut bucket = current.unwrap_or_else(|| Bucket::fresh(now));

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return (bucket, Verdict::Blocked(until - now));
            }
            bucket = Bucket::fresh(now);
        }
        if now.duration_since(bucket.window_start) >= self.window {
            bucket = Bucket::fresh(now);
        }

        bucket.count += 1;
        if bucket.count > self.points {
            bucket.blocked_until = Some(now + self.block);
            return (bucket, Verdict::Tripped);
        }
        (bucket, Verdict::Allowed)
    }
}

/// Set of refused origin addresses
#[derive(Debug, Default)]
pub struct IpBlocklist {
    ips: RwLock<HashSet<IpAddr>>,
}

impl IpBlocklist {
    /// Blocklist seeded with `ips`
    #[must_use]
    pub fn new(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            ips: RwLock::new(ips.into_iter().collect()),
        }
    }

    /// Add an address. Returns `false` if it was already blocked.
    pub async fn block(&self, ip: IpAddr) -> bool {
        self.ips.write().await.insert(ip)
    }

    /// Remove an address. Returns `false` if it was not blocked.
    pub async fn unblock(&self, ip: IpAddr) -> bool {
        self.ips.write().await.remove(&ip)
    }

    /// Check an address
    pub async fn is_blocked(&self, ip: IpAddr) -> bool {
        self.ips.read().await.contains(&ip)
    }

    /// Drop all entries
    pub async fn clear(&self) {
        self.ips.write().await.clear();
    }
}

/// Combined admission check
#[derive(Debug, Default)]
pub struct AccessGuard {
    limiter: RateLimiter,
    blocklist: IpBlocklist,
}

impl AccessGuard {
    /// Build a guard from its parts
    #[must_use]
    pub const fn new(limiter: RateLimiter, blocklist: IpBlocklist) -> Self {
        Self { limiter, blocklist }
    }

    /// Blocklist, for runtime changes
    #[must_use]
    pub const fn blocklist(&self) -> &IpBlocklist {
        &self.blocklist
    }

    /// Admit or refuse a request from `user` arriving from `origin`.
    ///
    /// The blocklist is checked first and only when the origin is known.
    ///
    /// # Errors
    ///
    /// See [`AccessDenied`].
    pub async fn admit(&self, user: OwnerId, origin: Option<IpAddr>) -> Result<(), AccessDenied> {
        if let Some(ip) = origin {
            if self.blocklist.is_blocked(ip).await {
                debug!(user_id = user, %ip, "Blocked origin");
                return Err(AccessDenied::Blocked { ip });
            }
        }
        self.limiter
            .consume(user)
            .await
            .map_err(|retry_after| AccessDenied::RateLimited { retry_after })
    }
}
