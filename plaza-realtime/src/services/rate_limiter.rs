//! Per-(user, action) quota enforcement.
//!
//! This module defines the [`RateLimiter`] trait, which decides whether a
//! user may perform an action now, plus the advisory [`RateLimitStatus`]
//! exposed in response metadata.
//!
//! Current `RateLimiter` implementations:
//! - [`MemoryRateLimiter`] (process-local, single-node and tests)
//! - Redis (cross-node, feature `redis`)

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use plaza_types::{Timestamp, UserId};

use crate::metrics::METRICS_ID_NODE_RATE_LIMITED;

#[cfg(feature = "redis")]
pub mod redis;

/// Dynamic trait object for the rate limiter service.
///
/// Must be `Send + Sync` to work with async contexts (e.g., Axum).
pub type RateLimiterService = Arc<dyn RateLimiter + Send + Sync>;

/// The gated actions.
///
/// The set is closed on purpose: a frame type that wants gating must be
/// added here, and an action missing from the configured [`RateLimitTable`]
/// is denied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateAction {
    /// Creating a new presence session.
    CreateSession,
    /// Streaming an avatar position update.
    UpdateAvatar,
    /// Creating a POI.
    CreatePoi,
    /// Joining a POI.
    JoinPoi,
}

impl RateAction {
    /// Stable key used in store keys and log output.
    pub fn key(self) -> &'static str {
        match self {
            RateAction::CreateSession => "create_session",
            RateAction::UpdateAvatar => "update_avatar",
            RateAction::CreatePoi => "create_poi",
            RateAction::JoinPoi => "join_poi",
        }
    }
}

impl fmt::Display for RateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A per-action quota: `limit` requests per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    /// Number of requests allowed per window.
    pub limit: u32,
    /// The fixed window length.
    pub window: Duration,
}

/// Error produced while parsing a [`Quota`] from its `count/window` form.
#[derive(Debug, thiserror::Error)]
pub enum QuotaParseError {
    /// The value lacked the `count/window` shape.
    #[error("expected quota of the form `count/window`, e.g. `60/1m`")]
    Shape,
    /// The count part was not a positive integer.
    #[error("invalid request count: {0}")]
    Count(#[from] std::num::ParseIntError),
    /// The window part was not a humantime duration.
    #[error("invalid window: {0}")]
    Window(#[from] humantime::DurationError),
}

impl Quota {
    /// Parses a quota of the form `count/window`, e.g. `60/1m` or `5/30s`.
    ///
    /// Used as a clap value parser for the per-action config fields.
    pub fn parse(value: &str) -> Result<Self, QuotaParseError> {
        let (count, window) = value.split_once('/').ok_or(QuotaParseError::Shape)?;
        Ok(Self {
            limit: count.trim().parse()?,
            window: humantime::parse_duration(window.trim())?,
        })
    }
}

/// The configured quota per action. Actions without an entry are denied.
#[derive(Clone, Debug, Default)]
pub struct RateLimitTable(HashMap<RateAction, Quota>);

impl RateLimitTable {
    /// Sets the quota for an action, replacing any previous entry.
    pub fn insert(&mut self, action: RateAction, quota: Quota) {
        self.0.insert(action, quota);
    }

    /// Looks up the quota for an action.
    pub fn get(&self, action: RateAction) -> Option<Quota> {
        self.0.get(&action).copied()
    }
}

/// Advisory counters for response metadata; reading them has no side effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// The configured per-window limit.
    pub limit: u32,
    /// Requests still available in the current window.
    pub remaining: u32,
    /// When the current window resets.
    pub reset_at: Timestamp,
}

/// All errors a rate-limit check may produce.
///
/// Store failures are infrastructure failures and are never reported as
/// [`RateLimitError::Exceeded`].
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The bucket is depleted; retry after the contained duration.
    #[error("rate limit for {action} exceeded, retry after {retry_after:?}")]
    Exceeded {
        /// The denied action.
        action: RateAction,
        /// Time until the window resets.
        retry_after: Duration,
    },
    /// The action has no configured quota and is denied.
    #[error("action {0} has no configured quota")]
    Denied(RateAction),
    /// The backing store failed or timed out.
    #[error("rate limit store error: {0}")]
    Store(#[source] eyre::Error),
}

/// Decides whether a user may perform an action now.
#[async_trait]
pub trait RateLimiter {
    /// Atomically consumes one token from the `(user, action)` bucket.
    ///
    /// When the window has elapsed since its start, the bucket resets to
    /// capacity and the window start shifts to now.
    async fn check(
        &self,
        user: &UserId,
        action: RateAction,
    ) -> Result<RateLimitStatus, RateLimitError>;

    /// Reports the bucket state without consuming a token.
    async fn observe(
        &self,
        user: &UserId,
        action: RateAction,
    ) -> Result<RateLimitStatus, RateLimitError>;
}

struct Bucket {
    remaining: u32,
    window_start: Instant,
}

/// Process-local rate limiter.
///
/// Buckets live in a mutex-guarded map keyed by `(user, action)`; idle
/// buckets are swept when their window has fully elapsed so dynamic user
/// populations don't grow the map unboundedly.
pub struct MemoryRateLimiter {
    table: RateLimitTable,
    buckets: Mutex<Buckets>,
}

struct Buckets {
    entries: HashMap<(UserId, RateAction), Bucket>,
    last_sweep: Instant,
}

/// Idle buckets are collected at most this often.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl MemoryRateLimiter {
    /// Creates a limiter enforcing the provided quota table.
    pub fn new(table: RateLimitTable) -> Self {
        Self {
            table,
            buckets: Mutex::new(Buckets {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    fn quota(&self, action: RateAction) -> Result<Quota, RateLimitError> {
        self.table.get(action).ok_or(RateLimitError::Denied(action))
    }

    fn status(quota: Quota, bucket: &Bucket) -> RateLimitStatus {
        let elapsed = bucket.window_start.elapsed();
        let resets_in = quota.window.saturating_sub(elapsed);
        RateLimitStatus {
            limit: quota.limit,
            remaining: bucket.remaining,
            reset_at: Timestamp::from_millis(
                Timestamp::now().as_millis() + resets_in.as_millis() as u64,
            ),
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(
        &self,
        user: &UserId,
        action: RateAction,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let quota = self.quota(action)?;
        let mut buckets = self.buckets.lock();
        if buckets.last_sweep.elapsed() >= SWEEP_INTERVAL {
            buckets.last_sweep = Instant::now();
            buckets
                .entries
                .retain(|(_, action), bucket| match self.table.get(*action) {
                    Some(quota) => bucket.window_start.elapsed() < quota.window,
                    None => false,
                });
        }

        let bucket = buckets
            .entries
            .entry((user.clone(), action))
            .or_insert_with(|| Bucket {
                remaining: quota.limit,
                window_start: Instant::now(),
            });
        if bucket.window_start.elapsed() >= quota.window {
            bucket.remaining = quota.limit;
            bucket.window_start = Instant::now();
        }
        if bucket.remaining == 0 {
            let retry_after = quota.window.saturating_sub(bucket.window_start.elapsed());
            ::metrics::counter!(METRICS_ID_NODE_RATE_LIMITED).increment(1);
            return Err(RateLimitError::Exceeded {
                action,
                retry_after,
            });
        }
        bucket.remaining -= 1;
        Ok(Self::status(quota, bucket))
    }

    async fn observe(
        &self,
        user: &UserId,
        action: RateAction,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let quota = self.quota(action)?;
        let buckets = self.buckets.lock();
        match buckets.entries.get(&(user.clone(), action)) {
            Some(bucket) if bucket.window_start.elapsed() < quota.window => {
                Ok(Self::status(quota, bucket))
            }
            _ => Ok(RateLimitStatus {
                limit: quota.limit,
                remaining: quota.limit,
                reset_at: Timestamp::now(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window: Duration) -> MemoryRateLimiter {
        let mut table = RateLimitTable::default();
        table.insert(RateAction::UpdateAvatar, Quota { limit, window });
        MemoryRateLimiter::new(table)
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = limiter(3, Duration::from_secs(60));
        let user = UserId::from("ada");
        for expected_remaining in [2, 1, 0] {
            let status = limiter.check(&user, RateAction::UpdateAvatar).await.unwrap();
            assert_eq!(status.remaining, expected_remaining);
        }
        let err = limiter
            .check(&user, RateAction::UpdateAvatar)
            .await
            .unwrap_err();
        match err {
            RateLimitError::Exceeded { retry_after, .. } => {
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected Exceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_elapse_resets_the_bucket() {
        let limiter = limiter(1, Duration::from_millis(30));
        let user = UserId::from("ada");
        limiter.check(&user, RateAction::UpdateAvatar).await.unwrap();
        assert!(limiter.check(&user, RateAction::UpdateAvatar).await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.check(&user, RateAction::UpdateAvatar).await.is_ok());
    }

    #[tokio::test]
    async fn unconfigured_action_is_denied() {
        let limiter = limiter(3, Duration::from_secs(60));
        let user = UserId::from("ada");
        let err = limiter.check(&user, RateAction::CreatePoi).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Denied(RateAction::CreatePoi)));
    }

    #[tokio::test]
    async fn observe_has_no_side_effect() {
        let limiter = limiter(2, Duration::from_secs(60));
        let user = UserId::from("ada");
        limiter.check(&user, RateAction::UpdateAvatar).await.unwrap();
        let first = limiter
            .observe(&user, RateAction::UpdateAvatar)
            .await
            .unwrap();
        let second = limiter
            .observe(&user, RateAction::UpdateAvatar)
            .await
            .unwrap();
        assert_eq!(first.remaining, 1);
        assert_eq!(second.remaining, 1);
    }

    #[tokio::test]
    async fn users_get_independent_buckets() {
        let limiter = limiter(1, Duration::from_secs(60));
        limiter
            .check(&UserId::from("ada"), RateAction::UpdateAvatar)
            .await
            .unwrap();
        assert!(
            limiter
                .check(&UserId::from("grace"), RateAction::UpdateAvatar)
                .await
                .is_ok()
        );
    }

    #[test]
    fn quota_parsing() {
        let quota = Quota::parse("60/1m").unwrap();
        assert_eq!(quota.limit, 60);
        assert_eq!(quota.window, Duration::from_secs(60));
        assert!(Quota::parse("60").is_err());
        assert!(Quota::parse("x/1m").is_err());
        assert!(Quota::parse("60/eternity").is_err());
    }
}
