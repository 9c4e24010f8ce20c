//! Redis-backed rate limiter.
//!
//! The check is a single Lua script (INCR + PEXPIRE + PTTL) so the
//! read-decrement is atomic for concurrent callers of the same key, across
//! all backend nodes sharing the store.

use std::time::Duration;

use async_trait::async_trait;
use plaza_types::{Timestamp, UserId};
use redis::Script;
use redis::aio::ConnectionManager;

use crate::metrics::METRICS_ID_NODE_RATE_LIMITED;
use crate::services::rate_limiter::{
    Quota, RateAction, RateLimitError, RateLimitStatus, RateLimitTable, RateLimiter,
};

const CHECK_SCRIPT: &str = r"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end
local limit = tonumber(ARGV[1])
if current > limit then
  return {0, 0, ttl}
end
return {1, limit - current, ttl}
";

/// Rate limiter backed by a shared Redis instance.
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    table: RateLimitTable,
    op_timeout: Duration,
    check_script: Script,
}

impl RedisRateLimiter {
    /// Connects to the store and prepares the check script.
    pub async fn connect(
        url: &str,
        table: RateLimitTable,
        op_timeout: Duration,
    ) -> eyre::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            table,
            op_timeout,
            check_script: Script::new(CHECK_SCRIPT),
        })
    }

    fn quota(&self, action: RateAction) -> Result<Quota, RateLimitError> {
        self.table.get(action).ok_or(RateLimitError::Denied(action))
    }

    fn bucket_key(user: &UserId, action: RateAction) -> String {
        format!("plaza:rl:{user}:{action}")
    }

    fn reset_at(ttl_ms: i64) -> Timestamp {
        if ttl_ms < 0 {
            Timestamp::now()
        } else {
            Timestamp::from_millis(Timestamp::now().as_millis() + ttl_ms as u64)
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(
        &self,
        user: &UserId,
        action: RateAction,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let quota = self.quota(action)?;
        let mut conn = self.conn.clone();
        let invocation = async {
            self.check_script
                .key(Self::bucket_key(user, action))
                .arg(quota.limit)
                .arg(quota.window.as_millis() as u64)
                .invoke_async::<(i32, u32, i64)>(&mut conn)
                .await
        };
        let (allowed, remaining, ttl_ms) = match tokio::time::timeout(self.op_timeout, invocation)
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err(RateLimitError::Store(err.into())),
            Err(_) => {
                return Err(RateLimitError::Store(eyre::eyre!(
                    "rate limit check timed out after {:?}",
                    self.op_timeout
                )));
            }
        };
        if allowed == 0 {
            ::metrics::counter!(METRICS_ID_NODE_RATE_LIMITED).increment(1);
            let retry_after = if ttl_ms < 0 {
                quota.window
            } else {
                Duration::from_millis(ttl_ms as u64)
            };
            return Err(RateLimitError::Exceeded {
                action,
                retry_after,
            });
        }
        Ok(RateLimitStatus {
            limit: quota.limit,
            remaining,
            reset_at: Self::reset_at(ttl_ms),
        })
    }

    async fn observe(
        &self,
        user: &UserId,
        action: RateAction,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let quota = self.quota(action)?;
        let key = Self::bucket_key(user, action);
        let mut conn = self.conn.clone();
        let query = async {
            redis::pipe()
                .get(&key)
                .cmd("PTTL")
                .arg(&key)
                .query_async::<(Option<u32>, i64)>(&mut conn)
                .await
        };
        let (count, ttl_ms) = match tokio::time::timeout(self.op_timeout, query).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err(RateLimitError::Store(err.into())),
            Err(_) => {
                return Err(RateLimitError::Store(eyre::eyre!(
                    "rate limit observe timed out after {:?}",
                    self.op_timeout
                )));
            }
        };
        Ok(RateLimitStatus {
            limit: quota.limit,
            remaining: quota.limit.saturating_sub(count.unwrap_or(0)),
            reset_at: Self::reset_at(ttl_ms),
        })
    }
}
