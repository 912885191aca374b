//! Redis-backed shared store. Every read-modify-write runs as a Lua script
//! so concurrent workers on different nodes never interleave inside one.

use crate::bucket::{BucketOutcome, BucketParams};
use crate::{AtomicStore, ClaimOutcome};
use async_trait::async_trait;
use dispatch_core::config::RedisConfig;
use dispatch_core::{DispatchError, DispatchResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info};

const COMPLETED_MARKER: &str = "done";
#[cfg(test)]
const HELD_PREFIX: &str = "held:";

/// KEYS[1] bucket; ARGV: capacity, refill/sec, now ms, cost, idle ttl ms.
/// Returns {allowed, retry_after_ms, tokens_remaining as string}.
const CONSUME_TOKENS_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + (elapsed / 1000.0) * rate)

if tokens >= cost then
  local remaining = tokens - cost
  redis.call('HSET', KEYS[1], 'tokens', tostring(remaining), 'ts', tostring(math.max(now, ts)))
  redis.call('PEXPIRE', KEYS[1], ttl)
  return {1, 0, tostring(remaining)}
end

local retry = math.max(1, math.ceil((cost - tokens) / rate * 1000))
return {0, retry, tostring(tokens)}
"#;

/// KEYS[1] bucket; ARGV: capacity, refill/sec, now ms.
const PEEK_TOKENS_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  return tostring(capacity)
end
local elapsed = math.max(0, now - ts)
return tostring(math.min(capacity, tokens + (elapsed / 1000.0) * rate))
"#;

/// KEYS[1] claim; ARGV: owner, ttl ms. Returns {code, remaining ms} with
/// code 0 = acquired, 1 = held, 2 = completed. Expired claims are already
/// gone from Redis, so a missing key is always claimable.
const TRY_CLAIM_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], 'held:' .. ARGV[1], 'PX', ARGV[2])
  return {0, 0}
end
if current == 'done' then
  return {2, 0}
end
return {1, redis.call('PTTL', KEYS[1])}
"#;

/// KEYS[1] claim; ARGV[1] owner. Deletes only the caller's own claim.
const RELEASE_CLAIM_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == 'held:' .. ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis store shared by every worker and admission node.
pub struct RedisStore {
    conn: ConnectionManager,
    consume_script: Script,
    peek_script: Script,
    claim_script: Script,
    release_script: Script,
}

fn store_err(e: redis::RedisError) -> DispatchError {
    metrics::counter!("store.redis.errors").increment(1);
    DispatchError::infrastructure(format!("redis: {e}"))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisStore {
    /// Connect to Redis and verify the connection.
    pub async fn connect(config: &RedisConfig) -> DispatchResult<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str()).map_err(store_err)?;
        let connect = ConnectionManager::new(client);
        let mut conn = tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
            .await
            .map_err(|_| DispatchError::Infrastructure(format!("redis connect to {url} timed out")))?
            .map_err(store_err)?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(store_err)?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            consume_script: Script::new(CONSUME_TOKENS_LUA),
            peek_script: Script::new(PEEK_TOKENS_LUA),
            claim_script: Script::new(TRY_CLAIM_LUA),
            release_script: Script::new(RELEASE_CLAIM_LUA),
        })
    }
}

fn parse_tokens(raw: &str) -> DispatchResult<f64> {
    raw.parse::<f64>()
        .map_err(|e| DispatchError::Infrastructure(format!("bad token count '{raw}' from redis: {e}")))
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn consume_tokens(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
        cost: f64,
    ) -> DispatchResult<BucketOutcome> {
        let mut conn = self.conn.clone();
        let (allowed, retry_after_ms, tokens): (i64, i64, String) = self
            .consume_script
            .key(key)
            .arg(params.capacity)
            .arg(params.refill_per_sec)
            .arg(now_ms)
            .arg(cost)
            .arg(millis(params.idle_ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            retry_after_ms: retry_after_ms.max(0) as u64,
            tokens_remaining: parse_tokens(&tokens)?,
        })
    }

    async fn peek_tokens(&self, key: &str, params: &BucketParams, now_ms: i64) -> DispatchResult<f64> {
        let mut conn = self.conn.clone();
        let tokens: String = self
            .peek_script
            .key(key)
            .arg(params.capacity)
            .arg(params.refill_per_sec)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        parse_tokens(&tokens)
    }

    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> DispatchResult<ClaimOutcome> {
        let mut conn = self.conn.clone();
        let (code, remaining_ms): (i64, i64) = self
            .claim_script
            .key(key)
            .arg(owner)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let outcome = match code {
            0 => ClaimOutcome::Acquired,
            2 => ClaimOutcome::Completed,
            _ => ClaimOutcome::Held {
                // PTTL is -1 for a key without expiry; treat as one full TTL.
                remaining: if remaining_ms >= 0 {
                    Duration::from_millis(remaining_ms as u64)
                } else {
                    ttl
                },
            },
        };
        debug!(key = key, owner = owner, outcome = ?outcome, "Claim attempted");
        Ok(outcome)
    }

    async fn complete_claim(&self, key: &str, ttl: Duration) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        conn.pset_ex::<_, _, ()>(key, COMPLETED_MARKER, millis(ttl))
            .await
            .map_err(store_err)
    }

    async fn release_claim(&self, key: &str, owner: &str) -> DispatchResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(store_err)?;
        Ok(())
    }
}
