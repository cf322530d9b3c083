//! Atomic transaction contracts and their Lua bodies.
//!
//! Every script replies with a flat integer table so that all contracts
//! decode the same way. Timestamps are unix seconds supplied by the caller;
//! the scripts never read the server clock.

use super::AtomicScript;

/// Fixed window decision over a remaining-count key.
///
/// KEYS[1] = window key (`prefix:<bucket>`)
/// ARGV[1] = max count
/// ARGV[2] = ttl (seconds)
///
/// Returns: {allowed (0/1), remaining}
pub const FIXED_WINDOW_CONSUME: AtomicScript = AtomicScript {
    name: "fixed_window_consume",
    version: 1,
    source: r#"
local key = KEYS[1]
local max_count = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local remaining = redis.call('GET', key)
if not remaining then
    remaining = max_count
else
    remaining = tonumber(remaining)
end

if remaining <= 0 then
    return {0, 0}
end

remaining = remaining - 1
redis.call('SETEX', key, ttl, remaining)

return {1, remaining}
"#,
};

/// Credit a fixed window, treating an absent key as full.
///
/// KEYS[1] = window key
/// ARGV[1] = max count
/// ARGV[2] = increment
/// ARGV[3] = ttl (seconds)
///
/// Returns: {remaining}
pub const FIXED_WINDOW_INCREASE: AtomicScript = AtomicScript {
    name: "fixed_window_increase",
    version: 1,
    source: r#"
local key = KEYS[1]
local max_count = tonumber(ARGV[1])
local increment = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local remaining = redis.call('GET', key)
if not remaining then
    remaining = max_count
else
    remaining = tonumber(remaining)
end

remaining = math.min(max_count, remaining + increment)
redis.call('SETEX', key, ttl, remaining)

return {remaining}
"#,
};

/// Token bucket decision with cadence-aligned refill.
///
/// KEYS[1] = token count key
/// KEYS[2] = last refill timestamp key
/// ARGV[1] = max tokens
/// ARGV[2] = refill interval (seconds)
/// ARGV[3] = tokens per refill
/// ARGV[4] = current timestamp (seconds)
/// ARGV[5] = ttl (seconds)
///
/// Returns: {allowed (0/1), tokens}
pub const TOKEN_BUCKET_CONSUME: AtomicScript = AtomicScript {
    name: "token_bucket_consume",
    version: 1,
    source: r#"
local token_key = KEYS[1]
local time_key = KEYS[2]
local max_tokens = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local per_refill = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local tokens = redis.call('GET', token_key)
local last_refill = redis.call('GET', time_key)
if not tokens then
    tokens = max_tokens
else
    tokens = tonumber(tokens)
end
if not last_refill then
    last_refill = now
else
    last_refill = tonumber(last_refill)
end

-- Advance by whole cycles only so partial progress carries over
local cycles = math.floor((now - last_refill) / interval)
local tokens_to_add = cycles * per_refill
if tokens_to_add > 0 then
    tokens = math.min(max_tokens, tokens + tokens_to_add)
    last_refill = last_refill + cycles * interval
end

if tokens > 0 then
    tokens = tokens - 1
    redis.call('SETEX', token_key, ttl, tokens)
    redis.call('SETEX', time_key, ttl, last_refill)
    return {1, tokens}
end

redis.call('SETEX', time_key, ttl, last_refill)
return {0, tokens}
"#,
};

/// Refill-aware token count. Persists only when at least one cycle elapsed.
///
/// Same KEYS/ARGV as [`TOKEN_BUCKET_CONSUME`].
///
/// Returns: {tokens}
pub const TOKEN_BUCKET_INSPECT: AtomicScript = AtomicScript {
    name: "token_bucket_inspect",
    version: 1,
    source: r#"
local token_key = KEYS[1]
local time_key = KEYS[2]
local max_tokens = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local per_refill = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local tokens = redis.call('GET', token_key)
local last_refill = redis.call('GET', time_key)
if not tokens then
    tokens = max_tokens
else
    tokens = tonumber(tokens)
end
if not last_refill then
    last_refill = now
else
    last_refill = tonumber(last_refill)
end

local cycles = math.floor((now - last_refill) / interval)
local tokens_to_add = cycles * per_refill
if tokens_to_add > 0 then
    tokens = math.min(max_tokens, tokens + tokens_to_add)
    last_refill = last_refill + cycles * interval
    redis.call('SETEX', token_key, ttl, tokens)
    redis.call('SETEX', time_key, ttl, last_refill)
end

return {tokens}
"#,
};

/// Credit a token bucket, treating an absent count as full.
///
/// KEYS[1] = token count key
/// ARGV[1] = max tokens
/// ARGV[2] = tokens to add
/// ARGV[3] = ttl (seconds)
///
/// Returns: {tokens}
pub const TOKEN_BUCKET_ADD: AtomicScript = AtomicScript {
    name: "token_bucket_add",
    version: 1,
    source: r#"
local token_key = KEYS[1]
local max_tokens = tonumber(ARGV[1])
local tokens_to_add = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local tokens = redis.call('GET', token_key)
if not tokens then
    tokens = max_tokens
else
    tokens = tonumber(tokens)
end

tokens = math.min(max_tokens, tokens + tokens_to_add)
redis.call('SETEX', token_key, ttl, tokens)

return {tokens}
"#,
};

/// Leaky bucket decision. The level is available capacity and recovers at
/// `rate` per elapsed second up to `capacity`.
///
/// KEYS[1] = bucket record (hash: tokens, last_time)
/// ARGV[1] = rate (per second)
/// ARGV[2] = capacity
/// ARGV[3] = current timestamp (seconds)
///
/// Returns: {allowed (0/1), tokens}
pub const LEAKY_BUCKET_CONSUME: AtomicScript = AtomicScript {
    name: "leaky_bucket_consume",
    version: 1,
    source: r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local tokens = redis.call('HGET', key, 'tokens')
local last_time = redis.call('HGET', key, 'last_time')
if not tokens then
    tokens = capacity
else
    tokens = tonumber(tokens)
end
if not last_time then
    last_time = 0
else
    last_time = tonumber(last_time)
end

local elapsed = math.max(0, now - last_time)
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_time', now)
redis.call('EXPIRE', key, math.ceil(capacity / rate))

return {allowed, tokens}
"#,
};

/// Leak-computing inspector. Commits the recomputed level and timestamp.
///
/// Same KEYS/ARGV as [`LEAKY_BUCKET_CONSUME`].
///
/// Returns: {tokens}
pub const LEAKY_BUCKET_INSPECT: AtomicScript = AtomicScript {
    name: "leaky_bucket_inspect",
    version: 1,
    source: r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local tokens = redis.call('HGET', key, 'tokens')
local last_time = redis.call('HGET', key, 'last_time')
if not tokens then
    tokens = capacity
else
    tokens = tonumber(tokens)
end
if not last_time then
    last_time = 0
else
    last_time = tonumber(last_time)
end

local elapsed = math.max(0, now - last_time)
tokens = math.min(capacity, tokens + elapsed * rate)

redis.call('HSET', key, 'tokens', tokens, 'last_time', now)
redis.call('EXPIRE', key, math.ceil(capacity / rate))

return {tokens}
"#,
};

/// Leak, then credit, a leaky bucket. Clamped to capacity.
///
/// KEYS[1] = bucket record
/// ARGV[1] = rate (per second)
/// ARGV[2] = capacity
/// ARGV[3] = tokens to add
/// ARGV[4] = current timestamp (seconds)
///
/// Returns: {tokens}
pub const LEAKY_BUCKET_ADD: AtomicScript = AtomicScript {
    name: "leaky_bucket_add",
    version: 1,
    source: r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local tokens_to_add = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local tokens = redis.call('HGET', key, 'tokens')
local last_time = redis.call('HGET', key, 'last_time')
if not tokens then
    tokens = capacity
else
    tokens = tonumber(tokens)
end
if not last_time then
    last_time = 0
else
    last_time = tonumber(last_time)
end

local elapsed = math.max(0, now - last_time)
tokens = math.min(capacity, tokens + elapsed * rate)
tokens = math.min(capacity, tokens + tokens_to_add)

redis.call('HSET', key, 'tokens', tokens, 'last_time', now)
redis.call('EXPIRE', key, math.ceil(capacity / rate))

return {tokens}
"#,
};

/// Count-up window decision. An increment past the limit is rolled back.
///
/// KEYS[1] = window key
/// ARGV[1] = max count
/// ARGV[2] = ttl (seconds)
///
/// Returns: {allowed (0/1), remaining}
pub const USAGE_WINDOW_CONSUME: AtomicScript = AtomicScript {
    name: "usage_window_consume",
    version: 1,
    source: r#"
local key = KEYS[1]
local max_count = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local used = redis.call('INCRBY', key, 1)
if used == 1 then
    redis.call('EXPIRE', key, ttl)
end

if used > max_count then
    redis.call('DECRBY', key, 1)
    return {0, math.max(0, max_count - (used - 1))}
end

return {1, max_count - used}
"#,
};

/// All contracts, for stores that pre-load scripts
pub const ALL: [AtomicScript; 9] = [
    FIXED_WINDOW_CONSUME,
    FIXED_WINDOW_INCREASE,
    TOKEN_BUCKET_CONSUME,
    TOKEN_BUCKET_INSPECT,
    TOKEN_BUCKET_ADD,
    LEAKY_BUCKET_CONSUME,
    LEAKY_BUCKET_INSPECT,
    LEAKY_BUCKET_ADD,
    USAGE_WINDOW_CONSUME,
];
