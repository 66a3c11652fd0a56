//! Lua scripts executed atomically by Redis.
//!
//! Each script touches exactly one logical key and sets or keeps its TTL in
//! the same invocation. Timestamps arrive as epoch milliseconds in ARGV; Lua
//! formats integers below 1e14 without an exponent, which covers epoch
//! milliseconds for the next few centuries.

/// KEYS[1] sorted set; ARGV: now, window_ms, permits, consume, member.
/// Returns {allowed, count, oldest_ms}.
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local permits = tonumber(ARGV[3])
local consume = ARGV[4] == '1'

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < permits then
  allowed = 1
  if consume then
    redis.call('ZADD', key, now, ARGV[5])
    redis.call('PEXPIRE', key, window)
    count = count + 1
  end
end

local oldest = now
local head = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if head[2] then
  oldest = tonumber(head[2])
end
return {allowed, count, oldest}
"#;

/// KEYS[1] hash {window, count}; ARGV: now, window_ms, permits, consume.
/// Returns {allowed, count, window_index}.
pub const FIXED_WINDOW: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local permits = tonumber(ARGV[3])
local consume = ARGV[4] == '1'

local index = math.floor(now / window)
local stored = redis.call('HMGET', key, 'window', 'count')
local count = 0
if stored[1] and tonumber(stored[1]) == index then
  count = tonumber(stored[2]) or 0
end

local allowed = 0
if count + 1 <= permits then
  allowed = 1
  if consume then
    count = count + 1
    redis.call('HSET', key, 'window', index, 'count', count)
    redis.call('PEXPIRE', key, window)
  end
end
return {allowed, count, index}
"#;

/// KEYS[1] hash {tokens, updated}; ARGV: now, capacity, rate_per_sec, ttl_ms, consume.
/// Returns {allowed, tokens}.
pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local consume = ARGV[5] == '1'

local stored = redis.call('HMGET', key, 'tokens', 'updated')
local tokens = capacity
local updated = now
if stored[1] and stored[2] then
  tokens = tonumber(stored[1])
  updated = tonumber(stored[2])
end

local elapsed = math.max(0, now - updated) / 1000
tokens = math.max(0, math.min(capacity, tokens + elapsed * rate))
local allowed = 0
if tokens >= 1 then
  allowed = 1
  if consume then
    tokens = math.max(0, tokens - 1)
  end
end

local level = string.format('%.17g', tokens)
if consume then
  redis.call('HSET', key, 'tokens', level, 'updated', math.max(now, updated))
  redis.call('PEXPIRE', key, ttl)
end
return {allowed, level}
"#;

/// KEYS[1] hash {water, updated}; ARGV: now, capacity, rate_per_sec, ttl_ms, consume.
/// Returns {allowed, water}.
pub const LEAKY_BUCKET: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local consume = ARGV[5] == '1'

local stored = redis.call('HMGET', key, 'water', 'updated')
local water = 0
local updated = now
if stored[1] and stored[2] then
  water = tonumber(stored[1])
  updated = tonumber(stored[2])
end

local elapsed = math.max(0, now - updated) / 1000
water = math.max(0, water - elapsed * rate)
local allowed = 0
if water < capacity then
  allowed = 1
  if consume then
    water = water + 1
  end
end

local level = string.format('%.17g', water)
if consume then
  redis.call('HSET', key, 'water', level, 'updated', math.max(now, updated))
  redis.call('PEXPIRE', key, ttl)
end
return {allowed, level}
"#;

/// KEYS[1] record; ARGV: record_json, ttl_ms, now.
/// Returns {1, ''} when created, {0, existing_json} after touching an existing record.
pub const IDEMPOTENCY_BEGIN: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
  local record = cjson.decode(existing)
  record['access_count'] = (tonumber(record['access_count']) or 0) + 1
  record['last_access_ms'] = tonumber(ARGV[3])
  local encoded = cjson.encode(record)
  redis.call('SET', KEYS[1], encoded, 'KEEPTTL')
  return {0, encoded}
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return {1, ''}
"#;

/// KEYS[1] record; ARGV: status, now, has_payload, payload.
/// Returns {0, ''} when missing, {2, json} when not pending, {1, json} when completed.
pub const IDEMPOTENCY_COMPLETE: &str = r#"
local existing = redis.call('GET', KEYS[1])
if not existing then
  return {0, ''}
end
local record = cjson.decode(existing)
if record['status'] ~= 'PENDING' then
  return {2, existing}
end

record['status'] = ARGV[1]
record['last_access_ms'] = tonumber(ARGV[2])
record['access_count'] = (tonumber(record['access_count']) or 0) + 1
record['result'] = nil
record['error'] = nil
if ARGV[3] == '1' then
  if ARGV[1] == 'SUCCESS' then
    record['result'] = ARGV[4]
  else
    record['error'] = ARGV[4]
  end
end

local encoded = cjson.encode(record)
redis.call('SET', KEYS[1], encoded, 'KEEPTTL')
return {1, encoded}
"#;

/// KEYS[1] record; ARGV: required status or ''.
/// Returns the number of keys deleted.
pub const IDEMPOTENCY_REMOVE: &str = r#"
local existing = redis.call('GET', KEYS[1])
if not existing then
  return 0
end
if ARGV[1] ~= '' then
  local record = cjson.decode(existing)
  if record['status'] ~= ARGV[1] then
    return 0
  end
end
return redis.call('DEL', KEYS[1])
"#;

/// KEYS[1] marker; ARGV: marker_json, ttl_ms.
/// Returns {1, ''} when acquired, {0, existing_json} when held.
pub const SUBMISSION_MARK: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return {1, ''}
end
return {0, redis.call('GET', KEYS[1]) or ''}
"#;
