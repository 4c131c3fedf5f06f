// -
// Redis hash layout

/// Hash field carrying the CAS version of a whole record
pub const CAS_VERSION_FIELD: &str = "CAS_VERSION";

/// Bookkeeping field of list-indexed records, never decoded into a message
pub const LIST_INDEX_FIELD: &str = "index_number";

/// Prefix of list-indexed value fields (`v<index>`)
pub const LIST_VALUE_PREFIX: char = 'v';

/// Prefix of list-indexed version fields (`V<index>`)
pub const LIST_VERSION_PREFIX: char = 'V';

/// Marker byte placed in front of every stored value
pub const VALUE_MARKER: u8 = b'&';

/// Version argument that makes the CAS script overwrite unconditionally
pub const FORCE_UPDATE_VERSION: &str = "-1";

/// Server side CAS. `ARGV[1]` names the version field, `ARGV[2]` is the expected version.
/// Replies `{applied, version}`: `1` and the new version after a write, `0` and the unchanged
/// version on mismatch.
pub const CAS_LUA_SCRIPT: &str = r#"
local real_version_str = redis.call('HGET', KEYS[1], ARGV[1])
local real_version = 0
if real_version_str ~= false and real_version_str ~= nil then
    real_version = tonumber(real_version_str)
end
local expect_version = tonumber(ARGV[2])
local unpack_fn = table.unpack or unpack
if real_version == 0 or expect_version == -1 or expect_version == real_version then
    ARGV[2] = real_version + 1
    redis.call('HSET', KEYS[1], unpack_fn(ARGV))
    return { 1, tostring(ARGV[2]) }
else
    return { 0, tostring(real_version) }
end
"#;

// -
// Persistence

/// Sub-tasks in flight per checkpoint of a batch load
pub const HASH_TABLE_BATCH_SIZE: usize = 20;

/// Await type of the Redis dispatcher instance
pub const REDIS_DISPATCHER_IDENT: u64 = 0x5245_4449_53;

pub const DEFAULT_RECORD_PREFIX: &str = "default";

// -
// Task runtime

/// Callbacks an actor executor accepts before refusing new ones
pub const ACTOR_MAX_PENDING_ACTIONS: usize = 100_000;

/// Callbacks drained per round before yielding back to the scheduler
pub const ACTOR_ACTIONS_PER_ROUND: usize = 100;

/// 2020-01-01T00:00:00Z, base of the task id seed
pub const TASK_ID_EPOCH_SECS: u64 = 1_577_836_800;

// -
// Router

/// Router manager slots, indexed by type id
pub const MAX_ROUTER_MANAGER_TYPES: usize = 256;

/// Statistics are logged when `now / ROUTER_STAT_PERIOD_SECS` advances
pub const ROUTER_STAT_PERIOD_SECS: i64 = 60;
