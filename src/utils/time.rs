use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

fn get_duration_since_epoch() -> Duration {
    // A clock before 1970 is treated as the epoch itself
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// return second
pub fn get_now_as_i64() -> i64 {
    get_duration_since_epoch().as_secs() as i64
}

/// return millisecond
pub fn get_now_as_millis() -> u128 {
    get_duration_since_epoch().as_millis()
}

/// Nanoseconds elapsed since `epoch_secs`, saturating at zero.
pub fn get_nanos_since(epoch_secs: u64) -> u64 {
    let elapsed = get_duration_since_epoch().saturating_sub(Duration::from_secs(epoch_secs));
    elapsed.as_nanos() as u64
}
