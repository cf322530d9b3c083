//! Store key derivation.
//!
//! Window policies encode the time bucket into the key, so a new window is a
//! new key and old windows simply expire. Bucket policies use one stable key
//! per identity.

use chrono::{DateTime, FixedOffset, Utc};
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const MINUTE: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

/// Render the window `now` falls into.
///
/// Exact day/hour/minute/second windows use calendar tokens in `offset`.
/// Any other length uses `unix_time / window`, in milliseconds for sub-second
/// windows and seconds otherwise.
pub fn window_token(now: DateTime<Utc>, window: Duration, offset: FixedOffset) -> String {
    let local = now.with_timezone(&offset);
    match window {
        w if w == DAY => local.format("%Y%m%d").to_string(),
        w if w == HOUR => local.format("%Y%m%d%H").to_string(),
        w if w == MINUTE => local.format("%Y%m%d%H%M").to_string(),
        w if w == SECOND => local.format("%Y%m%d%H%M%S").to_string(),
        w if w < SECOND => {
            let step = (w.as_millis() as i64).max(1);
            now.timestamp_millis().div_euclid(step).to_string()
        }
        w => {
            let step = (w.as_secs() as i64).max(1);
            now.timestamp().div_euclid(step).to_string()
        }
    }
}

/// `prefix:<window token>`
pub fn window_key(prefix: &str, now: DateTime<Utc>, window: Duration, offset: FixedOffset) -> String {
    format!("{}:{}", prefix, window_token(now, window, offset))
}

/// `prefix:identity`, used to scope a window policy to one caller
pub fn scoped_prefix(prefix: &str, identity: &str) -> String {
    format!("{}:{}", prefix, identity)
}

/// (`prefix:tokens:<id>`, `prefix:time:<id>`)
pub fn token_bucket_keys(prefix: &str, identity: &str) -> (String, String) {
    (
        format!("{}:tokens:{}", prefix, identity),
        format!("{}:time:{}", prefix, identity),
    )
}

/// `prefix:<id>`
pub fn leaky_bucket_key(prefix: &str, identity: &str) -> String {
    format!("{}:{}", prefix, identity)
}
