#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone};

/// Display format for message timestamps sent to clients.
pub const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Render a Unix millisecond timestamp in server-local time.
pub fn format_timestamp(unix_ms: i64) -> String {
	match Local.timestamp_millis_opt(unix_ms).earliest() {
		Some(dt) => dt.format(DISPLAY_FORMAT).to_string(),
		None => String::new(),
	}
}
