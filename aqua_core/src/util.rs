//! Common time and rounding helpers for aqua_core.
use chrono::{DateTime, FixedOffset, Local, Offset, Timelike, Utc};

/// Deciseconds in one day; the device clock wraps here.
pub const DECISECONDS_PER_DAY: u32 = 864_000;

/// Round to `decimals` places, half away from zero.
#[inline]
pub fn round_to(v: f64, decimals: i32) -> f64 {
    let k = 10f64.powi(decimals);
    (v * k).round() / k
}

fn utc(unix: f64) -> DateTime<Utc> {
    let secs = unix.floor();
    let nanos = ((unix - secs) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos.min(999_999_999)).unwrap_or_default()
}

/// Offset applied for hour-of-day: the configured one, or the host time zone.
pub fn effective_offset(configured: Option<FixedOffset>, unix: f64) -> FixedOffset {
    configured.unwrap_or_else(|| utc(unix).with_timezone(&Local).offset().fix())
}

/// Seconds since local midnight.
pub fn seconds_of_day(unix: f64, offset: Option<FixedOffset>) -> f64 {
    let local = utc(unix).with_timezone(&effective_offset(offset, unix));
    f64::from(local.num_seconds_from_midnight()) + f64::from(local.nanosecond()) / 1e9
}

/// Fractional local hour in `[0, 24)`.
pub fn local_hour(unix: f64, offset: Option<FixedOffset>) -> f64 {
    seconds_of_day(unix, offset) / 3600.0
}

/// Local time as the device clock expects it.
pub fn deciseconds_since_midnight(unix: f64, offset: Option<FixedOffset>) -> u32 {
    ((seconds_of_day(unix, offset) * 10.0) as u32).min(DECISECONDS_PER_DAY - 1)
}

/// Minutes since UTC midnight for `unix` whole seconds.
pub fn utc_minutes_of_day(unix: i64) -> f64 {
    let t = utc(unix as f64);
    f64::from(t.hour() * 60 + t.minute())
}
