//! Duration and cron parsing helpers shared by the config layer and the
//! schedule trigger.

use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;

use crate::error::EtlError;

/// Parse a human-readable duration string into a [`Duration`].
///
/// Supports components: `Xd` (days), `Xh` (hours), `Xm` (minutes), `Xs` (seconds).
/// Components can be combined: "2h30m", "1d12h", "90s". A bare number is
/// read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, EtlError> {
    let invalid = || EtlError::InvalidDuration(s.to_string());
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }
        let n: u64 = num_buf.parse().map_err(|_| invalid())?;
        num_buf.clear();
        let unit = match ch {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        total_secs = n
            .checked_mul(unit)
            .and_then(|v| total_secs.checked_add(v))
            .ok_or_else(invalid)?;
        found_unit = true;
    }

    if !num_buf.is_empty() {
        // "30m15" is ambiguous.
        if found_unit {
            return Err(invalid());
        }
        total_secs = num_buf.parse().map_err(|_| invalid())?;
    }

    Ok(Duration::from_secs(total_secs))
}

/// Longest lease a worker may hold: one year.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(365 * 86_400);

/// Convert a lease timeout into the signed offset added to lease timestamps.
///
/// Zero and anything above [`MAX_LEASE_DURATION`] are rejected.
pub fn lease_duration(timeout: Duration) -> Result<chrono::Duration, EtlError> {
    if timeout.is_zero() || timeout > MAX_LEASE_DURATION {
        return Err(EtlError::LeaseTimeout(timeout));
    }
    chrono::Duration::from_std(timeout).map_err(|_| EtlError::LeaseTimeout(timeout))
}

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate requires 6 fields: `sec min hour day-of-month month day-of-week`.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Parse a 5- or 6-field cron expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, EtlError> {
    Schedule::from_str(&normalize_cron(expr)).map_err(|e| EtlError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}
