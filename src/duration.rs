// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Duration parsing and environment-driven duration overrides.
//!
//! Supports parsing duration strings in Go format (e.g., "15s", "1m30s", "1.5h", "300ms")
//! into Rust `std::time::Duration`, and resolving tunable durations from the environment
//! with a built-in fallback.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::error;

use crate::env::Environment;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SECOND: u128 = 1_000_000_000;
const NANOS_PER_MINUTE: u128 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: u128 = 60 * NANOS_PER_MINUTE;

/// Largest duration accepted, matching the range of a signed 64-bit nanosecond count.
const MAX_NANOS: u128 = i64::MAX as u128;

/// Parse a Go-style duration string into a Rust `Duration`.
///
/// A duration string is a sequence of decimal numbers, each with an optional fraction
/// and a unit suffix, such as "300ms", "1.5h" or "2h45m". The literal "0" is also
/// accepted.
///
/// Supported units:
/// - `ns` (nanoseconds)
/// - `us` / `µs` / `μs` (microseconds)
/// - `ms` (milliseconds)
/// - `s` (seconds)
/// - `m` (minutes)
/// - `h` (hours)
///
/// # Examples
///
/// ```
/// use events_controller::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
///
/// // Invalid formats return errors
/// assert!(parse_duration("").is_err());
/// assert!(parse_duration("10").is_err());  // Missing unit
/// assert!(parse_duration("10x").is_err()); // Invalid unit
/// ```
///
/// # Errors
///
/// Returns an error if:
/// - The string is empty or signed
/// - A number is missing its unit, or the unit is unknown
/// - The total overflows the supported range
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    if duration_str.is_empty() {
        bail!("Duration string cannot be empty");
    }
    if duration_str == "0" {
        return Ok(Duration::ZERO);
    }
    if duration_str.starts_with('-') || duration_str.starts_with('+') {
        bail!("Signed durations are not supported: '{duration_str}'");
    }

    let mut rest = duration_str;
    let mut total: u128 = 0;

    while !rest.is_empty() {
        // Integer part
        let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let (int_str, after_int) = rest.split_at(int_len);

        // Optional fraction
        let (frac_str, after_number) = match after_int.strip_prefix('.') {
            Some(after_dot) => {
                let frac_len = after_dot
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(after_dot.len());
                after_dot.split_at(frac_len)
            }
            None => ("", after_int),
        };

        if int_str.is_empty() && frac_str.is_empty() {
            bail!("Invalid duration '{duration_str}': expected a number");
        }

        // Unit runs until the next digit or '.'
        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_number.len());
        let (unit, remainder) = after_number.split_at(unit_len);
        if unit.is_empty() {
            bail!("Missing unit in duration '{duration_str}'");
        }

        let unit_nanos = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => NANOS_PER_MICRO,
            "ms" => NANOS_PER_MILLI,
            "s" => NANOS_PER_SECOND,
            "m" => NANOS_PER_MINUTE,
            "h" => NANOS_PER_HOUR,
            _ => bail!("Unknown unit '{unit}' in duration '{duration_str}'"),
        };

        let whole: u128 = if int_str.is_empty() {
            0
        } else {
            int_str
                .parse()
                .with_context(|| format!("Invalid number in duration '{duration_str}'"))?
        };

        let mut nanos = whole
            .checked_mul(unit_nanos)
            .context("Duration value too large (overflow)")?;

        if !frac_str.is_empty() {
            // Ignore digits beyond nanosecond precision of the largest unit
            let digits = &frac_str[..frac_str.len().min(18)];
            let fraction: u128 = digits
                .parse()
                .with_context(|| format!("Invalid fraction in duration '{duration_str}'"))?;
            let scale = 10u128.pow(u32::try_from(digits.len()).unwrap_or(18));
            nanos = nanos
                .checked_add(fraction * unit_nanos / scale)
                .context("Duration value too large (overflow)")?;
        }

        total = total
            .checked_add(nanos)
            .context("Duration value too large (overflow)")?;
        if total > MAX_NANOS {
            bail!("Duration '{duration_str}' exceeds the supported range");
        }

        rest = remainder;
    }

    let total = u64::try_from(total).context("Duration value too large (overflow)")?;
    Ok(Duration::from_nanos(total))
}

/// Resolve a tunable duration from the environment.
///
/// Returns `fallback` when `key` is unset or empty. A value that cannot be parsed is
/// logged and replaced by `fallback`; a malformed override never blocks startup.
///
/// # Arguments
///
/// * `env` - Environment to read `key` from
/// * `key` - Name of the environment variable holding the override
/// * `fallback` - Built-in default
pub fn resolve_duration(env: &dyn Environment, key: &str, fallback: Duration) -> Duration {
    match env.lookup(key) {
        Some(value) if !value.is_empty() => match parse_duration(&value) {
            Ok(duration) => duration,
            Err(e) => {
                error!(
                    key = key,
                    value = %value,
                    fallback = ?fallback,
                    "Failed to parse {key} duration, using default: {e:#}"
                );
                fallback
            }
        },
        _ => fallback,
    }
}

#[cfg(test)]
#[path = "duration_tests.rs"]
mod duration_tests;
