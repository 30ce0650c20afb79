//! Human-readable duration strings.

use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Parse `"500ms"`, `"5s"`, `"5m"`, `"24h"` or `"1d"`.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::invalid(field, format!("'{}' has no unit", value)))?;
    let (number, unit) = value.split_at(split);

    let amount: u64 = number
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("'{}' is not a duration", value)))?;

    let millis_per_unit = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => {
            return Err(ConfigError::invalid(
                field,
                format!("unknown unit '{}' (expected ms, s, m, h or d)", other),
            ));
        }
    };

    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| ConfigError::invalid(field, format!("'{}' overflows", value)))
}
