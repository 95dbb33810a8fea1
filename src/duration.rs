//! Human-readable durations for command-line options.

use std::time::Duration;

/// Suffix and the number of milliseconds one unit spans. `ms` must come
/// before `m` and `s`.
const UNITS: [(&str, u64); 4] = [("ms", 1), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)];

/// Parse a duration such as `800ms`, `30s`, `2m` or `1h`.
///
/// A bare number is read as seconds.
///
/// ```
/// use qardioarm_listener::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("800ms").unwrap(), Duration::from_millis(800));
/// assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit_ms) = UNITS
        .iter()
        .find_map(|(suffix, ms)| src.strip_suffix(suffix).map(|num| (num, *ms)))
        .unwrap_or((src, 1_000));

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {src}"))
}
