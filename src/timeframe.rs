//! Timeframe normalization.
//!
//! Timeframes are part of subscription identity, so every entry point
//! (client protocol, config, recovery API) normalizes before touching any
//! map. Internal code assumes normalized values.

/// Normalize a timeframe string to its canonical form.
///
/// - `"5m"` → `"5"` (minutes are plain numeric strings)
/// - `"1h"` / `"4h"` → `"60"` / `"240"`
/// - `"1d"` / `"d"` → `"D"`, `"1w"` / `"w"` → `"W"`, `"1M"` / `"M"` → `"M"`
///
/// Idempotent: already-canonical values pass through unchanged. Note the
/// case split between `"m"` (minutes) and `"M"` (months).
pub fn normalize(timeframe: &str) -> String {
    let tf = timeframe.trim();
    match tf {
        "1d" | "d" | "D" => return "D".to_string(),
        "1w" | "w" | "W" => return "W".to_string(),
        "1M" | "M" => return "M".to_string(),
        _ => {}
    }
    if let Some(mins) = tf.strip_suffix('m') {
        if !mins.is_empty() && mins.chars().all(|c| c.is_ascii_digit()) {
            return mins.to_string();
        }
    }
    if let Some(hours) = tf.strip_suffix('h') {
        if let Ok(n) = hours.parse::<u64>() {
            return (n * 60).to_string();
        }
    }
    tf.to_string()
}

/// Milliseconds covered by one bar of a normalized timeframe.
///
/// `"M"` uses a 30-day approximation; staleness detection for monthly bars
/// is coarse by design.
pub fn timeframe_ms(timeframe: &str) -> i64 {
    match timeframe {
        "D" => 86_400_000,
        "W" => 604_800_000,
        "M" => 2_592_000_000,
        other => {
            let minutes = other.parse::<i64>().unwrap_or(1).max(1);
            minutes * 60_000
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_minute_and_hour_suffixes() {
        assert_eq!(normalize("1m"), "1");
        assert_eq!(normalize("5m"), "5");
        assert_eq!(normalize("15m"), "15");
        assert_eq!(normalize("1h"), "60");
        assert_eq!(normalize("4h"), "240");
    }

    #[test]
    fn normalizes_calendar_timeframes() {
        assert_eq!(normalize("1d"), "D");
        assert_eq!(normalize("d"), "D");
        assert_eq!(normalize("1w"), "W");
        assert_eq!(normalize("w"), "W");
        assert_eq!(normalize("1M"), "M");
        assert_eq!(normalize("M"), "M");
    }

    #[test]
    fn normalization_is_idempotent() {
        for tf in [
            "1m", "5m", "1h", "4h", "1d", "d", "1w", "w", "1M", "M", "60", "D",
        ] {
            let once = normalize(tf);
            assert_eq!(normalize(&once), once, "not idempotent for {tf}");
        }
    }

    #[test]
    fn passes_through_plain_numbers() {
        assert_eq!(normalize("1"), "1");
        assert_eq!(normalize("240"), "240");
        assert_eq!(normalize(" 60 "), "60");
    }

    #[test]
    fn timeframe_ms_values() {
        assert_eq!(timeframe_ms("1"), 60_000);
        assert_eq!(timeframe_ms("60"), 3_600_000);
        assert_eq!(timeframe_ms("D"), 86_400_000);
        assert_eq!(timeframe_ms("W"), 604_800_000);
        assert_eq!(timeframe_ms("M"), 2_592_000_000);
    }
}
