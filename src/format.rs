//! Human-readable rate and duration strings.

/// Decimal byte count, e.g. `1.5 MB`. Matches what file managers show.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["KB", "MB", "GB", "TB", "PB", "EB"];
    if bytes < 1000 {
        return if bytes == 1 { "1 byte".to_string() } else { format!("{} bytes", bytes) };
    }
    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if value >= 100.0 || unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn format_rate(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// `HH:MM:SS`; hours are not wrapped.
pub fn format_time_from_seconds(seconds: u64) -> String {
    format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds / 60) % 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(1), "1 byte");
        assert_eq!(format_bytes(999), "999 bytes");
        assert_eq!(format_bytes(1_500), "2 KB");
        assert_eq!(format_bytes(2_500_000), "2.5 MB");
        assert_eq!(format_bytes(250_000_000), "250 MB");
        assert_eq!(format_rate(3_200_000_000), "3.2 GB/s");
    }

    #[test]
    fn time() {
        assert_eq!(format_time_from_seconds(0), "00:00:00");
        assert_eq!(format_time_from_seconds(3_725), "01:02:05");
        assert_eq!(format_time_from_seconds(100 * 3600), "100:00:00");
    }
}
