use chrono::{DateTime, Utc};
use rand::RngCore;
use std::time::Duration;

use crate::config::ImageFormat;

/// Prefix shared by every raw capture written to the temp directory.
pub const TEMP_FILE_PREFIX: &str = "temp_";

/// Lowercase hex string built from `n_bytes` random bytes.
pub fn random_hex(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Name for a finished artifact in the uploads directory.
pub fn artifact_file_name(format: ImageFormat, now: DateTime<Utc>) -> String {
    format!(
        "screenshot_{}_{}.{}",
        now.timestamp_millis(),
        random_hex(8),
        format.extension()
    )
}

/// Public route for an artifact kept on local disk.
pub fn local_artifact_url(file_name: &str) -> String {
    format!("/uploads/{file_name}")
}

/// Compact duration for progress and health output: `350ms`, `4.2s`,
/// `3m 05s`, `1h 02m`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => format!("{}ms", duration.as_millis()),
        1..=59 => format!("{:.1}s", duration.as_secs_f64()),
        60..=3599 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_random_hex() {
        let hex = random_hex(8);
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(random_hex(8), random_hex(8));
    }

    #[test]
    fn test_artifact_file_name() {
        let now = Utc.timestamp_millis_opt(1_760_000_000_123).unwrap();
        let name = artifact_file_name(ImageFormat::Jpeg, now);
        assert!(name.starts_with("screenshot_1760000000123_"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(local_artifact_url(&name), format!("/uploads/{name}"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_millis(4_250)), "4.2s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1h 02m");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
