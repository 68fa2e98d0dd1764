//! General utilities shared across the application.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Formats a Unix-millisecond timestamp as RFC 3339 (UTC, millisecond precision).
#[must_use]
pub fn millis_to_rfc3339(millis: u64) -> String {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an RFC 3339 timestamp into Unix milliseconds.
///
/// Returns `None` for unparseable input; callers fall back to the server clock.
#[must_use]
pub fn rfc3339_to_millis(value: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis().max(0) as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Atomic File Writes
// ─────────────────────────────────────────────────────────────────────────────

/// Writes `contents` to `path` atomically (temp file + rename).
///
/// Creates the parent directory if it doesn't exist. The rename is atomic on
/// most filesystems, so readers never observe a half-written file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, contents)?;
    std::fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip() {
        let millis = 1_700_000_000_123u64;
        let formatted = millis_to_rfc3339(millis);
        assert_eq!(rfc3339_to_millis(&formatted), Some(millis));
    }

    #[test]
    fn rfc3339_with_offset_normalizes_to_utc() {
        let millis = rfc3339_to_millis("2024-06-01T12:00:00+02:00").unwrap();
        assert_eq!(millis, 1_717_236_000_000);
    }

    #[test]
    fn rfc3339_rejects_garbage() {
        assert_eq!(rfc3339_to_millis("not-a-timestamp"), None);
        assert_eq!(rfc3339_to_millis(""), None);
    }

    #[test]
    fn atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/status.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }
}
