use std::path::Path;
use std::time::SystemTime;

use color_eyre::Result;
use color_eyre::eyre::Context;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn system_time_to_unix(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Modification time of `path` in unix seconds.
///
/// # Errors
///
/// Returns an error if the path cannot be stat'd.
pub fn file_mtime_unix(path: &Path) -> Result<i64> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let modified = metadata
        .modified()
        .with_context(|| format!("failed to read mtime of {}", path.display()))?;
    Ok(system_time_to_unix(modified))
}

/// Modification time of `path`, or `None` when it cannot be read.
#[must_use]
pub fn file_mtime(path: &Path) -> Option<OffsetDateTime> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(OffsetDateTime::from(modified))
}

/// Parse an RFC 3339 timestamp, fractional seconds allowed.
#[must_use]
pub fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_with_and_without_nanos() {
        assert!(parse_rfc3339("2024-07-30T02:42:13Z").is_some());
        assert!(parse_rfc3339("2024-07-30T02:42:13.123456789Z").is_some());
        assert!(parse_rfc3339("2024-07-30T02:42:13+02:00").is_some());
        assert!(parse_rfc3339("yesterday").is_none());
    }

    #[test]
    fn epoch_is_zero() {
        assert_eq!(system_time_to_unix(SystemTime::UNIX_EPOCH), 0);
    }
}
