//! Per-song statistics kept as daemon stickers.
//!
//! The daemon is the only source of truth; nothing here is cached. Counters are
//! read, adjusted and written back, clamped to `0..=MAX_COUNT`.

use log::{debug, warn};
use serde::Serialize;

use crate::daemon::{is_stream, Daemon};
use crate::error::{EngineError, Result};

pub const PLAY_COUNT: &str = "playCount";
pub const SKIP_COUNT: &str = "skipCount";
pub const LAST_PLAYED: &str = "lastPlayed";
pub const LAST_SKIPPED: &str = "lastSkipped";
pub const LIKE: &str = "like";

pub const MAX_COUNT: i64 = 999_999_999;

/// Like values: 0 dislike, 1 neutral, 2 like
pub const LIKE_NEUTRAL: i64 = 1;
pub const LIKE_MAX: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StickerRecord {
    pub play_count: i64,
    pub skip_count: i64,
    pub last_played: i64,
    pub last_skipped: i64,
    pub like: i64,
}

impl Default for StickerRecord {
    fn default() -> Self {
        Self {
            play_count: 0,
            skip_count: 0,
            last_played: 0,
            last_skipped: 0,
            like: LIKE_NEUTRAL,
        }
    }
}

/// Read every known sticker of a song
pub fn read(daemon: &mut dyn Daemon, uri: &str) -> Result<StickerRecord> {
    let mut record = StickerRecord::default();
    if is_stream(uri) {
        return Ok(record);
    }
    for (name, value) in daemon.sticker_list(uri)? {
        let value: i64 = value.parse().unwrap_or(0);
        match name.as_str() {
            PLAY_COUNT => record.play_count = value,
            SKIP_COUNT => record.skip_count = value,
            LAST_PLAYED => record.last_played = value,
            LAST_SKIPPED => record.last_skipped = value,
            LIKE => record.like = value,
            _ => {}
        }
    }
    Ok(record)
}

/// Add `by` to a counter sticker and return the stored value
pub fn increment(daemon: &mut dyn Daemon, uri: &str, name: &str, by: i64) -> Result<i64> {
    if is_stream(uri) {
        debug!("Not counting {name} for stream {uri}");
        return Ok(0);
    }
    let current = daemon
        .sticker_get(uri, name)?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let value = current.saturating_add(by).clamp(0, MAX_COUNT);
    if value == MAX_COUNT {
        warn!("Sticker {name} of {uri} reached its maximum");
    }
    daemon.sticker_set(uri, name, &value.to_string())?;
    Ok(value)
}

pub fn set_timestamp(daemon: &mut dyn Daemon, uri: &str, name: &str, timestamp: i64) -> Result<()> {
    if is_stream(uri) {
        return Ok(());
    }
    daemon.sticker_set(uri, name, &timestamp.to_string())
}

pub fn set_like(daemon: &mut dyn Daemon, uri: &str, like: i64) -> Result<()> {
    if !(0..=LIKE_MAX).contains(&like) {
        return Err(EngineError::Validation(format!(
            "like must be between 0 and {LIKE_MAX}"
        )));
    }
    if is_stream(uri) {
        return Err(EngineError::Validation(
            "streams can not be liked".to_string(),
        ));
    }
    daemon.sticker_set(uri, LIKE, &like.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::memory::MemoryDaemon;

    const URI: &str = "Artist 1/Album 1/Track 1.flac";

    #[test]
    fn test_increment_from_missing_sticker() {
        let mut daemon = MemoryDaemon::with_library(1);
        assert_eq!(increment(&mut daemon, URI, PLAY_COUNT, 1).unwrap(), 1);
        assert_eq!(increment(&mut daemon, URI, PLAY_COUNT, 1).unwrap(), 2);
        assert_eq!(daemon.sticker(URI, PLAY_COUNT).as_deref(), Some("2"));
    }

    #[test]
    fn test_increment_clamps_to_range() {
        let mut daemon = MemoryDaemon::with_library(1);
        daemon.update(|s| {
            s.stickers
                .entry(URI.to_string())
                .or_default()
                .insert(PLAY_COUNT.to_string(), MAX_COUNT.to_string());
        });
        assert_eq!(increment(&mut daemon, URI, PLAY_COUNT, 5).unwrap(), MAX_COUNT);
        assert_eq!(increment(&mut daemon, URI, SKIP_COUNT, -3).unwrap(), 0);
    }

    #[test]
    fn test_streams_are_never_counted() {
        let mut daemon = MemoryDaemon::with_library(1);
        assert_eq!(
            increment(&mut daemon, "http://radio/stream", PLAY_COUNT, 1).unwrap(),
            0
        );
        assert!(daemon.lock().stickers.is_empty());
    }

    #[test]
    fn test_read_record() {
        let mut daemon = MemoryDaemon::with_library(1);
        increment(&mut daemon, URI, SKIP_COUNT, 1).unwrap();
        set_timestamp(&mut daemon, URI, LAST_SKIPPED, 1_700_000_000).unwrap();
        set_like(&mut daemon, URI, 2).unwrap();

        let record = read(&mut daemon, URI).unwrap();
        assert_eq!(record.skip_count, 1);
        assert_eq!(record.last_skipped, 1_700_000_000);
        assert_eq!(record.like, 2);
        assert_eq!(record.play_count, 0);
    }

    #[test]
    fn test_set_like_validation() {
        let mut daemon = MemoryDaemon::with_library(1);
        assert!(matches!(
            set_like(&mut daemon, URI, 3),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            set_like(&mut daemon, "https://x/y", 2),
            Err(EngineError::Validation(_))
        ));
        assert!(daemon.lock().stickers.is_empty());
    }
}
