//! # Play Tracker
//!
//! Derives "played" and "skipped" events from successive status snapshots.
//!
//! ## Timing rules
//!
//! For a song of `total` seconds observed at `elapsed` seconds:
//!
//! - tracks of 10 seconds or less are never tracked
//! - `song_end_time = now + total - elapsed - 10`
//! - `song_start_time = now - elapsed`
//! - the played threshold lies `min(total / 2, 240)` seconds after the start,
//!   or at `now` when playback is already past that point
//!
//! A song counts as played once the clock passes its threshold while it plays.
//! It counts as skipped if the song changes before the threshold and more than
//! 10 seconds after it started.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde_json::{json, Value};

use crate::daemon::{is_stream, Daemon, PlayState, Status};
use crate::error::Result;

/// Tracks this short or shorter are ignored
pub const MIN_TRACKED_LENGTH: i64 = 10;
/// Minimum play time before a song change counts as a skip
pub const SKIP_MIN_ELAPSED: i64 = 10;
/// Upper bound for the played threshold, seconds after start
pub const PLAYED_THRESHOLD_CAP: i64 = 240;

/// Current wall-clock time in unix seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Playback timing derived from the latest status refresh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackSnapshot {
    pub state: PlayState,
    pub volume: i32,
    pub song_id: Option<u32>,
    pub next_song_id: Option<u32>,
    pub song_uri: Option<String>,
    pub song_start_time: i64,
    pub song_end_time: i64,
    pub played_threshold: i64,
    pub last_song_id: Option<u32>,
    pub last_song_uri: Option<String>,
    pub last_song_start_time: i64,
    pub last_song_end_time: i64,
    pub last_played_threshold: i64,
    pub queue_length: u32,
    pub queue_version: u32,
    pub crossfade: i64,
    pub elapsed: i64,
    pub total: i64,
}

impl PlaybackSnapshot {
    /// Time at which the jukebox should top up the queue, 0 when not applicable
    pub fn add_time(&self) -> i64 {
        if self.song_end_time <= 0 {
            return 0;
        }
        (self.song_end_time - self.crossfade).max(0)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "state": self.state,
            "volume": self.volume,
            "currentSongId": self.song_id,
            "nextSongId": self.next_song_id,
            "queueLength": self.queue_length,
            "queueVersion": self.queue_version,
            "elapsedTime": self.elapsed,
            "totalTime": self.total,
            "lastSongId": self.last_song_id,
        })
    }
}

/// A song whose played threshold has passed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayedSong {
    pub id: u32,
    pub uri: Option<String>,
    pub start_time: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PlayTracker {
    snapshot: PlaybackSnapshot,
    marked_id: Option<u32>,
    skipped_id: Option<u32>,
}

impl PlayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &PlaybackSnapshot {
        &self.snapshot
    }

    /// Fold a status reply into the snapshot.
    ///
    /// `current_uri` is only consulted when the song id changed. Returns true
    /// if it did.
    pub fn apply_status(&mut self, status: &Status, current_uri: Option<String>, now: i64) -> bool {
        let snap = &mut self.snapshot;
        let changed = status.song_id != snap.song_id;
        if changed {
            snap.last_song_id = snap.song_id;
            snap.last_song_uri = snap.song_uri.take();
            snap.last_song_start_time = snap.song_start_time;
            snap.last_song_end_time = snap.song_end_time;
            snap.last_played_threshold = snap.played_threshold;
            snap.song_uri = current_uri;
            debug!(
                "Song changed from {:?} to {:?}",
                snap.last_song_id, status.song_id
            );
        }

        snap.state = status.state;
        snap.volume = status.volume;
        snap.song_id = status.song_id;
        snap.next_song_id = status.next_song_id;
        snap.queue_length = status.queue_length;
        snap.queue_version = status.queue_version;
        snap.crossfade = status.crossfade;
        snap.elapsed = status.elapsed;
        snap.total = status.total;

        if status.total > MIN_TRACKED_LENGTH {
            snap.song_end_time = now + status.total - status.elapsed - MIN_TRACKED_LENGTH;
            snap.song_start_time = now - status.elapsed;
            let offset = (status.total / 2).min(PLAYED_THRESHOLD_CAP);
            snap.played_threshold = if status.elapsed < offset {
                now - status.elapsed + offset
            } else {
                now
            };
        } else {
            snap.song_end_time = 0;
            snap.song_start_time = 0;
            snap.played_threshold = 0;
        }
        changed
    }

    /// Fetch status (and the new song's URI on change) and apply it
    pub fn refresh(&mut self, daemon: &mut dyn Daemon, now: i64) -> Result<Status> {
        let status = daemon.status()?;
        let uri = if status.song_id != self.snapshot.song_id {
            daemon.current_song()?.map(|s| s.uri)
        } else {
            None
        };
        self.apply_status(&status, uri, now);
        Ok(status)
    }

    /// The played threshold passed for a song not yet counted
    pub fn played_due(&self, now: i64) -> bool {
        let snap = &self.snapshot;
        snap.state == PlayState::Play
            && snap.played_threshold > 0
            && now > snap.played_threshold
            && snap.song_id.is_some()
            && snap.song_id != self.marked_id
    }

    /// Mark the current song as played if due; each song id is marked once
    pub fn take_played(&mut self, now: i64) -> Option<PlayedSong> {
        if !self.played_due(now) {
            return None;
        }
        let id = self.snapshot.song_id?;
        self.marked_id = Some(id);
        info!("Song {id} counts as played");
        Some(PlayedSong {
            id,
            uri: self.snapshot.song_uri.clone(),
            start_time: self.snapshot.song_start_time,
        })
    }

    /// URI of the previous song if the last change skipped it
    pub fn take_skipped(&mut self, now: i64) -> Option<String> {
        let snap = &self.snapshot;
        let last_id = snap.last_song_id?;
        if snap.song_id == Some(last_id) || self.skipped_id == Some(last_id) {
            return None;
        }
        let uri = snap.last_song_uri.as_deref()?;
        if is_stream(uri) {
            return None;
        }
        let before_threshold = snap.last_played_threshold > now;
        let elapsed = now - snap.last_song_start_time;
        if !before_threshold || snap.last_song_start_time <= 0 || elapsed <= SKIP_MIN_ELAPSED {
            return None;
        }
        let uri = uri.to_string();
        self.skipped_id = Some(last_id);
        info!("Song {uri} skipped after {elapsed}s");
        Some(uri)
    }
}
