//! # Daemon Seam
//!
//! Everything the engine needs from the music player daemon, as a typed trait.
//! The engine never speaks the wire protocol itself: [`mpd::MpdConnection`]
//! implements [`Daemon`] over a socket, [`memory::MemoryDaemon`] implements it
//! in memory for tests and benchmarks.
//!
//! ## Idle protocol
//!
//! While nothing needs doing the session sits in idle mode. The supervisor calls
//! [`Daemon::poll_idle`] with a short timeout each tick; once there is work it
//! calls [`Daemon::leave_idle`], which cancels idle and returns whatever change
//! notifications the daemon had already sent.

pub mod memory;
pub mod mpd;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::ConnectionSettings;
use crate::error::Result;

/// Player state as reported by the status command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    #[default]
    Unknown,
    Stop,
    Play,
    Pause,
}

impl PlayState {
    pub fn parse(value: &str) -> Self {
        match value {
            "play" => PlayState::Play,
            "pause" => PlayState::Pause,
            "stop" => PlayState::Stop,
            _ => PlayState::Unknown,
        }
    }
}

/// Snapshot of the daemon status command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub state: PlayState,
    pub volume: i32,
    pub song_pos: Option<u32>,
    pub song_id: Option<u32>,
    pub next_song_id: Option<u32>,
    pub queue_length: u32,
    pub queue_version: u32,
    /// Crossfade in seconds
    pub crossfade: i64,
    /// Seconds into the current song
    pub elapsed: i64,
    /// Length of the current song in seconds
    pub total: i64,
    /// Job id while a database update runs
    pub updating_db: Option<u32>,
}

impl Status {
    pub fn to_json(&self) -> Value {
        json!({
            "state": self.state,
            "volume": self.volume,
            "songPos": self.song_pos,
            "currentSongId": self.song_id,
            "nextSongId": self.next_song_id,
            "queueLength": self.queue_length,
            "queueVersion": self.queue_version,
            "elapsedTime": self.elapsed,
            "totalTime": self.total,
        })
    }
}

/// A song as listed by the daemon
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Song {
    pub uri: String,
    /// Queue id, only for songs in the queue
    pub id: Option<u32>,
    pub duration: i64,
    /// Modification time, unix seconds
    pub last_modified: i64,
    /// Tag name to values, tag names as the daemon spells them
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Song {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: &str, value: &str) -> Self {
        self.tags
            .entry(tag.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    /// First value of a tag, matched case-insensitively
    pub fn tag(&self, tag: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(tag))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn to_json(&self) -> Value {
        let mut tags = serde_json::Map::new();
        for (name, values) in &self.tags {
            tags.insert(name.clone(), json!(values.join(", ")));
        }
        json!({
            "uri": self.uri,
            "id": self.id,
            "duration": self.duration,
            "lastModified": self.last_modified,
            "tags": tags,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub songs: u64,
    /// Time of the last database update, unix seconds
    pub db_update: i64,
}

/// Subsystems reported by idle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subsystem {
    Database,
    StoredPlaylist,
    Queue,
    Player,
    Mixer,
    Output,
    Options,
    Update,
    Subscription,
}

impl Subsystem {
    pub const ALL: [Subsystem; 9] = [
        Subsystem::Database,
        Subsystem::StoredPlaylist,
        Subsystem::Queue,
        Subsystem::Player,
        Subsystem::Mixer,
        Subsystem::Output,
        Subsystem::Options,
        Subsystem::Update,
        Subsystem::Subscription,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Subsystem::Database => "database",
            Subsystem::StoredPlaylist => "stored_playlist",
            Subsystem::Queue => "playlist",
            Subsystem::Player => "player",
            Subsystem::Mixer => "mixer",
            Subsystem::Output => "output",
            Subsystem::Options => "options",
            Subsystem::Update => "update",
            Subsystem::Subscription => "subscription",
        }
    }

    /// Parse a `changed:` value; subsystems the engine does not watch yield `None`
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which songs to enumerate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SongSource {
    Library,
    Playlist(String),
}

/// Search to run on the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    /// Filter expression, e.g. `((Artist == 'X'))`
    Expression(String),
    /// Legacy single tag filter, e.g. `Genre` `Jazz`
    Tag { tag: String, value: String },
}

/// Typed operations on one live daemon session.
///
/// Only the supervisor loop holds a session, so implementations need not be
/// thread safe beyond `Send`. A [`crate::error::EngineError::Protocol`] leaves the
/// session usable once [`Daemon::clear_error`] succeeds; a
/// [`crate::error::EngineError::Connection`] ends it.
pub trait Daemon: Send {
    /// Protocol version announced by the daemon
    fn version(&self) -> (u32, u32, u32);

    fn password(&mut self, password: &str) -> Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    /// Recover from the last protocol error
    fn clear_error(&mut self) -> Result<()>;

    // capability introspection
    fn commands(&mut self) -> Result<Vec<String>>;
    fn tag_types(&mut self) -> Result<Vec<String>>;
    fn channels(&mut self) -> Result<Vec<String>>;
    /// Music directory as configured in the daemon, if it tells us
    fn music_directory(&mut self) -> Result<Option<String>>;

    // status
    fn status(&mut self) -> Result<Status>;
    fn current_song(&mut self) -> Result<Option<Song>>;
    fn queue_song(&mut self, id: u32) -> Result<Option<Song>>;
    fn queue_songs(&mut self) -> Result<Vec<Song>>;
    fn stats(&mut self) -> Result<Stats>;

    // playback and queue
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    fn previous(&mut self) -> Result<()>;
    fn set_volume(&mut self, volume: u32) -> Result<()>;
    fn add(&mut self, uri: &str) -> Result<()>;
    /// Append every song whose tag matches `value`
    fn search_add(&mut self, tag: &str, value: &str) -> Result<()>;
    fn clear_queue(&mut self) -> Result<()>;
    /// Start a database update, returning its job id
    fn update_database(&mut self) -> Result<u32>;

    // library enumeration without collecting everything first
    fn for_each_song(&mut self, source: &SongSource, visit: &mut dyn FnMut(Song)) -> Result<()>;
    fn for_each_tag_value(&mut self, tag: &str, visit: &mut dyn FnMut(String)) -> Result<()>;

    // stored playlists
    fn playlists(&mut self) -> Result<Vec<String>>;
    fn playlist_songs(&mut self, name: &str) -> Result<Vec<String>>;
    fn playlist_add(&mut self, name: &str, uri: &str) -> Result<()>;
    fn playlist_remove(&mut self, name: &str) -> Result<()>;
    /// Append all matches of `query` to playlist `name`, creating it if needed
    fn search_to_playlist(&mut self, query: &SearchQuery, name: &str) -> Result<()>;

    // stickers
    fn sticker_get(&mut self, uri: &str, name: &str) -> Result<Option<String>>;
    fn sticker_list(&mut self, uri: &str) -> Result<Vec<(String, String)>>;
    fn sticker_set(&mut self, uri: &str, name: &str, value: &str) -> Result<()>;
    /// Every song carrying sticker `name`, with its value
    fn sticker_find(&mut self, name: &str) -> Result<Vec<(String, String)>>;

    // idle
    fn enter_idle(&mut self) -> Result<()>;
    /// Wait up to `timeout` for the daemon to report a change
    fn poll_idle(&mut self, timeout: Duration) -> Result<bool>;
    /// Cancel idle and collect the changes reported so far
    fn leave_idle(&mut self) -> Result<Vec<Subsystem>>;
}

/// Opens daemon sessions
pub trait Connector: Send {
    fn connect(&mut self, settings: &ConnectionSettings) -> Result<Box<dyn Daemon>>;
}

/// Streams and other URIs without a stable local identity
pub fn is_stream(uri: &str) -> bool {
    uri.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_parse_names() {
        assert_eq!(Subsystem::parse("playlist"), Some(Subsystem::Queue));
        assert_eq!(Subsystem::parse("stored_playlist"), Some(Subsystem::StoredPlaylist));
        assert_eq!(Subsystem::parse("sticker"), None);
    }

    #[test]
    fn test_song_tag_lookup_ignores_case() {
        let song = Song::new("a/b.flac").with_tag("Artist", "Nina Simone");
        assert_eq!(song.tag("artist"), Some("Nina Simone"));
        assert_eq!(song.tag("Album"), None);
    }

    #[test]
    fn test_is_stream() {
        assert!(is_stream("http://radio.example/stream"));
        assert!(!is_stream("Jazz/Coltrane/Naima.flac"));
    }
}
