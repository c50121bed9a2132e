//! In-memory daemon for tests and benchmarks.
//!
//! [`MemoryDaemon`] is a cheap handle around shared state, so a test can keep one
//! handle for inspection while the supervisor owns another as `Box<dyn Daemon>`.
//! Mutations queue the idle notifications a real daemon would send.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::ConnectionSettings;
use crate::daemon::{
    Connector, Daemon, PlayState, SearchQuery, Song, SongSource, Stats, Status, Subsystem,
};
use crate::error::{EngineError, Result};

/// Everything the fake daemon knows
#[derive(Debug, Clone)]
pub struct MemoryState {
    pub version: (u32, u32, u32),
    pub commands: Vec<String>,
    pub tag_types: Vec<String>,
    pub channels: Vec<String>,
    pub music_directory: Option<String>,
    /// Password required before any other command
    pub password: Option<String>,
    pub authenticated: bool,
    /// `false` makes every call fail as a broken transport
    pub online: bool,
    /// Refuse new sessions from [`MemoryConnector`]
    pub refuse_connections: bool,
    pub connect_attempts: u32,
    /// Number of upcoming `add` calls that fail with a protocol error
    pub fail_adds: usize,
    /// Make `clear_error` fail, escalating protocol errors
    pub clear_error_fails: bool,

    pub library: Vec<Song>,
    pub queue: Vec<Song>,
    pub next_queue_id: u32,
    pub queue_version: u32,
    pub current: Option<usize>,
    pub state: PlayState,
    pub volume: i32,
    pub elapsed: i64,
    pub crossfade: i64,
    pub updating_db: Option<u32>,
    pub db_update: i64,
    pub playlists: BTreeMap<String, Vec<String>>,
    pub stickers: BTreeMap<String, BTreeMap<String, String>>,

    pub idle: bool,
    pub pending: Vec<Subsystem>,
    /// Every command issued, in wire-like spelling
    pub log: Vec<String>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            version: (0, 23, 5),
            commands: ["sticker", "listplaylists", "getfingerprint", "searchaddpl", "channels"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tag_types: ["Artist", "Album", "AlbumArtist", "Title", "Track", "Genre", "Date"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            channels: Vec::new(),
            music_directory: None,
            password: None,
            authenticated: false,
            online: true,
            refuse_connections: false,
            connect_attempts: 0,
            fail_adds: 0,
            clear_error_fails: false,
            library: Vec::new(),
            queue: Vec::new(),
            next_queue_id: 1,
            queue_version: 1,
            current: None,
            state: PlayState::Stop,
            volume: 50,
            elapsed: 0,
            crossfade: 0,
            updating_db: None,
            db_update: 0,
            playlists: BTreeMap::new(),
            stickers: BTreeMap::new(),
            idle: false,
            pending: Vec::new(),
            log: Vec::new(),
        }
    }
}

impl MemoryState {
    fn notify(&mut self, subsystem: Subsystem) {
        if !self.pending.contains(&subsystem) {
            self.pending.push(subsystem);
        }
    }

    fn queue_changed(&mut self) {
        self.queue_version += 1;
        self.notify(Subsystem::Queue);
    }

    fn push_queue(&mut self, song: &Song) {
        let mut song = song.clone();
        song.id = Some(self.next_queue_id);
        self.next_queue_id += 1;
        self.queue.push(song);
    }

    fn matches(song: &Song, query: &SearchQuery) -> Result<bool> {
        match query {
            SearchQuery::Tag { tag, value } if tag == "modified-since" => {
                let since: i64 = value
                    .parse()
                    .map_err(|_| EngineError::protocol("search", "invalid timestamp"))?;
                Ok(song.last_modified >= since)
            }
            SearchQuery::Tag { tag, value } => Ok(song
                .tags
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case(tag))
                .flat_map(|(_, values)| values)
                .any(|v| v.to_lowercase().contains(&value.to_lowercase()))),
            SearchQuery::Expression(expr) => {
                let inner = expr.trim_matches(|c| c == '(' || c == ')').trim();
                if let Some(rest) = inner.strip_prefix("modified-since ") {
                    let since: i64 = rest
                        .trim_matches('\'')
                        .parse()
                        .map_err(|_| EngineError::protocol("search", "invalid timestamp"))?;
                    return Ok(song.last_modified >= since);
                }
                if let Some((tag, value)) = inner.split_once(" == ") {
                    let value = value.trim_matches('\'');
                    return Ok(song.tag(tag.trim()) == Some(value));
                }
                Err(EngineError::protocol("search", format!("unsupported expression {expr}")))
            }
        }
    }
}

/// Shared handle to an in-memory daemon
#[derive(Debug, Clone, Default)]
pub struct MemoryDaemon {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Daemon whose library holds `count` songs `Artist N/Album N/Track N.flac`
    pub fn with_library(count: usize) -> Self {
        let daemon = Self::new();
        daemon.update(|state| {
            for i in 1..=count {
                state.library.push(
                    Song {
                        uri: format!("Artist {i}/Album {i}/Track {i}.flac"),
                        duration: 180,
                        last_modified: 1_000 * i as i64,
                        ..Default::default()
                    }
                    .with_tag("Artist", &format!("Artist {i}"))
                    .with_tag("Album", &format!("Album {i}"))
                    .with_tag("Title", &format!("Track {i}")),
                );
            }
            state.db_update = 1_000 * count as i64;
        });
        daemon
    }

    pub fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the state, e.g. to stage a scenario
    pub fn update<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn queue_uris(&self) -> Vec<String> {
        self.lock().queue.iter().map(|s| s.uri.clone()).collect()
    }

    pub fn sticker(&self, uri: &str, name: &str) -> Option<String> {
        self.lock()
            .stickers
            .get(uri)
            .and_then(|s| s.get(name))
            .cloned()
    }

    /// Raise an idle notification as if another client changed something
    pub fn notify(&self, subsystem: Subsystem) {
        self.lock().notify(subsystem);
    }

    /// Guard shared by every call: transport up and session authenticated
    fn session(&self, command: &str) -> Result<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        if !state.online {
            return Err(EngineError::Connection("connection reset by peer".to_string()));
        }
        if state.password.is_some() && !state.authenticated && command != "password" {
            return Err(EngineError::protocol(command, "you don't have permission"));
        }
        state.log.push(command.to_string());
        Ok(state)
    }
}

impl Daemon for MemoryDaemon {
    fn version(&self) -> (u32, u32, u32) {
        self.lock().version
    }

    fn password(&mut self, password: &str) -> Result<()> {
        let mut state = self.session("password")?;
        if state.password.as_deref() == Some(password) {
            state.authenticated = true;
            Ok(())
        } else {
            Err(EngineError::protocol("password", "incorrect password"))
        }
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        self.session("timeout").map(|_| ())
    }

    fn clear_error(&mut self) -> Result<()> {
        let state = self.lock();
        if !state.online || state.clear_error_fails {
            return Err(EngineError::Connection("can not clear error".to_string()));
        }
        Ok(())
    }

    fn commands(&mut self) -> Result<Vec<String>> {
        Ok(self.session("commands")?.commands.clone())
    }

    fn tag_types(&mut self) -> Result<Vec<String>> {
        Ok(self.session("tagtypes")?.tag_types.clone())
    }

    fn channels(&mut self) -> Result<Vec<String>> {
        Ok(self.session("channels")?.channels.clone())
    }

    fn music_directory(&mut self) -> Result<Option<String>> {
        Ok(self.session("config")?.music_directory.clone())
    }

    fn status(&mut self) -> Result<Status> {
        let state = self.session("status")?;
        let current = state.current.and_then(|pos| state.queue.get(pos));
        let next = state.current.and_then(|pos| state.queue.get(pos + 1));
        Ok(Status {
            state: state.state,
            volume: state.volume,
            song_pos: state.current.map(|p| p as u32),
            song_id: current.and_then(|s| s.id),
            next_song_id: next.and_then(|s| s.id),
            queue_length: state.queue.len() as u32,
            queue_version: state.queue_version,
            crossfade: state.crossfade,
            elapsed: if current.is_some() { state.elapsed } else { 0 },
            total: current.map(|s| s.duration).unwrap_or(0),
            updating_db: state.updating_db,
        })
    }

    fn current_song(&mut self) -> Result<Option<Song>> {
        let state = self.session("currentsong")?;
        Ok(state.current.and_then(|pos| state.queue.get(pos)).cloned())
    }

    fn queue_song(&mut self, id: u32) -> Result<Option<Song>> {
        let state = self.session("playlistid")?;
        Ok(state.queue.iter().find(|s| s.id == Some(id)).cloned())
    }

    fn queue_songs(&mut self) -> Result<Vec<Song>> {
        Ok(self.session("playlistinfo")?.queue.clone())
    }

    fn stats(&mut self) -> Result<Stats> {
        let state = self.session("stats")?;
        Ok(Stats {
            songs: state.library.len() as u64,
            db_update: state.db_update,
        })
    }

    fn play(&mut self) -> Result<()> {
        let mut state = self.session("play")?;
        if state.queue.is_empty() {
            return Ok(());
        }
        if state.current.is_none() {
            state.current = Some(0);
            state.elapsed = 0;
        }
        state.state = PlayState::Play;
        state.notify(Subsystem::Player);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let mut state = self.session("pause")?;
        if state.state == PlayState::Play {
            state.state = PlayState::Pause;
            state.notify(Subsystem::Player);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.session("stop")?;
        state.state = PlayState::Stop;
        state.elapsed = 0;
        state.notify(Subsystem::Player);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let mut state = self.session("next")?;
        if let Some(pos) = state.current {
            if pos + 1 < state.queue.len() {
                state.current = Some(pos + 1);
            } else {
                state.current = None;
                state.state = PlayState::Stop;
            }
            state.elapsed = 0;
            state.notify(Subsystem::Player);
        }
        Ok(())
    }

    fn previous(&mut self) -> Result<()> {
        let mut state = self.session("previous")?;
        if let Some(pos) = state.current {
            state.current = Some(pos.saturating_sub(1));
            state.elapsed = 0;
            state.notify(Subsystem::Player);
        }
        Ok(())
    }

    fn set_volume(&mut self, volume: u32) -> Result<()> {
        let mut state = self.session("setvol")?;
        if volume > 100 {
            return Err(EngineError::protocol("setvol", "Invalid volume value"));
        }
        state.volume = volume as i32;
        state.notify(Subsystem::Mixer);
        Ok(())
    }

    fn add(&mut self, uri: &str) -> Result<()> {
        let mut state = self.session(&format!("add {uri}"))?;
        if state.fail_adds > 0 {
            state.fail_adds -= 1;
            return Err(EngineError::protocol("add", "No such song"));
        }
        let song = state
            .library
            .iter()
            .find(|s| s.uri == uri)
            .cloned()
            .ok_or_else(|| EngineError::protocol("add", "No such directory"))?;
        state.push_queue(&song);
        state.queue_changed();
        Ok(())
    }

    fn search_add(&mut self, tag: &str, value: &str) -> Result<()> {
        let mut state = self.session(&format!("searchadd {tag} {value}"))?;
        let matching: Vec<Song> = state
            .library
            .iter()
            .filter(|s| s.tag(tag) == Some(value))
            .cloned()
            .collect();
        for song in &matching {
            state.push_queue(song);
        }
        state.queue_changed();
        Ok(())
    }

    fn clear_queue(&mut self) -> Result<()> {
        let mut state = self.session("clear")?;
        state.queue.clear();
        state.current = None;
        state.state = PlayState::Stop;
        state.queue_changed();
        Ok(())
    }

    fn update_database(&mut self) -> Result<u32> {
        let mut state = self.session("update")?;
        let job = state.updating_db.unwrap_or(0) + 1;
        state.updating_db = Some(job);
        state.notify(Subsystem::Update);
        Ok(job)
    }

    fn for_each_song(&mut self, source: &SongSource, visit: &mut dyn FnMut(Song)) -> Result<()> {
        let songs: Vec<Song> = {
            let state = self.session("listall")?;
            match source {
                SongSource::Library => state.library.clone(),
                SongSource::Playlist(name) => {
                    let uris = state
                        .playlists
                        .get(name)
                        .ok_or_else(|| EngineError::protocol("listplaylist", "No such playlist"))?;
                    uris.iter()
                        .map(|uri| {
                            state
                                .library
                                .iter()
                                .find(|s| &s.uri == uri)
                                .cloned()
                                .unwrap_or_else(|| Song::new(uri.clone()))
                        })
                        .collect()
                }
            }
        };
        songs.into_iter().for_each(visit);
        Ok(())
    }

    fn for_each_tag_value(&mut self, tag: &str, visit: &mut dyn FnMut(String)) -> Result<()> {
        let mut values: Vec<String> = {
            let state = self.session(&format!("list {tag}"))?;
            state
                .library
                .iter()
                .filter_map(|s| s.tag(tag).map(str::to_string))
                .collect()
        };
        values.sort();
        values.dedup();
        values.into_iter().for_each(visit);
        Ok(())
    }

    fn playlists(&mut self) -> Result<Vec<String>> {
        Ok(self.session("listplaylists")?.playlists.keys().cloned().collect())
    }

    fn playlist_songs(&mut self, name: &str) -> Result<Vec<String>> {
        self.session("listplaylist")?
            .playlists
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::protocol("listplaylist", "No such playlist"))
    }

    fn playlist_add(&mut self, name: &str, uri: &str) -> Result<()> {
        let mut state = self.session(&format!("playlistadd {name} {uri}"))?;
        state
            .playlists
            .entry(name.to_string())
            .or_default()
            .push(uri.to_string());
        state.notify(Subsystem::StoredPlaylist);
        Ok(())
    }

    fn playlist_remove(&mut self, name: &str) -> Result<()> {
        let mut state = self.session(&format!("rm {name}"))?;
        if state.playlists.remove(name).is_none() {
            return Err(EngineError::protocol("rm", "No such playlist"));
        }
        state.notify(Subsystem::StoredPlaylist);
        Ok(())
    }

    fn search_to_playlist(&mut self, query: &SearchQuery, name: &str) -> Result<()> {
        let mut state = self.session(&format!("searchaddpl {name}"))?;
        let mut uris = Vec::new();
        for song in &state.library {
            if MemoryState::matches(song, query)? {
                uris.push(song.uri.clone());
            }
        }
        state
            .playlists
            .entry(name.to_string())
            .or_default()
            .extend(uris);
        state.notify(Subsystem::StoredPlaylist);
        Ok(())
    }

    fn sticker_get(&mut self, uri: &str, name: &str) -> Result<Option<String>> {
        let state = self.session("sticker get")?;
        Ok(state.stickers.get(uri).and_then(|s| s.get(name)).cloned())
    }

    fn sticker_list(&mut self, uri: &str) -> Result<Vec<(String, String)>> {
        let state = self.session("sticker list")?;
        Ok(state
            .stickers
            .get(uri)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn sticker_set(&mut self, uri: &str, name: &str, value: &str) -> Result<()> {
        let mut state = self.session(&format!("sticker set {uri} {name} {value}"))?;
        if !state.library.iter().any(|s| s.uri == uri) {
            return Err(EngineError::protocol("sticker set", "no such song"));
        }
        state
            .stickers
            .entry(uri.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn sticker_find(&mut self, name: &str) -> Result<Vec<(String, String)>> {
        let state = self.session("sticker find")?;
        Ok(state
            .stickers
            .iter()
            .filter_map(|(uri, s)| s.get(name).map(|v| (uri.clone(), v.clone())))
            .collect())
    }

    fn enter_idle(&mut self) -> Result<()> {
        self.session("idle")?.idle = true;
        Ok(())
    }

    fn poll_idle(&mut self, _timeout: Duration) -> Result<bool> {
        let state = self.lock();
        if !state.online {
            return Err(EngineError::Connection("connection reset by peer".to_string()));
        }
        Ok(state.idle && !state.pending.is_empty())
    }

    fn leave_idle(&mut self) -> Result<Vec<Subsystem>> {
        let mut state = self.session("noidle")?;
        state.idle = false;
        Ok(std::mem::take(&mut state.pending))
    }
}

/// Hands out sessions on a shared [`MemoryDaemon`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    daemon: MemoryDaemon,
}

impl MemoryConnector {
    pub fn new(daemon: MemoryDaemon) -> Self {
        Self { daemon }
    }
}

impl Connector for MemoryConnector {
    fn connect(&mut self, settings: &ConnectionSettings) -> Result<Box<dyn Daemon>> {
        let mut state = self.daemon.lock();
        state.connect_attempts += 1;
        if state.refuse_connections || !state.online {
            return Err(EngineError::Connection(format!(
                "{}:{} refused the connection",
                settings.host, settings.port
            )));
        }
        state.authenticated = false;
        state.idle = false;
        drop(state);
        Ok(Box::new(self.daemon.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_play_updates_status() {
        let mut daemon = MemoryDaemon::with_library(3);
        daemon.add("Artist 2/Album 2/Track 2.flac").unwrap();
        daemon.play().unwrap();

        let status = daemon.status().unwrap();
        assert_eq!(status.state, PlayState::Play);
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.total, 180);
        assert!(status.song_id.is_some());
    }

    #[test]
    fn test_password_gate() {
        let mut daemon = MemoryDaemon::with_library(1);
        daemon.update(|s| s.password = Some("hunter2".to_string()));
        assert!(daemon.status().is_err());
        assert!(daemon.password("wrong").is_err());
        daemon.password("hunter2").unwrap();
        assert!(daemon.status().is_ok());
    }

    #[test]
    fn test_idle_reports_pending_changes() {
        let mut daemon = MemoryDaemon::with_library(2);
        daemon.enter_idle().unwrap();
        assert!(!daemon.poll_idle(Duration::ZERO).unwrap());

        daemon.notify(Subsystem::Player);
        assert!(daemon.poll_idle(Duration::ZERO).unwrap());
        assert_eq!(daemon.leave_idle().unwrap(), vec![Subsystem::Player]);
        assert!(!daemon.poll_idle(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_expression_search_to_playlist() {
        let mut daemon = MemoryDaemon::with_library(5);
        daemon
            .search_to_playlist(&SearchQuery::Expression("(modified-since '3000')".into()), "new")
            .unwrap();
        assert_eq!(daemon.playlist_songs("new").unwrap().len(), 3);

        daemon
            .search_to_playlist(&SearchQuery::Expression("((Artist == 'Artist 1'))".into()), "a1")
            .unwrap();
        assert_eq!(
            daemon.playlist_songs("a1").unwrap(),
            vec!["Artist 1/Album 1/Track 1.flac".to_string()]
        );
    }

    #[test]
    fn test_offline_daemon_reports_connection_error() {
        let mut daemon = MemoryDaemon::with_library(1);
        daemon.update(|s| s.online = false);
        assert!(daemon.status().unwrap_err().is_connection());
    }
}
