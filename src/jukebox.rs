//! # Jukebox
//!
//! Keeps the queue topped up with random songs or albums.
//!
//! ## Trigger
//!
//! A fill is due when the queue is shorter than the target length, or while the
//! last song plays out: once `now` passes the current song's end minus the
//! crossfade, one extra song is added so playback never runs dry.
//!
//! ## Selection
//!
//! Candidates stream past a [`Reservoir`] in one pass (Algorithm R): the i-th
//! candidate replaces a uniformly chosen slot with probability `capacity / i`,
//! so every candidate ends up selected with equal probability and the candidate
//! list is never collected. The selection is shuffled before it is queued.

use std::collections::HashSet;
use std::fmt;

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::daemon::{Daemon, PlayState, SongSource};
use crate::error::{EngineError, Result};
use crate::features::Features;
use crate::stickers;
use crate::tracker::PlaybackSnapshot;

/// Most songs or albums added by one fill
pub const MAX_ADD: i64 = 999;

/// Tag used for album mode
pub const ALBUM_TAG: &str = "Album";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[repr(u8)]
pub enum JukeboxMode {
    #[default]
    Off = 0,
    AddSong = 1,
    AddAlbum = 2,
}

impl TryFrom<u8> for JukeboxMode {
    type Error = EngineError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(JukeboxMode::Off),
            1 => Ok(JukeboxMode::AddSong),
            2 => Ok(JukeboxMode::AddAlbum),
            other => Err(EngineError::Validation(format!(
                "unknown jukebox mode {other}"
            ))),
        }
    }
}

/// Where candidates come from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JukeboxSource {
    #[default]
    Library,
    Playlist(String),
}

impl JukeboxSource {
    /// Setting value meaning "the whole library"
    pub const LIBRARY: &'static str = "Database";

    pub fn from_setting(value: &str) -> Self {
        if value.is_empty() || value == Self::LIBRARY {
            JukeboxSource::Library
        } else {
            JukeboxSource::Playlist(value.to_string())
        }
    }

    fn songs(&self) -> SongSource {
        match self {
            JukeboxSource::Library => SongSource::Library,
            JukeboxSource::Playlist(name) => SongSource::Playlist(name.clone()),
        }
    }
}

impl fmt::Display for JukeboxSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JukeboxSource::Library => f.write_str(Self::LIBRARY),
            JukeboxSource::Playlist(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JukeboxConfig {
    pub mode: JukeboxMode,
    pub source: JukeboxSource,
    /// Target queue length
    pub queue_length: u32,
    /// Songs sharing this tag's value with a queued song are not picked
    pub unique_tag: Option<String>,
    /// Songs played within this many hours are not picked; 0 disables
    pub last_played_hours: u32,
}

impl Default for JukeboxConfig {
    fn default() -> Self {
        Self {
            mode: JukeboxMode::Off,
            source: JukeboxSource::Library,
            queue_length: 1,
            unique_tag: None,
            last_played_hours: 0,
        }
    }
}

/// Fixed-size uniform sample over a stream of unknown length
#[derive(Debug, Clone)]
pub struct Reservoir<T> {
    capacity: usize,
    items: Vec<T>,
    seen: usize,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity),
            seen: 0,
        }
    }

    /// Offer the next candidate; returns true if it was kept
    pub fn offer<R: Rng + ?Sized>(&mut self, item: T, rng: &mut R) -> bool {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return true;
        }
        if self.capacity == 0 {
            return false;
        }
        let slot = rng.gen_range(0..self.seen);
        if slot < self.capacity {
            self.items[slot] = item;
            true
        } else {
            false
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Candidates offered so far
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Fewer candidates existed than requested
    pub fn is_short(&self) -> bool {
        self.items.len() < self.capacity
    }

    pub fn into_shuffled<R: Rng + ?Sized>(mut self, rng: &mut R) -> Vec<T> {
        self.items.shuffle(rng);
        self.items
    }
}

/// Result of one fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Nothing to do: mode off, queue long enough, or source unavailable
    Skipped,
    /// Number of songs or albums queued
    Added(usize),
}

#[derive(Debug, Clone, Default)]
pub struct JukeboxEngine {
    config: JukeboxConfig,
}

impl JukeboxEngine {
    pub fn new(config: JukeboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JukeboxConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: JukeboxConfig) {
        self.config = config;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.mode != JukeboxMode::Off
    }

    /// The play-out condition: the current song is about to end and the queue
    /// holds no more than the target
    pub fn add_time_due(&self, snapshot: &PlaybackSnapshot, now: i64) -> bool {
        let add_time = snapshot.add_time();
        self.is_enabled()
            && snapshot.state == PlayState::Play
            && add_time > 0
            && now > add_time
            && snapshot.queue_length <= self.config.queue_length
    }

    /// The queue is shorter than the target
    pub fn queue_short(&self, queue_length: u32) -> bool {
        self.is_enabled() && queue_length < self.config.queue_length
    }

    /// Number of entries to add for the given queue length
    pub fn wanted(&self, queue_length: u32, add_time: i64, now: i64) -> i64 {
        let mut wanted = i64::from(self.config.queue_length) - i64::from(queue_length);
        if add_time > 0 && now > add_time {
            wanted += 1;
        }
        wanted.min(MAX_ADD)
    }

    /// Fill the queue, retrying the whole fill once if it fails
    pub fn run<R: Rng + ?Sized>(
        &self,
        daemon: &mut dyn Daemon,
        features: &Features,
        snapshot: &PlaybackSnapshot,
        now: i64,
        rng: &mut R,
    ) -> Result<FillOutcome> {
        if !self.is_enabled() {
            return Ok(FillOutcome::Skipped);
        }
        if let JukeboxSource::Playlist(name) = &self.config.source {
            if !features.playlists {
                warn!("Jukebox source {name} needs stored playlist support, skipping fill");
                return Ok(FillOutcome::Skipped);
            }
        }
        let recent = if features.stickers {
            self.recently_played(daemon, now)?
        } else {
            HashSet::new()
        };
        match self.fill(daemon, snapshot, &recent, now, rng) {
            Err(e) if !e.is_connection() => {
                warn!("Jukebox fill failed: {e}, retrying once");
                daemon.clear_error()?;
                self.fill(daemon, snapshot, &recent, now, rng)
            }
            other => other,
        }
    }

    /// Uris whose lastPlayed sticker falls inside the configured window
    pub fn recently_played(&self, daemon: &mut dyn Daemon, now: i64) -> Result<HashSet<String>> {
        if self.config.last_played_hours == 0 {
            return Ok(HashSet::new());
        }
        let since = now - i64::from(self.config.last_played_hours) * 3600;
        let recent: HashSet<String> = daemon
            .sticker_find(stickers::LAST_PLAYED)?
            .into_iter()
            .filter(|(_, value)| value.parse::<i64>().map_or(false, |played| played > since))
            .map(|(uri, _)| uri)
            .collect();
        debug!("Jukebox: skipping {} recently played songs", recent.len());
        Ok(recent)
    }

    fn fill<R: Rng + ?Sized>(
        &self,
        daemon: &mut dyn Daemon,
        snapshot: &PlaybackSnapshot,
        recent: &HashSet<String>,
        now: i64,
        rng: &mut R,
    ) -> Result<FillOutcome> {
        let status = daemon.status()?;
        let wanted = self.wanted(status.queue_length, snapshot.add_time(), now);
        if wanted < 1 {
            debug!("Jukebox: queue already holds {} songs", status.queue_length);
            return Ok(FillOutcome::Skipped);
        }
        let wanted = wanted as usize;

        let added = match self.config.mode {
            JukeboxMode::Off => return Ok(FillOutcome::Skipped),
            JukeboxMode::AddSong => {
                let uris = self.select_songs(daemon, wanted, recent, rng)?;
                for uri in &uris {
                    daemon.add(uri)?;
                }
                uris.len()
            }
            JukeboxMode::AddAlbum => {
                let albums = self.select_albums(daemon, wanted, rng)?;
                for album in &albums {
                    daemon.search_add(ALBUM_TAG, album)?;
                }
                albums.len()
            }
        };

        if added > 0 {
            info!("Jukebox added {added} {}", match self.config.mode {
                JukeboxMode::AddAlbum => "albums",
                _ => "songs",
            });
            daemon.play()?;
        }
        Ok(FillOutcome::Added(added))
    }

    /// Random songs not already queued or recently played, honouring the unique tag
    pub fn select_songs<R: Rng + ?Sized>(
        &self,
        daemon: &mut dyn Daemon,
        wanted: usize,
        recent: &HashSet<String>,
        rng: &mut R,
    ) -> Result<Vec<String>> {
        let queued = daemon.queue_songs()?;
        let unique_tag = self.config.unique_tag.as_deref();
        let queued_uris: HashSet<String> = queued.iter().map(|s| s.uri.clone()).collect();
        let taken_values: HashSet<String> = queued
            .iter()
            .filter_map(|s| unique_tag.and_then(|tag| s.tag(tag)).map(str::to_string))
            .collect();

        let mut reservoir: Reservoir<(String, Option<String>)> = Reservoir::new(wanted);
        daemon.for_each_song(&self.config.source.songs(), &mut |song| {
            if queued_uris.contains(&song.uri) || recent.contains(&song.uri) {
                return;
            }
            let value = unique_tag.and_then(|tag| song.tag(tag)).map(str::to_string);
            if let Some(value) = &value {
                if taken_values.contains(value)
                    || reservoir.items().iter().any(|(_, v)| v.as_ref() == Some(value))
                {
                    return;
                }
            }
            reservoir.offer((song.uri, value), rng);
        })?;

        if reservoir.is_short() {
            warn!(
                "Jukebox: wanted {wanted} songs but only {} candidates in {}",
                reservoir.items().len(),
                self.config.source
            );
        }
        let picked = reservoir.into_shuffled(rng);
        Ok(picked.into_iter().map(|(uri, _)| uri).collect())
    }

    /// Random album names from the library or the songs of the source playlist
    pub fn select_albums<R: Rng + ?Sized>(
        &self,
        daemon: &mut dyn Daemon,
        wanted: usize,
        rng: &mut R,
    ) -> Result<Vec<String>> {
        let mut reservoir = Reservoir::new(wanted);
        match &self.config.source {
            JukeboxSource::Library => {
                daemon.for_each_tag_value(ALBUM_TAG, &mut |album| {
                    if !album.is_empty() {
                        reservoir.offer(album, rng);
                    }
                })?;
            }
            source => {
                let mut albums = HashSet::new();
                daemon.for_each_song(&source.songs(), &mut |song| {
                    if let Some(album) = song.tag(ALBUM_TAG) {
                        if !album.is_empty() {
                            albums.insert(album.to_string());
                        }
                    }
                })?;
                let mut albums: Vec<String> = albums.into_iter().collect();
                albums.sort();
                for album in albums {
                    reservoir.offer(album, rng);
                }
            }
        }
        if reservoir.is_short() {
            warn!(
                "Jukebox: wanted {wanted} albums but only {} available",
                reservoir.items().len()
            );
        }
        Ok(reservoir.into_shuffled(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::memory::MemoryDaemon;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn create_test_engine(mode: JukeboxMode, queue_length: u32) -> JukeboxEngine {
        JukeboxEngine::new(JukeboxConfig {
            mode,
            queue_length,
            ..Default::default()
        })
    }

    fn all_features() -> Features {
        Features {
            playlists: true,
            stickers: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_reservoir_keeps_everything_when_short() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reservoir = Reservoir::new(15);
        for i in 0..10 {
            reservoir.offer(i, &mut rng);
        }
        assert!(reservoir.is_short());
        assert_eq!(reservoir.seen(), 10);
        let mut picked = reservoir.into_shuffled(&mut rng);
        picked.sort_unstable();
        assert_eq!(picked, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_reservoir_is_uniform() {
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 20_000;
        let mut hits = [0u32; 10];
        for _ in 0..trials {
            let mut reservoir = Reservoir::new(3);
            for i in 0..10 {
                reservoir.offer(i, &mut rng);
            }
            for &i in reservoir.items() {
                hits[i] += 1;
            }
        }
        for (i, &count) in hits.iter().enumerate() {
            let p = f64::from(count) / f64::from(trials);
            assert!((p - 0.3).abs() < 0.02, "candidate {i} picked with p={p}");
        }
    }

    #[test]
    fn test_reservoir_zero_capacity() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut reservoir = Reservoir::new(0);
        assert!(!reservoir.offer("x", &mut rng));
        assert!(reservoir.items().is_empty());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(JukeboxMode::try_from(2).unwrap(), JukeboxMode::AddAlbum);
        assert!(JukeboxMode::try_from(3).is_err());
        assert_eq!(JukeboxSource::from_setting("Database"), JukeboxSource::Library);
        assert_eq!(
            JukeboxSource::from_setting("Chill"),
            JukeboxSource::Playlist("Chill".to_string())
        );
    }

    #[test]
    fn test_wanted_adds_one_past_add_time() {
        let engine = create_test_engine(JukeboxMode::AddSong, 5);
        assert_eq!(engine.wanted(2, 0, 100), 3);
        assert_eq!(engine.wanted(5, 90, 100), 1);
        assert_eq!(engine.wanted(5, 110, 100), 0);
        assert_eq!(engine.wanted(9, 0, 100), -4);
    }

    #[test]
    fn test_fill_empty_queue_with_distinct_songs() {
        let mut daemon = MemoryDaemon::with_library(10);
        let engine = create_test_engine(JukeboxMode::AddSong, 5);
        let mut rng = StdRng::seed_from_u64(3);

        let outcome = engine
            .run(&mut daemon, &all_features(), &PlaybackSnapshot::default(), 1_000, &mut rng)
            .unwrap();
        assert_eq!(outcome, FillOutcome::Added(5));

        let mut queue = daemon.queue_uris();
        assert_eq!(queue.len(), 5);
        queue.sort();
        queue.dedup();
        assert_eq!(queue.len(), 5);
        assert_eq!(daemon.status().unwrap().state, PlayState::Play);
    }

    #[test]
    fn test_fill_skips_queued_songs() {
        let mut daemon = MemoryDaemon::with_library(3);
        daemon.add("Artist 1/Album 1/Track 1.flac").unwrap();
        let engine = create_test_engine(JukeboxMode::AddSong, 5);
        let mut rng = StdRng::seed_from_u64(3);

        engine
            .run(&mut daemon, &all_features(), &PlaybackSnapshot::default(), 0, &mut rng)
            .unwrap();
        let mut queue = daemon.queue_uris();
        queue.sort();
        queue.dedup();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_unique_tag_constraint() {
        let mut daemon = MemoryDaemon::new();
        daemon.update(|s| {
            for (i, artist) in ["A", "A", "A", "B", "C"].iter().enumerate() {
                s.library.push(
                    crate::daemon::Song::new(format!("{i}.flac")).with_tag("Artist", artist),
                );
            }
        });
        let engine = JukeboxEngine::new(JukeboxConfig {
            mode: JukeboxMode::AddSong,
            queue_length: 5,
            unique_tag: Some("Artist".to_string()),
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(11);
        engine
            .run(&mut daemon, &all_features(), &PlaybackSnapshot::default(), 0, &mut rng)
            .unwrap();
        assert_eq!(daemon.queue_uris().len(), 3);
    }

    #[test]
    fn test_recently_played_songs_are_skipped() {
        let now = 100_000;
        let mut daemon = MemoryDaemon::with_library(4);
        let library: Vec<String> = daemon.lock().library.iter().map(|s| s.uri.clone()).collect();
        daemon.update(|s| {
            for (uri, played) in [(&library[0], now - 600), (&library[1], now - 7_200)] {
                s.stickers
                    .entry(uri.clone())
                    .or_default()
                    .insert(stickers::LAST_PLAYED.to_string(), played.to_string());
            }
        });
        let engine = JukeboxEngine::new(JukeboxConfig {
            mode: JukeboxMode::AddSong,
            queue_length: 4,
            last_played_hours: 1,
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(3);
        let outcome = engine
            .run(&mut daemon, &all_features(), &PlaybackSnapshot::default(), now, &mut rng)
            .unwrap();
        assert_eq!(outcome, FillOutcome::Added(3));
        let queue = daemon.queue_uris();
        assert!(!queue.contains(&library[0]));
        assert!(queue.contains(&library[1]));
    }

    #[test]
    fn test_last_played_filter_needs_stickers() {
        let mut daemon = MemoryDaemon::with_library(2);
        let first = daemon.lock().library[0].uri.clone();
        daemon.update(|s| {
            s.stickers
                .entry(first.clone())
                .or_default()
                .insert(stickers::LAST_PLAYED.to_string(), "50".to_string());
        });
        let engine = JukeboxEngine::new(JukeboxConfig {
            mode: JukeboxMode::AddSong,
            queue_length: 2,
            last_played_hours: 1,
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(3);
        engine
            .run(&mut daemon, &Features::default(), &PlaybackSnapshot::default(), 100, &mut rng)
            .unwrap();
        assert!(daemon.queue_uris().contains(&first));
    }

    #[test]
    fn test_album_mode_adds_whole_albums() {
        let mut daemon = MemoryDaemon::new();
        daemon.update(|s| {
            for album in ["X", "Y"] {
                for track in 0..3 {
                    s.library.push(
                        crate::daemon::Song::new(format!("{album}/{track}.flac"))
                            .with_tag("Album", album),
                    );
                }
            }
        });
        let engine = create_test_engine(JukeboxMode::AddAlbum, 1);
        let mut rng = StdRng::seed_from_u64(5);
        let outcome = engine
            .run(&mut daemon, &all_features(), &PlaybackSnapshot::default(), 0, &mut rng)
            .unwrap();
        assert_eq!(outcome, FillOutcome::Added(1));
        assert_eq!(daemon.queue_uris().len(), 3);
    }

    #[test]
    fn test_playlist_source_needs_playlist_support() {
        let mut daemon = MemoryDaemon::with_library(4);
        let engine = JukeboxEngine::new(JukeboxConfig {
            mode: JukeboxMode::AddAlbum,
            source: JukeboxSource::Playlist("Chill".to_string()),
            queue_length: 2,
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(5);
        let outcome = engine
            .run(&mut daemon, &Features::default(), &PlaybackSnapshot::default(), 0, &mut rng)
            .unwrap();
        assert_eq!(outcome, FillOutcome::Skipped);
        assert!(daemon.queue_uris().is_empty());
    }

    #[test]
    fn test_failed_fill_is_retried_once() {
        let mut daemon = MemoryDaemon::with_library(10);
        daemon.update(|s| s.fail_adds = 1);
        let engine = create_test_engine(JukeboxMode::AddSong, 3);
        let mut rng = StdRng::seed_from_u64(9);
        let outcome = engine
            .run(&mut daemon, &all_features(), &PlaybackSnapshot::default(), 0, &mut rng)
            .unwrap();
        assert_eq!(outcome, FillOutcome::Added(3));
        assert_eq!(daemon.queue_uris().len(), 3);
    }

    #[test]
    fn test_second_failure_is_reported() {
        let mut daemon = MemoryDaemon::with_library(10);
        daemon.update(|s| s.fail_adds = 2);
        let engine = create_test_engine(JukeboxMode::AddSong, 3);
        let mut rng = StdRng::seed_from_u64(9);
        let result =
            engine.run(&mut daemon, &all_features(), &PlaybackSnapshot::default(), 0, &mut rng);
        assert!(matches!(result, Err(EngineError::Protocol { .. })));
    }

    #[test]
    fn test_add_time_trigger() {
        let engine = create_test_engine(JukeboxMode::AddSong, 1);
        let snapshot = PlaybackSnapshot {
            state: PlayState::Play,
            song_end_time: 1_000,
            crossfade: 2,
            queue_length: 1,
            ..Default::default()
        };
        assert!(!engine.add_time_due(&snapshot, 998));
        assert!(engine.add_time_due(&snapshot, 999));

        let off = create_test_engine(JukeboxMode::Off, 1);
        assert!(!off.add_time_due(&snapshot, 999));
    }
}
