//! State owned by the supervisor loop for the lifetime of the engine.
//!
//! A [`Session`] survives reconnects: configuration, the last played list and
//! the smart playlist definitions stay, while [`Features`] and the playback
//! snapshot are rebuilt after each connect.

use std::sync::Arc;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::api::{Notification, Response};
use crate::config::{EngineConfig, StateStore, Workdir};
use crate::daemon::{is_stream, Daemon, PlayState, Status};
use crate::error::{EngineError, Result};
use crate::features::{self, Features};
use crate::job_queue::JobQueue;
use crate::jukebox::{FillOutcome, JukeboxEngine};
use crate::last_played::LastPlayedList;
use crate::smartpls::SmartPlaylistEngine;
use crate::stickers;
use crate::tracker::PlayTracker;

/// Delay between connecting and the first periodic smart playlist refresh
pub const SMARTPLS_FIRST_RUN: i64 = 30;

pub struct Session {
    pub config: EngineConfig,
    pub store: StateStore,
    pub features: Features,
    pub tracker: PlayTracker,
    pub last_played: LastPlayedList,
    pub jukebox: JukeboxEngine,
    pub smartpls: SmartPlaylistEngine,
    outbound: Arc<JobQueue<Response>>,
    internal: Arc<JobQueue<Response>>,
    rng: StdRng,
    /// Next periodic smart playlist refresh, 0 when none is scheduled
    smartpls_at: i64,
    /// Song for which an end-of-song fill already ran
    add_time_song: Option<u32>,
}

impl Session {
    pub fn new(
        config: EngineConfig,
        store: StateStore,
        workdir: &Workdir,
        outbound: Arc<JobQueue<Response>>,
        internal: Arc<JobQueue<Response>>,
    ) -> Self {
        let last_played = LastPlayedList::new(workdir.last_played_file(), config.last_played_count);
        let jukebox = JukeboxEngine::new(config.jukebox.clone());
        let smartpls = SmartPlaylistEngine::new(workdir.smartpls_dir(), &config.smartpls_prefix);
        let mut session = Self {
            config,
            store,
            features: Features::default(),
            tracker: PlayTracker::new(),
            last_played,
            jukebox,
            smartpls,
            outbound,
            internal,
            rng: StdRng::from_entropy(),
            smartpls_at: 0,
            add_time_song: None,
        };
        session.sync_config();
        session
    }

    /// Use a fixed seed for jukebox selection
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Push configuration into the engines after a settings change
    pub fn sync_config(&mut self) {
        self.jukebox.set_config(self.config.jukebox.clone());
        self.last_played.set_retention(self.config.last_played_count);
        self.smartpls.set_prefix(&self.config.smartpls_prefix);
        self.smartpls
            .set_generate_tags(self.features.generate_pls_tags.clone());
    }

    pub fn emit(&self, notification: Notification) {
        debug!("Emitting {}", notification.method());
        let response = notification.into_response();
        if response.is_internal() {
            self.internal.push(response);
        } else {
            self.outbound.push(response);
        }
    }

    /// Answer a request; requests without a client connection get no reply
    pub fn reply(&self, response: Response) {
        if !response.has_caller() {
            debug!("Not replying to internal connection {}", response.connection_id);
            return;
        }
        self.outbound.push(response);
    }

    /// Detect capabilities and bring every engine up to date with the daemon
    pub fn on_connected(&mut self, daemon: &mut dyn Daemon, now: i64) -> Result<()> {
        self.detect_features(daemon)?;
        self.tracker = PlayTracker::new();
        self.add_time_song = None;
        self.refresh_status(daemon, now)?;

        self.smartpls.update_all(daemon, &self.features)?;
        self.smartpls_at = if self.features.smartpls && self.config.smartpls_interval > 0 {
            now + SMARTPLS_FIRST_RUN
        } else {
            0
        };

        if self.jukebox.is_enabled() {
            self.fill_jukebox(daemon, now)?;
        }
        Ok(())
    }

    /// Rerun capability detection and announce the result
    pub fn detect_features(&mut self, daemon: &mut dyn Daemon) -> Result<()> {
        self.features = features::detect(daemon, &self.config)?;
        self.sync_config();
        self.emit(Notification::MpdConnected(self.features.to_json()));
        self.emit(Notification::Bootstrap {
            music_directory: self.features.music_directory.clone(),
            feat_library: self.features.library,
        });
        Ok(())
    }

    /// Fetch status into the tracker and book a skip if the song changed early
    pub fn refresh_status(&mut self, daemon: &mut dyn Daemon, now: i64) -> Result<Status> {
        let status = self.tracker.refresh(daemon, now)?;
        if let Some(uri) = self.tracker.take_skipped(now) {
            self.record_skip(daemon, &uri, now)?;
        }
        Ok(status)
    }

    fn record_skip(&mut self, daemon: &mut dyn Daemon, uri: &str, now: i64) -> Result<()> {
        if !self.features.stickers {
            return Ok(());
        }
        let count = stickers::increment(daemon, uri, stickers::SKIP_COUNT, 1)?;
        stickers::set_timestamp(daemon, uri, stickers::LAST_SKIPPED, now)?;
        debug!("Skip count of {uri} is now {count}");
        Ok(())
    }

    /// Book the current song as played once its threshold has passed
    pub fn mark_played(&mut self, daemon: &mut dyn Daemon, now: i64) -> Result<()> {
        let Some(played) = self.tracker.take_played(now) else {
            return Ok(());
        };
        let Some(uri) = played.uri.filter(|uri| !is_stream(uri)) else {
            debug!("Not booking song {} without a stable uri", played.id);
            return Ok(());
        };

        if let Err(e) = self.last_played.add(&uri, now) {
            error!("Can not save last played list: {e}");
        }
        self.emit(Notification::UpdateLastPlayed);

        if self.features.stickers {
            stickers::increment(daemon, &uri, stickers::PLAY_COUNT, 1)?;
            stickers::set_timestamp(daemon, &uri, stickers::LAST_PLAYED, played.start_time)?;
        }
        Ok(())
    }

    /// The current song is about to end and no fill ran for it yet
    pub fn jukebox_due(&self, now: i64) -> bool {
        let snapshot = self.tracker.snapshot();
        self.jukebox.add_time_due(snapshot, now) && self.add_time_song != snapshot.song_id
    }

    pub fn run_jukebox(&mut self, daemon: &mut dyn Daemon, now: i64) -> Result<FillOutcome> {
        let snapshot = self.tracker.snapshot().clone();
        if self.jukebox.add_time_due(&snapshot, now) {
            self.add_time_song = snapshot.song_id;
        }
        let outcome = self
            .jukebox
            .run(daemon, &self.features, &snapshot, now, &mut self.rng)?;
        if let FillOutcome::Added(count) = outcome {
            if count > 0 {
                self.refresh_status(daemon, now)?;
            }
        }
        Ok(outcome)
    }

    /// Run a fill in the background of another operation.
    ///
    /// A failed fill is logged and announced to clients, then dropped; only a
    /// lost connection is returned.
    pub fn fill_jukebox(&mut self, daemon: &mut dyn Daemon, now: i64) -> Result<()> {
        let e = match self.run_jukebox(daemon, now) {
            Ok(_) => return Ok(()),
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => e,
        };
        error!("Jukebox fill failed: {e}");
        self.emit(Notification::JukeboxError(e.to_string()));
        if matches!(e, EngineError::Protocol { .. }) {
            daemon.clear_error()?;
        }
        Ok(())
    }

    /// Start playback after a queue change if auto play is on
    pub fn auto_play(&mut self, daemon: &mut dyn Daemon, status: &Status) -> Result<()> {
        if self.config.auto_play && status.queue_length > 0 && status.state != PlayState::Play {
            info!("Auto play: starting playback");
            daemon.play()?;
        }
        Ok(())
    }

    pub fn smartpls_due(&self, now: i64) -> bool {
        self.smartpls_at > 0 && now >= self.smartpls_at
    }

    /// Refresh every smart playlist and schedule the next periodic run
    pub fn refresh_smartpls(&mut self, daemon: &mut dyn Daemon, now: i64) -> Result<usize> {
        self.smartpls_at = if self.features.smartpls && self.config.smartpls_interval > 0 {
            now + self.config.smartpls_interval
        } else {
            0
        };
        self.smartpls.update_all(daemon, &self.features)
    }

    /// Drop connection bound state
    pub fn on_disconnected(&mut self) {
        self.features = Features::default();
        self.smartpls_at = 0;
    }

    /// Write out anything still held in memory
    pub fn shutdown(&mut self) {
        if let Err(e) = self.last_played.flush() {
            warn!("Can not flush last played list on shutdown: {e}");
        }
        info!("Session closed");
    }
}
