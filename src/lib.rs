//! Connection, jukebox and smart playlist engine for an MPD web remote.
//!
//! Tonearm keeps one connection to a Music Player Daemon alive, turns its idle
//! notifications into client-facing events, and runs the background features that
//! need a live connection: play/skip bookkeeping with stickers, the last played
//! log, the jukebox and smart playlists.
//!
//! Core modules:
//! - [`supervisor`] - Connection state machine and tick loop
//! - [`events`] - Idle notifications to domain events
//! - [`tracker`] - Playback snapshot and play/skip detection
//! - [`jukebox`] - Automatic queue filling
//! - [`smartpls`] - Smart playlist definitions and generation
//! - [`handler`] - Command execution
//!
//! ### Supporting Modules
//!
//! - [`engine`] - Queue wiring, threads and shutdown
//! - [`job_queue`] - Blocking FIFO between the loops
//! - [`api`] - Jobs, command ids and JSON-RPC payloads
//! - [`daemon`] - The daemon seam, an MPD adapter and an in-memory daemon
//! - [`config`] - Working directory and persisted settings
//! - [`settings`] - Bootstrap loop
//! - [`features`], [`stickers`], [`last_played`], [`session`], [`error`]
//! - [`cli`], [`completion`] - Command-line interface
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tonearm::api::{CommandId, Request};
//! use tonearm::config::{EngineConfig, StateStore, Workdir};
//! use tonearm::daemon::mpd::MpdConnector;
//! use tonearm::engine::Engine;
//!
//! let workdir = Workdir::prepare(&tonearm::config::get_data_dir()?)?;
//! let store = StateStore::new(workdir.state_dir());
//! let config = EngineConfig::load(&store)?;
//! let engine = Engine::start(config, store, &workdir, Box::new(MpdConnector))?;
//!
//! engine.inbound().push(Request::new(1, 1, CommandId::PlayerState, serde_json::Value::Null));
//! if let Some(response) = engine.outbound().shift(Duration::from_secs(1)) {
//!     println!("{}", response.payload);
//! }
//! engine.stop()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod api;
pub mod cli;
pub mod completion;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod handler;
pub mod job_queue;
pub mod jukebox;
pub mod last_played;
pub mod session;
pub mod settings;
pub mod smartpls;
pub mod stickers;
pub mod supervisor;
pub mod tracker;
