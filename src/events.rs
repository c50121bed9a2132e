//! # Event dispatch
//!
//! Turns the subsystems reported by one idle round into [`DomainEvent`]s and
//! applies them: notifications go out to clients, and some events drive the
//! engines (database changes refresh smart playlists, a short queue runs the
//! jukebox).
//!
//! The daemon status is fetched at most once per batch, so every event of the
//! batch sees the same snapshot.

use log::{debug, error, info, warn};
use serde_json::json;

use crate::api::Notification;
use crate::daemon::{Daemon, Status, Subsystem};
use crate::error::{EngineError, Result};
use crate::features;
use crate::session::Session;

/// A daemon change with the data needed to act on it
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Database,
    StoredPlaylist,
    /// `changed` is false when the queue version did not move
    Queue { status: Status, changed: bool },
    Player(Status),
    Mixer { volume: i32 },
    Output,
    Options,
    Update { job: Option<u32> },
    Subscription,
}

fn needs_status(subsystem: Subsystem) -> bool {
    matches!(
        subsystem,
        Subsystem::Queue
            | Subsystem::Player
            | Subsystem::Mixer
            | Subsystem::Output
            | Subsystem::Options
            | Subsystem::Update
    )
}

/// Resolve a batch of changed subsystems into events
pub fn resolve(
    session: &mut Session,
    daemon: &mut dyn Daemon,
    changed: &[Subsystem],
    now: i64,
) -> Result<Vec<DomainEvent>> {
    let previous_version = session.tracker.snapshot().queue_version;
    let status = if changed.iter().any(|s| needs_status(*s)) {
        Some(session.refresh_status(daemon, now)?)
    } else {
        None
    };

    let mut events = Vec::with_capacity(changed.len());
    for subsystem in changed {
        info!("MPD event: {subsystem}");
        let event = match (subsystem, &status) {
            (Subsystem::Database, _) => DomainEvent::Database,
            (Subsystem::StoredPlaylist, _) => DomainEvent::StoredPlaylist,
            (Subsystem::Subscription, _) => DomainEvent::Subscription,
            (Subsystem::Queue, Some(status)) => DomainEvent::Queue {
                status: status.clone(),
                changed: status.queue_version != previous_version,
            },
            (Subsystem::Player, Some(status)) => DomainEvent::Player(status.clone()),
            (Subsystem::Mixer, Some(status)) => DomainEvent::Mixer {
                volume: status.volume,
            },
            (Subsystem::Output, _) => DomainEvent::Output,
            (Subsystem::Options, _) => DomainEvent::Options,
            (Subsystem::Update, Some(status)) => DomainEvent::Update {
                job: status.updating_db,
            },
            (other, None) => {
                debug!("No status for {other} event");
                continue;
            }
        };
        events.push(event);
    }
    Ok(events)
}

/// Apply one event
pub fn handle(
    session: &mut Session,
    daemon: &mut dyn Daemon,
    event: DomainEvent,
    now: i64,
) -> Result<()> {
    match event {
        DomainEvent::Database => {
            session.emit(Notification::UpdateDatabase);
            session.smartpls.update_all(daemon, &session.features)?;
        }
        DomainEvent::StoredPlaylist => session.emit(Notification::UpdateStoredPlaylist),
        DomainEvent::Queue { changed: false, .. } => {
            debug!("Queue version unchanged, ignoring queue event");
        }
        DomainEvent::Queue { status, .. } => {
            session.emit(Notification::UpdateQueue(json!({
                "queueLength": status.queue_length,
                "queueVersion": status.queue_version,
            })));
            if session.jukebox.queue_short(status.queue_length) {
                session.fill_jukebox(daemon, now)?;
            }
            session.auto_play(daemon, &status)?;
        }
        DomainEvent::Player(_) => {
            session.emit(Notification::UpdateState(session.tracker.snapshot().to_json()));
        }
        DomainEvent::Mixer { volume } => {
            session.emit(Notification::UpdateVolume(json!({ "volume": volume })));
        }
        DomainEvent::Output => session.emit(Notification::UpdateOutputs),
        DomainEvent::Options => session.emit(Notification::UpdateOptions),
        DomainEvent::Update { job: Some(job_id) } => {
            session.emit(Notification::UpdateStarted { job_id });
        }
        DomainEvent::Update { job: None } => session.emit(Notification::UpdateFinished),
        DomainEvent::Subscription => {
            let love = features::check_love(daemon, &session.config)?;
            if love != session.features.love {
                info!("Love channel {}", if love { "appeared" } else { "went away" });
                session.features.love = love;
                session.emit(Notification::UpdateOptions);
            }
        }
    }
    Ok(())
}

/// Resolve and apply a batch of changed subsystems.
///
/// Every event of the batch is handled even when an earlier one fails. A
/// rejected command is logged and cleared; a lost connection is returned once
/// the batch is through.
pub fn dispatch(
    session: &mut Session,
    daemon: &mut dyn Daemon,
    changed: &[Subsystem],
    now: i64,
) -> Result<()> {
    let mut lost = None;
    for event in resolve(session, daemon, changed, now)? {
        let e = match handle(session, daemon, event, now) {
            Ok(()) => continue,
            Err(e) => e,
        };
        if e.is_connection() {
            error!("Handling MPD event failed: {e}");
            lost.get_or_insert(e);
            continue;
        }
        warn!("Handling MPD event failed: {e}");
        if matches!(e, EngineError::Protocol { .. }) {
            if let Err(e) = daemon.clear_error() {
                lost.get_or_insert(e);
            }
        }
    }
    match lost {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
