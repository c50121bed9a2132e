//! Executes caller commands against the session and, when connected, the daemon.
//!
//! Engine-local commands never touch the daemon and are served in every
//! connection state. Everything else needs a live session and fails with a
//! connection error without one.

use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{CommandId, Request};
use crate::config::{validate_name, SettingsPatch};
use crate::daemon::Daemon;
use crate::error::{EngineError, Result};
use crate::jukebox::FillOutcome;
use crate::session::Session;
use crate::smartpls::SmartPlaylistDefinition;
use crate::stickers;

/// What the supervisor should do with the connection after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Reconnect,
    Disconnect,
}

#[derive(Deserialize)]
struct ConnectionParams {
    host: String,
    port: u16,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Deserialize)]
struct PageParams {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct PlaylistParams {
    playlist: String,
}

#[derive(Deserialize)]
struct UriParams {
    uri: String,
}

#[derive(Deserialize)]
struct PlaylistUriParams {
    playlist: String,
    uri: String,
}

#[derive(Deserialize)]
struct VolumeParams {
    volume: u32,
}

#[derive(Deserialize)]
struct LikeParams {
    uri: String,
    like: i64,
}

#[derive(Deserialize)]
struct SmartplsSaveParams {
    playlist: String,
    definition: SmartPlaylistDefinition,
}

fn ok() -> Value {
    json!({"message": "ok"})
}

/// Run one request, returning its result and the follow-up for the connection
pub fn execute(
    session: &mut Session,
    daemon: Option<&mut dyn Daemon>,
    request: &Request,
    now: i64,
) -> Result<(Value, Action)> {
    debug!("Executing {:?} for {}", request.command, request.connection_id);
    if request.command.is_engine_local() {
        return execute_local(session, daemon, request);
    }
    let Some(daemon) = daemon else {
        return Err(EngineError::Connection("not connected".to_string()));
    };
    let result = execute_remote(session, daemon, request, now)?;
    Ok((result, Action::None))
}

fn execute_local(
    session: &mut Session,
    daemon: Option<&mut dyn Daemon>,
    request: &Request,
) -> Result<(Value, Action)> {
    match request.command {
        CommandId::SettingsGet => {
            let mut settings = session.config.to_json();
            if let (Some(settings), Value::Object(features)) =
                (settings.as_object_mut(), session.features.to_json())
            {
                settings.extend(features);
            }
            Ok((settings, Action::None))
        }
        CommandId::SettingsSet => {
            let patch: SettingsPatch = request.params()?;
            apply_patch(session, daemon, &patch)
        }
        CommandId::ConnectionSave => {
            let params: ConnectionParams = request.params()?;
            let patch = SettingsPatch {
                mpd_host: Some(params.host),
                mpd_port: Some(params.port),
                mpd_pass: params.password,
                ..Default::default()
            };
            let (result, _) = apply_patch(session, None, &patch)?;
            Ok((result, Action::Reconnect))
        }
        CommandId::Reconnect => Ok((ok(), Action::Reconnect)),
        CommandId::Disconnect => Ok((ok(), Action::Disconnect)),
        CommandId::LastPlayedList => {
            let params: PageParams = request.params()?;
            let limit = params
                .limit
                .unwrap_or(session.config.max_elements_per_page)
                .min(session.config.max_elements_per_page.max(1));
            let (entries, total) = session.last_played.read(params.offset, limit)?;
            Ok((
                json!({
                    "data": entries,
                    "offset": params.offset,
                    "returnedEntities": entries.len(),
                    "totalEntities": total,
                }),
                Action::None,
            ))
        }
        CommandId::SmartplsGet => {
            let params: PlaylistParams = request.params()?;
            let definition = session.smartpls.load(&params.playlist)?;
            let mut result = serde_json::to_value(definition)?;
            if let Some(object) = result.as_object_mut() {
                object.insert("playlist".to_string(), Value::String(params.playlist));
            }
            Ok((result, Action::None))
        }
        other => Err(EngineError::Validation(format!(
            "{other:?} is not an engine command"
        ))),
    }
}

fn apply_patch(
    session: &mut Session,
    daemon: Option<&mut dyn Daemon>,
    patch: &SettingsPatch,
) -> Result<(Value, Action)> {
    let change = session.config.apply(&session.store, patch)?;
    session.sync_config();
    info!(
        "Settings changed: connection={} features={} jukebox={}",
        change.connection, change.features, change.jukebox
    );
    if change.connection {
        return Ok((ok(), Action::Reconnect));
    }
    if let Some(daemon) = daemon {
        if change.features {
            session.detect_features(daemon)?;
        }
    }
    Ok((ok(), Action::None))
}

fn execute_remote(
    session: &mut Session,
    daemon: &mut dyn Daemon,
    request: &Request,
    now: i64,
) -> Result<Value> {
    match request.command {
        CommandId::PlayerPlay => daemon.play().map(|_| ok()),
        CommandId::PlayerPause => daemon.pause().map(|_| ok()),
        CommandId::PlayerStop => daemon.stop().map(|_| ok()),
        CommandId::PlayerNext => daemon.next().map(|_| ok()),
        CommandId::PlayerPrev => daemon.previous().map(|_| ok()),
        CommandId::PlayerVolumeSet => {
            let params: VolumeParams = request.params()?;
            if params.volume > 100 {
                return Err(EngineError::Validation("volume must be 0 to 100".into()));
            }
            daemon.set_volume(params.volume).map(|_| ok())
        }
        CommandId::PlayerState => {
            session.refresh_status(daemon, now)?;
            Ok(session.tracker.snapshot().to_json())
        }
        CommandId::PlayerCurrentSong => {
            let Some(song) = daemon.current_song()? else {
                return Ok(json!({}));
            };
            let mut result = song.to_json();
            if session.features.stickers {
                let record = stickers::read(daemon, &song.uri)?;
                if let Some(object) = result.as_object_mut() {
                    object.insert("stickers".to_string(), serde_json::to_value(record)?);
                }
            }
            Ok(result)
        }
        CommandId::QueueAdd => {
            let params: UriParams = request.params()?;
            daemon.add(&params.uri).map(|_| ok())
        }
        CommandId::QueueClear => daemon.clear_queue().map(|_| ok()),
        CommandId::PlaylistList => {
            require_playlists(session)?;
            Ok(json!({ "data": daemon.playlists()? }))
        }
        CommandId::PlaylistContent => {
            require_playlists(session)?;
            let params: PlaylistParams = request.params()?;
            validate_name(&params.playlist)?;
            Ok(json!({ "data": daemon.playlist_songs(&params.playlist)? }))
        }
        CommandId::PlaylistAdd => {
            require_playlists(session)?;
            let params: PlaylistUriParams = request.params()?;
            validate_name(&params.playlist)?;
            daemon.playlist_add(&params.playlist, &params.uri).map(|_| ok())
        }
        CommandId::PlaylistRm => {
            require_playlists(session)?;
            let params: PlaylistParams = request.params()?;
            validate_name(&params.playlist)?;
            daemon.playlist_remove(&params.playlist)?;
            if session.smartpls.exists(&params.playlist)? {
                session.smartpls.delete(&params.playlist, None)?;
            }
            Ok(ok())
        }
        CommandId::DatabaseUpdate => Ok(json!({ "jobid": daemon.update_database()? })),
        CommandId::StickerLike => {
            require_stickers(session)?;
            let params: LikeParams = request.params()?;
            stickers::set_like(daemon, &params.uri, params.like)?;
            Ok(ok())
        }
        CommandId::StickerGet => {
            require_stickers(session)?;
            let params: UriParams = request.params()?;
            Ok(serde_json::to_value(stickers::read(daemon, &params.uri)?)?)
        }
        CommandId::SmartplsSave => {
            let params: SmartplsSaveParams = request.params()?;
            session.smartpls.save(&params.playlist, &params.definition)?;
            session
                .smartpls
                .update(daemon, &session.features, &params.playlist)?;
            Ok(ok())
        }
        CommandId::SmartplsDelete => {
            let params: PlaylistParams = request.params()?;
            session.smartpls.delete(&params.playlist, Some(daemon))?;
            Ok(ok())
        }
        CommandId::SmartplsUpdate => {
            require_smartpls(session)?;
            let params: PlaylistParams = request.params()?;
            session
                .smartpls
                .update(daemon, &session.features, &params.playlist)?;
            Ok(ok())
        }
        CommandId::SmartplsUpdateAll => {
            require_smartpls(session)?;
            let updated = session.refresh_smartpls(daemon, now)?;
            Ok(json!({ "updated": updated }))
        }
        CommandId::JukeboxFill => match session.run_jukebox(daemon, now)? {
            FillOutcome::Added(count) => Ok(json!({ "added": count })),
            FillOutcome::Skipped => Ok(json!({ "added": 0 })),
        },
        other => Err(EngineError::Validation(format!(
            "{other:?} is not a daemon command"
        ))),
    }
}

fn require_playlists(session: &Session) -> Result<()> {
    if session.features.playlists {
        Ok(())
    } else {
        Err(EngineError::Validation("MPD does not support playlists".into()))
    }
}

fn require_stickers(session: &Session) -> Result<()> {
    if session.features.stickers {
        Ok(())
    } else {
        Err(EngineError::Validation("MPD stickers are disabled".into()))
    }
}

fn require_smartpls(session: &Session) -> Result<()> {
    if session.features.smartpls {
        Ok(())
    } else {
        Err(EngineError::Validation("Smart playlists are disabled".into()))
    }
}
