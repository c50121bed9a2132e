//! # Jobs exchanged with the front end
//!
//! Inbound [`Request`]s carry a caller handle, a [`CommandId`] and a JSON payload.
//! Outbound [`Response`]s carry a handle and a serialized JSON-RPC 2.0 document:
//! a result or error addressed to the caller, or a notification addressed to
//! [`BROADCAST`] (every client) or [`INTERNAL`] (the settings loop only).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EngineError, Result};

/// Opaque caller handle assigned by the front end
pub type ConnectionId = i64;

/// Notification for every connected client
pub const BROADCAST: ConnectionId = 0;

/// Message for the settings loop, never relayed to clients
pub const INTERNAL: ConnectionId = -1;

/// Error text for jobs that arrive while no session is up
pub const DISCONNECTED_MESSAGE: &str = "MPD disconnected";

/// Every command a caller may submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandId {
    SettingsGet,
    SettingsSet,
    ConnectionSave,
    Reconnect,
    Disconnect,
    LastPlayedList,
    SmartplsGet,
    PlayerPlay,
    PlayerPause,
    PlayerStop,
    PlayerNext,
    PlayerPrev,
    PlayerVolumeSet,
    PlayerState,
    PlayerCurrentSong,
    QueueAdd,
    QueueClear,
    PlaylistList,
    PlaylistContent,
    PlaylistAdd,
    PlaylistRm,
    DatabaseUpdate,
    StickerLike,
    StickerGet,
    SmartplsSave,
    SmartplsDelete,
    SmartplsUpdate,
    SmartplsUpdateAll,
    JukeboxFill,
}

impl CommandId {
    /// Commands answered from engine state alone, in any connection state
    pub fn is_engine_local(self) -> bool {
        matches!(
            self,
            CommandId::SettingsGet
                | CommandId::SettingsSet
                | CommandId::ConnectionSave
                | CommandId::Reconnect
                | CommandId::Disconnect
                | CommandId::LastPlayedList
                | CommandId::SmartplsGet
        )
    }
}

/// Inbound job
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub connection_id: ConnectionId,
    pub request_id: u64,
    pub command: CommandId,
    pub params: Value,
}

#[derive(Deserialize)]
struct WireRequest {
    connection: ConnectionId,
    id: u64,
    method: CommandId,
    #[serde(default)]
    params: Value,
}

impl Request {
    pub fn new(connection_id: ConnectionId, request_id: u64, command: CommandId, params: Value) -> Self {
        Self {
            connection_id,
            request_id,
            command,
            params,
        }
    }

    /// Parse one JSON request line as written by the front end:
    /// `{"connection": 7, "id": 1, "method": "player_play", "params": {}}`
    pub fn from_json(line: &str) -> Result<Self> {
        let wire: WireRequest = serde_json::from_str(line)
            .map_err(|e| EngineError::Validation(format!("malformed request: {e}")))?;
        Ok(Self::new(wire.connection, wire.id, wire.method, wire.params))
    }

    /// Decode the payload into a typed parameter struct
    pub fn params<P: DeserializeOwned>(&self) -> Result<P> {
        let params = if self.params.is_null() {
            json!({})
        } else {
            self.params.clone()
        };
        serde_json::from_value(params).map_err(|e| {
            EngineError::Validation(format!("invalid params for {:?}: {e}", self.command))
        })
    }
}

/// Outbound job
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub connection_id: ConnectionId,
    pub payload: String,
}

impl Response {
    pub fn result(request: &Request, result: Value) -> Self {
        Self {
            connection_id: request.connection_id,
            payload: json!({"jsonrpc": "2.0", "id": request.request_id, "result": result})
                .to_string(),
        }
    }

    pub fn error(request: &Request, message: &str) -> Self {
        Self {
            connection_id: request.connection_id,
            payload: json!({
                "jsonrpc": "2.0",
                "id": request.request_id,
                "error": {"message": message}
            })
            .to_string(),
        }
    }

    pub fn disconnected(request: &Request) -> Self {
        Self::error(request, DISCONNECTED_MESSAGE)
    }

    pub fn is_broadcast(&self) -> bool {
        self.connection_id == BROADCAST
    }

    pub fn is_internal(&self) -> bool {
        self.connection_id == INTERNAL
    }

    /// Whether a reply has a client to go to
    pub fn has_caller(&self) -> bool {
        self.connection_id > INTERNAL
    }

    /// Parsed payload, for consumers that route on content
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Broadcast and internal notifications emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    MpdConnected(Value),
    MpdDisconnected,
    UpdateDatabase,
    UpdateStoredPlaylist,
    UpdateQueue(Value),
    UpdateState(Value),
    UpdateVolume(Value),
    UpdateOutputs,
    UpdateOptions,
    UpdateStarted { job_id: u32 },
    UpdateFinished,
    UpdateLastPlayed,
    /// A jukebox fill failed and was not retried
    JukeboxError(String),
    /// Resolved music directory for the settings loop
    Bootstrap {
        music_directory: Option<String>,
        feat_library: bool,
    },
}

impl Notification {
    pub fn method(&self) -> &'static str {
        match self {
            Notification::MpdConnected(_) => "mpd_connected",
            Notification::MpdDisconnected => "mpd_disconnected",
            Notification::UpdateDatabase => "update_database",
            Notification::UpdateStoredPlaylist => "update_stored_playlist",
            Notification::UpdateQueue(_) => "update_queue",
            Notification::UpdateState(_) => "update_state",
            Notification::UpdateVolume(_) => "update_volume",
            Notification::UpdateOutputs => "update_outputs",
            Notification::UpdateOptions => "update_options",
            Notification::UpdateStarted { .. } => "update_started",
            Notification::UpdateFinished => "update_finished",
            Notification::UpdateLastPlayed => "update_lastplayed",
            Notification::JukeboxError(_) => "jukebox_error",
            Notification::Bootstrap { .. } => "bootstrap",
        }
    }

    fn params(&self) -> Value {
        match self {
            Notification::MpdConnected(params)
            | Notification::UpdateQueue(params)
            | Notification::UpdateState(params)
            | Notification::UpdateVolume(params) => params.clone(),
            Notification::UpdateStarted { job_id } => json!({ "jobid": job_id }),
            Notification::JukeboxError(message) => json!({ "message": message }),
            Notification::Bootstrap {
                music_directory,
                feat_library,
            } => json!({
                "musicDirectory": music_directory.as_deref().unwrap_or("none"),
                "featLibrary": feat_library,
            }),
            _ => json!({}),
        }
    }

    /// Bootstrap messages go to the settings loop, the rest to every client
    pub fn into_response(self) -> Response {
        let connection_id = match self {
            Notification::Bootstrap { .. } => INTERNAL,
            _ => BROADCAST,
        };
        Response {
            connection_id,
            payload: json!({"jsonrpc": "2.0", "method": self.method(), "params": self.params()})
                .to_string(),
        }
    }
}
