//! Capability detection run after every successful connect.
//!
//! What the engine may do depends on both the daemon (which commands it allows,
//! which tags it knows, its protocol version) and the user's toggles. The check
//! folds both into one [`Features`] value that the rest of the session consults.

use std::path::Path;

use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::daemon::{is_stream, Daemon};
use crate::error::{EngineError, Result};

/// First protocol version with filter expressions
pub const ADVANCED_SEARCH_VERSION: (u32, u32, u32) = (0, 21, 0);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub stickers: bool,
    pub playlists: bool,
    pub tags: bool,
    pub advanced_search: bool,
    pub fingerprint: bool,
    pub love: bool,
    pub smartpls: bool,
    /// Music directory exists on this host
    pub library: bool,
    pub music_directory: Option<String>,
    /// Configured tags the daemon knows about
    pub tag_list: Vec<String>,
    pub search_tag_list: Vec<String>,
    pub browse_tag_list: Vec<String>,
    pub generate_pls_tags: Vec<String>,
}

impl Features {
    pub fn to_json(&self) -> Value {
        json!({
            "featStickers": self.stickers,
            "featPlaylists": self.playlists,
            "featTags": self.tags,
            "featAdvsearch": self.advanced_search,
            "featFingerprint": self.fingerprint,
            "featLove": self.love,
            "featSmartpls": self.smartpls,
            "featLibrary": self.library,
            "musicDirectory": self.music_directory,
            "tags": self.tag_list,
            "searchtags": self.search_tag_list,
            "browsetags": self.browse_tag_list,
        })
    }
}

/// Keep the configured tags the daemon supports, in configured order
fn enabled_tags(configured: &[String], supported: &[String]) -> Vec<String> {
    configured
        .iter()
        .filter_map(|tag| {
            supported
                .iter()
                .find(|s| s.eq_ignore_ascii_case(tag))
                .cloned()
        })
        .collect()
}

/// Run a capability query; a rejected query counts as "not available"
fn optional<T>(daemon: &mut dyn Daemon, what: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(EngineError::Protocol { message, .. }) => {
            warn!("Can not query {what}: {message}");
            daemon.clear_error()?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Whether the configured love channel is currently subscribed to on the daemon
pub fn check_love(daemon: &mut dyn Daemon, config: &EngineConfig) -> Result<bool> {
    if !config.love || config.love_channel.is_empty() {
        return Ok(false);
    }
    let channels = daemon.channels();
    let channels = optional(daemon, "channels", channels)?.unwrap_or_default();
    let found = channels.iter().any(|c| *c == config.love_channel);
    if !found {
        warn!("Love channel {} not available", config.love_channel);
    }
    Ok(found)
}

/// Resolve the music directory setting to a local path, if there is one
pub fn resolve_music_directory(
    daemon: &mut dyn Daemon,
    config: &EngineConfig,
) -> Result<Option<String>> {
    let setting = config.music_directory.as_str();
    let dir = match setting {
        "none" | "" => None,
        "auto" if config.connection.is_socket() => {
            let reply = daemon.music_directory();
            optional(daemon, "music directory", reply)?.flatten()
        }
        "auto" => {
            info!("Music directory can only be asked for over a local socket");
            None
        }
        path if path.starts_with('/') => Some(path.to_string()),
        other => {
            warn!("Ignoring invalid music directory {other}");
            None
        }
    };
    Ok(dir
        .map(|d| d.trim_end_matches('/').to_string())
        .filter(|d| !d.is_empty() && !is_stream(d)))
}

/// Query the daemon and combine the result with user toggles
pub fn detect(daemon: &mut dyn Daemon, config: &EngineConfig) -> Result<Features> {
    let mut features = Features::default();

    let commands = daemon.commands()?;
    let allowed = |name: &str| commands.iter().any(|c| c == name);
    features.stickers = config.stickers && allowed("sticker");
    features.playlists = allowed("listplaylists");
    features.fingerprint = allowed("getfingerprint");
    if config.stickers && !features.stickers {
        warn!("MPD does not support stickers, disabling sticker features");
    }
    if !features.playlists {
        warn!("MPD does not support stored playlists");
    }

    features.smartpls = config.smartpls && features.stickers && features.playlists;
    features.advanced_search = daemon.version() >= ADVANCED_SEARCH_VERSION;

    let tag_types = daemon.tag_types();
    let supported = optional(daemon, "tag types", tag_types)?.unwrap_or_default();
    features.tags = !supported.is_empty();
    if features.tags {
        features.tag_list = enabled_tags(&config.tag_list, &supported);
        features.search_tag_list = enabled_tags(&config.search_tag_list, &supported);
        features.browse_tag_list = enabled_tags(&config.browse_tag_list, &supported);
        features.generate_pls_tags = enabled_tags(&config.generate_pls_tags, &supported);
    } else {
        warn!("MPD reports no tag types, tag features disabled");
    }

    features.love = check_love(daemon, config)?;

    features.music_directory = resolve_music_directory(daemon, config)?;
    features.library = features
        .music_directory
        .as_deref()
        .map(|d| Path::new(d).is_dir())
        .unwrap_or(false);

    info!(
        "Features: stickers={} playlists={} tags={} advsearch={} fingerprint={} smartpls={} love={} library={}",
        features.stickers,
        features.playlists,
        features.tags,
        features.advanced_search,
        features.fingerprint,
        features.smartpls,
        features.love,
        features.library
    );
    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::memory::MemoryDaemon;
    use tempfile::TempDir;

    #[test]
    fn test_detect_full_featured_daemon() {
        let mut daemon = MemoryDaemon::with_library(1);
        let config = EngineConfig::default();
        let features = detect(&mut daemon, &config).unwrap();

        assert!(features.stickers);
        assert!(features.playlists);
        assert!(features.fingerprint);
        assert!(features.smartpls);
        assert!(features.advanced_search);
        assert!(features.tags);
        assert_eq!(features.tag_list, config.tag_list);
        assert!(!features.love);
        assert!(!features.library);
    }

    #[test]
    fn test_detect_without_sticker_command_disables_smartpls() {
        let mut daemon = MemoryDaemon::with_library(1);
        daemon.update(|s| s.commands.retain(|c| c != "sticker"));
        let features = detect(&mut daemon, &EngineConfig::default()).unwrap();
        assert!(!features.stickers);
        assert!(!features.smartpls);
        assert!(features.playlists);
    }

    #[test]
    fn test_user_toggle_overrides_daemon_support() {
        let mut daemon = MemoryDaemon::with_library(1);
        let config = EngineConfig {
            stickers: false,
            ..Default::default()
        };
        let features = detect(&mut daemon, &config).unwrap();
        assert!(!features.stickers);
        assert!(!features.smartpls);
    }

    #[test]
    fn test_old_daemon_has_no_advanced_search() {
        let mut daemon = MemoryDaemon::with_library(1);
        daemon.update(|s| s.version = (0, 20, 23));
        let features = detect(&mut daemon, &EngineConfig::default()).unwrap();
        assert!(!features.advanced_search);
    }

    #[test]
    fn test_tag_list_limited_to_supported_tags() {
        let mut daemon = MemoryDaemon::with_library(1);
        daemon.update(|s| s.tag_types = vec!["artist".to_string(), "Title".to_string()]);
        let config = EngineConfig {
            tag_list: vec!["Artist".into(), "Composer".into(), "Title".into()],
            ..Default::default()
        };
        let features = detect(&mut daemon, &config).unwrap();
        assert_eq!(features.tag_list, vec!["artist".to_string(), "Title".to_string()]);
    }

    #[test]
    fn test_love_channel_detection() {
        let mut daemon = MemoryDaemon::with_library(1);
        daemon.update(|s| s.channels = vec!["mpdas".to_string()]);
        let mut config = EngineConfig {
            love: true,
            love_channel: "mpdas".to_string(),
            ..Default::default()
        };
        assert!(check_love(&mut daemon, &config).unwrap());
        config.love_channel = "other".to_string();
        assert!(!check_love(&mut daemon, &config).unwrap());
    }

    #[test]
    fn test_music_directory_resolution() {
        let dir = TempDir::new().unwrap();
        let mut daemon = MemoryDaemon::with_library(1);
        daemon.update(|s| s.music_directory = Some("/srv/music/".to_string()));

        let mut config = EngineConfig::default();
        // auto over TCP can not ask the daemon
        assert_eq!(resolve_music_directory(&mut daemon, &config).unwrap(), None);

        config.connection.host = "/run/mpd/socket".to_string();
        assert_eq!(
            resolve_music_directory(&mut daemon, &config).unwrap(),
            Some("/srv/music".to_string())
        );

        config.music_directory = dir.path().to_string_lossy().into_owned();
        let features = detect(&mut daemon, &config).unwrap();
        assert!(features.library);

        daemon.update(|s| s.music_directory = Some("nfs://nas/music".to_string()));
        config.music_directory = "auto".to_string();
        assert_eq!(resolve_music_directory(&mut daemon, &config).unwrap(), None);
    }
}
