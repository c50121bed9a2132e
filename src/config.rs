//! # Configuration Module
//!
//! Working directory layout, persisted engine settings and the atomic file writer
//! every persisted file goes through.
//!
//! ## Data Storage
//!
//! Tonearm keeps its state below one working directory, by default the
//! platform data directory:
//! - Linux: `~/.local/share/tonearm/`
//! - macOS: `~/Library/Application Support/tonearm/`
//!
//! ```text
//! <workdir>/state/<key>        one scalar setting per file, first line is the value
//! <workdir>/smartpls/<name>    one smart playlist definition per file (JSON)
//! <workdir>/state/last_played  last played log, "timestamp::uri" per line
//! ```
//!
//! A key that has no file yet is created with its default on first read, so the
//! state directory always documents the effective configuration.

use anyhow::Context;
use log::{debug, info};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::jukebox::{JukeboxConfig, JukeboxMode, JukeboxSource};

/// Longest accepted name for state keys, playlists and smart playlists
pub const MAX_NAME_LEN: usize = 200;

/// Returns the platform-appropriate working directory for Tonearm
///
/// # Errors
///
/// Fails if the system data directory can not be determined.
pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system data directory. Pass --workdir to choose one explicitly."
        )
    })?;
    Ok(data_dir.join("tonearm"))
}

/// Resolved working directory with its subdirectories created
#[derive(Debug, Clone)]
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    /// Absolutize `root` and create the `state` and `smartpls` subdirectories
    ///
    /// # Errors
    ///
    /// Fails if the path can not be made absolute or a directory can not be created.
    pub fn prepare(root: &Path) -> anyhow::Result<Self> {
        let root = root
            .absolutize()
            .with_context(|| format!("Invalid working directory {}", root.display()))?
            .into_owned();
        for dir in [root.join("state"), root.join("smartpls")] {
            fs::create_dir_all(&dir).with_context(|| {
                format!(
                    "Failed to create {}. Please check file permissions.",
                    dir.display()
                )
            })?;
        }
        debug!("Working directory ready at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn smartpls_dir(&self) -> PathBuf {
        self.root.join("smartpls")
    }

    pub fn last_played_file(&self) -> PathBuf {
        self.state_dir().join("last_played")
    }
}

/// Reject names that could escape their directory or break line-oriented files
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::Validation("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name.starts_with('.') {
        return Err(EngineError::Validation(format!("invalid name {name:?}")));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(EngineError::Validation(format!(
            "name {name:?} contains a path separator or control character"
        )));
    }
    Ok(())
}

/// Replace `path` with `contents` through a temp file in the same directory
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| EngineError::resource(dir, e))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| EngineError::resource(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| EngineError::resource(path, e.error))?;
    Ok(())
}

/// One file per scalar setting below `<workdir>/state`
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_name(key)?;
        Ok(self.dir.join(key))
    }

    /// Read a value, creating the file with `default` if it does not exist
    pub fn read_string(&self, key: &str, default: &str) -> Result<String> {
        let path = self.path(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content.lines().next().unwrap_or("").to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("State {key} not found, writing default");
                self.write(key, default)?;
                Ok(default.to_string())
            }
            Err(e) => Err(EngineError::resource(path, e)),
        }
    }

    pub fn read_bool(&self, key: &str, default: bool) -> Result<bool> {
        let value = self.read_string(key, if default { "true" } else { "false" })?;
        Ok(value == "true")
    }

    /// Numeric read; an unparsable file falls back to `default`
    pub fn read_number<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr + ToString + Copy,
    {
        let value = self.read_string(key, &default.to_string())?;
        Ok(value.trim().parse().unwrap_or(default))
    }

    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        if value.contains('\n') {
            return Err(EngineError::Validation(format!(
                "value for {key} must be a single line"
            )));
        }
        let path = self.path(key)?;
        write_atomic(&path, value.as_bytes())
    }
}

/// Where and how to reach the daemon
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Hostname, or an absolute path for a unix socket
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Per-command protocol timeout
    pub timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6600,
            password: None,
            timeout: Duration::from_millis(10_000),
        }
    }
}

impl ConnectionSettings {
    pub fn is_socket(&self) -> bool {
        self.host.starts_with('/')
    }
}

/// Split a comma separated tag list
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

const DEFAULT_TAGLIST: &str = "Artist,Album,AlbumArtist,Title,Track,Genre,Date";
const DEFAULT_BROWSETAGLIST: &str = "Artist,Album,AlbumArtist,Genre";

/// Effective engine settings, loaded from and saved to a [`StateStore`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub connection: ConnectionSettings,
    /// `auto`, an absolute path, or `none`
    pub music_directory: String,
    pub jukebox: JukeboxConfig,
    pub tag_list: Vec<String>,
    pub search_tag_list: Vec<String>,
    pub browse_tag_list: Vec<String>,
    pub generate_pls_tags: Vec<String>,
    pub stickers: bool,
    pub smartpls: bool,
    /// Seconds between periodic smart playlist refreshes, 0 disables
    pub smartpls_interval: i64,
    pub smartpls_prefix: String,
    pub love: bool,
    pub love_channel: String,
    pub auto_play: bool,
    pub last_played_count: usize,
    pub max_elements_per_page: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            music_directory: "auto".to_string(),
            jukebox: JukeboxConfig::default(),
            tag_list: split_list(DEFAULT_TAGLIST),
            search_tag_list: split_list(DEFAULT_TAGLIST),
            browse_tag_list: split_list(DEFAULT_BROWSETAGLIST),
            generate_pls_tags: Vec::new(),
            stickers: true,
            smartpls: true,
            smartpls_interval: 14_400,
            smartpls_prefix: "myMPDsmart".to_string(),
            love: false,
            love_channel: String::new(),
            auto_play: false,
            last_played_count: 200,
            max_elements_per_page: 100,
        }
    }
}

/// Partial settings update as sent with `settings_set`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    pub mpd_host: Option<String>,
    pub mpd_port: Option<u16>,
    pub mpd_pass: Option<String>,
    pub mpd_timeout: Option<u64>,
    pub music_directory: Option<String>,
    pub jukebox_mode: Option<u8>,
    pub jukebox_playlist: Option<String>,
    pub jukebox_queue_length: Option<u32>,
    pub jukebox_unique_tag: Option<String>,
    pub jukebox_last_played: Option<u32>,
    pub taglist: Option<String>,
    pub searchtaglist: Option<String>,
    pub browsetaglist: Option<String>,
    pub generate_pls_tags: Option<String>,
    pub stickers: Option<bool>,
    pub smartpls: Option<bool>,
    pub smartpls_interval: Option<i64>,
    pub smartpls_prefix: Option<String>,
    pub love: Option<bool>,
    pub love_channel: Option<String>,
    pub auto_play: Option<bool>,
    pub last_played_count: Option<usize>,
    pub max_elements_per_page: Option<usize>,
}

/// Which parts of the session a settings update invalidated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsChange {
    pub connection: bool,
    pub features: bool,
    pub jukebox: bool,
}

fn validate_tag_list(key: &str, value: &str) -> Result<()> {
    for tag in split_list(value) {
        if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EngineError::Validation(format!(
                "{key}: invalid tag name {tag:?}"
            )));
        }
    }
    Ok(())
}

impl SettingsPatch {
    /// Check every field before anything is written
    pub fn validate(&self) -> Result<()> {
        if let Some(host) = &self.mpd_host {
            if host.is_empty() || host.contains(char::is_whitespace) {
                return Err(EngineError::Validation(format!("invalid mpd_host {host:?}")));
            }
        }
        if self.mpd_port == Some(0) {
            return Err(EngineError::Validation("mpd_port must not be 0".to_string()));
        }
        if let Some(timeout) = self.mpd_timeout {
            if !(100..=1_000_000).contains(&timeout) {
                return Err(EngineError::Validation(format!(
                    "mpd_timeout {timeout} out of range"
                )));
            }
        }
        if let Some(mode) = self.jukebox_mode {
            JukeboxMode::try_from(mode)?;
        }
        if let Some(playlist) = &self.jukebox_playlist {
            validate_name(playlist)?;
        }
        if let Some(length) = self.jukebox_queue_length {
            if !(1..=999).contains(&length) {
                return Err(EngineError::Validation(format!(
                    "jukebox_queue_length {length} out of range"
                )));
            }
        }
        if let Some(tag) = &self.jukebox_unique_tag {
            validate_tag_list("jukebox_unique_tag", tag)?;
        }
        for (key, value) in [
            ("taglist", &self.taglist),
            ("searchtaglist", &self.searchtaglist),
            ("browsetaglist", &self.browsetaglist),
            ("generate_pls_tags", &self.generate_pls_tags),
        ] {
            if let Some(value) = value {
                validate_tag_list(key, value)?;
            }
        }
        if let Some(prefix) = &self.smartpls_prefix {
            validate_name(prefix)?;
        }
        if matches!(self.smartpls_interval, Some(i) if i < 0) {
            return Err(EngineError::Validation(
                "smartpls_interval must not be negative".to_string(),
            ));
        }
        if matches!(self.max_elements_per_page, Some(0)) {
            return Err(EngineError::Validation(
                "max_elements_per_page must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Load every key, creating missing ones with their defaults
    pub fn load(store: &StateStore) -> Result<Self> {
        let defaults = Self::default();
        let password = store.read_string("mpd_pass", "")?;
        let jukebox_mode = JukeboxMode::try_from(store.read_number("jukebox_mode", 0u8)?)
            .unwrap_or(JukeboxMode::Off);
        let unique_tag = store.read_string("jukebox_unique_tag", "")?;

        let config = Self {
            connection: ConnectionSettings {
                host: store.read_string("mpd_host", &defaults.connection.host)?,
                port: store.read_number("mpd_port", defaults.connection.port)?,
                password: (!password.is_empty()).then_some(password),
                timeout: Duration::from_millis(store.read_number("mpd_timeout", 10_000u64)?),
            },
            music_directory: store.read_string("music_directory", &defaults.music_directory)?,
            jukebox: JukeboxConfig {
                mode: jukebox_mode,
                source: JukeboxSource::from_setting(
                    &store.read_string("jukebox_playlist", JukeboxSource::LIBRARY)?,
                ),
                queue_length: store.read_number("jukebox_queue_length", 1u32)?,
                unique_tag: (!unique_tag.is_empty()).then_some(unique_tag),
                last_played_hours: store.read_number("jukebox_last_played", 0u32)?,
            },
            tag_list: split_list(&store.read_string("taglist", DEFAULT_TAGLIST)?),
            search_tag_list: split_list(&store.read_string("searchtaglist", DEFAULT_TAGLIST)?),
            browse_tag_list: split_list(
                &store.read_string("browsetaglist", DEFAULT_BROWSETAGLIST)?,
            ),
            generate_pls_tags: split_list(&store.read_string("generate_pls_tags", "")?),
            stickers: store.read_bool("stickers", defaults.stickers)?,
            smartpls: store.read_bool("smartpls", defaults.smartpls)?,
            smartpls_interval: store.read_number("smartpls_interval", defaults.smartpls_interval)?,
            smartpls_prefix: store.read_string("smartpls_prefix", &defaults.smartpls_prefix)?,
            love: store.read_bool("love", defaults.love)?,
            love_channel: store.read_string("love_channel", "")?,
            auto_play: store.read_bool("auto_play", defaults.auto_play)?,
            last_played_count: store
                .read_number("last_played_count", defaults.last_played_count)?,
            max_elements_per_page: store
                .read_number("max_elements_per_page", defaults.max_elements_per_page)?,
        };
        info!(
            "Loaded settings: mpd at {}:{}, jukebox {:?}",
            config.connection.host, config.connection.port, config.jukebox.mode
        );
        Ok(config)
    }

    /// Validate, persist and apply a partial update.
    ///
    /// Each key is written to disk before it is applied in memory, so a failed
    /// write leaves memory and disk agreeing on every key handled so far.
    pub fn apply(&mut self, store: &StateStore, patch: &SettingsPatch) -> Result<SettingsChange> {
        patch.validate()?;
        let mut change = SettingsChange::default();

        if let Some(host) = &patch.mpd_host {
            store.write("mpd_host", host)?;
            change.connection |= *host != self.connection.host;
            self.connection.host = host.clone();
        }
        if let Some(port) = patch.mpd_port {
            store.write("mpd_port", &port.to_string())?;
            change.connection |= port != self.connection.port;
            self.connection.port = port;
        }
        if let Some(pass) = &patch.mpd_pass {
            store.write("mpd_pass", pass)?;
            let pass = (!pass.is_empty()).then(|| pass.clone());
            change.connection |= pass != self.connection.password;
            self.connection.password = pass;
        }
        if let Some(timeout) = patch.mpd_timeout {
            store.write("mpd_timeout", &timeout.to_string())?;
            self.connection.timeout = Duration::from_millis(timeout);
        }
        if let Some(dir) = &patch.music_directory {
            store.write("music_directory", dir)?;
            change.features |= *dir != self.music_directory;
            self.music_directory = dir.clone();
        }
        if let Some(mode) = patch.jukebox_mode {
            store.write("jukebox_mode", &mode.to_string())?;
            self.jukebox.mode = JukeboxMode::try_from(mode)?;
            change.jukebox = true;
        }
        if let Some(playlist) = &patch.jukebox_playlist {
            store.write("jukebox_playlist", playlist)?;
            self.jukebox.source = JukeboxSource::from_setting(playlist);
            change.jukebox = true;
        }
        if let Some(length) = patch.jukebox_queue_length {
            store.write("jukebox_queue_length", &length.to_string())?;
            self.jukebox.queue_length = length;
            change.jukebox = true;
        }
        if let Some(tag) = &patch.jukebox_unique_tag {
            store.write("jukebox_unique_tag", tag)?;
            self.jukebox.unique_tag = (!tag.is_empty()).then(|| tag.clone());
            change.jukebox = true;
        }
        if let Some(hours) = patch.jukebox_last_played {
            store.write("jukebox_last_played", &hours.to_string())?;
            self.jukebox.last_played_hours = hours;
            change.jukebox = true;
        }
        if let Some(list) = &patch.taglist {
            store.write("taglist", list)?;
            self.tag_list = split_list(list);
            change.features = true;
        }
        if let Some(list) = &patch.searchtaglist {
            store.write("searchtaglist", list)?;
            self.search_tag_list = split_list(list);
            change.features = true;
        }
        if let Some(list) = &patch.browsetaglist {
            store.write("browsetaglist", list)?;
            self.browse_tag_list = split_list(list);
            change.features = true;
        }
        if let Some(list) = &patch.generate_pls_tags {
            store.write("generate_pls_tags", list)?;
            self.generate_pls_tags = split_list(list);
            change.features = true;
        }
        if let Some(stickers) = patch.stickers {
            store.write("stickers", &stickers.to_string())?;
            change.features |= stickers != self.stickers;
            self.stickers = stickers;
        }
        if let Some(smartpls) = patch.smartpls {
            store.write("smartpls", &smartpls.to_string())?;
            change.features |= smartpls != self.smartpls;
            self.smartpls = smartpls;
        }
        if let Some(interval) = patch.smartpls_interval {
            store.write("smartpls_interval", &interval.to_string())?;
            self.smartpls_interval = interval;
        }
        if let Some(prefix) = &patch.smartpls_prefix {
            store.write("smartpls_prefix", prefix)?;
            self.smartpls_prefix = prefix.clone();
        }
        if let Some(love) = patch.love {
            store.write("love", &love.to_string())?;
            change.features |= love != self.love;
            self.love = love;
        }
        if let Some(channel) = &patch.love_channel {
            store.write("love_channel", channel)?;
            change.features |= *channel != self.love_channel;
            self.love_channel = channel.clone();
        }
        if let Some(auto_play) = patch.auto_play {
            store.write("auto_play", &auto_play.to_string())?;
            self.auto_play = auto_play;
        }
        if let Some(count) = patch.last_played_count {
            store.write("last_played_count", &count.to_string())?;
            self.last_played_count = count;
        }
        if let Some(page) = patch.max_elements_per_page {
            store.write("max_elements_per_page", &page.to_string())?;
            self.max_elements_per_page = page;
        }
        Ok(change)
    }

    /// Settings as reported to callers; the password is never echoed back
    pub fn to_json(&self) -> Value {
        json!({
            "mpdHost": self.connection.host,
            "mpdPort": self.connection.port,
            "mpdPassSet": self.connection.password.is_some(),
            "mpdTimeout": self.connection.timeout.as_millis() as u64,
            "musicDirectory": self.music_directory,
            "jukeboxMode": self.jukebox.mode as u8,
            "jukeboxPlaylist": self.jukebox.source.to_string(),
            "jukeboxQueueLength": self.jukebox.queue_length,
            "jukeboxUniqueTag": self.jukebox.unique_tag.as_deref().unwrap_or(""),
            "jukeboxLastPlayed": self.jukebox.last_played_hours,
            "taglist": self.tag_list.join(","),
            "searchtaglist": self.search_tag_list.join(","),
            "browsetaglist": self.browse_tag_list.join(","),
            "generatePlsTags": self.generate_pls_tags.join(","),
            "stickers": self.stickers,
            "smartpls": self.smartpls,
            "smartplsInterval": self.smartpls_interval,
            "smartplsPrefix": self.smartpls_prefix,
            "love": self.love,
            "loveChannel": self.love_channel,
            "autoPlay": self.auto_play,
            "lastPlayedCount": self.last_played_count,
            "maxElementsPerPage": self.max_elements_per_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_validate_name_rejects_separators() {
        assert!(validate_name("Favourites").is_ok());
        assert!(validate_name("Best of 2024 (live)").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("line\nbreak").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_missing_key_writes_default() {
        let (dir, store) = create_test_store();
        assert_eq!(store.read_string("mpd_host", "localhost").unwrap(), "localhost");
        let on_disk = fs::read_to_string(dir.path().join("mpd_host")).unwrap();
        assert_eq!(on_disk, "localhost");
    }

    #[test]
    fn test_write_then_read_number_and_bool() {
        let (_dir, store) = create_test_store();
        store.write("mpd_port", "6601").unwrap();
        store.write("stickers", "false").unwrap();
        assert_eq!(store.read_number("mpd_port", 6600u16).unwrap(), 6601);
        assert!(!store.read_bool("stickers", true).unwrap());
    }

    #[test]
    fn test_unparsable_number_falls_back() {
        let (_dir, store) = create_test_store();
        store.write("mpd_port", "not-a-port").unwrap();
        assert_eq!(store.read_number("mpd_port", 6600u16).unwrap(), 6600);
    }

    #[test]
    fn test_write_rejects_bad_key_and_multiline_value() {
        let (_dir, store) = create_test_store();
        assert!(matches!(
            store.write("../evil", "x"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            store.write("mpd_host", "a\nb"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        // No temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_missing_directory_is_resource_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("file");
        assert!(matches!(
            write_atomic(&path, b"x"),
            Err(EngineError::Resource { .. })
        ));
    }

    #[test]
    fn test_load_defaults_into_empty_store() {
        let (dir, store) = create_test_store();
        let config = EngineConfig::load(&store).unwrap();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 6600);
        assert_eq!(config.connection.password, None);
        assert_eq!(config.jukebox.mode, JukeboxMode::Off);
        assert_eq!(config.jukebox.source, JukeboxSource::Library);
        assert_eq!(config.last_played_count, 200);
        assert!(dir.path().join("jukebox_mode").exists());
    }

    #[test]
    fn test_apply_persists_and_reports_changes() {
        let (_dir, store) = create_test_store();
        let mut config = EngineConfig::load(&store).unwrap();
        let patch = SettingsPatch {
            mpd_host: Some("music.local".to_string()),
            jukebox_mode: Some(1),
            jukebox_queue_length: Some(5),
            jukebox_last_played: Some(24),
            ..Default::default()
        };

        let change = config.apply(&store, &patch).unwrap();
        assert!(change.connection);
        assert!(change.jukebox);
        assert!(!change.features);

        let reloaded = EngineConfig::load(&store).unwrap();
        assert_eq!(reloaded.connection.host, "music.local");
        assert_eq!(reloaded.jukebox.mode, JukeboxMode::AddSong);
        assert_eq!(reloaded.jukebox.queue_length, 5);
        assert_eq!(reloaded.jukebox.last_played_hours, 24);
    }

    #[test]
    fn test_apply_rejects_invalid_patch_without_writing() {
        let (_dir, store) = create_test_store();
        let mut config = EngineConfig::load(&store).unwrap();
        let patch = SettingsPatch {
            mpd_host: Some("other".to_string()),
            jukebox_mode: Some(7),
            ..Default::default()
        };
        assert!(matches!(
            config.apply(&store, &patch),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(store.read_string("mpd_host", "x").unwrap(), "localhost");
    }

    #[test]
    fn test_settings_json_hides_password() {
        let mut config = EngineConfig::default();
        config.connection.password = Some("secret".to_string());
        let json = config.to_json();
        assert_eq!(json["mpdPassSet"], true);
        assert!(!json.to_string().contains("secret"));
    }

    #[test]
    fn test_workdir_prepare_creates_layout() {
        let dir = TempDir::new().unwrap();
        let workdir = Workdir::prepare(&dir.path().join("tonearm")).unwrap();
        assert!(workdir.root().is_absolute());
        assert!(workdir.state_dir().is_dir());
        assert!(workdir.smartpls_dir().is_dir());
        assert_eq!(
            workdir.last_played_file(),
            workdir.state_dir().join("last_played")
        );
    }
}
