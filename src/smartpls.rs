//! # Smart playlists
//!
//! A smart playlist is a stored playlist on the daemon whose contents are
//! recomputed from a rule kept in `<workdir>/smartpls/<name>` as JSON:
//!
//! ```json
//! {"type":"sticker","sticker":"playCount","maxentries":200,"minvalue":0}
//! {"type":"newest","timerange":604800}
//! {"type":"search","tag":"Genre","searchstr":"Jazz"}
//! ```
//!
//! A refresh removes the daemon playlist if it exists and fills it anew, so
//! running it twice over unchanged data yields the same playlist.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{validate_name, write_atomic};
use crate::daemon::{Daemon, SearchQuery};
use crate::error::{EngineError, Result};
use crate::features::Features;

/// Tag name that marks a search definition as a raw filter expression
pub const EXPRESSION_TAG: &str = "expression";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SmartPlaylistDefinition {
    /// Songs ranked by a numeric sticker
    Sticker {
        sticker: String,
        maxentries: usize,
        #[serde(default)]
        minvalue: i64,
    },
    /// Songs modified within `timerange` seconds of the last database update
    Newest { timerange: i64 },
    /// Result of a stored search
    Search { tag: String, searchstr: String },
}

impl SmartPlaylistDefinition {
    pub fn validate(&self) -> Result<()> {
        match self {
            SmartPlaylistDefinition::Sticker {
                sticker,
                maxentries,
                minvalue,
            } => {
                if sticker.is_empty() {
                    return Err(EngineError::Validation("sticker name is empty".into()));
                }
                if *maxentries == 0 {
                    return Err(EngineError::Validation("maxentries must be positive".into()));
                }
                if *minvalue < 0 {
                    return Err(EngineError::Validation("minvalue must not be negative".into()));
                }
            }
            SmartPlaylistDefinition::Newest { timerange } if *timerange <= 0 => {
                return Err(EngineError::Validation("timerange must be positive".into()));
            }
            SmartPlaylistDefinition::Newest { .. } => {}
            SmartPlaylistDefinition::Search { tag, searchstr } => {
                if tag.is_empty() || searchstr.is_empty() {
                    return Err(EngineError::Validation(
                        "search needs a tag and a search string".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Quote a value for use inside a filter expression
pub fn escape_expression_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\'' | '"' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Songs carrying `sticker` with a value at or above the threshold, highest first.
///
/// Without `minvalue` the threshold is the highest observed value, halved when
/// it exceeds 2. Ties are ordered by URI.
pub fn rank_by_sticker(
    values: Vec<(String, String)>,
    maxentries: usize,
    minvalue: i64,
) -> (Vec<String>, i64) {
    let mut ranked: Vec<(String, i64)> = values
        .into_iter()
        .filter_map(|(uri, value)| value.parse::<i64>().ok().map(|v| (uri, v)))
        .filter(|(_, value)| *value >= 1)
        .collect();

    let observed_max = ranked.iter().map(|(_, v)| *v).max().unwrap_or(0);
    let threshold = if minvalue > 0 {
        minvalue
    } else if observed_max > 2 {
        observed_max / 2
    } else {
        observed_max
    };

    ranked.retain(|(_, value)| *value >= threshold);
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let uris = ranked
        .into_iter()
        .take(maxentries)
        .map(|(uri, _)| uri)
        .collect();
    (uris, threshold)
}

pub struct SmartPlaylistEngine {
    dir: PathBuf,
    prefix: String,
    generate_tags: Vec<String>,
}

impl SmartPlaylistEngine {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
            generate_tags: Vec::new(),
        }
    }

    pub fn set_prefix(&mut self, prefix: &str) {
        self.prefix = prefix.to_string();
    }

    /// Tags for which per-value playlists are generated on a full refresh
    pub fn set_generate_tags(&mut self, tags: Vec<String>) {
        self.generate_tags = tags;
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name)?.is_file())
    }

    /// Persist a definition, replacing any previous one
    pub fn save(&self, name: &str, definition: &SmartPlaylistDefinition) -> Result<()> {
        definition.validate()?;
        let path = self.path(name)?;
        let json = serde_json::to_string(definition)?;
        write_atomic(&path, json.as_bytes())?;
        info!("Saved smart playlist {name}");
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<SmartPlaylistDefinition> {
        let path = self.path(name)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                EngineError::Validation(format!("no smart playlist named {name}"))
            } else {
                EngineError::resource(&path, e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Remove the definition; the daemon playlist is removed too when a session is given
    pub fn delete(&self, name: &str, daemon: Option<&mut dyn Daemon>) -> Result<()> {
        let path = self.path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EngineError::Validation(format!(
                    "no smart playlist named {name}"
                )));
            }
            Err(e) => return Err(EngineError::resource(&path, e)),
        }
        if let Some(daemon) = daemon {
            remove_if_exists(daemon, name)?;
        }
        info!("Deleted smart playlist {name}");
        Ok(())
    }

    /// Names of all stored definitions, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::resource(&self.dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::resource(&self.dir, e))?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Recompute one playlist from its definition
    pub fn update(&self, daemon: &mut dyn Daemon, features: &Features, name: &str) -> Result<()> {
        if !features.smartpls {
            debug!("Smart playlists disabled, not updating {name}");
            return Ok(());
        }
        let definition = self.load(name)?;
        remove_if_exists(daemon, name)?;
        match definition {
            SmartPlaylistDefinition::Sticker {
                sticker,
                maxentries,
                minvalue,
            } => {
                let values = daemon.sticker_find(&sticker)?;
                let (uris, threshold) = rank_by_sticker(values, maxentries, minvalue);
                for uri in &uris {
                    daemon.playlist_add(name, uri)?;
                }
                info!(
                    "Updated smart playlist {name} with {} songs, minimum value {threshold}",
                    uris.len()
                );
            }
            SmartPlaylistDefinition::Newest { timerange } => {
                let cutoff = daemon.stats()?.db_update - timerange;
                if cutoff <= 0 {
                    warn!("Smart playlist {name}: time range reaches before the epoch, skipping");
                    return Ok(());
                }
                let query = if features.advanced_search {
                    SearchQuery::Expression(format!("(modified-since '{cutoff}')"))
                } else {
                    SearchQuery::Tag {
                        tag: "modified-since".to_string(),
                        value: cutoff.to_string(),
                    }
                };
                daemon.search_to_playlist(&query, name)?;
                info!("Updated smart playlist {name} with songs modified since {cutoff}");
            }
            SmartPlaylistDefinition::Search { tag, searchstr } => {
                let query = if tag == EXPRESSION_TAG {
                    if !features.advanced_search {
                        return Err(EngineError::Validation(format!(
                            "smart playlist {name} needs filter expression support"
                        )));
                    }
                    SearchQuery::Expression(searchstr)
                } else {
                    SearchQuery::Tag {
                        tag,
                        value: searchstr,
                    }
                };
                daemon.search_to_playlist(&query, name)?;
                info!("Updated smart playlist {name}");
            }
        }
        Ok(())
    }

    /// Playlist name generated for one tag value
    pub fn generated_name(&self, tag: &str, value: &str) -> String {
        if self.prefix.is_empty() {
            format!("{tag}-{value}")
        } else {
            format!("{}-{tag}-{value}", self.prefix)
        }
    }

    /// Create search definitions for tag values that have none yet
    pub fn generate_per_tag(&self, daemon: &mut dyn Daemon, features: &Features) -> Result<usize> {
        let mut created = 0;
        for tag in &self.generate_tags {
            let mut values = Vec::new();
            daemon.for_each_tag_value(tag, &mut |value| {
                if !value.is_empty() {
                    values.push(value);
                }
            })?;
            for value in values {
                let name = self.generated_name(tag, &value);
                if validate_name(&name).is_err() {
                    warn!("Can not create smart playlist for {tag} {value:?}");
                    continue;
                }
                if self.exists(&name)? {
                    continue;
                }
                let definition = if features.advanced_search {
                    SmartPlaylistDefinition::Search {
                        tag: EXPRESSION_TAG.to_string(),
                        searchstr: format!("(({tag} == '{}'))", escape_expression_value(&value)),
                    }
                } else {
                    SmartPlaylistDefinition::Search {
                        tag: tag.clone(),
                        searchstr: value,
                    }
                };
                self.save(&name, &definition)?;
                created += 1;
            }
        }
        if created > 0 {
            info!("Created {created} per tag smart playlists");
        }
        Ok(created)
    }

    /// Generate per-tag definitions, then update every definition.
    ///
    /// A failing playlist is logged and skipped unless the connection is gone.
    pub fn update_all(&self, daemon: &mut dyn Daemon, features: &Features) -> Result<usize> {
        if !features.smartpls {
            debug!("Smart playlists disabled");
            return Ok(0);
        }
        self.generate_per_tag(daemon, features)?;
        let mut updated = 0;
        for name in self.list()? {
            match self.update(daemon, features, &name) {
                Ok(()) => updated += 1,
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => {
                    warn!("Update of smart playlist {name} failed: {e}");
                    if matches!(e, EngineError::Protocol { .. }) {
                        daemon.clear_error()?;
                    }
                }
            }
        }
        info!("Updated {updated} smart playlists");
        Ok(updated)
    }
}

fn remove_if_exists(daemon: &mut dyn Daemon, name: &str) -> Result<()> {
    if daemon.playlists()?.iter().any(|p| p == name) {
        daemon.playlist_remove(name)?;
    }
    Ok(())
}
