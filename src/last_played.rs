//! Last played list: a short in-memory head backed by an on-disk tail.
//!
//! New entries go to the front of the in-memory list. Before the list would grow
//! past the flush threshold (or the retention count, whichever is smaller), the
//! in-memory entries are written in front of the file contents and memory is
//! cleared. The file holds at most `retention` lines of `timestamp::uri`,
//! newest first.

use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::write_atomic;
use crate::error::{EngineError, Result};

/// In-memory entries kept before merging to disk
pub const FLUSH_THRESHOLD: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastPlayedEntry {
    pub timestamp: i64,
    pub uri: String,
}

impl LastPlayedEntry {
    fn to_line(&self) -> String {
        format!("{}::{}\n", self.timestamp, self.uri)
    }

    fn parse(line: &str) -> Option<Self> {
        let (timestamp, uri) = line.split_once("::")?;
        Some(Self {
            timestamp: timestamp.trim().parse().ok()?,
            uri: uri.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct LastPlayedList {
    path: PathBuf,
    retention: usize,
    /// Newest first
    entries: VecDeque<LastPlayedEntry>,
}

impl LastPlayedList {
    pub fn new(path: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            path: path.into(),
            retention,
            entries: VecDeque::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn set_retention(&mut self, retention: usize) {
        self.retention = retention;
    }

    /// Number of entries not yet on disk
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    fn flush_limit(&self) -> usize {
        FLUSH_THRESHOLD.min(self.retention)
    }

    /// Record a played song. A retention of zero disables the list.
    ///
    /// The entry is kept in memory even when the preceding flush fails; the
    /// error is returned so the caller can report it. Memory never holds more
    /// than `retention` entries, the oldest are dropped first.
    pub fn add(&mut self, uri: &str, timestamp: i64) -> Result<()> {
        if self.retention == 0 {
            return Ok(());
        }
        let flushed = if self.entries.len() >= self.flush_limit() {
            self.flush()
        } else {
            Ok(())
        };
        self.entries.push_front(LastPlayedEntry {
            timestamp,
            uri: uri.to_string(),
        });
        if self.entries.len() > self.retention {
            warn!("Last played list not flushed, dropping oldest unsaved entry");
            self.entries.truncate(self.retention);
        }
        debug!("Last played: {uri} ({} in memory)", self.entries.len());
        flushed
    }

    fn read_disk(&self) -> Result<Vec<LastPlayedEntry>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content
                .lines()
                .filter_map(|line| {
                    let entry = LastPlayedEntry::parse(line);
                    if entry.is_none() {
                        warn!("Skipping malformed last played line {line:?}");
                    }
                    entry
                })
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(EngineError::resource(&self.path, e)),
        }
    }

    /// Merge in-memory entries in front of the file, trimmed to the retention count
    pub fn flush(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let disk = self.read_disk()?;
        let content: String = self
            .entries
            .iter()
            .chain(disk.iter())
            .take(self.retention)
            .map(LastPlayedEntry::to_line)
            .collect();
        write_atomic(&self.path, content.as_bytes())?;
        info!(
            "Flushed {} last played entries to {}",
            self.entries.len(),
            self.path.display()
        );
        self.entries.clear();
        Ok(())
    }

    /// Page through memory then disk, newest first; also returns the total count.
    ///
    /// At most `retention` lines of the file count, so a file written under a
    /// larger retention is read as if already trimmed.
    pub fn read(&self, offset: usize, limit: usize) -> Result<(Vec<LastPlayedEntry>, usize)> {
        let mut disk = self.read_disk()?;
        disk.truncate(self.retention);
        let total = self.entries.len() + disk.len();
        let page = self
            .entries
            .iter()
            .chain(disk.iter())
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }
}
