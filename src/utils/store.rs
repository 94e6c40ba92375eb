use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::to_string_pretty;

use crate::models::{ChangeSet, Course, HistoryEntry};

// A missing or blank file reads as the empty value. A file that does not parse is
// reported and also read as empty, so a damaged state file never stops a cycle.
fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read \"{}\"", path.display()))
        }
    };

    if contents.trim().is_empty() {
        return Ok(T::default());
    }

    match serde_json::from_str(&contents) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("Ignoring malformed \"{}\": {}", path.display(), e);
            Ok(T::default())
        }
    }
}

// Writes the value as pretty JSON, replacing the file.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = to_string_pretty(value).context("Failed to serialize state")?;
    fs::write(path, json).with_context(|| format!("Failed to write \"{}\"", path.display()))
}

/// The last fetched snapshot of all courses with their grades.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Vec<Course>> {
        read_json_or_default(&self.path)
    }

    pub fn save(&self, courses: &[Course]) -> Result<()> {
        write_json(&self.path, courses)?;
        info!("Saved {} courses to \"{}\"", courses.len(), self.path.display());
        Ok(())
    }
}

/// Append-only log of change sets, stored newest first as one JSON array.
///
/// Every append rewrites the whole file, so only one process may own it.
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn entries(&self) -> Result<Vec<HistoryEntry>> {
        read_json_or_default(&self.path)
    }

    // Prepends the entry so the newest change stays on top.
    pub fn append(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries()?;

        if let Some(newest) = entries.first() {
            if entry.timestamp < newest.timestamp {
                warn!(
                    "History entry at {} is older than the newest one at {}",
                    entry.timestamp, newest.timestamp
                );
            }
        }

        let courses_changed = entry.updates.len();
        entries.insert(0, entry);
        write_json(&self.path, &entries)?;

        info!(
            "Updated \"{}\" with {} courses changed",
            self.path.display(),
            courses_changed
        );
        Ok(())
    }

    /// Changes recorded at or after `since`, oldest entry first.
    pub fn query_since(&self, since: DateTime<Utc>) -> Result<ChangeSet> {
        let entries = self.entries()?;

        Ok(entries
            .into_iter()
            .rev()
            .filter(|entry| entry.timestamp >= since)
            .flat_map(|entry| entry.updates)
            .collect())
    }

    /// Every recorded change, oldest entry first.
    pub fn query_all(&self) -> Result<ChangeSet> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .flat_map(|entry| entry.updates)
            .collect())
    }
}

/// Time of the last successful notification, kept as RFC 3339 text.
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    // Reads the last notified time, if any was saved.
    pub fn get(&self) -> Result<Option<DateTime<Utc>>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read last notified time from \"{}\"", self.path.display())
                })
            }
        };

        let contents = contents.trim();
        if contents.is_empty() {
            return Ok(None);
        }

        let time = DateTime::parse_from_rfc3339(contents).with_context(|| {
            format!("Malformed last notified time in \"{}\"", self.path.display())
        })?;
        Ok(Some(time.with_timezone(&Utc)))
    }

    pub fn set(&self, time: DateTime<Utc>) -> Result<()> {
        fs::write(&self.path, time.to_rfc3339()).with_context(|| {
            format!("Failed to save last notified time to \"{}\"", self.path.display())
        })
    }
}
