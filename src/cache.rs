//! Durable per-friend fetch results, so interrupted runs can resume.
//!
//! Stored as an append-only JSON-lines file: each `put` appends one record and
//! syncs it to disk before returning, and the last record for a user id wins
//! on replay. A torn final line (crash mid-write) is skipped on open and the
//! file is rewritten without it, so later appends start on a fresh line. The
//! file is also compacted on open when superseded records dominate it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    NotFound,
    RateLimited,
    Error,
}

/// Result of one attempted fetch for one friend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutualResult {
    pub user_id: String,
    pub mutual_ids: Vec<String>,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchStatus,
    /// Names the service reported alongside the ids
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub display_names: BTreeMap<String, String>,
}

impl MutualResult {
    pub fn ok(user_id: impl Into<String>, mutual_ids: Vec<String>) -> Self {
        Self::with_status(user_id, mutual_ids, FetchStatus::Ok)
    }

    pub fn failed(user_id: impl Into<String>, status: FetchStatus) -> Self {
        Self::with_status(user_id, Vec::new(), status)
    }

    fn with_status(user_id: impl Into<String>, mutual_ids: Vec<String>, status: FetchStatus) -> Self {
        Self {
            user_id: user_id.into(),
            mutual_ids,
            fetched_at: Utc::now(),
            status,
            display_names: BTreeMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok
    }
}

/// Counts by status, for `cache status` and progress reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounts {
    pub ok: usize,
    pub not_found: usize,
    pub rate_limited: usize,
    pub error: usize,
}

impl CacheCounts {
    pub fn total(&self) -> usize {
        self.ok + self.not_found + self.rate_limited + self.error
    }
}

pub struct MutualCache {
    path: PathBuf,
    session_path: Option<PathBuf>,
    entries: RwLock<HashMap<String, MutualResult>>,
    writer: Mutex<Option<File>>,
}

impl MutualCache {
    /// Open (or lazily create) the cache at `path`, replaying earlier records.
    ///
    /// `session_path` is the saved session artifact that [`MutualCache::clear`]
    /// removes together with the cached data.
    pub fn open(path: impl Into<PathBuf>, session_path: Option<PathBuf>) -> Result<Self> {
        let path = path.into();
        let replayed = replay(&path)?;

        let cache = Self {
            path,
            session_path,
            entries: RwLock::new(replayed.entries),
            writer: Mutex::new(None),
        };

        let live = cache.len();
        // Appending after a torn tail would glue the next record onto it
        if replayed.damaged || (replayed.lines > live * 2 && replayed.lines > 64) {
            cache.compact()?;
        }
        info!(entries = live, path = %cache.path.display(), "Opened mutual cache");
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, user_id: &str) -> Option<MutualResult> {
        self.entries.read().get(user_id).cloned()
    }

    /// `Ok` result for `user_id`, if one was committed
    pub fn get_ok(&self, user_id: &str) -> Option<MutualResult> {
        self.entries
            .read()
            .get(user_id)
            .filter(|result| result.is_ok())
            .cloned()
    }

    /// Append and sync the record, then make it visible to readers
    pub fn put(&self, result: MutualResult) -> Result<()> {
        let mut line = serde_json::to_vec(&result)?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        if writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| storage_error(&self.path, e))?;
            *writer = Some(file);
        }
        if let Some(file) = writer.as_mut() {
            file.write_all(&line)
                .and_then(|_| file.sync_data())
                .map_err(|e| storage_error(&self.path, e))?;
        }

        self.entries.write().insert(result.user_id.clone(), result);
        Ok(())
    }

    /// Remove all cached results and the saved session. Absent files are fine.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        *writer = None;
        remove_if_exists(&self.path)?;
        if let Some(session_path) = &self.session_path {
            remove_if_exists(session_path)?;
        }
        self.entries.write().clear();
        info!(path = %self.path.display(), "Cleared mutual cache");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of every cached result, ordered by user id
    pub fn entries(&self) -> Vec<MutualResult> {
        let mut all: Vec<MutualResult> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        all
    }

    pub fn counts(&self) -> CacheCounts {
        let mut counts = CacheCounts::default();
        for result in self.entries.read().values() {
            match result.status {
                FetchStatus::Ok => counts.ok += 1,
                FetchStatus::NotFound => counts.not_found += 1,
                FetchStatus::RateLimited => counts.rate_limited += 1,
                FetchStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Rewrite the file with one line per user id
    fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        *writer = None;

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| storage_error(&tmp, e))?;
            for result in self.entries() {
                serde_json::to_writer(&mut file, &result)?;
                file.write_all(b"\n")?;
            }
            file.sync_all().map_err(|e| storage_error(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| storage_error(&self.path, e))?;
        debug!(path = %self.path.display(), "Compacted mutual cache");
        Ok(())
    }
}

struct Replay {
    entries: HashMap<String, MutualResult>,
    lines: usize,
    /// Unreadable records or a final line without its newline
    damaged: bool,
}

fn replay(path: &Path) -> Result<Replay> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Replay {
                entries: HashMap::new(),
                lines: 0,
                damaged: false,
            });
        }
        Err(e) => return Err(storage_error(path, e)),
    };

    let mut entries = HashMap::new();
    let mut lines = 0usize;
    let mut damaged = raw.last().is_some_and(|&last| last != b'\n');
    for (number, line) in raw.split(|&b| b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        lines += 1;
        match serde_json::from_slice::<MutualResult>(line) {
            Ok(result) => {
                entries.insert(result.user_id.clone(), result);
            }
            Err(e) => {
                damaged = true;
                warn!(line = number + 1, error = %e, "Skipping unreadable cache record");
            }
        }
    }
    Ok(Replay {
        entries,
        lines,
        damaged,
    })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(storage_error(path, e)),
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> NetworkError {
    NetworkError::Storage(format!("{}: {}", path.display(), e))
}
