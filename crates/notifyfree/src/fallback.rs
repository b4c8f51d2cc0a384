// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local fallback store for entries that could not be delivered.
//!
//! The store is a JSON-lines file, one [`FallbackRecord`] per line. Several
//! processes may share it, so every change to the file (append, rotation,
//! rewrite, removal) happens while holding an exclusive lock on the sibling
//! `<path>.lock` file. The lock is never held while entries are on the wire:
//! [`FallbackStore::retry`] sends from a snapshot and reconciles afterwards,
//! keeping anything appended in between.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::client::LogSender;
use crate::config::FallbackConfig;
use crate::error::{DeliveryError, FallbackError};
use crate::formatter::FormattedEntry;

const ROTATION_SUFFIX_FORMAT: &str = "%Y%m%d%H%M%S";
const LOCK_SUFFIX: &str = ".lock";

/// One persisted line of the fallback file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    /// RFC 3339 time the entry was persisted.
    pub cached_at: String,
    pub original_record: FormattedEntry,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    pub exists: bool,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Number of non-empty lines.
    pub count: usize,
    pub max_size: u64,
}

#[derive(Debug, Clone)]
pub struct FallbackStore {
    path: PathBuf,
    lock_path: PathBuf,
    max_size: u64,
}

impl FallbackStore {
    pub fn new(path: impl Into<PathBuf>, max_size: u64) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(LOCK_SUFFIX);
        FallbackStore {
            path,
            lock_path: PathBuf::from(lock_path),
            max_size,
        }
    }

    pub fn from_config(config: &FallbackConfig) -> Self {
        Self::new(config.path.clone(), config.max_file_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `entry` with the failure `reason`.
    ///
    /// The current file is rotated first when it is larger than the
    /// configured maximum. Blocks while another writer holds the lock; call
    /// it from a blocking context when running on an async runtime.
    ///
    /// # Errors
    /// I/O failures creating, rotating or writing the file.
    pub fn cache(&self, entry: &FormattedEntry, reason: &str) -> Result<(), FallbackError> {
        let record = FallbackRecord {
            cached_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            original_record: entry.clone(),
            reason: reason.to_string(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _lock = self.lock()?;
        self.rotate_if_needed()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    /// Re-deliver every stored entry through `sender`.
    ///
    /// Delivered lines are removed; lines that still fail stay in the file.
    /// Lines that cannot be parsed are dropped. An authentication failure
    /// stops the replay and keeps every line not yet delivered. Entries
    /// appended while the replay runs are kept. The file is removed when
    /// nothing remains.
    ///
    /// Returns the number of delivered entries.
    ///
    /// # Errors
    /// I/O failures reading or rewriting the file.
    pub async fn retry(&self, sender: &dyn LogSender) -> Result<usize, FallbackError> {
        let store = self.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.snapshot()).await??;

        let mut settled = Vec::new();
        let mut delivered = 0;
        let mut dropped = 0;

        for line in snapshot {
            let record: FallbackRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    debug!("NOTIFYFREE | Dropping malformed fallback line: {e}");
                    dropped += 1;
                    settled.push(line);
                    continue;
                }
            };
            match sender.send(&record.original_record).await {
                Ok(()) => {
                    delivered += 1;
                    settled.push(line);
                }
                Err(DeliveryError::Auth) => {
                    warn!("NOTIFYFREE | Fallback retry stopped: authentication failed");
                    break;
                }
                Err(e) => debug!("NOTIFYFREE | Fallback entry still failing: {e}"),
            }
        }

        if dropped > 0 {
            warn!("NOTIFYFREE | Dropped {dropped} malformed fallback entries");
        }
        if !settled.is_empty() {
            let store = self.clone();
            tokio::task::spawn_blocking(move || store.remove_lines(&settled)).await??;
        }

        Ok(delivered)
    }

    /// Read-only summary of the fallback file.
    ///
    /// # Errors
    /// I/O failures other than the file being absent.
    pub fn stats(&self) -> Result<FallbackStats, FallbackError> {
        let mut stats = FallbackStats {
            exists: false,
            path: self.path.clone(),
            size_bytes: 0,
            count: 0,
            max_size: self.max_size,
        };

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };
        stats.exists = true;
        stats.size_bytes = file.metadata()?.len();
        stats.count = read_lines(&file)?.len();
        Ok(stats)
    }

    /// Delete the fallback file. Returns whether a file was removed.
    ///
    /// # Errors
    /// I/O failures other than the file being absent.
    pub fn clear(&self) -> Result<bool, FallbackError> {
        if !self.path.exists() {
            return Ok(false);
        }
        let _lock = self.lock()?;
        remove_if_exists(&self.path)
    }

    /// Exclusive lock over the fallback file, released when the handle drops.
    fn lock(&self) -> Result<File, FallbackError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        file.lock()?;
        Ok(file)
    }

    fn snapshot(&self) -> Result<Vec<String>, FallbackError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _lock = self.lock()?;
        match File::open(&self.path) {
            Ok(file) => Ok(read_lines(&file)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes one occurrence of each settled line from the current file.
    fn remove_lines(&self, settled: &[String]) -> Result<(), FallbackError> {
        let _lock = self.lock()?;
        let current = match File::open(&self.path) {
            Ok(file) => read_lines(&file)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut pending: HashMap<&str, usize> = HashMap::new();
        for line in settled {
            *pending.entry(line.as_str()).or_default() += 1;
        }
        let remaining: Vec<&String> = current
            .iter()
            .filter(|line| match pending.get_mut(line.as_str()) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    false
                }
                _ => true,
            })
            .collect();

        if remaining.is_empty() {
            remove_if_exists(&self.path)?;
            return Ok(());
        }
        let mut file = File::create(&self.path)?;
        for line in remaining {
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        Ok(())
    }

    /// Must be called with the lock held.
    fn rotate_if_needed(&self) -> Result<(), FallbackError> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if size <= self.max_size {
            return Ok(());
        }

        let rotated = self.rotated_path();
        fs::rename(&self.path, &rotated)?;
        debug!(
            "NOTIFYFREE | Rotated fallback file ({} bytes) to {}",
            size,
            rotated.display()
        );
        Ok(())
    }

    fn rotated_path(&self) -> PathBuf {
        let stamp = Utc::now().format(ROTATION_SUFFIX_FORMAT);
        let base = format!("{}.{stamp}", self.path.display());
        let mut candidate = PathBuf::from(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = PathBuf::from(format!("{base}-{n}"));
            n += 1;
        }
        candidate
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, FallbackError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_lines(file: &File) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}
