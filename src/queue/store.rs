//! Queue-state and history file persistence.
//!
//! All writes are atomic whole-file rewrites: the JSON payload is written
//! to a temp file in the data directory and renamed over the target, so a
//! crash mid-write never leaves a half-written queue file behind.
//!
//! History is split per rule. Each rule gets its own file named from the
//! rule's source and target identifiers (illegal filename characters,
//! including the `<>` separator itself, sanitize to `_`), and a legacy
//! combined file is still written for backward-compatible aggregate views.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::models::rule::Rule;
use crate::models::task::Task;
use crate::{AppError, Result};

/// Queue state file name inside the data directory.
pub const QUEUE_FILE: &str = "courier_queue.json";

/// Legacy combined history file name inside the data directory.
pub const LEGACY_HISTORY_FILE: &str = "courier_history.json";

/// Version stamp written into the queue file.
const QUEUE_FILE_VERSION: &str = "1.0";

/// On-disk representation of the queue state.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueFile {
    /// Tasks waiting for delivery, in FIFO order.
    pub pending_messages: Vec<Task>,
    /// The single in-flight task, if a delivery was underway at save time.
    pub processing_message: Option<Task>,
    /// Whether a delivery was underway at save time.
    pub is_processing: bool,
    /// When this file was written.
    pub last_save_time: DateTime<Utc>,
    /// File format version.
    pub version: String,
}

/// State reconstructed from disk at startup.
#[derive(Debug, Default)]
pub struct LoadedState {
    /// Pending tasks in their persisted order.
    pub pending: Vec<Task>,
    /// Task that was in flight when the process last saved.
    pub in_flight: Option<Task>,
    /// Per-rule history, keyed by rule id, oldest first.
    pub history: HashMap<String, Vec<Task>>,
}

/// File-backed persistence for the durable queue.
pub struct QueueStore {
    data_dir: PathBuf,
    sanitizer: Regex,
}

impl QueueStore {
    /// Create a store rooted at `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] when the directory cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let sanitizer = Regex::new(r#"[<>:"/\\|?*]"#)
            .map_err(|err| AppError::Persistence(format!("filename sanitizer: {err}")))?;
        Ok(Self {
            data_dir,
            sanitizer,
        })
    }

    /// Path of the queue state file.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_FILE)
    }

    /// Path of the legacy combined history file.
    #[must_use]
    pub fn legacy_history_path(&self) -> PathBuf {
        self.data_dir.join(LEGACY_HISTORY_FILE)
    }

    /// Deterministic history file path for a rule, derived from its source
    /// and target identifiers with illegal characters sanitized.
    #[must_use]
    pub fn history_path_for(&self, rule: &Rule) -> PathBuf {
        let raw = format!(
            "courier_history({}{}<>{}{}).json",
            rule.source.kind.label(),
            rule.source.identifier,
            rule.target.kind.label(),
            rule.target.identifier,
        );
        let sanitized = self.sanitizer.replace_all(&raw, "_").into_owned();
        self.data_dir.join(sanitized)
    }

    /// Persist the queue state file.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] on serialization or I/O failure. Callers treat
    /// this as non-fatal: the in-memory queue stays authoritative and the
    /// next successful save reconciles the file.
    pub fn save_queue(
        &self,
        pending: &[Task],
        in_flight: Option<&Task>,
        is_processing: bool,
    ) -> Result<()> {
        let file = QueueFile {
            pending_messages: pending.to_vec(),
            processing_message: in_flight.cloned(),
            is_processing,
            last_save_time: Utc::now(),
            version: QUEUE_FILE_VERSION.to_owned(),
        };
        self.write_atomic(&self.queue_path(), &file)
    }

    /// Persist one rule's history file, keeping the newest `cap` entries.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] on serialization or I/O failure.
    pub fn save_rule_history(&self, rule: &Rule, entries: &[Task], cap: usize) -> Result<()> {
        let start = entries.len().saturating_sub(cap);
        self.write_atomic(&self.history_path_for(rule), &entries[start..])
    }

    /// Persist the legacy combined history file: all rules merged, ordered
    /// by completion time, newest `cap` entries kept.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] on serialization or I/O failure.
    pub fn save_legacy_history(
        &self,
        history: &HashMap<String, Vec<Task>>,
        cap: usize,
    ) -> Result<()> {
        let mut merged: Vec<&Task> = history.values().flatten().collect();
        merged.sort_by_key(|task| task.completed_at);
        let start = merged.len().saturating_sub(cap);
        self.write_atomic(&self.legacy_history_path(), &merged[start..])
    }

    /// Load persisted state from disk.
    ///
    /// A corrupt queue file is logged and treated as empty; corrupt or
    /// unreadable history files are skipped individually rather than
    /// aborting the load. Legacy combined entries are merged in by task id
    /// so older installations keep their aggregate history.
    #[must_use]
    pub fn load(&self) -> LoadedState {
        let mut state = LoadedState::default();

        let queue_path = self.queue_path();
        if queue_path.exists() {
            match fs::read_to_string(&queue_path)
                .map_err(AppError::from)
                .and_then(|raw| serde_json::from_str::<QueueFile>(&raw).map_err(AppError::from))
            {
                Ok(file) => {
                    state.pending = file.pending_messages;
                    state.in_flight = file.processing_message;
                }
                Err(err) => {
                    warn!(path = %queue_path.display(), %err, "queue file unreadable, starting empty");
                }
            }
        }

        self.load_history_files(&mut state.history);
        self.merge_legacy_history(&mut state.history);

        info!(
            pending = state.pending.len(),
            history = state.history.values().map(Vec::len).sum::<usize>(),
            "queue state loaded"
        );
        state
    }

    /// Scan the data directory for per-rule history files and load each.
    fn load_history_files(&self, history: &mut HashMap<String, Vec<Task>>) {
        let pattern = self.data_dir.join("courier_history*.json");
        let legacy = self.legacy_history_path();

        let paths = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(%err, "history file scan failed");
                return;
            }
        };

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!(%err, "unreadable history path skipped");
                    continue;
                }
            };
            if path == legacy {
                continue;
            }
            match Self::load_history_file(&path) {
                Ok(tasks) => {
                    // The rule id comes from the entries themselves; a file
                    // with no entries carries no usable key.
                    if let Some(rule_id) = tasks.first().map(|task| task.rule.id.clone()) {
                        debug!(path = %path.display(), entries = tasks.len(), "history file loaded");
                        history.insert(rule_id, tasks);
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "corrupt history file skipped");
                }
            }
        }
    }

    fn load_history_file(path: &Path) -> Result<Vec<Task>> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Fold legacy combined entries into the per-rule map, deduplicating by
    /// task id.
    fn merge_legacy_history(&self, history: &mut HashMap<String, Vec<Task>>) {
        let legacy = self.legacy_history_path();
        if !legacy.exists() {
            return;
        }
        let tasks = match Self::load_history_file(&legacy) {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(path = %legacy.display(), %err, "corrupt legacy history file skipped");
                return;
            }
        };
        for task in tasks {
            let entries = history.entry(task.rule.id.clone()).or_default();
            if entries.iter().all(|existing| existing.id != task.id) {
                entries.push(task);
            }
        }
    }

    /// Serialize `value` to a temp file and rename it over `path`.
    fn write_atomic(&self, path: &Path, value: &(impl Serialize + ?Sized)) -> Result<()> {
        let tmp = NamedTempFile::new_in(&self.data_dir)?;
        serde_json::to_writer_pretty(tmp.as_file(), value)?;
        tmp.persist(path)
            .map_err(|err| AppError::Persistence(format!("rename over {}: {err}", path.display())))?;
        Ok(())
    }
}
