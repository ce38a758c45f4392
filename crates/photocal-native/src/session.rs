//! Session persistence: trial log, metadata, staircase snapshot.
//!
//! Every artifact of a session shares one file-name prefix,
//! `{participant}_{session}_{timestamp}`:
//!
//! - `.csv` - one row per completed trial, appended and flushed to disk the
//!   moment the trial finalizes; never mutated afterwards
//! - `.meta` - `key=value` lines, maintained as an in-memory map and
//!   rewritten in full (atomically, temp file then rename) on every update,
//!   so a crash mid-write leaves the previous consistent file on disk
//! - `.staircase.json` - serialized final staircase state, written once at
//!   completion or abort
//!
//! A metadata write failure is logged and swallowed by the caller; it must
//! never keep the device shutdown path from running.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use photocal_core::{Staircase, StaircaseSummary, TrialRecord};

/// Header row of the trial log.
pub const TRIAL_LOG_HEADER: &str = "goggle_level,uncomfortable,trial_number,reversals_so_far,timestamp";

/// Timestamp format used in file names.
pub const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Timestamp format used inside records and metadata.
pub const RECORD_STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// ============================================================================
// Error Types
// ============================================================================

/// Errors from session persistence.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Data directory could not be created.
    #[error("failed to create data directory {}: {source}", path.display())]
    CreateDir {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Trial log could not be opened.
    #[error("failed to open trial log {}: {source}", path.display())]
    OpenTrialLog {
        /// File that was being created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A trial row could not be written or flushed. Fatal: a session whose
    /// outcomes cannot be persisted must not keep presenting stimuli.
    #[error("failed to append trial row: {source}")]
    TrialWrite {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Metadata rewrite failed.
    #[error("failed to write metadata {}: {source}", path.display())]
    Metadata {
        /// Metadata file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Metadata file could not be read back.
    #[error("failed to read metadata {}: {source}", path.display())]
    ReadMetadata {
        /// Metadata file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Staircase snapshot could not be serialized or written.
    #[error("failed to write staircase snapshot {}: {source}", path.display())]
    Snapshot {
        /// Snapshot file path.
        path: PathBuf,
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Identifiers and Stamps
// ============================================================================

/// Validate a participant or session identifier.
///
/// Identifiers become file-name components, so only alphanumerics,
/// underscore and hyphen are accepted.
#[must_use]
pub fn validate_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// File-name timestamp for the current local time.
#[must_use]
pub fn file_stamp() -> String {
    Local::now().format(FILE_STAMP_FORMAT).to_string()
}

/// Record timestamp for the current local time.
#[must_use]
pub fn record_stamp() -> String {
    Local::now().format(RECORD_STAMP_FORMAT).to_string()
}

/// Read a metadata file back into a map by splitting each line once on the
/// first `=`.
///
/// # Errors
///
/// [`PersistenceError::ReadMetadata`] when the file cannot be read.
pub fn read_metadata(path: &Path) -> Result<BTreeMap<String, String>, PersistenceError> {
    let file = File::open(path).map_err(|source| PersistenceError::ReadMetadata {
        path: path.to_path_buf(),
        source,
    })?;

    let mut metadata = BTreeMap::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| PersistenceError::ReadMetadata {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some((key, value)) = line.split_once('=') {
            metadata.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(metadata)
}

// ============================================================================
// Session Log
// ============================================================================

/// Paths of the three session artifacts.
#[derive(Clone, Debug)]
pub struct SessionPaths {
    /// Trial log (`.csv`).
    pub trials: PathBuf,
    /// Metadata (`.meta`).
    pub metadata: PathBuf,
    /// Staircase snapshot (`.staircase.json`).
    pub snapshot: PathBuf,
}

impl SessionPaths {
    /// Derive the artifact paths for one session.
    #[must_use]
    pub fn new(data_dir: &Path, participant_id: &str, session_id: &str, stamp: &str) -> Self {
        let prefix = format!("{participant_id}_{session_id}_{stamp}");
        Self {
            trials: data_dir.join(format!("{prefix}.csv")),
            metadata: data_dir.join(format!("{prefix}.meta")),
            snapshot: data_dir.join(format!("{prefix}.staircase.json")),
        }
    }
}

/// Owner of the session's output files.
pub struct SessionLog {
    paths: SessionPaths,
    trial_file: File,
    metadata: BTreeMap<String, String>,
}

impl SessionLog {
    /// Create the session artifacts and write the initial metadata.
    ///
    /// # Errors
    ///
    /// [`PersistenceError`] when the directory or files cannot be created.
    pub fn create(
        data_dir: &Path,
        participant_id: &str,
        session_id: &str,
        stamp: &str,
        starting_intensity: u8,
        config_file: &Path,
    ) -> Result<Self, PersistenceError> {
        fs::create_dir_all(data_dir).map_err(|source| PersistenceError::CreateDir {
            path: data_dir.to_path_buf(),
            source,
        })?;

        let paths = SessionPaths::new(data_dir, participant_id, session_id, stamp);

        let mut trial_file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&paths.trials)
            .map_err(|source| PersistenceError::OpenTrialLog {
                path: paths.trials.clone(),
                source,
            })?;
        writeln!(trial_file, "{TRIAL_LOG_HEADER}")
            .and_then(|()| trial_file.sync_data())
            .map_err(|source| PersistenceError::TrialWrite { source })?;

        let mut metadata = BTreeMap::new();
        metadata.insert("participant_id".into(), participant_id.to_string());
        metadata.insert("session_id".into(), session_id.to_string());
        metadata.insert("timestamp".into(), stamp.to_string());
        metadata.insert("experiment_start_time".into(), record_stamp());
        metadata.insert("starting_intensity".into(), starting_intensity.to_string());
        metadata.insert(
            "config_file".into(),
            config_file.display().to_string(),
        );
        metadata.insert("app_version".into(), env!("CARGO_PKG_VERSION").to_string());
        metadata.insert("os".into(), std::env::consts::OS.to_string());
        // Pessimistic until finalize runs: a crash mid-session must leave
        // these readable as "did not complete".
        metadata.insert("experiment_completed".into(), "false".into());
        metadata.insert("experiment_aborted".into(), "false".into());

        let log = Self {
            paths,
            trial_file,
            metadata,
        };
        log.rewrite_metadata()?;

        info!(
            trials = %log.paths.trials.display(),
            metadata = %log.paths.metadata.display(),
            "session log created"
        );
        Ok(log)
    }

    /// Paths of the session artifacts.
    #[must_use]
    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Current metadata map (already persisted).
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Append one trial row and flush it to disk before returning.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::TrialWrite`] when the row may not be durable.
    pub fn append_trial(&mut self, record: &TrialRecord) -> Result<(), PersistenceError> {
        writeln!(
            self.trial_file,
            "{},{},{},{},{}",
            record.intensity,
            u8::from(record.uncomfortable),
            record.trial_number,
            record.reversals_so_far,
            record.timestamp,
        )
        .and_then(|()| self.trial_file.sync_data())
        .map_err(|source| PersistenceError::TrialWrite { source })?;

        debug!(
            trial = record.trial_number,
            intensity = record.intensity,
            uncomfortable = record.uncomfortable,
            "trial row persisted"
        );
        Ok(())
    }

    /// Merge fields into the metadata and rewrite the file.
    ///
    /// Existing fields are never dropped; updates overwrite by key.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Metadata`] when the rewrite fails. The in-memory
    /// map keeps the merged values, so the next successful update persists
    /// them.
    pub fn update_metadata<I, K, V>(&mut self, fields: I) -> Result<(), PersistenceError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in fields {
            self.metadata.insert(key.into(), value.into());
        }
        self.rewrite_metadata()
    }

    /// Write the completion fields of a finished session.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Metadata`] when the rewrite fails.
    pub fn finalize_completed(&mut self, summary: &StaircaseSummary) -> Result<(), PersistenceError> {
        self.finalize(summary, true, false)
    }

    /// Write the completion fields of an aborted or crashed session with
    /// whatever totals exist.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Metadata`] when the rewrite fails.
    pub fn finalize_partial(
        &mut self,
        summary: &StaircaseSummary,
        aborted: bool,
    ) -> Result<(), PersistenceError> {
        self.finalize(summary, false, aborted)
    }

    fn finalize(
        &mut self,
        summary: &StaircaseSummary,
        completed: bool,
        aborted: bool,
    ) -> Result<(), PersistenceError> {
        let mut fields: Vec<(String, String)> = vec![
            ("experiment_end_time".into(), record_stamp()),
            ("total_trials".into(), summary.trial_count.to_string()),
            (
                "total_reversals".into(),
                summary.reversal_count.to_string(),
            ),
            ("experiment_completed".into(), completed.to_string()),
            ("experiment_aborted".into(), aborted.to_string()),
        ];
        if let Some(threshold) = summary.threshold {
            fields.push(("final_threshold".into(), format!("{threshold:.2}")));
        }
        self.update_metadata(fields)
    }

    /// Write the staircase snapshot. Intended to be called once, at session
    /// end or abort.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::Snapshot`] on serialization or I/O failure.
    pub fn write_snapshot(&self, staircase: &Staircase) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(staircase).map_err(|source| {
            PersistenceError::Snapshot {
                path: self.paths.snapshot.clone(),
                source,
            }
        })?;
        fs::write(&self.paths.snapshot, json + "\n").map_err(|source| {
            PersistenceError::Snapshot {
                path: self.paths.snapshot.clone(),
                source: serde_json::Error::io(source),
            }
        })?;

        info!(path = %self.paths.snapshot.display(), "staircase snapshot written");
        Ok(())
    }

    /// Rewrite the metadata file atomically: write a temp file in the same
    /// directory, then rename it over the target.
    fn rewrite_metadata(&self) -> Result<(), PersistenceError> {
        let metadata_err = |source| PersistenceError::Metadata {
            path: self.paths.metadata.clone(),
            source,
        };

        let dir = self
            .paths
            .metadata
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir).map_err(metadata_err)?;
        for (key, value) in &self.metadata {
            writeln!(temp, "{key}={value}").map_err(metadata_err)?;
        }
        temp.flush().map_err(metadata_err)?;
        temp.persist(&self.paths.metadata)
            .map_err(|err| metadata_err(err.error))?;

        debug!(fields = self.metadata.len(), "metadata rewritten");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
