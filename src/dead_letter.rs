//! Dead-letter sink for batches that could not be delivered.
//!
//! Records are appended as JSON lines (`{ batch, reason, finalAttempt, timestamp }`)
//! and never rewritten. If the sink itself fails the record is logged in full,
//! so an undeliverable batch is never dropped without a trace.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::reading::Batch;

/// One permanently undeliverable batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub batch: Batch,
    pub reason: String,

    /// Number of delivery attempts made before giving up
    pub final_attempt: u32,

    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(batch: Batch, reason: impl Into<String>) -> Self {
        let final_attempt = batch.attempt;
        Self {
            batch,
            reason: reason.into(),
            final_attempt,
            timestamp: Utc::now(),
        }
    }
}

/// Errors that can occur while writing a dead letter.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize dead letter: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    fn append(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// Write a dead letter, falling back to an error log if the sink fails.
pub fn record(sink: &dyn DeadLetterSink, letter: &DeadLetter) {
    if let Err(e) = sink.append(letter) {
        let payload = serde_json::to_string(letter)
            .unwrap_or_else(|_| format!("{:?}", letter));
        error!(
            error = %e,
            batch_id = %letter.batch.batch_id,
            dead_letter = %payload,
            "Dead-letter sink failed, record logged instead"
        );
    }
}

/// Dead-letter sink backed by a JSON-lines file.
pub struct FileDeadLetterSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDeadLetterSink {
    /// Open (or create) the file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeadLetterSink for FileDeadLetterSink {
    fn append(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(letter)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// In-memory sink, useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn append(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        self.letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(letter.clone());
        Ok(())
    }
}
