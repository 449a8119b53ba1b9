//! Append-only, signed security audit log.
//!
//! Stored at `<state_dir>/sentinel.audit.jsonl`. Every entry is signed with
//! the device key (see [`super::signing`]) before it is considered
//! committed.
//!
//! # Format
//!
//! One JSON object per line (JSONL):
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp, nanosecond precision |
//! | `actor` | Local user (or `system`) on whose behalf the decision was made |
//! | `subject` | Display identity, or `null` |
//! | `decision` | `display_added`, `invalid_serial`, `granted`, etc. |
//! | `context` | Sorted string map with supporting detail |
//! | `signature` | `{"hmac_sha256": "<hex>"}` or `"unsigned"` |
//!
//! # Write path
//!
//! [`AuditLog::append`] stamps, signs and pushes the entry to the in-memory
//! history under one short lock, then hands the encoded line to a dedicated
//! writer thread. The caller never waits for disk. Because the enqueue
//! happens under the same lock, history order and file order always match
//! the order in which `append` was called.
//!
//! Each line write takes an advisory `flock` on the log so a running
//! monitor and a one-shot CLI command never interleave partial lines.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::record::{EventDraft, EventSignature, SecurityEvent};
use super::signing::{EventSigner, SigningError};
use crate::concurrency::FileLock;

pub const AUDIT_FILENAME: &str = "sentinel.audit.jsonl";

enum WriterCommand {
    Append(String),
    Flush(oneshot::Sender<()>),
}

struct LogState {
    history: Vec<SecurityEvent>,
    writer: Option<mpsc::Sender<WriterCommand>>,
}

struct Inner {
    actor: String,
    signer: EventSigner,
    path: Option<PathBuf>,
    state: Mutex<LogState>,
}

/// Handle to the audit log. Cheap to clone; all clones share one history.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<Inner>,
}

impl AuditLog {
    /// Open (or create) the log at `path`, warm the history from disk and
    /// start the writer thread.
    pub fn open(path: impl Into<PathBuf>, actor: impl Into<String>, signer: EventSigner) -> Result<Self> {
        let path = path.into();
        let lock = FileLock::new(&path)?;

        let existing = read_audit_file(&path)?;
        if existing.corrupt_lines > 0 {
            warn!(
                "Skipped {} corrupt line(s) in {}",
                existing.corrupt_lines,
                path.display()
            );
        }
        debug!(
            "Loaded {} audit entries from {}",
            existing.entries.len(),
            path.display()
        );

        let (tx, rx) = mpsc::channel();
        let writer_path = path.clone();
        std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || run_writer(writer_path, lock, rx))
            .context("Failed to start audit writer thread")?;

        Ok(Self {
            inner: Arc::new(Inner {
                actor: actor.into(),
                signer,
                path: Some(path),
                state: Mutex::new(LogState {
                    history: existing.entries,
                    writer: Some(tx),
                }),
            }),
        })
    }

    /// Log that keeps history in memory only.
    pub fn in_memory(actor: impl Into<String>, signer: EventSigner) -> Self {
        Self {
            inner: Arc::new(Inner {
                actor: actor.into(),
                signer,
                path: None,
                state: Mutex::new(LogState {
                    history: Vec::new(),
                    writer: None,
                }),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn signer(&self) -> &EventSigner {
        &self.inner.signer
    }

    /// Stamp, sign and enqueue a decision. Returns the committed entry.
    ///
    /// If no signing key is available the entry is still recorded, marked
    /// `unsigned`, and a warning is raised on the `display_sentinel::signing`
    /// target.
    pub fn append(&self, draft: EventDraft) -> SecurityEvent {
        let mut state = self.lock_state();

        let mut event = SecurityEvent {
            ts: Utc::now(),
            actor: self.inner.actor.clone(),
            subject: draft.subject,
            decision: draft.decision,
            context: draft.context,
            signature: EventSignature::Unsigned,
        };

        match self.inner.signer.sign(&event) {
            Ok(signature) => event.signature = signature,
            Err(SigningError::SigningUnavailable(reason)) => {
                warn!(
                    target: "display_sentinel::signing",
                    decision = %event.decision,
                    "Recording unsigned audit entry: {}",
                    reason
                );
            }
            Err(e) => {
                warn!(
                    target: "display_sentinel::signing",
                    decision = %event.decision,
                    "Signing failed, recording unsigned audit entry: {}",
                    e
                );
            }
        }

        state.history.push(event.clone());

        if let Some(writer) = &state.writer {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if writer.send(WriterCommand::Append(line)).is_err() {
                        error!("Audit writer stopped; entry kept in memory only");
                    }
                }
                Err(e) => error!("Failed to encode audit entry: {}", e),
            }
        }

        event
    }

    /// All entries in append order, including those loaded at open.
    pub fn load_history(&self) -> Vec<SecurityEvent> {
        self.lock_state().history.clone()
    }

    /// Wait until every entry appended so far has reached the file.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        let sent = {
            let state = self.lock_state();
            match &state.writer {
                Some(writer) => writer.send(WriterCommand::Flush(tx)).is_ok(),
                None => false,
            }
        };
        if sent {
            // A dropped sender means the writer is gone; nothing left to wait for.
            let _ = rx.await;
        }
    }

    /// Check every entry in memory against the signer.
    pub fn verify_history(&self) -> AuditReport {
        AuditReport::from_entries(&self.load_history(), 0, &self.inner.signer)
    }

    fn lock_state(&self) -> MutexGuard<'_, LogState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn run_writer(path: PathBuf, lock: FileLock, rx: mpsc::Receiver<WriterCommand>) {
    for command in rx {
        match command {
            WriterCommand::Append(line) => {
                if let Err(e) = write_line(&path, &lock, &line) {
                    error!("Failed to persist audit entry to {}: {:#}", path.display(), e);
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Audit writer for {} stopped", path.display());
}

fn write_line(path: &Path, lock: &FileLock, line: &str) -> Result<()> {
    let _guard = lock.acquire().context("Failed to lock audit log")?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    file.sync_data().context("Failed to sync audit log")?;
    Ok(())
}

/// Parsed contents of an audit file.
#[derive(Debug, Default)]
pub struct AuditFile {
    pub entries: Vec<SecurityEvent>,
    pub corrupt_lines: usize,
}

/// Read and parse all entries from an audit file.
///
/// Corrupted lines are skipped and counted, never fatal. A missing file
/// reads as empty.
pub fn read_audit_file(path: &Path) -> Result<AuditFile> {
    if !path.exists() {
        return Ok(AuditFile::default());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    let mut file = AuditFile::default();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SecurityEvent>(line) {
            Ok(entry) => file.entries.push(entry),
            Err(_) => file.corrupt_lines += 1,
        }
    }

    Ok(file)
}

/// Per-entry verification summary.
///
/// `invalid` and `unsigned` hold entry indices (0-based, corrupt lines
/// excluded).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub total: usize,
    pub valid: usize,
    pub invalid: Vec<usize>,
    pub unsigned: Vec<usize>,
    pub corrupt_lines: usize,
}

impl AuditReport {
    fn from_entries(entries: &[SecurityEvent], corrupt_lines: usize, signer: &EventSigner) -> Self {
        let mut report = AuditReport {
            total: entries.len(),
            corrupt_lines,
            ..Default::default()
        };
        for (i, entry) in entries.iter().enumerate() {
            if !entry.signature.is_signed() {
                report.unsigned.push(i);
            } else if signer.verify_event(entry) {
                report.valid += 1;
            } else {
                report.invalid.push(i);
            }
        }
        report
    }

    /// No tampered entries and no corrupt lines. Unsigned entries are
    /// reported but do not break integrity.
    pub fn is_intact(&self) -> bool {
        self.invalid.is_empty() && self.corrupt_lines == 0
    }
}

/// Verify every entry of the audit file at `path`.
pub fn verify_audit_file(path: &Path, signer: &EventSigner) -> Result<AuditReport> {
    let file = read_audit_file(path)?;
    Ok(AuditReport::from_entries(
        &file.entries,
        file.corrupt_lines,
        signer,
    ))
}

/// Get the full path to the audit log file.
pub fn audit_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(AUDIT_FILENAME)
}
