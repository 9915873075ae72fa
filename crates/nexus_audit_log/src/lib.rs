//! nexus_audit_log
//!
//! Append-only, hash-chained audit log (spec component 4.E).
//! - `entry_hash = SHA-256(canonical_json(entry \ entry_hash))`
//! - `entry.prev_hash = previous.entry_hash`, or the 64-zero genesis string
//!   for the first entry.
//! - Append is single-writer: concurrent callers serialize through an
//!   internal async mutex (spec section 5's "serializer queue"). Readers may
//!   verify a snapshot concurrently with appends to later entries.

use chrono::Utc;
use nexus_audit_spec::{AuditEntry, AuditEntryInput};
use nexus_common::{genesis_hash, sha256_canonical_json, CanonError};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] CanonError),
}

pub fn compute_entry_hash(entry: &AuditEntry) -> Result<String, AuditLogError> {
    Ok(sha256_canonical_json(&entry.unsigned())?)
}

struct AppenderState {
    file: File,
    last_hash: String,
}

/// Single-writer, append-only audit log backed by a JSONL file.
pub struct AuditAppender {
    state: Mutex<AppenderState>,
}

impl AuditAppender {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let last_hash = last_hash_of_file(path)?.unwrap_or_else(genesis_hash);
        Ok(Self {
            state: Mutex::new(AppenderState { file, last_hash }),
        })
    }

    /// Append one entry. Computes `prev_hash`/`entry_hash`, persists the
    /// JSONL line, and updates the in-memory chain tip while holding the
    /// appender's mutex, per spec section 5's concurrency model.
    pub async fn append(&self, input: AuditEntryInput) -> Result<AuditEntry, AuditLogError> {
        let mut state = self.state.lock().await;

        let mut entry = AuditEntry {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            actor_id: input.actor_id,
            event: input.event,
            resource: input.resource,
            resource_id: input.resource_id,
            details: input.details,
            ip: input.ip,
            created_at: Utc::now(),
            prev_hash: state.last_hash.clone(),
            entry_hash: String::new(),
        };
        entry.entry_hash = compute_entry_hash(&entry)?;

        let line = serde_json::to_string(&entry)?;
        state.file.write_all(line.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;
        state.last_hash = entry.entry_hash.clone();

        Ok(entry)
    }
}

fn last_hash_of_file(path: &Path) -> Result<Option<String>, AuditLogError> {
    if !path.exists() {
        return Ok(None);
    }
    let f = File::open(path)?;
    let reader = BufReader::new(f);
    let mut last = None;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line)?;
        last = Some(entry.entry_hash);
    }
    Ok(last)
}

/// Walk a sequence of entries and verify the hash chain. Returns
/// `(true, None)` if every entry's stored hash matches its recomputed hash
/// and `prev_hash` matches the prior entry's `entry_hash` (genesis for index
/// 0); otherwise `(false, Some(first_bad_index))`.
pub fn verify_entries(entries: &[AuditEntry]) -> Result<(bool, Option<usize>), AuditLogError> {
    let mut expected_prev = genesis_hash();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.prev_hash != expected_prev {
            return Ok((false, Some(idx)));
        }
        let computed = compute_entry_hash(entry)?;
        if computed != entry.entry_hash {
            return Ok((false, Some(idx)));
        }
        expected_prev = entry.entry_hash.clone();
    }
    Ok((true, None))
}

/// Read a JSONL audit log from disk and verify its chain end-to-end.
pub fn verify_log(path: impl AsRef<Path>) -> Result<(bool, Option<usize>), AuditLogError> {
    let f = File::open(path)?;
    let reader = BufReader::new(f);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str::<AuditEntry>(&line)?);
    }
    verify_entries(&entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_input(event: &str) -> AuditEntryInput {
        AuditEntryInput {
            tenant_id: "tenant-1".into(),
            actor_id: Some("actor-1".into()),
            event: event.into(),
            resource: "inference".into(),
            resource_id: Some("req-1".into()),
            details: json!({"model": "gpt-4o"}),
            ip: None,
        }
    }

    #[tokio::test]
    async fn first_entry_chains_to_genesis() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let appender = AuditAppender::open(tmp.path()).unwrap();
        let e1 = appender.append(sample_input("inference.completed")).await.unwrap();
        assert_eq!(e1.prev_hash, genesis_hash());
    }

    #[tokio::test]
    async fn verify_passes_for_untouched_chain() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let appender = AuditAppender::open(tmp.path()).unwrap();
        appender.append(sample_input("inference.completed")).await.unwrap();
        appender.append(sample_input("inference.completed")).await.unwrap();

        let (ok, bad) = verify_log(tmp.path()).unwrap();
        assert!(ok);
        assert_eq!(bad, None);
    }

    #[tokio::test]
    async fn flipping_a_byte_breaks_verification_at_that_index() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let appender = AuditAppender::open(tmp.path()).unwrap();
        appender.append(sample_input("inference.completed")).await.unwrap();
        appender.append(sample_input("inference.completed")).await.unwrap();

        let contents = std::fs::read_to_string(tmp.path()).unwrap();
        let mut lines: Vec<String> = contents.lines().map(|s| s.to_string()).collect();
        let mut first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        first["details"]["model"] = json!("tampered");
        lines[0] = serde_json::to_string(&first).unwrap();
        std::fs::write(tmp.path(), lines.join("\n") + "\n").unwrap();

        let (ok, bad) = verify_log(tmp.path()).unwrap();
        assert!(!ok);
        assert_eq!(bad, Some(0));
    }

    #[tokio::test]
    async fn reopening_continues_the_chain() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let appender = AuditAppender::open(tmp.path()).unwrap();
            appender.append(sample_input("inference.completed")).await.unwrap();
        }
        let appender2 = AuditAppender::open(tmp.path()).unwrap();
        let e2 = appender2.append(sample_input("inference.completed")).await.unwrap();
        assert_ne!(e2.prev_hash, genesis_hash());

        let (ok, _) = verify_log(tmp.path()).unwrap();
        assert!(ok);
    }
}
