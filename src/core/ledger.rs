use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::manifest::RecordingSession;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl Default for FileStatus {
    fn default() -> Self {
        FileStatus::Pending
    }
}

/// One journal record, keyed by (session id, file id). The journal holds
/// every mutation ever made; the in-memory map holds the latest per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub session_id: String,
    pub file_id: String,
    pub status: FileStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
    pub destination_ref: Option<String>,
}

/// Durable per-file transfer state, backed by an append-only JSON-lines
/// journal. Every mutation is flushed and fsynced before the call returns,
/// so a crash at any point loses at most the mutation in flight — never a
/// completed one.
pub struct ProgressLedger {
    path: PathBuf,
    journal: File,
    entries: HashMap<(String, String), LedgerEntry>,
}

/// Compact once the journal carries this many superseded records beyond
/// the live set.
const COMPACT_SLACK: usize = 64;

fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

impl ProgressLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (entries, records_read) = Self::replay(path)?;

        if records_read > entries.len() * 2 + COMPACT_SLACK {
            info!(
                records = records_read,
                live = entries.len(),
                "compacting ledger journal"
            );
            Self::compact(path, &entries)?;
        }

        let mut journal = OpenOptions::new().create(true).append(true).open(path)?;

        // A crash mid-append can leave a torn final line with no newline;
        // terminate it so the next record starts on a line of its own.
        if !ends_with_newline(path)? {
            journal.write_all(b"\n")?;
            journal.sync_data()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            journal,
            entries,
        })
    }

    /// Replays the journal. The last record per key wins, except that Done
    /// is sticky. Unreadable lines are skipped with a warning: the affected
    /// key falls back to Pending, which at worst re-transfers a file —
    /// never the other way around.
    fn replay(path: &Path) -> Result<(HashMap<(String, String), LedgerEntry>, usize), LedgerError> {
        let mut entries = HashMap::new();
        let mut records_read = 0;

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no existing ledger, starting empty");
                return Ok((entries, 0));
            }
            Err(err) => return Err(err.into()),
        };

        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(line = number + 1, %err, "skipping unreadable ledger record");
                    continue;
                }
            };
            records_read += 1;

            let key = (entry.session_id.clone(), entry.file_id.clone());
            match entries.get(&key) {
                Some(existing)
                    if existing.status == FileStatus::Done && entry.status != FileStatus::Done =>
                {
                    warn!(
                        session = %entry.session_id,
                        file = %entry.file_id,
                        "ignoring journal record that would demote a completed file"
                    );
                }
                _ => {
                    entries.insert(key, entry);
                }
            }
        }

        Ok((entries, records_read))
    }

    /// Rewrites the journal down to one record per live key. The new
    /// journal is written to a temp file, fsynced, and renamed into place
    /// so a crash mid-compaction leaves the old journal intact.
    fn compact(path: &Path, entries: &HashMap<(String, String), LedgerEntry>) -> Result<(), LedgerError> {
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            for entry in entries.values() {
                serde_json::to_writer(&mut writer, entry)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        #[cfg(unix)]
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn append(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.journal.write_all(line.as_bytes())?;
        self.journal.sync_data()?;
        self.entries
            .insert((entry.session_id.clone(), entry.file_id.clone()), entry);
        Ok(())
    }

    /// Unknown keys default to Pending.
    pub fn get(&self, session_id: &str, file_id: &str) -> FileStatus {
        self.entries
            .get(&(session_id.to_string(), file_id.to_string()))
            .map(|entry| entry.status)
            .unwrap_or_default()
    }

    pub fn attempts(&self, session_id: &str, file_id: &str) -> u32 {
        self.entries
            .get(&(session_id.to_string(), file_id.to_string()))
            .map(|entry| entry.attempts)
            .unwrap_or(0)
    }

    pub fn destination_ref(&self, session_id: &str, file_id: &str) -> Option<&str> {
        self.entries
            .get(&(session_id.to_string(), file_id.to_string()))
            .and_then(|entry| entry.destination_ref.as_deref())
    }

    pub fn mark_in_progress(&mut self, session_id: &str, file_id: &str) -> Result<(), LedgerError> {
        if self.get(session_id, file_id) == FileStatus::Done {
            return Ok(());
        }
        let attempts = self.attempts(session_id, file_id);
        self.append(LedgerEntry {
            session_id: session_id.to_string(),
            file_id: file_id.to_string(),
            status: FileStatus::InProgress,
            attempts,
            updated_at: Utc::now(),
            destination_ref: None,
        })
    }

    /// Safe to replay: marking an already-Done key again is a no-op.
    pub fn mark_done(
        &mut self,
        session_id: &str,
        file_id: &str,
        destination_ref: &str,
    ) -> Result<(), LedgerError> {
        if self.get(session_id, file_id) == FileStatus::Done {
            return Ok(());
        }
        let attempts = self.attempts(session_id, file_id);
        self.append(LedgerEntry {
            session_id: session_id.to_string(),
            file_id: file_id.to_string(),
            status: FileStatus::Done,
            attempts,
            updated_at: Utc::now(),
            destination_ref: Some(destination_ref.to_string()),
        })
    }

    pub fn mark_failed(
        &mut self,
        session_id: &str,
        file_id: &str,
        attempt: u32,
    ) -> Result<(), LedgerError> {
        if self.get(session_id, file_id) == FileStatus::Done {
            return Ok(());
        }
        self.append(LedgerEntry {
            session_id: session_id.to_string(),
            file_id: file_id.to_string(),
            status: FileStatus::Failed,
            attempts: attempt,
            updated_at: Utc::now(),
            destination_ref: None,
        })
    }

    pub fn is_session_fully_done(&self, session: &RecordingSession) -> bool {
        !session.files.is_empty()
            && session
                .files
                .iter()
                .all(|file| self.get(&session.id, &file.id) == FileStatus::Done)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn ledger_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("ledger.jsonl")
    }

    #[test]
    fn test_unknown_key_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ProgressLedger::open(&ledger_path(&dir)).unwrap();
        assert_eq!(ledger.get("s1", "f1"), FileStatus::Pending);
    }

    #[test]
    fn test_transitions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(&dir);

        {
            let mut ledger = ProgressLedger::open(&path).unwrap();
            ledger.mark_in_progress("s1", "f1").unwrap();
            ledger.mark_done("s1", "f1", "drive-id-1").unwrap();
            ledger.mark_in_progress("s1", "f2").unwrap();
            ledger.mark_failed("s1", "f2", 1).unwrap();
        }

        let ledger = ProgressLedger::open(&path).unwrap();
        assert_eq!(ledger.get("s1", "f1"), FileStatus::Done);
        assert_eq!(ledger.destination_ref("s1", "f1"), Some("drive-id-1"));
        assert_eq!(ledger.get("s1", "f2"), FileStatus::Failed);
        assert_eq!(ledger.attempts("s1", "f2"), 1);
    }

    #[test]
    fn test_mark_done_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(&dir);

        let mut ledger = ProgressLedger::open(&path).unwrap();
        ledger.mark_done("s1", "f1", "ref-1").unwrap();
        ledger.mark_done("s1", "f1", "ref-2").unwrap();

        // The second call must not overwrite the recorded upload.
        assert_eq!(ledger.destination_ref("s1", "f1"), Some("ref-1"));

        // And must not grow the journal.
        let lines = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines, 1);
    }

    #[test]
    fn test_done_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = ProgressLedger::open(&ledger_path(&dir)).unwrap();
        ledger.mark_done("s1", "f1", "ref").unwrap();
        ledger.mark_in_progress("s1", "f1").unwrap();
        ledger.mark_failed("s1", "f1", 3).unwrap();
        assert_eq!(ledger.get("s1", "f1"), FileStatus::Done);
    }

    #[test]
    fn test_corrupt_trailing_line_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(&dir);

        {
            let mut ledger = ProgressLedger::open(&path).unwrap();
            ledger.mark_done("s1", "f1", "ref").unwrap();
            ledger.mark_in_progress("s1", "f2").unwrap();
        }

        // Simulate a crash mid-append: a truncated record on the last line.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"session_id\":\"s1\",\"file_id\":\"f3\",\"sta").unwrap();

        let mut ledger = ProgressLedger::open(&path).unwrap();
        assert_eq!(ledger.get("s1", "f1"), FileStatus::Done);
        assert_eq!(ledger.get("s1", "f2"), FileStatus::InProgress);
        // The half-written record degrades to Pending, never to Done.
        assert_eq!(ledger.get("s1", "f3"), FileStatus::Pending);

        // Appends after the torn line must land on their own line and
        // survive the next reload.
        ledger.mark_done("s1", "f4", "ref-4").unwrap();
        drop(ledger);
        let ledger = ProgressLedger::open(&path).unwrap();
        assert_eq!(ledger.get("s1", "f4"), FileStatus::Done);
    }

    #[test]
    fn test_journal_demotion_of_done_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(&dir);

        {
            let mut ledger = ProgressLedger::open(&path).unwrap();
            ledger.mark_done("s1", "f1", "ref").unwrap();
        }

        // A record claiming the file went back in progress (e.g. from a
        // journal spliced together by hand) must not demote Done.
        let rogue = LedgerEntry {
            session_id: "s1".to_string(),
            file_id: "f1".to_string(),
            status: FileStatus::InProgress,
            attempts: 0,
            updated_at: Utc::now(),
            destination_ref: None,
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let mut line = serde_json::to_string(&rogue).unwrap();
        line.push('\n');
        file.write_all(line.as_bytes()).unwrap();

        let ledger = ProgressLedger::open(&path).unwrap();
        assert_eq!(ledger.get("s1", "f1"), FileStatus::Done);
    }

    #[test]
    fn test_compaction_preserves_state_and_shrinks_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(&dir);

        {
            let mut ledger = ProgressLedger::open(&path).unwrap();
            // Churn a single key well past the compaction threshold.
            for attempt in 1..=200 {
                ledger.mark_in_progress("s1", "f1").unwrap();
                ledger.mark_failed("s1", "f1", attempt).unwrap();
            }
            ledger.mark_done("s1", "f1", "ref").unwrap();
            ledger.mark_done("s2", "f1", "ref2").unwrap();
        }

        let ledger = ProgressLedger::open(&path).unwrap();
        assert_eq!(ledger.get("s1", "f1"), FileStatus::Done);
        assert_eq!(ledger.get("s2", "f1"), FileStatus::Done);
        assert_eq!(ledger.len(), 2);

        let lines = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines, 2);
    }

    #[test]
    fn test_session_fully_done() {
        let session = RecordingSession {
            id: "s1".to_string(),
            host: "a@example.com".to_string(),
            topic: "Sync".to_string(),
            start_time: chrono::NaiveDateTime::parse_from_str(
                "2025-08-07 10:30:00",
                "%Y-%m-%d %H:%M:%S",
            )
            .unwrap(),
            start_time_raw: "Aug 07, 2025 10:30:00 AM".to_string(),
            file_count: 2,
            folder_name: "Sync - 2025.08.07".to_string(),
            files: vec![
                crate::core::manifest::RecordingFile {
                    id: "f1".to_string(),
                    file_type: "MP4".to_string(),
                    size: 10,
                    download_url: String::new(),
                    dest_name: "a.mp4".to_string(),
                },
                crate::core::manifest::RecordingFile {
                    id: "f2".to_string(),
                    file_type: "M4A".to_string(),
                    size: 10,
                    download_url: String::new(),
                    dest_name: "a.m4a".to_string(),
                },
            ],
        };

        let dir = tempfile::tempdir().unwrap();
        let mut ledger = ProgressLedger::open(&ledger_path(&dir)).unwrap();
        assert!(!ledger.is_session_fully_done(&session));
        ledger.mark_done("s1", "f1", "r1").unwrap();
        assert!(!ledger.is_session_fully_done(&session));
        ledger.mark_done("s1", "f2", "r2").unwrap();
        assert!(ledger.is_session_fully_done(&session));
    }
}
