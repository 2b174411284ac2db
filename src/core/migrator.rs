use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::core::ledger::{FileStatus, ProgressLedger};
use crate::core::planner::PlannedTransfer;
use crate::core::providers::{RecordingSource, StorageDestination};
use crate::core::retry::{RetryDecision, RetryPolicy};

/// What one invocation did. Not persisted; the ledger carries the durable
/// record.
#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub planned: usize,
    pub transferred: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes_transferred: u64,
    pub cap_reached: bool,
}

/// Drives one migration run: download to staging, upload, record in the
/// ledger. Ledger and local-disk failures abort the run; per-file provider
/// failures never do.
pub struct MigrationExecutor<'a> {
    source: &'a dyn RecordingSource,
    destination: &'a dyn StorageDestination,
    ledger: &'a mut ProgressLedger,
    staging_dir: PathBuf,
    retry: RetryPolicy,
    cap_bytes: u64,
}

/// Removes the staged download once the transfer reaches a terminal
/// outcome, whichever way the enclosing scope exits.
struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), %err, "failed to remove staged file");
            }
        }
        // Only succeeds once the folder is empty, which is exactly when we
        // want it gone.
        if let Some(dir) = self.path.parent() {
            let _ = fs::remove_dir(dir);
        }
    }
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(
        source: &'a dyn RecordingSource,
        destination: &'a dyn StorageDestination,
        ledger: &'a mut ProgressLedger,
        staging_dir: PathBuf,
        retry: RetryPolicy,
        cap_bytes: u64,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            staging_dir,
            retry,
            cap_bytes,
        }
    }

    pub async fn run(&mut self, plan: &[PlannedTransfer], dry_run: bool) -> Result<BatchSummary> {
        let mut summary = BatchSummary {
            planned: plan.len(),
            ..Default::default()
        };

        if dry_run {
            for item in plan {
                info!(
                    session = %item.session_id,
                    file = %item.file.id,
                    size = item.file.size,
                    dest = %format!("{}/{}", item.folder_name, item.file.dest_name),
                    "dry run: would transfer"
                );
            }
            return Ok(summary);
        }

        self.sweep_staging().context("sweeping staging directory")?;

        for item in plan {
            if summary.bytes_transferred >= self.cap_bytes {
                info!(
                    bytes = summary.bytes_transferred,
                    cap = self.cap_bytes,
                    "volume cap reached, stopping run"
                );
                summary.cap_reached = true;
                break;
            }

            // The plan may be stale if built before an earlier partial run.
            if self.ledger.get(&item.session_id, &item.file.id) == FileStatus::Done {
                summary.skipped += 1;
                continue;
            }

            match self.transfer_with_retry(item).await? {
                Some(bytes) => {
                    summary.transferred += 1;
                    summary.bytes_transferred += bytes;
                }
                None => summary.failed += 1,
            }
        }

        Ok(summary)
    }

    /// Ok(Some(bytes)) on success, Ok(None) once retries are exhausted and
    /// the entry is left Failed. Err only for ledger/disk failures, which
    /// abort the whole run.
    async fn transfer_with_retry(&mut self, item: &PlannedTransfer) -> Result<Option<u64>> {
        let mut run_attempts = 0;
        loop {
            self.ledger.mark_in_progress(&item.session_id, &item.file.id)?;

            match self.transfer_once(item).await {
                Ok((bytes, destination_ref)) => {
                    self.ledger
                        .mark_done(&item.session_id, &item.file.id, &destination_ref)?;
                    info!(
                        session = %item.session_id,
                        file = %item.file.id,
                        bytes,
                        dest = %destination_ref,
                        "transfer complete"
                    );
                    return Ok(Some(bytes));
                }
                Err(err) => {
                    run_attempts += 1;
                    let total_attempts = self.ledger.attempts(&item.session_id, &item.file.id) + 1;
                    self.ledger
                        .mark_failed(&item.session_id, &item.file.id, total_attempts)?;

                    match self.retry.decide(&err, run_attempts) {
                        RetryDecision::Retry { delay } => {
                            warn!(
                                session = %item.session_id,
                                file = %item.file.id,
                                attempt = run_attempts,
                                %err,
                                "transfer failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            error!(
                                session = %item.session_id,
                                file = %item.file.id,
                                attempts = run_attempts,
                                %err,
                                "transfer failed, giving up for this run"
                            );
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    async fn transfer_once(
        &self,
        item: &PlannedTransfer,
    ) -> std::result::Result<(u64, String), crate::core::providers::ProviderError> {
        let staging_folder = self.staging_dir.join(&item.folder_name);
        fs::create_dir_all(&staging_folder)?;

        let staged = StagedFile::new(staging_folder.join(&item.file.dest_name));

        let bytes = self
            .source
            .download_file(&item.file.download_url, staged.path())
            .await?;
        let destination_ref = self
            .destination
            .upload_file(staged.path(), &item.folder_name, &item.file.dest_name)
            .await?;

        Ok((bytes, destination_ref))
    }

    /// Clears staging leftovers from a previous interrupted run so disk
    /// usage stays bounded across crashes.
    fn sweep_staging(&self) -> std::io::Result<()> {
        if !self.staging_dir.exists() {
            return fs::create_dir_all(&self.staging_dir);
        }

        let mut removed = 0;
        for entry in WalkDir::new(&self.staging_dir)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            } else if entry.file_type().is_dir() && entry.path() != self.staging_dir {
                let _ = fs::remove_dir(entry.path());
            }
        }
        if removed > 0 {
            warn!(removed, "removed staged files left over from an interrupted run");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::RecordingFile;
    use crate::core::providers::{
        MockRecordingSource, MockStorageDestination, ProviderError,
    };
    use std::time::Duration;

    fn planned(session: &str, file_id: &str, size: u64) -> PlannedTransfer {
        PlannedTransfer {
            session_id: session.to_string(),
            folder_name: format!("Sync {session}"),
            file: RecordingFile {
                id: file_id.to_string(),
                file_type: "MP4".to_string(),
                size,
                download_url: format!("https://zoom.example/{file_id}"),
                dest_name: format!("{file_id}.mp4"),
            },
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    fn fake_download(dest: &Path, bytes: u64) -> Result<u64, ProviderError> {
        std::fs::write(dest, vec![0u8; bytes as usize])?;
        Ok(bytes)
    }

    struct Fixture {
        ledger: ProgressLedger,
        staging: tempfile::TempDir,
        _ledger_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let ledger_dir = tempfile::tempdir().unwrap();
        let ledger = ProgressLedger::open(&ledger_dir.path().join("ledger.jsonl")).unwrap();
        Fixture {
            ledger,
            staging: tempfile::tempdir().unwrap(),
            _ledger_dir: ledger_dir,
        }
    }

    fn staged_file_count(dir: &Path) -> usize {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[tokio::test]
    async fn test_success_marks_done_and_cleans_staging() {
        let mut fx = fixture();
        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();

        source
            .expect_download_file()
            .times(1)
            .returning(|_, dest| fake_download(dest, 16));
        destination
            .expect_upload_file()
            .times(1)
            .returning(|_, _, _| Ok("drive-1".to_string()));

        let staging = fx.staging.path().to_path_buf();
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut fx.ledger,
            staging.clone(),
            policy(),
            u64::MAX,
        );
        let summary = executor.run(&[planned("s1", "f1", 16)], false).await.unwrap();

        assert_eq!(summary.transferred, 1);
        assert_eq!(summary.bytes_transferred, 16);
        assert_eq!(fx.ledger.get("s1", "f1"), FileStatus::Done);
        assert_eq!(fx.ledger.destination_ref("s1", "f1"), Some("drive-1"));
        assert_eq!(staged_file_count(&staging), 0);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let mut fx = fixture();
        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();
        source.expect_download_file().never();
        destination.expect_upload_file().never();

        let staging = fx.staging.path().to_path_buf();
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut fx.ledger,
            staging,
            policy(),
            u64::MAX,
        );
        let summary = executor.run(&[planned("s1", "f1", 16)], true).await.unwrap();

        assert_eq!(summary.planned, 1);
        assert_eq!(summary.transferred, 0);
        assert!(fx.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_run() {
        let mut fx = fixture();
        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();

        source
            .expect_download_file()
            .withf(|url, _| url.ends_with("f1"))
            .returning(|_, _| Err(ProviderError::NotFound("gone".to_string())));
        source
            .expect_download_file()
            .withf(|url, _| url.ends_with("f2"))
            .returning(|_, dest| fake_download(dest, 8));
        destination
            .expect_upload_file()
            .times(1)
            .returning(|_, _, _| Ok("drive-2".to_string()));

        let staging = fx.staging.path().to_path_buf();
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut fx.ledger,
            staging,
            policy(),
            u64::MAX,
        );
        let summary = executor
            .run(&[planned("s1", "f1", 8), planned("s1", "f2", 8)], false)
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.transferred, 1);
        assert_eq!(fx.ledger.get("s1", "f1"), FileStatus::Failed);
        assert_eq!(fx.ledger.get("s1", "f2"), FileStatus::Done);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let mut fx = fixture();
        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();

        let mut calls = 0;
        source.expect_download_file().returning(move |_, dest| {
            calls += 1;
            if calls == 1 {
                Err(ProviderError::Status {
                    status: 503,
                    endpoint: "download".to_string(),
                })
            } else {
                fake_download(dest, 8)
            }
        });
        destination
            .expect_upload_file()
            .times(1)
            .returning(|_, _, _| Ok("drive-1".to_string()));

        let staging = fx.staging.path().to_path_buf();
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut fx.ledger,
            staging,
            policy(),
            u64::MAX,
        );
        let summary = executor.run(&[planned("s1", "f1", 8)], false).await.unwrap();

        assert_eq!(summary.transferred, 1);
        assert_eq!(fx.ledger.get("s1", "f1"), FileStatus::Done);
        // Both the failed and the successful attempt were journaled.
        assert_eq!(fx.ledger.attempts("s1", "f1"), 1);
    }

    #[tokio::test]
    async fn test_rerun_skips_already_done_files() {
        let mut fx = fixture();
        fx.ledger.mark_done("s1", "f1", "drive-1").unwrap();
        fx.ledger.mark_done("s1", "f2", "drive-2").unwrap();

        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();
        source.expect_download_file().never();
        destination.expect_upload_file().never();

        let staging = fx.staging.path().to_path_buf();
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut fx.ledger,
            staging,
            policy(),
            u64::MAX,
        );
        // Same plan as the interrupted run would have had.
        let summary = executor
            .run(&[planned("s1", "f1", 8), planned("s1", "f2", 8)], false)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.transferred, 0);
    }

    #[tokio::test]
    async fn test_staging_cleaned_after_exhausted_retries() {
        let mut fx = fixture();
        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();

        // Download succeeds, upload keeps failing transiently until the
        // policy gives up.
        source
            .expect_download_file()
            .returning(|_, dest| fake_download(dest, 8));
        destination.expect_upload_file().returning(|_, _, _| {
            Err(ProviderError::Status {
                status: 500,
                endpoint: "upload".to_string(),
            })
        });

        let staging = fx.staging.path().to_path_buf();
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut fx.ledger,
            staging.clone(),
            policy(),
            u64::MAX,
        );
        let summary = executor.run(&[planned("s1", "f1", 8)], false).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(fx.ledger.get("s1", "f1"), FileStatus::Failed);
        assert_eq!(staged_file_count(&staging), 0);
    }

    #[tokio::test]
    async fn test_cap_stops_run_early() {
        let mut fx = fixture();
        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();

        source
            .expect_download_file()
            .times(1)
            .returning(|_, dest| fake_download(dest, 10));
        destination
            .expect_upload_file()
            .times(1)
            .returning(|_, _, _| Ok("drive-1".to_string()));

        let staging = fx.staging.path().to_path_buf();
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut fx.ledger,
            staging,
            policy(),
            5,
        );
        let summary = executor
            .run(&[planned("s1", "f1", 10), planned("s1", "f2", 10)], false)
            .await
            .unwrap();

        assert_eq!(summary.transferred, 1);
        assert!(summary.cap_reached);
        assert_eq!(fx.ledger.get("s1", "f2"), FileStatus::Pending);
    }

    #[tokio::test]
    async fn test_daily_batches_complete_manifest_across_runs() {
        use crate::core::ledger::ProgressLedger;
        use crate::core::manifest::{Manifest, RecordingSession};
        use crate::core::planner;

        fn session(id: &str, files: Vec<RecordingFile>) -> RecordingSession {
            RecordingSession {
                id: id.to_string(),
                host: "a@example.com".to_string(),
                topic: "Sync".to_string(),
                start_time: chrono::NaiveDateTime::parse_from_str(
                    "2025-08-07 10:30:00",
                    "%Y-%m-%d %H:%M:%S",
                )
                .unwrap(),
                start_time_raw: "Aug 07, 2025 10:30:00 AM".to_string(),
                file_count: files.len() as u32,
                folder_name: format!("Sync {id}"),
                files,
            }
        }

        // Session A: two 1-byte files. Session B: one 10-byte file.
        // Cap: 2 bytes per run, so A fills day one and B alone — over
        // the cap, admitted for forward progress — fills day two.
        let manifest = Manifest {
            sessions: vec![
                session("a", vec![planned("a", "a1", 1).file, planned("a", "a2", 1).file]),
                session("b", vec![planned("b", "b1", 10).file]),
            ],
        };

        let ledger_dir = tempfile::tempdir().unwrap();
        let ledger_path = ledger_dir.path().join("ledger.jsonl");
        let staging = tempfile::tempdir().unwrap();

        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();
        source.expect_download_file().returning(|url, dest| {
            let bytes = if url.ends_with("b1") { 10 } else { 1 };
            fake_download(dest, bytes)
        });
        destination
            .expect_upload_file()
            .returning(|_, _, name| Ok(format!("drive-{name}")));

        // Day one.
        let mut ledger = ProgressLedger::open(&ledger_path).unwrap();
        let plan = planner::plan(&manifest, &ledger, 2);
        assert_eq!(
            plan.iter().map(|t| t.file.id.as_str()).collect::<Vec<_>>(),
            ["a1", "a2"]
        );
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut ledger,
            staging.path().to_path_buf(),
            policy(),
            2,
        );
        let summary = executor.run(&plan, false).await.unwrap();
        assert_eq!(summary.transferred, 2);
        assert!(ledger.is_session_fully_done(&manifest.sessions[0]));
        assert!(!ledger.is_session_fully_done(&manifest.sessions[1]));
        drop(ledger);

        // Day two: fresh process, same cap.
        let mut ledger = ProgressLedger::open(&ledger_path).unwrap();
        let plan = planner::plan(&manifest, &ledger, 2);
        assert_eq!(
            plan.iter().map(|t| t.file.id.as_str()).collect::<Vec<_>>(),
            ["b1"]
        );
        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut ledger,
            staging.path().to_path_buf(),
            policy(),
            2,
        );
        let summary = executor.run(&plan, false).await.unwrap();
        assert_eq!(summary.transferred, 1);
        assert!(ledger.is_session_fully_done(&manifest.sessions[1]));

        // Day three: nothing left to plan.
        let plan = planner::plan(&manifest, &ledger, 2);
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_leftover_staging_files() {
        let mut fx = fixture();
        let staging = fx.staging.path().to_path_buf();
        let leftover_dir = staging.join("Sync old");
        std::fs::create_dir_all(&leftover_dir).unwrap();
        std::fs::write(leftover_dir.join("orphan.mp4"), b"junk").unwrap();

        let mut source = MockRecordingSource::new();
        let mut destination = MockStorageDestination::new();
        source.expect_download_file().never();
        destination.expect_upload_file().never();

        let mut executor = MigrationExecutor::new(
            &source,
            &destination,
            &mut fx.ledger,
            staging.clone(),
            policy(),
            u64::MAX,
        );
        executor.run(&[], false).await.unwrap();

        assert_eq!(staged_file_count(&staging), 0);
        assert!(!leftover_dir.exists());
    }
}
