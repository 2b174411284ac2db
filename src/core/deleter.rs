use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::providers::{ProviderError, RecordingSource};
use crate::core::verifier::{VerificationRecord, VerificationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionOutcome {
    Deleted,
    /// Dry-run marker: eligible, but no destructive call was issued.
    WouldDelete,
    Skipped,
    Failed,
}

/// One row per input session, whatever its fate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionRecord {
    #[serde(rename = "ID")]
    pub session_id: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Topic")]
    pub topic: String,
    #[serde(rename = "Start Time")]
    pub start_time: String,
    pub zoom_meeting_uuid: Option<String>,
    pub verification_status: VerificationStatus,
    pub deletion_status: DeletionOutcome,
    pub deletion_reason: Option<String>,
}

/// Deletes source recordings for fully-verified sessions only. Everything
/// that is not verified COMPLETE is skipped by construction; a failure on
/// one session never stops the rest.
pub struct DeletionExecutor<'a> {
    source: &'a dyn RecordingSource,
}

impl<'a> DeletionExecutor<'a> {
    pub fn new(source: &'a dyn RecordingSource) -> Self {
        Self { source }
    }

    /// `confirm` is consulted once for the whole run, with the number of
    /// eligible sessions, unless `force` or `dry_run` bypasses it. If it
    /// declines, every eligible session is reported SKIPPED and no
    /// destructive call is made.
    pub async fn run(
        &self,
        records: &[VerificationRecord],
        dry_run: bool,
        force: bool,
        confirm: impl FnOnce(usize) -> bool,
    ) -> Vec<DeletionRecord> {
        let eligible = records
            .iter()
            .filter(|record| {
                record.verification_status == VerificationStatus::Complete
                    && record.zoom_meeting_uuid.is_some()
            })
            .count();

        let confirmed = if dry_run || force || eligible == 0 {
            true
        } else {
            confirm(eligible)
        };

        if !confirmed {
            warn!("confirmation declined, no recordings will be deleted");
        }

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            results.push(self.process(record, dry_run, confirmed).await);
        }

        let deleted = results
            .iter()
            .filter(|r| r.deletion_status == DeletionOutcome::Deleted)
            .count();
        info!(
            input = records.len(),
            eligible,
            deleted,
            dry_run,
            "deletion run finished"
        );

        results
    }

    async fn process(
        &self,
        record: &VerificationRecord,
        dry_run: bool,
        confirmed: bool,
    ) -> DeletionRecord {
        if record.verification_status != VerificationStatus::Complete {
            return outcome(
                record,
                DeletionOutcome::Skipped,
                Some(format!(
                    "verification status {}",
                    status_label(record.verification_status)
                )),
            );
        }

        let Some(uuid) = record.zoom_meeting_uuid.as_deref() else {
            return outcome(
                record,
                DeletionOutcome::Skipped,
                Some("missing zoom meeting uuid".to_string()),
            );
        };

        if dry_run {
            return outcome(record, DeletionOutcome::WouldDelete, None);
        }

        if !confirmed {
            return outcome(
                record,
                DeletionOutcome::Skipped,
                Some("confirmation declined".to_string()),
            );
        }

        match self.source.delete_recording(uuid).await {
            Ok(()) => {
                info!(session = %record.session_id, uuid, "deleted source recording");
                outcome(record, DeletionOutcome::Deleted, None)
            }
            // Already gone is as deleted as it gets.
            Err(ProviderError::NotFound(_)) => outcome(
                record,
                DeletionOutcome::Deleted,
                Some("already deleted or not found".to_string()),
            ),
            Err(err) => {
                error!(session = %record.session_id, uuid, %err, "deletion failed");
                outcome(record, DeletionOutcome::Failed, Some(err.to_string()))
            }
        }
    }
}

fn outcome(
    record: &VerificationRecord,
    deletion_status: DeletionOutcome,
    deletion_reason: Option<String>,
) -> DeletionRecord {
    DeletionRecord {
        session_id: record.session_id.clone(),
        host: record.host.clone(),
        topic: record.topic.clone(),
        start_time: record.start_time.clone(),
        zoom_meeting_uuid: record.zoom_meeting_uuid.clone(),
        verification_status: record.verification_status,
        deletion_status,
        deletion_reason,
    }
}

fn status_label(status: VerificationStatus) -> &'static str {
    match status {
        VerificationStatus::Complete => "COMPLETE",
        VerificationStatus::Incomplete => "INCOMPLETE",
        VerificationStatus::Error => "ERROR",
        VerificationStatus::NoMatchOnZoom => "NO_MATCH_ON_ZOOM",
        VerificationStatus::NoFilesOnZoom => "NO_FILES_ON_ZOOM",
    }
}
