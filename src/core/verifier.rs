use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::manifest::{Manifest, RecordingSession};
use crate::core::providers::{RecordingSource, RemoteRecording, StorageDestination};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// Every file the source reports exists at the destination.
    Complete,
    /// The destination is known to be short.
    Incomplete,
    /// One side could not be queried; nothing is known.
    Error,
    /// The source no longer lists a matching recording.
    NoMatchOnZoom,
    /// The source lists the recording but reports no downloadable files.
    NoFilesOnZoom,
}

/// One verification row per session. Carries the manifest columns through
/// so the report stands on its own, plus the provider-internal identifier
/// the deletion phase needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    #[serde(rename = "ID")]
    pub session_id: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Topic")]
    pub topic: String,
    #[serde(rename = "Start Time")]
    pub start_time: String,
    #[serde(rename = "File Count")]
    pub file_count: u32,
    #[serde(rename = "Total Size (Bytes)")]
    pub total_bytes: u64,
    pub zoom_meeting_uuid: Option<String>,
    pub zoom_file_count: Option<u32>,
    pub drive_file_count: Option<u32>,
    pub verification_status: VerificationStatus,
    pub verification_error: Option<String>,
}

/// Compares what the source says a session should contain against what
/// the destination actually holds. The expected count is re-queried from
/// the source: the manifest may be stale.
pub struct VerificationAuditor<'a> {
    source: &'a dyn RecordingSource,
    destination: &'a dyn StorageDestination,
    /// File types counted toward the expected total; `None` counts all.
    count_file_types: Option<Vec<String>>,
}

impl<'a> VerificationAuditor<'a> {
    pub fn new(
        source: &'a dyn RecordingSource,
        destination: &'a dyn StorageDestination,
        count_file_types: Option<Vec<String>>,
    ) -> Self {
        let count_file_types = count_file_types
            .map(|types| types.into_iter().map(|t| t.to_lowercase()).collect());
        Self {
            source,
            destination,
            count_file_types,
        }
    }

    /// Produces one record per manifest session. Re-running on the same
    /// state recomputes the same report; nothing accumulates.
    pub async fn verify(&self, manifest: &Manifest) -> Vec<VerificationRecord> {
        let mut records = Vec::with_capacity(manifest.sessions.len());
        for session in &manifest.sessions {
            let record = self.verify_session(session).await;
            info!(
                session = %session.id,
                status = ?record.verification_status,
                expected = ?record.zoom_file_count,
                observed = ?record.drive_file_count,
                "verified session"
            );
            records.push(record);
        }
        records
    }

    async fn verify_session(&self, session: &RecordingSession) -> VerificationRecord {
        let mut record = base_record(session);

        let recording = match self.source.find_recording(session).await {
            Ok(Some(recording)) => recording,
            Ok(None) => {
                record.verification_status = VerificationStatus::NoMatchOnZoom;
                record.zoom_file_count = Some(0);
                return record;
            }
            Err(err) => {
                warn!(session = %session.id, %err, "source query failed");
                record.verification_status = VerificationStatus::Error;
                record.verification_error = Some(err.to_string());
                return record;
            }
        };

        debug!(
            session = %session.id,
            uuid = %recording.uuid,
            meeting = %recording.meeting_id,
            topic = %recording.topic,
            "matched source recording"
        );
        record.zoom_meeting_uuid = Some(recording.uuid.clone());
        let expected = self.expected_count(&recording);
        record.zoom_file_count = Some(expected as u32);

        if expected == 0 {
            record.verification_status = VerificationStatus::NoFilesOnZoom;
            return record;
        }

        match self.destination.count_files(&session.folder_name).await {
            Ok(observed) => {
                record.drive_file_count = Some(observed as u32);
                record.verification_status = if observed == expected {
                    VerificationStatus::Complete
                } else {
                    let expected_files: Vec<_> = recording
                        .files
                        .iter()
                        .map(|file| (file.id.as_str(), file.size))
                        .collect();
                    debug!(
                        session = %session.id,
                        observed,
                        expected,
                        ?expected_files,
                        "destination is short"
                    );
                    VerificationStatus::Incomplete
                };
            }
            Err(err) => {
                warn!(session = %session.id, %err, "destination query failed");
                record.verification_status = VerificationStatus::Error;
                record.verification_error = Some(err.to_string());
            }
        }

        record
    }

    fn expected_count(&self, recording: &RemoteRecording) -> usize {
        match &self.count_file_types {
            None => recording.files.len(),
            Some(types) => recording
                .files
                .iter()
                .filter(|file| types.contains(&file.file_type.to_lowercase()))
                .count(),
        }
    }
}

fn base_record(session: &RecordingSession) -> VerificationRecord {
    VerificationRecord {
        session_id: session.id.clone(),
        host: session.host.clone(),
        topic: session.topic.clone(),
        start_time: session.start_time_raw.clone(),
        file_count: session.file_count,
        total_bytes: session.total_bytes(),
        zoom_meeting_uuid: None,
        zoom_file_count: None,
        drive_file_count: None,
        verification_status: VerificationStatus::Error,
        verification_error: None,
    }
}
