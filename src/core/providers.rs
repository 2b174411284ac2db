use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::core::manifest::RecordingSession;

/// Failure from either provider, split along the retry boundary: transient
/// failures are worth another attempt, everything else is not.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP {status} from {endpoint}")]
    Status { status: u16, endpoint: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Status { status, .. } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            ProviderError::Network(err) => err.is_timeout() || err.is_connect(),
            ProviderError::Io(_) => true,
            ProviderError::NotFound(_) | ProviderError::Auth(_) | ProviderError::Protocol(_) => {
                false
            }
        }
    }

    /// Maps an unsuccessful HTTP status onto the taxonomy.
    pub(crate) fn from_status(status: reqwest::StatusCode, endpoint: &str) -> Self {
        match status.as_u16() {
            401 | 403 => ProviderError::Auth(endpoint.to_string()),
            404 => ProviderError::NotFound(endpoint.to_string()),
            status => ProviderError::Status {
                status,
                endpoint: endpoint.to_string(),
            },
        }
    }
}

/// A recording as the source provider reports it right now, as opposed to
/// what the manifest claimed at export time.
#[derive(Debug, Clone)]
pub struct RemoteRecording {
    /// Provider-internal identifier; the deletion key.
    pub uuid: String,
    pub meeting_id: String,
    pub topic: String,
    pub files: Vec<RemoteFile>,
}

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub id: String,
    pub file_type: String,
    pub size: u64,
}

/// The source of recordings: list, fetch, delete.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordingSource: Send + Sync {
    /// Looks up the live recording matching a manifest session, if the
    /// provider still has it.
    async fn find_recording(
        &self,
        session: &RecordingSession,
    ) -> Result<Option<RemoteRecording>, ProviderError>;

    /// Streams one file to `dest`, returning the byte count.
    async fn download_file(&self, download_url: &str, dest: &Path) -> Result<u64, ProviderError>;

    /// Deletes a meeting's entire recording set by its provider-internal
    /// identifier.
    async fn delete_recording(&self, meeting_uuid: &str) -> Result<(), ProviderError>;
}

/// The destination store: upload and count.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageDestination: Send + Sync {
    /// Uploads a staged file into `folder` under the destination root,
    /// returning the destination's reference for it.
    async fn upload_file(
        &self,
        local: &Path,
        folder: &str,
        name: &str,
    ) -> Result<String, ProviderError>;

    /// Counts files currently stored under `folder`. A folder that was
    /// never created counts as zero, not as an error.
    async fn count_files(&self, folder: &str) -> Result<usize, ProviderError>;
}
