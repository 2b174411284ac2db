use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::core::config::NamingConfig;

/// One row of the manifest CSV: a single downloadable file, with its
/// session's columns repeated. Rows belonging to the same session share
/// the `ID` column.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Topic")]
    pub topic: String,
    #[serde(rename = "Start Time")]
    pub start_time: String,
    #[serde(rename = "File Count")]
    pub file_count: u32,
    #[serde(rename = "File ID")]
    pub file_id: String,
    #[serde(rename = "File Type")]
    pub file_type: String,
    #[serde(rename = "File Extension")]
    pub file_extension: String,
    #[serde(rename = "File Size (Bytes)")]
    pub file_size: u64,
    #[serde(rename = "Download URL")]
    pub download_url: String,
}

/// One Zoom meeting recording event. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub id: String,
    pub host: String,
    pub topic: String,
    pub start_time: NaiveDateTime,
    pub start_time_raw: String,
    pub file_count: u32,
    pub folder_name: String,
    pub files: Vec<RecordingFile>,
}

/// One downloadable artifact belonging to a session.
#[derive(Debug, Clone)]
pub struct RecordingFile {
    pub id: String,
    pub file_type: String,
    pub size: u64,
    pub download_url: String,
    /// Destination file name, derived from session metadata at load time.
    pub dest_name: String,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub sessions: Vec<RecordingSession>,
}

impl RecordingSession {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

impl Manifest {
    pub fn load(path: &Path, naming: &NamingConfig) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening manifest {}", path.display()))?;

        let mut sessions: Vec<RecordingSession> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for (line, row) in reader.deserialize::<ManifestRow>().enumerate() {
            let row = row.with_context(|| {
                format!("parsing manifest row {} of {}", line + 2, path.display())
            })?;

            let position = match index.get(&row.id) {
                Some(&position) => position,
                None => {
                    let session = Self::session_from_row(&row, naming).with_context(|| {
                        format!("parsing manifest row {} of {}", line + 2, path.display())
                    })?;
                    index.insert(row.id.clone(), sessions.len());
                    sessions.push(session);
                    sessions.len() - 1
                }
            };

            let session = &mut sessions[position];
            let file = session_file(session, &row, naming);
            session.files.push(file);
        }

        for session in &sessions {
            if session.files.len() as u32 != session.file_count {
                warn!(
                    session = %session.id,
                    listed = session.file_count,
                    found = session.files.len(),
                    "manifest file count does not match its file rows; \
                     verification will re-query the source"
                );
            }
        }

        Ok(Self { sessions })
    }

    fn session_from_row(row: &ManifestRow, naming: &NamingConfig) -> Result<RecordingSession> {
        let start_time = NaiveDateTime::parse_from_str(&row.start_time, &naming.start_time_format)
            .with_context(|| format!("unparseable start time {:?}", row.start_time))?;

        let meeting_time = start_time.format(&naming.time_format).to_string();
        let folder_name = sanitize_name(
            &naming
                .folder_template
                .replace("{topic}", &row.topic)
                .replace("{meeting_time}", &meeting_time),
        );

        Ok(RecordingSession {
            id: row.id.clone(),
            host: row.host.clone(),
            topic: row.topic.clone(),
            start_time,
            start_time_raw: row.start_time.clone(),
            file_count: row.file_count,
            folder_name,
            files: Vec::new(),
        })
    }
}

fn session_file(session: &RecordingSession, row: &ManifestRow, naming: &NamingConfig) -> RecordingFile {
    let meeting_time = session.start_time.format(&naming.time_format).to_string();
    let dest_name = sanitize_name(
        &naming
            .file_template
            .replace("{meeting_time}", &meeting_time)
            .replace("{topic}", &session.topic)
            .replace("{rec_type}", &prettify_type(&row.file_type))
            .replace("{file_id}", &row.file_id)
            .replace("{ext}", &row.file_extension.to_lowercase()),
    );

    RecordingFile {
        id: row.file_id.clone(),
        file_type: row.file_type.clone(),
        size: row.file_size,
        download_url: row.download_url.clone(),
        dest_name,
    }
}

/// Strips characters that are hostile to filesystems or the Drive API.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') && !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// "shared_screen_with_speaker_view" -> "Shared Screen With Speaker View"
fn prettify_type(file_type: &str) -> String {
    file_type
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
