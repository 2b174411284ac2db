use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::config::ZoomConfig;
use crate::core::manifest::RecordingSession;
use crate::core::providers::{ProviderError, RecordingSource, RemoteFile, RemoteRecording};

const OAUTH_TOKEN_URL: &str = "https://zoom.us/oauth/token";
const API_BASE: &str = "https://api.zoom.us/v2";

/// Zoom API client using the OAuth account-credentials grant. The access
/// token is fetched at startup and refreshed once per request on 401;
/// Zoom tokens expire after an hour, which a large run will outlive.
pub struct ZoomClient {
    http: reqwest::Client,
    config: ZoomConfig,
    token: RwLock<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordingsPage {
    #[serde(default)]
    meetings: Vec<ZoomMeeting>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ZoomMeeting {
    uuid: String,
    id: i64,
    topic: String,
    #[serde(default)]
    recording_files: Vec<ZoomRecordingFile>,
}

#[derive(Debug, Clone, Deserialize)]
struct ZoomRecordingFile {
    id: String,
    #[serde(default)]
    file_type: String,
    #[serde(default)]
    file_size: u64,
}

impl ZoomClient {
    pub async fn connect(config: ZoomConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        let token = Self::fetch_token(&http, &config).await?;
        Ok(Self {
            http,
            config,
            token: RwLock::new(token),
        })
    }

    async fn fetch_token(http: &reqwest::Client, config: &ZoomConfig) -> Result<String, ProviderError> {
        let response = http
            .post(OAUTH_TOKEN_URL)
            .basic_auth(&config.client_id, Some(&config.client_secret))
            .query(&[
                ("grant_type", "account_credentials"),
                ("account_id", config.account_id.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Auth(format!(
                "zoom token request failed with HTTP {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        token
            .access_token
            .ok_or_else(|| ProviderError::Auth("no access_token in zoom token response".to_string()))
    }

    async fn refresh_token(&self) -> Result<(), ProviderError> {
        debug!("refreshing zoom access token");
        let token = Self::fetch_token(&self.http, &self.config).await?;
        *self.token.write().await = token;
        Ok(())
    }

    /// Sends one API request with bearer auth, refreshing the token once
    /// on 401 before giving up.
    async fn request(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, ProviderError> {
        for refreshed in [false, true] {
            let token = self.token.read().await.clone();
            let response = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                self.refresh_token().await?;
                continue;
            }
            if !response.status().is_success() {
                return Err(ProviderError::from_status(response.status(), url));
            }
            return Ok(response);
        }
        Err(ProviderError::Auth(url.to_string()))
    }

    async fn list_recordings(
        &self,
        user: &str,
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
    ) -> Result<Vec<ZoomMeeting>, ProviderError> {
        let url = format!("{API_BASE}/users/{user}/recordings");
        let mut meetings = Vec::new();
        let mut page_token = String::new();

        loop {
            let mut query = vec![
                ("page_size", "300".to_string()),
                ("from", from.format("%Y-%m-%d").to_string()),
                ("to", to.format("%Y-%m-%d").to_string()),
            ];
            if !page_token.is_empty() {
                query.push(("next_page_token", page_token.clone()));
            }

            let page: RecordingsPage = self.request(Method::GET, &url, &query).await?.json().await?;
            meetings.extend(page.meetings);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = token,
                _ => break,
            }
        }

        Ok(meetings)
    }
}

/// The Zoom console formats meeting ids with spaces ("123 456 7890");
/// the API reports them as plain numbers.
fn normalize_meeting_id(id: &str) -> String {
    id.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn match_meeting<'m>(meetings: &'m [ZoomMeeting], session: &RecordingSession) -> Option<&'m ZoomMeeting> {
    let wanted = normalize_meeting_id(&session.id);
    meetings
        .iter()
        .find(|meeting| !wanted.is_empty() && meeting.id.to_string() == wanted)
        .or_else(|| meetings.iter().find(|meeting| meeting.topic == session.topic))
}

fn with_access_token(download_url: &str, token: &str) -> String {
    let separator = if download_url.contains('?') { '&' } else { '?' };
    format!("{download_url}{separator}access_token={token}")
}

impl From<&ZoomMeeting> for RemoteRecording {
    fn from(meeting: &ZoomMeeting) -> Self {
        RemoteRecording {
            uuid: meeting.uuid.clone(),
            meeting_id: meeting.id.to_string(),
            topic: meeting.topic.clone(),
            files: meeting
                .recording_files
                .iter()
                .map(|file| RemoteFile {
                    id: file.id.clone(),
                    file_type: file.file_type.clone(),
                    size: file.file_size,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl RecordingSource for ZoomClient {
    async fn find_recording(
        &self,
        session: &RecordingSession,
    ) -> Result<Option<RemoteRecording>, ProviderError> {
        // The manifest's start time may be minutes off the API's; a one-day
        // window either side is enough to find the meeting.
        let date = session.start_time.date();
        let from = date - chrono::Duration::days(1);
        let to = date + chrono::Duration::days(1);

        let meetings = self.list_recordings(&session.host, from, to).await?;
        Ok(match_meeting(&meetings, session).map(RemoteRecording::from))
    }

    async fn download_file(&self, download_url: &str, dest: &Path) -> Result<u64, ProviderError> {
        for refreshed in [false, true] {
            let token = self.token.read().await.clone();
            let url = with_access_token(download_url, &token);
            let mut response = self.http.get(&url).bearer_auth(&token).send().await?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                self.refresh_token().await?;
                continue;
            }
            if !response.status().is_success() {
                return Err(ProviderError::from_status(response.status(), download_url));
            }

            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(dest).await?;
            let mut bytes: u64 = 0;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                bytes += chunk.len() as u64;
            }
            file.flush().await?;
            return Ok(bytes);
        }
        Err(ProviderError::Auth(download_url.to_string()))
    }

    async fn delete_recording(&self, meeting_uuid: &str) -> Result<(), ProviderError> {
        let url = format!("{API_BASE}/meetings/{meeting_uuid}/recordings");
        self.request(Method::DELETE, &url, &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::RecordingSession;

    fn meeting(id: i64, uuid: &str, topic: &str) -> ZoomMeeting {
        ZoomMeeting {
            uuid: uuid.to_string(),
            id,
            topic: topic.to_string(),
            recording_files: Vec::new(),
        }
    }

    fn session(id: &str, topic: &str) -> RecordingSession {
        RecordingSession {
            id: id.to_string(),
            host: "a@example.com".to_string(),
            topic: topic.to_string(),
            start_time: chrono::NaiveDateTime::parse_from_str(
                "2025-08-07 10:30:00",
                "%Y-%m-%d %H:%M:%S",
            )
            .unwrap(),
            start_time_raw: "Aug 07, 2025 10:30:00 AM".to_string(),
            file_count: 0,
            folder_name: "Sync".to_string(),
            files: Vec::new(),
        }
    }

    #[test]
    fn test_meeting_id_matching_ignores_console_formatting() {
        let meetings = vec![
            meeting(1234567890, "uuid-a", "Other"),
            meeting(999, "uuid-b", "Sync"),
        ];
        let found = match_meeting(&meetings, &session("123 456 7890", "Sync")).unwrap();
        assert_eq!(found.uuid, "uuid-a");
    }

    #[test]
    fn test_topic_fallback_when_id_does_not_match() {
        let meetings = vec![meeting(999, "uuid-b", "Weekly Sync")];
        let found = match_meeting(&meetings, &session("111", "Weekly Sync")).unwrap();
        assert_eq!(found.uuid, "uuid-b");
        assert!(match_meeting(&meetings, &session("111", "Unknown")).is_none());
    }

    #[test]
    fn test_access_token_appended_with_right_separator() {
        assert_eq!(
            with_access_token("https://zoom.example/rec/a", "tok"),
            "https://zoom.example/rec/a?access_token=tok"
        );
        assert_eq!(
            with_access_token("https://zoom.example/rec/a?x=1", "tok"),
            "https://zoom.example/rec/a?x=1&access_token=tok"
        );
    }

    #[test]
    fn test_recordings_page_parses_api_shape() {
        let raw = r#"{
            "meetings": [{
                "uuid": "u1==",
                "id": 123,
                "topic": "Sync",
                "start_time": "2025-08-07T13:30:00Z",
                "recording_files": [{
                    "id": "f1",
                    "file_type": "MP4",
                    "file_size": 1000,
                    "download_url": "https://zoom.example/rec/f1"
                }]
            }],
            "next_page_token": ""
        }"#;
        let page: RecordingsPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.meetings.len(), 1);
        let remote = RemoteRecording::from(&page.meetings[0]);
        assert_eq!(remote.uuid, "u1==");
        assert_eq!(remote.meeting_id, "123");
        assert_eq!(remote.files.len(), 1);
        assert_eq!(remote.files[0].size, 1000);
    }
}
