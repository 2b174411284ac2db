use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::core::config::DriveConfig;
use crate::core::providers::{ProviderError, StorageDestination};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Authorized-user credentials as written by Google's OAuth tooling.
/// The refresh token must be provisioned ahead of time: an unattended
/// migration cannot stop to open a browser.
#[derive(Debug, Clone, Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Google Drive client. One folder per session is created under the
/// configured root; uploads go through Drive's resumable protocol in a
/// single shot (an interrupted upload is retried from scratch, never
/// resumed part-way).
pub struct DriveClient {
    http: reqwest::Client,
    credentials: AuthorizedUser,
    token: RwLock<String>,
    root_id: String,
    folder_cache: Mutex<HashMap<String, String>>,
}

impl DriveClient {
    pub async fn connect(config: &DriveConfig) -> Result<Self, ProviderError> {
        let raw = std::fs::read_to_string(&config.credentials_file)?;
        let credentials: AuthorizedUser = serde_json::from_str(&raw).map_err(|err| {
            ProviderError::Protocol(format!(
                "invalid drive credentials {}: {err}",
                config.credentials_file.display()
            ))
        })?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        let token = Self::fetch_token(&http, &credentials).await?;

        let mut client = Self {
            http,
            credentials,
            token: RwLock::new(token),
            root_id: String::new(),
            folder_cache: Mutex::new(HashMap::new()),
        };
        client.root_id = client.ensure_folder(&config.root_folder, "root").await?;
        debug!(root = %config.root_folder, id = %client.root_id, "drive root folder ready");
        Ok(client)
    }

    async fn fetch_token(
        http: &reqwest::Client,
        credentials: &AuthorizedUser,
    ) -> Result<String, ProviderError> {
        let response = http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("refresh_token", credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Auth(format!(
                "drive token refresh failed with HTTP {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        token
            .access_token
            .ok_or_else(|| ProviderError::Auth("no access_token in drive token response".to_string()))
    }

    async fn refresh_token(&self) -> Result<(), ProviderError> {
        debug!("refreshing drive access token");
        let token = Self::fetch_token(&self.http, &self.credentials).await?;
        *self.token.write().await = token;
        Ok(())
    }

    /// Sends one API request, refreshing the token once on 401. A JSON
    /// body, when present, is cheap to clone across the retry.
    async fn request(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ProviderError> {
        for refreshed in [false, true] {
            let token = self.token.read().await.clone();
            let mut builder = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&token)
                .query(query);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let response = builder.send().await?;

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

    async fn find_folder(&self, name: &str, parent: &str) -> Result<Option<String>, ProviderError> {
        let q = format!(
            "name = '{}' and mimeType = '{FOLDER_MIME}' and '{}' in parents and trashed = false",
            escape_query(name),
            parent
        );
        let response = self
            .request(
                Method::GET,
                FILES_URL,
                &[("q", q.as_str()), ("fields", "files(id)"), ("pageSize", "10")],
                None,
            )
            .await?;
        let list: FileList = response.json().await?;
        Ok(list.files.into_iter().next().map(|file| file.id))
    }

    async fn create_folder(&self, name: &str, parent: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent],
        });
        let response = self
            .request(Method::POST, FILES_URL, &[("fields", "id")], Some(&body))
            .await?;
        let created: DriveFile = response.json().await?;
        Ok(created.id)
    }

    async fn ensure_folder(&self, name: &str, parent: &str) -> Result<String, ProviderError> {
        match self.find_folder(name, parent).await? {
            Some(id) => Ok(id),
            None => self.create_folder(name, parent).await,
        }
    }

    /// Resolve-or-create a session folder under the root, memoized per run.
    async fn session_folder(&self, folder: &str) -> Result<String, ProviderError> {
        if let Some(id) = self.folder_cache.lock().await.get(folder) {
            return Ok(id.clone());
        }
        let id = self.ensure_folder(folder, &self.root_id).await?;
        self.folder_cache
            .lock()
            .await
            .insert(folder.to_string(), id.clone());
        Ok(id)
    }
}

/// Drive query strings quote values with single quotes.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl StorageDestination for DriveClient {
    async fn upload_file(
        &self,
        local: &Path,
        folder: &str,
        name: &str,
    ) -> Result<String, ProviderError> {
        let folder_id = self.session_folder(folder).await?;
        let size = tokio::fs::metadata(local).await?.len();

        let metadata = serde_json::json!({
            "name": name,
            "parents": [folder_id],
        });
        let init = self
            .request(
                Method::POST,
                UPLOAD_URL,
                &[("uploadType", "resumable")],
                Some(&metadata),
            )
            .await?;
        let session_uri = init
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::Protocol("upload session response missing Location".to_string())
            })?;

        let file = tokio::fs::File::open(local).await?;
        let token = self.token.read().await.clone();
        let response = self
            .http
            .put(&session_uri)
            .bearer_auth(&token)
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_status(response.status(), &session_uri));
        }

        let uploaded: DriveFile = response.json().await?;
        debug!(file = name, id = %uploaded.id, bytes = size, "uploaded to drive");
        Ok(uploaded.id)
    }

    async fn count_files(&self, folder: &str) -> Result<usize, ProviderError> {
        // A session folder that was never created simply holds nothing.
        let Some(folder_id) = self.find_folder(folder, &self.root_id).await? else {
            return Ok(0);
        };

        let q = format!("'{folder_id}' in parents and trashed = false");
        let mut count = 0;
        let mut page_token = String::new();

        loop {
            let list: FileList = {
                let mut query = vec![
                    ("q", q.as_str()),
                    ("fields", "files(id),nextPageToken"),
                    ("pageSize", "1000"),
                ];
                if !page_token.is_empty() {
                    query.push(("pageToken", page_token.as_str()));
                }
                self.request(Method::GET, FILES_URL, &query, None)
                    .await?
                    .json()
                    .await?
            };
            count += list.files.len();

            match list.next_page_token {
                Some(token) if !token.is_empty() => page_token = token,
                _ => break,
            }
        }

        Ok(count)
    }
}
