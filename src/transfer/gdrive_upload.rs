// panelbackup/src/transfer/gdrive_upload.rs
//! Google Drive folder destination over the Drive v3 REST API.
//!
//! Uploads use a resumable session: the file goes up in chunks and a failed
//! chunk is resent from the offset the server acknowledged, not from zero.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{RemoteStat, RemoteStore, Uploaded};
use crate::backup::Artifact;
use crate::config::{FolderStoreConfig, TokenSource};
use crate::errors::TransferError;
use crate::utils::clock::Clock;
use crate::utils::digest::md5_file;
use crate::utils::retry::RetryPolicy;

const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const DRIVE_SCOPES: &[&str] = &["https://www.googleapis.com/auth/drive"];

/// Resumable chunks must be multiples of this, except the last one.
const CHUNK_QUANTUM: u64 = 256 * 1024;

const ARCHIVE_MIME: &str = "application/gzip";

#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata {
    size: Option<String>,
    md5_checksum: Option<String>,
}

/// Server acknowledgement of one chunk.
#[derive(Debug, PartialEq, Eq)]
enum ChunkAck {
    /// More bytes expected, starting at this offset.
    Incomplete(u64),
    Done(String),
}

/// Source of the bearer token sent with every Drive API call.
enum DriveAuth {
    /// Pre-issued token, re-read on every call so a rotated file or variable is picked up.
    Static(TokenSource),
    /// Service account key; `gcp_auth` mints tokens and refreshes them before they expire.
    ServiceAccount {
        key_file: PathBuf,
        account: OnceCell<CustomServiceAccount>,
    },
}

impl DriveAuth {
    fn from_source(source: &TokenSource) -> Self {
        match source {
            TokenSource::ServiceAccount(key_file) => DriveAuth::ServiceAccount {
                key_file: key_file.clone(),
                account: OnceCell::new(),
            },
            other => DriveAuth::Static(other.clone()),
        }
    }

    async fn bearer(&self) -> Result<String, TransferError> {
        match self {
            DriveAuth::Static(source) => source
                .resolve()
                .map(|token| token.expose().to_string())
                .map_err(|e| TransferError::Rejected(format!("credentials: {:#}", e))),
            DriveAuth::ServiceAccount { key_file, account } => {
                let account = account
                    .get_or_try_init(|| async { CustomServiceAccount::from_file(key_file) })
                    .await
                    .map_err(|e| {
                        TransferError::Rejected(format!("credentials: service account key {}: {}", key_file.display(), e))
                    })?;
                let token = account
                    .token(DRIVE_SCOPES)
                    .await
                    .map_err(|e| TransferError::Transport(format!("token request failed: {}", e)))?;
                Ok(token.as_str().to_string())
            }
        }
    }
}

pub struct DriveStore {
    client: Client,
    auth: DriveAuth,
    files_url: String,
    upload_url: String,
    folder_id: String,
    chunk_size: u64,
    chunk_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DriveStore {
    /// Credentials are read on first use, so a missing token fails the upload, not the setup.
    pub fn new(config: &FolderStoreConfig, chunk_size: u64, chunk_policy: RetryPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        // 308 is "resume incomplete" here, not a redirect.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client for Google Drive")?;
        Ok(Self {
            client,
            auth: DriveAuth::from_source(&config.access_token),
            files_url: DRIVE_FILES_URL.to_string(),
            upload_url: DRIVE_UPLOAD_URL.to_string(),
            folder_id: config.folder_id.clone(),
            chunk_size: normalize_chunk_size(chunk_size),
            chunk_policy,
            clock,
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base: &str) -> Self {
        self.files_url = format!("{}/drive/v3/files", base);
        self.upload_url = format!("{}/upload/drive/v3/files", base);
        self
    }

    async fn start_session(&self, name: &str, total: u64) -> Result<String, TransferError> {
        let response = self
            .client
            .post(&self.upload_url)
            .bearer_auth(self.auth.bearer().await?)
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .header("X-Upload-Content-Type", ARCHIVE_MIME)
            .header("X-Upload-Content-Length", total.to_string())
            .json(&json!({ "name": name, "parents": [self.folder_id] }))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| TransferError::Transport("resumable session started without a Location header".into()))
    }

    async fn send_chunk(&self, session: &str, offset: u64, data: Vec<u8>, total: u64) -> Result<ChunkAck, TransferError> {
        let mut request = self.client.put(session).header(CONTENT_LENGTH, data.len().to_string());
        if !data.is_empty() {
            let last = offset + data.len() as u64 - 1;
            request = request.header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, last, total));
        }
        let response = request.body(data).send().await?;
        read_ack(response).await
    }

    /// Asks the server how many bytes of the session it has.
    async fn query_offset(&self, session: &str, total: u64) -> Result<ChunkAck, TransferError> {
        let response = self
            .client
            .put(session)
            .header(CONTENT_LENGTH, "0")
            .header(CONTENT_RANGE, format!("bytes */{}", total))
            .send()
            .await?;
        read_ack(response).await
    }

    async fn pause(&self, attempts: u32, cancel: &CancellationToken) -> Result<(), TransferError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = self.clock.sleep(self.chunk_policy.next_delay(attempts)) => Ok(()),
        }
    }

    async fn upload_resumable(&self, artifact: &Artifact, session: &str, cancel: &CancellationToken) -> Result<String, TransferError> {
        let total = artifact.size_bytes;
        let mut file = File::open(&artifact.path).await?;
        let mut offset = 0u64;
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let len = self.chunk_size.min(total.saturating_sub(offset));
            let mut buf = vec![0u8; usize::try_from(len).map_err(|_| TransferError::Rejected("chunk too large".into()))?];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf).await?;

            let sent = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                sent = self.send_chunk(session, offset, buf, total) => sent,
            };
            let ack = match sent {
                Ok(ack) => {
                    failures = 0;
                    ack
                }
                Err(err) if err.is_transient() && self.chunk_policy.allows_another(failures + 1) => {
                    failures += 1;
                    warn!(offset, attempt = failures, error = %err, "Chunk upload failed, resuming");
                    self.pause(failures, cancel).await?;
                    self.query_offset(session, total).await?
                }
                Err(err) => return Err(err),
            };

            match ack {
                ChunkAck::Done(id) => return Ok(id),
                ChunkAck::Incomplete(next) => {
                    debug!(offset = next, total, "Chunk acknowledged");
                    offset = next;
                }
            }
        }
    }

    async fn list_folder(&self, query: &str, order_by: Option<&str>) -> Result<Vec<FileRef>, TransferError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.to_string()),
                ("fields", "nextPageToken,files(id,name,createdTime)".to_string()),
                ("spaces", "drive".to_string()),
                ("supportsAllDrives", "true".to_string()),
                ("includeItemsFromAllDrives", "true".to_string()),
            ];
            if let Some(order) = order_by {
                params.push(("orderBy", order.to_string()));
            }
            if let Some(token) = page_token.take() {
                params.push(("pageToken", token));
            }
            let response = self
                .client
                .get(&self.files_url)
                .bearer_auth(self.auth.bearer().await?)
                .query(&params)
                .send()
                .await?;
            let page: FileList = ensure_success(response).await?.json().await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    async fn exists(&self, name: &str) -> Result<bool, TransferError> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(&self.folder_id)
        );
        Ok(!self.list_folder(&query, None).await?.is_empty())
    }

    async fn put(&self, artifact: &Artifact, name: &str, cancel: &CancellationToken) -> Result<Uploaded, TransferError> {
        let expected_checksum = md5_file(&artifact.path).await?;
        info!(folder = %self.folder_id, name, "Uploading to Google Drive");

        let session = self.start_session(name, artifact.size_bytes).await?;
        let file_id = self.upload_resumable(artifact, &session, cancel).await?;
        info!(file_id = %file_id, "Google Drive upload finished");

        Ok(Uploaded {
            handle: file_id,
            bytes: artifact.size_bytes,
            expected_checksum: Some(expected_checksum),
        })
    }

    async fn stat(&self, uploaded: &Uploaded) -> Result<Option<RemoteStat>, TransferError> {
        let response = self
            .client
            .get(format!("{}/{}", self.files_url, uploaded.handle))
            .bearer_auth(self.auth.bearer().await?)
            .query(&[("fields", "size,md5Checksum"), ("supportsAllDrives", "true")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let metadata: FileMetadata = ensure_success(response).await?.json().await?;
        let size = metadata
            .size
            .as_deref()
            .map(str::parse::<u64>)
            .transpose()
            .map_err(|e| TransferError::Transport(format!("invalid size in file metadata: {}", e)))?
            .unwrap_or(0);
        Ok(Some(RemoteStat {
            size,
            checksum: metadata.md5_checksum,
        }))
    }

    async fn purge(&self, keep: usize) -> Result<Vec<String>, TransferError> {
        let query = format!("'{}' in parents and trashed = false", escape_query(&self.folder_id));
        let files = self.list_folder(&query, Some("createdTime desc")).await?;

        let mut deleted = Vec::new();
        for file in files.into_iter().skip(keep) {
            let response = self
                .client
                .delete(format!("{}/{}", self.files_url, file.id))
                .bearer_auth(self.auth.bearer().await?)
                .query(&[("supportsAllDrives", "true")])
                .send()
                .await?;
            ensure_success(response).await?;
            deleted.push(if file.name.is_empty() { file.id } else { file.name });
        }
        Ok(deleted)
    }
}

async fn ensure_success(response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(TransferError::Http {
        status: status.as_u16(),
        message: message.trim().chars().take(500).collect(),
    })
}

async fn read_ack(response: Response) -> Result<ChunkAck, TransferError> {
    match response.status() {
        StatusCode::PERMANENT_REDIRECT => {
            let range = response.headers().get(RANGE).and_then(|v| v.to_str().ok());
            Ok(ChunkAck::Incomplete(range.and_then(parse_range_header).unwrap_or(0)))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            // The session expired; only a fresh transfer can recover.
            Err(TransferError::Transport("resumable upload session expired".into()))
        }
        _ => {
            let file: FileRef = ensure_success(response).await?.json().await?;
            Ok(ChunkAck::Done(file.id))
        }
    }
}

/// `bytes=0-524287` → next offset 524288.
fn parse_range_header(value: &str) -> Option<u64> {
    let (_, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    end.trim().parse::<u64>().ok().map(|last| last + 1)
}

fn normalize_chunk_size(chunk_size: u64) -> u64 {
    (chunk_size / CHUNK_QUANTUM).max(1) * CHUNK_QUANTUM
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
