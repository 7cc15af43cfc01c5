// panelbackup/src/transfer/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::http::HttpResponse;
use s3::config::{Credentials, Region};
use s3::error::{DisplayErrorContext, SdkError};
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{RemoteStat, RemoteStore, Uploaded};
use crate::backup::Artifact;
use crate::config::{ObjectStoreConfig, S3Credentials};
use crate::errors::TransferError;
use crate::utils::clock::Clock;
use crate::utils::digest::{md5_bytes, md5_file, multipart_etag};
use crate::utils::retry::RetryPolicy;

/// S3 refuses more parts than this in one multipart upload.
const MAX_PARTS: u64 = 10_000;

/// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO...).
pub struct S3Store {
    client: s3::Client,
    bucket: String,
    prefix: String,
    verify_etag: bool,
    chunk_size: u64,
    part_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl S3Store {
    /// Builds the SDK client. Credentials are resolved lazily on the first request.
    pub async fn connect(config: &ObjectStoreConfig, chunk_size: u64, part_policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        loader = match &config.credentials {
            S3Credentials::Static {
                access_key_id,
                secret_access_key,
            } => loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key.expose(),
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            )),
            S3Credentials::Profile(profile) => loader.profile_name(profile),
            S3Credentials::DefaultChain => loader,
        };
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: config.bucket_name.clone(),
            prefix: config.key_prefix.clone(),
            verify_etag: config.verify_etag,
            chunk_size,
            part_policy,
            clock,
        }
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteStat>, TransferError> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => Ok(Some(RemoteStat {
                size: output.content_length().and_then(|len| u64::try_from(len).ok()).unwrap_or(0),
                checksum: output.e_tag().map(str::to_string),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) if status_of(&err) == Some(404) => Ok(None),
            Err(err) => Err(sdk_failure("HeadObject", err)),
        }
    }

    async fn put_single(&self, artifact: &Artifact, key: &str, cancel: &CancellationToken) -> Result<Uploaded, TransferError> {
        let expected_checksum = if self.verify_etag {
            Some(md5_file(&artifact.path).await?)
        } else {
            None
        };
        let body = ByteStream::from_path(&artifact.path)
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(i64::try_from(artifact.size_bytes).unwrap_or(i64::MAX))
            .body(body)
            .send();
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            sent = request => { sent.map_err(|e| sdk_failure("PutObject", e))?; }
        }

        Ok(Uploaded {
            handle: key.to_string(),
            bytes: artifact.size_bytes,
            expected_checksum,
        })
    }

    async fn put_multipart(&self, artifact: &Artifact, key: &str, cancel: &CancellationToken) -> Result<Uploaded, TransferError> {
        let part_size = part_size_for(artifact.size_bytes, self.chunk_size);
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_failure("CreateMultipartUpload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| TransferError::Rejected("CreateMultipartUpload returned no upload id".into()))?
            .to_string();
        debug!(key, upload_id = %upload_id, part_size, "Started multipart upload");

        match self.upload_parts(artifact, key, &upload_id, part_size, cancel).await {
            Ok(uploaded) => Ok(uploaded),
            Err(err) => {
                // Parts of an unfinished upload are invisible but still billed.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(&abort_err), "Failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        artifact: &Artifact,
        key: &str,
        upload_id: &str,
        part_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Uploaded, TransferError> {
        let mut file = File::open(&artifact.path).await?;
        let mut remaining = artifact.size_bytes;
        let mut parts = Vec::new();
        let mut digests = Vec::new();
        let mut part_number: i32 = 0;

        while remaining > 0 {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            part_number += 1;
            let len = remaining.min(part_size);
            let mut buf = vec![0u8; usize::try_from(len).map_err(|_| TransferError::Rejected("part too large".into()))?];
            file.read_exact(&mut buf).await?;
            digests.push(md5_bytes(&buf));

            let e_tag = self.upload_part_with_retry(key, upload_id, part_number, buf, cancel).await?;
            parts.push(CompletedPart::builder().e_tag(e_tag).part_number(part_number).build());
            remaining -= len;
            debug!(key, part_number, remaining, "Uploaded part");
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| sdk_failure("CompleteMultipartUpload", e))?;

        Ok(Uploaded {
            handle: key.to_string(),
            bytes: artifact.size_bytes,
            expected_checksum: self.verify_etag.then(|| multipart_etag(&digests)),
        })
    }

    /// Retries just this part; earlier parts stay uploaded.
    async fn upload_part_with_retry(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let request = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data.clone()))
                .send();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                sent = request => sent.map_err(|e| sdk_failure("UploadPart", e)),
            };
            match result {
                Ok(output) => {
                    return output
                        .e_tag()
                        .map(str::to_string)
                        .ok_or_else(|| TransferError::Rejected(format!("UploadPart {} returned no ETag", part_number)));
                }
                Err(err) if err.is_transient() && self.part_policy.allows_another(attempts) => {
                    warn!(key, part_number, attempt = attempts, error = %err, "Part upload failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = self.clock.sleep(self.part_policy.next_delay(attempts)) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn list_backups(&self) -> Result<Vec<(String, i64, u32)>, TransferError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| sdk_failure("ListObjectsV2", e))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                // Only direct children of the prefix; nested "folders" are left alone.
                match key.strip_prefix(self.prefix.as_str()) {
                    Some(rest) if !rest.is_empty() && !rest.contains('/') => {}
                    _ => continue,
                }
                let (secs, nanos) = object
                    .last_modified()
                    .map(|t| (t.secs(), t.subsec_nanos()))
                    .unwrap_or((0, 0));
                objects.push((key.to_string(), secs, nanos));
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(objects)
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn exists(&self, name: &str) -> Result<bool, TransferError> {
        Ok(self.head(&self.key_for(name)).await?.is_some())
    }

    async fn put(&self, artifact: &Artifact, name: &str, cancel: &CancellationToken) -> Result<Uploaded, TransferError> {
        let key = self.key_for(name);
        info!(bucket = %self.bucket, key = %key, "Uploading to object storage");
        if artifact.size_bytes > self.chunk_size {
            self.put_multipart(artifact, &key, cancel).await
        } else {
            self.put_single(artifact, &key, cancel).await
        }
    }

    async fn stat(&self, uploaded: &Uploaded) -> Result<Option<RemoteStat>, TransferError> {
        let stat = self.head(&uploaded.handle).await?;
        Ok(stat.map(|s| RemoteStat {
            checksum: if self.verify_etag { s.checksum } else { None },
            ..s
        }))
    }

    async fn purge(&self, keep: usize) -> Result<Vec<String>, TransferError> {
        let mut objects = self.list_backups().await?;
        let doomed = oldest_beyond(&mut objects, keep);

        let mut deleted = Vec::with_capacity(doomed.len());
        for key in doomed {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| sdk_failure("DeleteObject", e))?;
            deleted.push(key);
        }
        Ok(deleted)
    }
}

/// Part size: the configured chunk, grown when the file would need more than [`MAX_PARTS`] parts.
fn part_size_for(total: u64, chunk_size: u64) -> u64 {
    let chunk_size = chunk_size.max(1);
    let min_for_limit = total.div_ceil(MAX_PARTS);
    chunk_size.max(min_for_limit)
}

/// Sorts newest first and returns the keys past the first `keep`.
fn oldest_beyond(objects: &mut [(String, i64, u32)], keep: usize) -> Vec<String> {
    objects.sort_by(|a, b| (b.1, b.2, &b.0).cmp(&(a.1, a.2, &a.0)));
    objects.iter().skip(keep).map(|(key, _, _)| key.clone()).collect()
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

fn sdk_failure<E>(operation: &str, err: SdkError<E, HttpResponse>) -> TransferError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = status_of(&err);
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));
    match (&err, status) {
        (SdkError::ConstructionFailure(_), _) => TransferError::Rejected(message),
        (SdkError::TimeoutError(_) | SdkError::DispatchFailure(_), _) => TransferError::Transport(message),
        (_, Some(status)) => TransferError::Http { status, message },
        _ => TransferError::Transport(message),
    }
}
