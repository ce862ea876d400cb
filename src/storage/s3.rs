//! S3-compatible storage provider.
//!
//! Uploads stream through the multipart API so archives of unknown size
//! never need to be buffered whole; small bodies fall back to a single
//! `PutObject`. A failed multipart upload is aborted so no partial object
//! becomes observable.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;

use super::{BackupItem, BodyReader, Provider};
use crate::error::{Result, SnapError};

/// Part size for multipart uploads. S3 requires ≥ 5 MiB for all but the
/// final part.
const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for MinIO/R2 style deployments; enables path-style
    /// addressing.
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

pub struct S3Provider {
    client: Client,
    bucket: String,
}

impl S3Provider {
    pub async fn new(settings: S3Settings) -> Result<Self> {
        let mut endpoint = settings.endpoint.clone();
        if let Some(ep) = &mut endpoint {
            if !ep.contains("://") {
                *ep = format!("http://{ep}");
            }
        }

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key, &settings.secret_key)
        {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "stacksnap-static",
            ));
        }

        if let Some(ep) = &endpoint {
            loader = loader.endpoint_url(ep.clone());
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if endpoint.is_some() {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
        })
    }

    fn storage_err(context: &str, err: impl std::fmt::Display) -> SnapError {
        SnapError::Storage(format!("{context}: {err}"))
    }

    async fn upload_multipart(
        &self,
        key: &str,
        first_part: Vec<u8>,
        body: &mut BodyReader,
    ) -> Result<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                Self::storage_err("failed to start multipart upload", DisplayErrorContext(&e))
            })?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();

        let result = self
            .upload_parts(key, &upload_id, first_part, body)
            .await;

        if result.is_err() {
            let abort = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(e) = abort {
                tracing::warn!(
                    "Failed to abort multipart upload for {}: {}",
                    key,
                    DisplayErrorContext(&e)
                );
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        body: &mut BodyReader,
    ) -> Result<()> {
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut chunk = first_part;

        loop {
            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| {
                    Self::storage_err("failed to upload part", DisplayErrorContext(&e))
                })?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(response.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;

            chunk = read_part(body).await?;
            if chunk.is_empty() {
                break;
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                Self::storage_err("failed to complete multipart upload", DisplayErrorContext(&e))
            })?;
        Ok(())
    }
}

/// Read up to one part worth of bytes, returning short only at EOF.
async fn read_part(body: &mut BodyReader) -> Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(PART_SIZE.min(1024 * 1024));
    let mut buf = [0u8; 64 * 1024];
    while chunk.len() < PART_SIZE {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        chunk.extend_from_slice(&buf[..n]);
    }
    Ok(chunk)
}

#[async_trait]
impl Provider for S3Provider {
    async fn upload(&self, key: &str, mut body: BodyReader) -> Result<()> {
        let first = read_part(&mut body).await?;

        if first.len() < PART_SIZE {
            // Whole body fits in one part.
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(|e| Self::storage_err("failed to upload", DisplayErrorContext(&e)))?;
            return Ok(());
        }

        self.upload_multipart(key, first, &mut body).await
    }

    async fn download(&self, key: &str) -> Result<BodyReader> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::storage_err("failed to download", DisplayErrorContext(&e)))?;
        Ok(Box::new(response.body.into_async_read()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupItem>> {
        let mut items = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token.clone());
            }

            let response = request.send().await.map_err(|e| {
                Self::storage_err("failed to list objects", DisplayErrorContext(&e))
            })?;

            for object in response.contents() {
                let modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0))
                    .unwrap_or_else(Utc::now);
                items.push(BackupItem {
                    key: object.key().unwrap_or_default().to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified: modified,
                });
            }

            continuation = response.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }

        Ok(items)
    }
}
