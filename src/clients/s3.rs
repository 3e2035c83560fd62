// dynamotool/src/clients/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::DateTime;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration};
use tokio::io::AsyncReadExt;

use super::{BucketStatus, ObjectBody, ObjectInfo, ObjectReader, ObjectStore};
use crate::config::AwsSettings;
use crate::errors::{AppError, Result};
use crate::utils::aws::load_sdk_config;

/// Bodies up to this size go out as a single PutObject; larger ones use
/// multipart upload with parts of this size.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Region that rejects an explicit location constraint.
const US_EAST_1: &str = "us-east-1";

fn storage_error<E>(what: String, err: E) -> AppError
where
    E: std::error::Error,
{
    AppError::StorageIo(format!("{}: {}", what, DisplayErrorContext(err)))
}

#[derive(Clone)]
pub struct S3Store {
    client: s3::Client,
    region: String,
}

impl S3Store {
    pub async fn connect(settings: &AwsSettings) -> Self {
        let sdk_config = load_sdk_config(settings).await;
        let mut builder = s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint_url {
            // S3-compatible endpoints (MinIO, Spaces) want path-style addressing.
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: s3::Client::from_conf(builder.build()),
            region: settings.region.clone(),
        }
    }

    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        first_part: Vec<u8>,
        mut body: ObjectReader,
    ) -> Result<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error(format!("Failed to start multipart upload s3://{}/{}", bucket, key), e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| AppError::StorageIo(format!("No upload id returned for s3://{}/{}", bucket, key)))?
            .to_string();

        let result = self.upload_parts(bucket, key, &upload_id, first_part, &mut body).await;
        if result.is_err() {
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!(bucket, key, error = %DisplayErrorContext(&abort_err), "failed to abort multipart upload");
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        body: &mut ObjectReader,
    ) -> Result<u64> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut chunk = first_part;
        let mut part_number = 1;

        while !chunk.is_empty() {
            total += chunk.len() as u64;
            let uploaded = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| {
                    storage_error(format!("Failed to upload part {} of s3://{}/{}", part_number, bucket, key), e)
                })?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
            chunk = read_part(body).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| storage_error(format!("Failed to complete multipart upload s3://{}/{}", bucket, key), e))?;
        Ok(total)
    }
}

/// Reads up to one part's worth of bytes. A short read means end of body.
async fn read_part(body: &mut ObjectReader) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(PART_SIZE.min(64 * 1024));
    body.as_mut()
        .take(PART_SIZE as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| AppError::StorageIo(format!("Failed to read upload body: {}", e)))?;
    Ok(buf)
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectInfo>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix(prefix.filter(|p| !p.is_empty()).map(str::to_string))
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| storage_error(format!("Failed to list objects in {}", bucket), e))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }
        }
        tracing::debug!(bucket, prefix = prefix.unwrap_or(""), count = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error(format!("Failed to get object s3://{}/{}", bucket, key), e))?;

        let content_length = object.content_length().unwrap_or(0).max(0) as u64;
        Ok(ObjectBody {
            content_length,
            reader: Box::pin(object.body.into_async_read()),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectReader,
        content_length: Option<u64>,
    ) -> Result<u64> {
        let first = read_part(&mut body).await?;
        if first.len() == PART_SIZE {
            return self.multipart_upload(bucket, key, first, body).await;
        }

        let len = first.len() as u64;
        if let Some(expected) = content_length {
            if expected != len {
                return Err(AppError::StorageIo(format!(
                    "Body for s3://{}/{} was {} bytes, expected {}",
                    bucket, key, len, expected
                )));
            }
        }

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(len as i64)
            .body(ByteStream::from(first))
            .send()
            .await
            .map_err(|e| storage_error(format!("Failed to upload s3://{}/{}", bucket, key), e))?;
        Ok(len)
    }

    async fn head_bucket(&self, bucket: &str) -> Result<BucketStatus> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(BucketStatus::Exists),
            Err(err) => {
                let service_not_found = err.as_service_error().is_some_and(|e| e.is_not_found());
                let status_not_found = err.raw_response().is_some_and(|r| r.status().as_u16() == 404);
                if service_not_found || status_not_found {
                    Ok(BucketStatus::NotFound)
                } else {
                    // Access denied, wrong region and friends are not "missing".
                    Err(AppError::BucketProvisioning(format!(
                        "Could not check bucket {}: {}",
                        bucket,
                        DisplayErrorContext(&err)
                    )))
                }
            }
        }
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if region != US_EAST_1 {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request.send().await.map_err(|e| {
            AppError::BucketProvisioning(format!(
                "Failed to create bucket {} in {}: {}",
                bucket,
                region,
                DisplayErrorContext(&e)
            ))
        })?;
        tracing::info!(bucket, region, "created bucket");
        Ok(())
    }

    fn default_region(&self) -> &str {
        &self.region
    }
}
