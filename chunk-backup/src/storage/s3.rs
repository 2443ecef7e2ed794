//! S3-compatible backend built on `aws-sdk-s3`.
//!
//! The client is assembled from an explicit [`StorageConfig`]; nothing is read
//! from the ambient AWS profile or environment at this layer.

use super::{BlobStore, StorageError};
use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "chunk-backup",
        );

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn head(&self, bucket: &str, key: &str) -> Result<u64, StorageError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(output.content_length().unwrap_or_default().max(0) as u64),
            Err(err) => match err.into_service_error() {
                HeadObjectError::NotFound(_) => Err(StorageError::not_found(bucket, key)),
                other => Err(StorageError::Backend(format!(
                    "head {}/{}: {}",
                    bucket,
                    key,
                    DisplayErrorContext(&other)
                ))),
            },
        }
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) => {
                return match err.into_service_error() {
                    GetObjectError::NoSuchKey(_) => Err(StorageError::not_found(bucket, key)),
                    other => Err(StorageError::Backend(format!(
                        "get {}/{}: {}",
                        bucket,
                        key,
                        DisplayErrorContext(&other)
                    ))),
                };
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("read body of {}/{}: {}", bucket, key, e)))?;

        let data = body.into_bytes().to_vec();
        debug!("Fetched {}/{} ({} bytes)", bucket, key, data.len());
        Ok(data)
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| {
                StorageError::Backend(format!(
                    "put {}/{}: {}",
                    bucket,
                    key,
                    DisplayErrorContext(&err)
                ))
            })?;

        debug!("Stored {}/{} ({} bytes)", bucket, key, data.len());
        Ok(())
    }
}
