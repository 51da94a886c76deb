use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Object storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object storage unavailable: {0}")]
    Unavailable(String),
}

/// A stored binary: where it is served from and how to delete it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredObject {
    pub url: String,
    pub object_id: String,
}

/// Gateway to the image object store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `data` under `folder`, naming it after `name`.
    async fn store(
        &self,
        data: Bytes,
        folder: &str,
        name: &str,
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;

    /// Best-effort removal; `false` when the object could not be deleted.
    async fn delete(&self, object_id: &str) -> bool;
}

/// S3-backed object store with public URLs
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        }
    }

    /// Public URL an object key is served from
    pub fn public_url(&self, key: &str) -> String {
        public_url_for(&self.config, key)
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to upload object: {e}")))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to create multipart upload: {e}")))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Unavailable("no upload ID in response".to_string()))?;

        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);

        for (index, chunk) in data.chunks(part_size).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data.slice_ref(chunk)))
                .send()
                .await
                .map_err(|e| StorageError::Unavailable(format!("failed to upload part: {e}")))?;

            completed_parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to complete multipart upload: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn store(
        &self,
        data: Bytes,
        folder: &str,
        name: &str,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let key = object_key(folder, name, content_type);

        debug!(key = %key, "Uploading image to S3");

        let size_bytes = data.len();
        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(&key, data, content_type).await?;
        } else {
            self.simple_upload(&key, data, content_type).await?;
        }

        info!(key = %key, size_bytes, "Image uploaded");
        metrics::counter!("photo.storage.uploads").increment(1);

        Ok(StoredObject {
            url: self.public_url(&key),
            object_id: key,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, object_id: &str) -> bool {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_id)
            .send()
            .await
        {
            Ok(_) => {
                debug!(key = %object_id, "Object deleted from S3");
                true
            }
            Err(e) => {
                warn!(key = %object_id, error = %e, "Failed to delete object from S3");
                false
            }
        }
    }
}

/// Build `{folder}/{name}.{ext}` with sanitized components
pub fn object_key(folder: &str, name: &str, content_type: &str) -> String {
    let folder = folder
        .split('/')
        .filter(|c| !c.is_empty())
        .map(sanitize_path_component)
        .collect::<Vec<_>>()
        .join("/");

    format!(
        "{folder}/{name}.{ext}",
        name = sanitize_path_component(name),
        ext = extension_for(content_type)
    )
}

fn public_url_for(config: &S3Config, key: &str) -> String {
    match &config.public_base_url {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
        None => match &config.endpoint_url {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), config.bucket, key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                config.bucket, config.region, key
            ),
        },
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// File extension for an image content type
fn extension_for(content_type: &str) -> &'static str {
    match content_type.to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/gif" => "gif",
        _ => "bin",
    }
}
