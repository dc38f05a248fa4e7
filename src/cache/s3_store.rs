use std::time::SystemTime;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::store::{ObjectMeta, TileStore};
use crate::error::CacheError;

/// Stores objects in an S3 (or S3-compatible) bucket under an optional prefix.
///
/// S3 reports `Last-Modified` with one-second resolution, so a descriptor
/// rewritten within the same second as a tile write does not invalidate it.
#[derive(Clone)]
pub struct S3TileStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3TileStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/", p))
            .unwrap_or_default();
        Self {
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn error(&self, key: &str, message: String) -> CacheError {
        CacheError::S3 {
            key: format!("s3://{}/{}", self.bucket, self.object_key(key)),
            message,
        }
    }
}

/// Whether an SDK error means the object does not exist. Some
/// S3-compatible services only say so in the message.
fn is_not_found(service_not_found: bool, message: &str) -> bool {
    service_not_found
        || message.contains("NotFound")
        || message.contains("NoSuchKey")
        || message.contains("404")
}

#[async_trait]
impl TileStore for S3TileStore {
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, CacheError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;

        let head = match result {
            Ok(head) => head,
            Err(e) => {
                let service_not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false)
                    || e.raw_response()
                        .map(|r| r.status().as_u16() == 404)
                        .unwrap_or(false);
                let message = e.to_string();
                if is_not_found(service_not_found, &message) {
                    return Ok(None);
                }
                return Err(self.error(key, message));
            }
        };

        let modified = head
            .last_modified()
            .and_then(|t| SystemTime::try_from(*t).ok())
            .ok_or_else(|| self.error(key, "missing Last-Modified".to_string()))?;

        Ok(Some(ObjectMeta {
            size: head.content_length().unwrap_or(0).max(0) as u64,
            modified,
        }))
    }

    async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let service_not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                let message = e.to_string();
                if is_not_found(service_not_found, &message) {
                    return Err(CacheError::NotFound(key.to_string()));
                }
                return Err(self.error(key, message));
            }
        };

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| self.error(key, e.to_string()))?
            .into_bytes();
        Ok(data)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), CacheError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.error(key, e.to_string()))?;
        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// A custom endpoint (MinIO and other S3-compatible services) switches the
/// client to path-style addressing.
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}
