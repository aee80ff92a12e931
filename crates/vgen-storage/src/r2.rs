//! Cloudflare R2 store over the S3 API.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};
use vgen_models::{ArtifactRef, ContentKind, TaskId};

use crate::error::{StorageError, StorageOp, StorageResult};
use crate::keys::validate_key;
use crate::store::ArtifactStore;

/// Returned by R2 when `If-None-Match: *` meets an existing object.
const PRECONDITION_FAILED: u16 = 412;

/// Bucket coordinates and credentials.
#[derive(Clone)]
pub struct R2Config {
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// `auto` unless the account pins one
    pub region: String,
}

impl std::fmt::Debug for R2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R2Config")
            .field("endpoint_url", &self.endpoint_url)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl R2Config {
    pub fn from_env() -> StorageResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Every missing variable is reported,
    /// not only the first.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StorageResult<Self> {
        let mut missing = Vec::new();
        let mut required = |name: &'static str| {
            lookup(name).filter(|v| !v.is_empty()).unwrap_or_else(|| {
                missing.push(name);
                String::new()
            })
        };

        let config = Self {
            endpoint_url: required("R2_ENDPOINT_URL"),
            access_key_id: required("R2_ACCESS_KEY_ID"),
            secret_access_key: required("R2_SECRET_ACCESS_KEY"),
            bucket: required("R2_BUCKET_NAME"),
            region: lookup("R2_REGION").unwrap_or_else(|| "auto".to_string()),
        };

        if missing.is_empty() {
            Ok(config)
        } else {
            Err(StorageError::config(format!("missing {}", missing.join(", "))))
        }
    }

    /// A bucket name in the environment selects R2 over the local store.
    pub fn is_configured() -> bool {
        std::env::var("R2_BUCKET_NAME").is_ok_and(|v| !v.is_empty())
    }
}

#[derive(Clone)]
pub struct R2Store {
    client: Client,
    bucket: String,
}

impl R2Store {
    pub fn new(config: R2Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "vgen-r2",
        );
        let s3 = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3),
            bucket: config.bucket,
        }
    }

    pub fn from_env() -> StorageResult<Self> {
        R2Config::from_env().map(Self::new)
    }

    /// Fail fast on bad credentials or a missing bucket.
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::backend(StorageOp::Connect, &self.bucket, e))?;
        info!(bucket = %self.bucket, "R2 bucket reachable");
        Ok(())
    }
}

fn http_status<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

#[async_trait]
impl ArtifactStore for R2Store {
    async fn put(
        &self,
        key: &str,
        kind: ContentKind,
        task_id: Option<&TaskId>,
        bytes: &[u8],
    ) -> StorageResult<ArtifactRef> {
        validate_key(key)?;
        debug!(key, size = bytes.len(), "R2 put");

        let sent = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .content_type(kind.mime_type())
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await;

        match sent {
            Ok(_) => Ok(ArtifactRef::new(task_id.cloned(), key, kind, bytes.len() as u64)),
            Err(e) if http_status(&e) == Some(PRECONDITION_FAILED) => {
                Err(StorageError::already_exists(key))
            }
            Err(e) => Err(StorageError::backend(StorageOp::Put, key, e)),
        }
    }

    async fn get(&self, artifact: &ArtifactRef) -> StorageResult<Vec<u8>> {
        let key = artifact.key.as_str();
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::not_found(key)
                } else {
                    StorageError::backend(StorageOp::Get, key, e)
                }
            })?;

        let body = object
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend(StorageOp::Get, key, e))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<u64>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(meta) => Ok(Some(meta.content_length().unwrap_or_default().max(0) as u64)),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(StorageError::backend(StorageOp::Head, key, e)),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        debug!(key, "R2 delete");
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(drop)
            .map_err(|e| StorageError::backend(StorageOp::Delete, key, e))
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StorageError::backend(StorageOp::List, prefix, e))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_owned)));
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_reports_every_missing_variable() {
        let vars = HashMap::from([("R2_BUCKET_NAME", "media")]);
        let err = R2Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("R2_ENDPOINT_URL"), "{msg}");
        assert!(msg.contains("R2_SECRET_ACCESS_KEY"), "{msg}");
        assert!(!msg.contains("R2_BUCKET_NAME"), "{msg}");
    }

    #[test]
    fn test_config_defaults_region_and_hides_secret() {
        let vars = HashMap::from([
            ("R2_ENDPOINT_URL", "https://acct.r2.cloudflarestorage.com"),
            ("R2_ACCESS_KEY_ID", "id"),
            ("R2_SECRET_ACCESS_KEY", "hunter2"),
            ("R2_BUCKET_NAME", "media"),
        ]);
        let config = R2Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.region, "auto");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[tokio::test]
    #[ignore = "requires R2 credentials"]
    async fn test_r2_write_once() {
        let store = R2Store::from_env().unwrap();
        store.check_connectivity().await.unwrap();
        let key = format!("runs/it-{}/scenes/000/script.json", uuid::Uuid::new_v4());

        store.put(&key, ContentKind::Script, None, b"{}").await.unwrap();
        let again = store.put(&key, ContentKind::Script, None, b"[]").await;
        assert!(matches!(again, Err(StorageError::AlreadyExists(_))));
        assert_eq!(store.head(&key).await.unwrap(), Some(2));

        store.delete(&key).await.unwrap();
        assert_eq!(store.head(&key).await.unwrap(), None);
    }
}
