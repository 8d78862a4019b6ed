//! S3 Blob Store Implementation
//!
//! Production blob storage over the `object_store` crate.
//!
//! Supports:
//! - AWS S3
//! - S3-compatible services (MinIO, LocalStack, etc.)
//! - Custom endpoints
//!
//! Diff metadata rides as object attributes, so discovery by lower-bound
//! key works without downloading blob contents.

use crate::blobstore::{BlobMeta, BlobStore};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, GetOptions, ObjectStore as ObjectStoreTrait, PutOptions, PutPayload,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;

/// S3 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Key prefix within bucket
    pub prefix: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

/// S3 blob store for production deployments
#[derive(Clone)]
pub struct S3BlobStore {
    store: Arc<dyn ObjectStoreTrait>,
    prefix: String,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    ///
    /// Credentials via the standard environment variables:
    /// - AWS_ACCESS_KEY_ID
    /// - AWS_SECRET_ACCESS_KEY
    pub fn new(config: S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        // Custom endpoint for S3-compatible services (MinIO)
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        builder = builder
            .with_access_key_id(std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default())
            .with_secret_access_key(std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default());

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3BlobStore {
            store: Arc::new(store),
            prefix: config.prefix,
        })
    }

    /// Create from an existing object store (for testing)
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, prefix: String) -> Self {
        S3BlobStore { store, prefix }
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn strip_prefix(&self, path: &ObjectPath) -> String {
        let path_str = path.to_string();
        if self.prefix.is_empty() {
            path_str
        } else {
            let prefix_with_slash = format!("{}/", self.prefix);
            path_str
                .strip_prefix(&prefix_with_slash)
                .unwrap_or(&path_str)
                .to_string()
        }
    }

    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => {
                IoError::new(ErrorKind::NotFound, err.to_string())
            }
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }

    async fn head_with_meta(&self, key: &str) -> IoResult<BlobMeta> {
        let path = self.full_path(key);
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = self
            .store
            .get_opts(&path, options)
            .await
            .map_err(Self::map_error)?;

        let mut user_meta = HashMap::new();
        for (attribute, value) in result.attributes.iter() {
            if let Attribute::Metadata(name) = attribute {
                user_meta.insert(name.to_string(), value.to_string());
            }
        }

        Ok(BlobMeta {
            key: key.to_string(),
            size_bytes: result.meta.size as u64,
            user_meta,
        })
    }
}

impl BlobStore for S3BlobStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        user_meta: &'a HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key);
            let mut attributes = Attributes::new();
            for (name, value) in user_meta {
                attributes.insert(
                    Attribute::Metadata(Cow::Owned(name.clone())),
                    value.clone().into(),
                );
            }
            let options = PutOptions {
                attributes,
                ..Default::default()
            };
            self.store
                .put_opts(&path, PutPayload::from(data.to_vec()), options)
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key);
            let result = self.store.get(&path).await.map_err(Self::map_error)?;
            let bytes = result.bytes().await.map_err(Self::map_error)?;
            Ok(bytes.to_vec())
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<BlobMeta>> + Send + 'a>> {
        Box::pin(self.head_with_meta(key))
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<BlobMeta>>> + Send + 'a>> {
        Box::pin(async move {
            let list_prefix = self.full_path(prefix.trim_end_matches('/'));
            let objects: Vec<object_store::ObjectMeta> = self
                .store
                .list(Some(&list_prefix))
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut keys: Vec<String> = objects
                .iter()
                .map(|meta| self.strip_prefix(&meta.location))
                .collect();
            keys.sort();

            // Attributes only come back on gets, so metadata discovery is
            // one head per object.
            let mut metas = Vec::with_capacity(keys.len());
            for key in keys {
                metas.push(self.head_with_meta(&key).await?);
            }
            Ok(metas)
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key);
            match self.store.delete(&path).await {
                Ok(()) => Ok(()),
                Err(object_store::Error::NotFound { .. }) => Ok(()), // Already deleted
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> S3BlobStore {
        S3BlobStore::from_store(Arc::new(InMemory::new()), "test-prefix".to_string())
    }

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = store();
        store
            .put("diffs/d1", b"payload", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(store.get("diffs/d1").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_metadata_roundtrip() {
        let store = store();
        store
            .put("diffs/d1", b"x", &meta(&[("lower_bound_checkpoint", "t0")]))
            .await
            .unwrap();

        let head = store.head("diffs/d1").await.unwrap();
        assert_eq!(head.user_meta.get("lower_bound_checkpoint").unwrap(), "t0");
        assert_eq!(head.size_bytes, 1);
    }

    #[tokio::test]
    async fn test_list_strips_prefix() {
        let store = store();
        store.put("diffs/a", b"1", &HashMap::new()).await.unwrap();
        store.put("diffs/b", b"2", &HashMap::new()).await.unwrap();

        let listed = store.list("diffs/").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["diffs/a", "diffs/b"]);
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let store = store();
        store.put("k", b"v", &HashMap::new()).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.is_err());
    }
}
