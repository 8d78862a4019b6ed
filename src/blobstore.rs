//! Blob Store Abstraction
//!
//! Trait-based abstraction over durable blob storage for exported diffs.
//! Diff discovery is driven by blob user-metadata (lower/upper checkpoint
//! bounds), so metadata round-trips through every implementation.
//!
//! Implementations:
//! - `InMemoryBlobStore`: for unit tests
//! - `LocalFsBlobStore`: for development (JSON sidecar carries metadata)
//! - `S3BlobStore`: for production (feature-gated, see `s3_store`)

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Metadata for a stored blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Blob key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// User-supplied metadata key/value pairs
    pub user_meta: HashMap<String, String>,
}

/// Blob store abstraction trait
///
/// Returns boxed futures so implementations stay object-safe and callers can
/// be generic over the backend.
pub trait BlobStore: Send + Sync + 'static {
    /// Put a blob (create or overwrite) with user metadata
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        user_meta: &'a HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    /// Get a blob's contents
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>>;

    /// Get blob metadata without downloading content
    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<BlobMeta>> + Send + 'a>>;

    /// List blobs with a prefix, sorted by key
    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<BlobMeta>>> + Send + 'a>>;

    /// Delete a blob (idempotent)
    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;
}

/// Whether an I/O error from a blob store is worth retrying.
///
/// The whitelist covers transient unavailability; logical errors (not found,
/// permissions) propagate immediately.
pub fn is_transient_io(error: &IoError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::WouldBlock
    )
}

// ============================================================================
// InMemoryBlobStore - for tests
// ============================================================================

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    user_meta: HashMap<String, String>,
}

/// In-memory blob store for unit tests. Clones share state.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, StoredBlob>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        InMemoryBlobStore {
            blobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of stored blobs (for testing)
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Check if empty (for testing)
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl Clone for InMemoryBlobStore {
    fn clone(&self) -> Self {
        InMemoryBlobStore {
            blobs: Arc::clone(&self.blobs),
        }
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        user_meta: &'a HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.blobs.write().insert(
                key.to_string(),
                StoredBlob {
                    data: data.to_vec(),
                    user_meta: user_meta.clone(),
                },
            );
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            self.blobs
                .read()
                .get(key)
                .map(|blob| blob.data.clone())
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<BlobMeta>> + Send + 'a>> {
        Box::pin(async move {
            self.blobs
                .read()
                .get(key)
                .map(|blob| BlobMeta {
                    key: key.to_string(),
                    size_bytes: blob.data.len() as u64,
                    user_meta: blob.user_meta.clone(),
                })
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<BlobMeta>>> + Send + 'a>> {
        Box::pin(async move {
            let blobs = self.blobs.read();
            let mut metas: Vec<BlobMeta> = blobs
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, blob)| BlobMeta {
                    key: k.clone(),
                    size_bytes: blob.data.len() as u64,
                    user_meta: blob.user_meta.clone(),
                })
                .collect();

            // Sort by key for consistent ordering
            metas.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(metas)
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.blobs.write().remove(key);
            Ok(())
        })
    }
}

// ============================================================================
// LocalFsBlobStore - for development
// ============================================================================

/// Sidecar file format for blob metadata
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    user_meta: HashMap<String, String>,
}

/// Local filesystem blob store. Data lives at `<base>/<key>`; user metadata
/// in a JSON sidecar at `<base>/<key>.meta.json`.
#[derive(Debug, Clone)]
pub struct LocalFsBlobStore {
    base_path: PathBuf,
}

impl LocalFsBlobStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsBlobStore { base_path }
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.meta.json", key))
    }

    fn ensure_parent(path: &PathBuf) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> IoResult<HashMap<String, String>> {
        let raw = tokio::fs::read(self.sidecar_path(key)).await?;
        let sidecar: Sidecar = serde_json::from_slice(&raw)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))?;
        Ok(sidecar.user_meta)
    }
}

impl BlobStore for LocalFsBlobStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        user_meta: &'a HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.data_path(key);
            Self::ensure_parent(&path)?;
            tokio::fs::write(&path, data).await?;

            let sidecar = Sidecar {
                user_meta: user_meta.clone(),
            };
            let encoded = serde_json::to_vec_pretty(&sidecar)
                .map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))?;
            tokio::fs::write(self.sidecar_path(key), encoded).await
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move { tokio::fs::read(self.data_path(key)).await })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<BlobMeta>> + Send + 'a>> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(self.data_path(key)).await?;
            let user_meta = self.read_sidecar(key).await.unwrap_or_default();
            Ok(BlobMeta {
                key: key.to_string(),
                size_bytes: metadata.len(),
                user_meta,
            })
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<BlobMeta>>> + Send + 'a>> {
        Box::pin(async move {
            fn walk(
                dir: &PathBuf,
                base: &PathBuf,
                prefix: &str,
                keys: &mut Vec<String>,
            ) -> IoResult<()> {
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    let path = entry.path();
                    if path.is_dir() {
                        walk(&path, base, prefix, keys)?;
                    } else if path.is_file() {
                        let key = path
                            .strip_prefix(base)
                            .expect("walked path must be under base")
                            .to_string_lossy()
                            .to_string();
                        if key.starts_with(prefix) && !key.ends_with(".meta.json") {
                            keys.push(key);
                        }
                    }
                }
                Ok(())
            }

            if !self.base_path.exists() {
                return Ok(Vec::new());
            }

            let mut keys = Vec::new();
            walk(&self.base_path, &self.base_path, prefix, &mut keys)?;
            keys.sort();

            let mut metas = Vec::with_capacity(keys.len());
            for key in keys {
                metas.push(self.head(&key).await?);
            }
            Ok(metas)
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            for path in [self.data_path(key), self.sidecar_path(key)] {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {} // Already deleted
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }
}
