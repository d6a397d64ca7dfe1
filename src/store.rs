use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("corrupt object metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Metadata stored alongside each object
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ObjectMetadata {
    pub key: String,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub size: usize,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub metadata: ObjectMetadata,
    pub bytes: Bytes,
}

/// Sled-backed object store with per-object expiry.
///
/// Each bucket is a sled tree. Objects past their expiry are treated as
/// absent and removed on the next read, or in bulk by [`ObjectStore::purge_expired`].
pub struct ObjectStore {
    tree: Tree,
}

/// Store key for a request path: its non-empty segments joined by `/`.
pub fn object_key(path: &str) -> String {
    path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

impl ObjectStore {
    /// Opens (or creates) the store for `bucket` under `path`.
    pub fn open(path: impl AsRef<Path>, bucket: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(&db, bucket)
    }

    /// Opens `bucket` as a tree of an already opened database.
    pub fn from_db(db: &Db, bucket: &str) -> Result<Self, StoreError> {
        Ok(Self { tree: db.open_tree(bucket)? })
    }

    /// In-memory store that disappears on drop.
    pub fn temporary(bucket: &str) -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db, bucket)
    }

    fn metadata_key(key: &str) -> String {
        format!("meta:{}", key)
    }

    fn data_key(key: &str) -> String {
        format!("data:{}", key)
    }

    pub fn get(&self, key: &str) -> Result<Option<StoredObject>, StoreError> {
        let meta = match self.tree.get(Self::metadata_key(key).as_bytes())? {
            Some(m) => serde_json::from_slice::<ObjectMetadata>(&m)?,
            None => return Ok(None),
        };

        if meta.expires_at <= now() {
            tracing::debug!("Object {} expired at {}", key, meta.expires_at);
            self.remove(key)?;
            return Ok(None);
        }

        match self.tree.get(Self::data_key(key).as_bytes())? {
            Some(data) => Ok(Some(StoredObject { metadata: meta, bytes: Bytes::from(data.to_vec()) })),
            None => Ok(None),
        }
    }

    pub fn put(
        &self,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
        cache_control: Option<&str>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let created_at = now();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let metadata = ObjectMetadata {
            key: key.to_string(),
            content_type: content_type.map(str::to_string),
            cache_control: cache_control.map(str::to_string),
            size: data.len(),
            created_at,
            expires_at: created_at.saturating_add(ttl_secs),
        };

        // Data first, so a reader never sees metadata without its bytes.
        self.tree.insert(Self::data_key(key).as_bytes(), data)?;
        self.tree.insert(Self::metadata_key(key).as_bytes(), serde_json::to_vec(&metadata)?)?;
        Ok(())
    }

    /// Waits until everything written so far is on disk. `put` alone relies
    /// on sled's background flush.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.tree.flush_async().await?)
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.tree.remove(Self::metadata_key(key).as_bytes())?;
        self.tree.remove(Self::data_key(key).as_bytes())?;
        Ok(())
    }

    /// Removes every expired object, returning how many were dropped.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now();
        let mut expired = Vec::new();

        for item in self.tree.scan_prefix(b"meta:") {
            let (_, value) = item?;
            if let Ok(meta) = serde_json::from_slice::<ObjectMetadata>(&value) {
                if meta.expires_at <= now {
                    expired.push(meta.key);
                }
            }
        }

        for key in &expired {
            self.remove(key)?;
        }
        if !expired.is_empty() {
            tracing::info!("Purged {} expired objects", expired.len());
        }
        Ok(expired.len())
    }

    pub fn len(&self) -> usize {
        self.tree.scan_prefix(b"meta:").count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
