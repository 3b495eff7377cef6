//! Associated blob storage
//!
//! Large files associated with documents (originals, attachments) live in
//! an out-of-band store addressed by (index, unique id, filename). The
//! routing layer drives deletion as part of document and index removal but
//! never implements the storage itself.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs;

use crate::{Error, Result};

/// Per-document auxiliary file storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        index_name: &str,
        unique_id: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<()>;

    async fn get(&self, index_name: &str, unique_id: &str, filename: &str)
        -> Result<Option<Bytes>>;

    /// Delete one associated file of a document
    async fn delete_one(&self, index_name: &str, unique_id: &str, filename: &str) -> Result<()>;

    /// Delete every associated file of a document
    async fn delete_all(&self, index_name: &str, unique_id: &str) -> Result<()>;

    /// Delete every associated file of an index
    async fn drop_index(&self, index_name: &str) -> Result<()>;
}

/// Local filesystem blob store, one directory per (index, unique id).
pub struct LocalBlobStore {
    root_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root_path: impl Into<PathBuf>) -> Result<Self> {
        let root_path = root_path.into();
        std::fs::create_dir_all(&root_path)?;
        Ok(Self { root_path })
    }

    fn document_dir(&self, index_name: &str, unique_id: &str) -> PathBuf {
        // Unique ids are caller-supplied; encode them so path separators
        // cannot escape the store root.
        let encoded: String = unique_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root_path.join(index_name).join(encoded)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        index_name: &str,
        unique_id: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<()> {
        let dir = self.document_dir(index_name, unique_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(filename), &data).await?;
        Ok(())
    }

    async fn get(
        &self,
        index_name: &str,
        unique_id: &str,
        filename: &str,
    ) -> Result<Option<Bytes>> {
        let path = self.document_dir(index_name, unique_id).join(filename);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete_one(&self, index_name: &str, unique_id: &str, filename: &str) -> Result<()> {
        let path = self.document_dir(index_name, unique_id).join(filename);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete_all(&self, index_name: &str, unique_id: &str) -> Result<()> {
        let dir = self.document_dir(index_name, unique_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn drop_index(&self, index_name: &str) -> Result<()> {
        let dir = self.root_path.join(index_name);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
