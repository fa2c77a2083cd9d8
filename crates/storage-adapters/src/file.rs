//! # File blob store
//!
//! One file per key under a root directory: `<root>/<key>.json`. Writes go
//! to a uniquely named temporary sibling first and are renamed into place, so
//! a crash mid-write leaves the previous blob intact and concurrent writers
//! never share a staging file.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use domains::BlobStore;
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::debug;

pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Creates the root directory if it does not exist yet.
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys map to file names; anything outside `[A-Za-z0-9_-]` becomes `_`.
    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{name}.json"))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, blob: String) -> anyhow::Result<()> {
        let target = self.path_for(key);
        let root = self.root.clone();
        let bytes = blob.len();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut staging = NamedTempFile::new_in(&root)?;
            staging.write_all(blob.as_bytes())?;
            staging.persist(&target)?;
            Ok(())
        })
        .await??;
        debug!(key, bytes, "blob saved");
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
