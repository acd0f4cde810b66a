//! A remote backed by a directory: a mounted share, a synced folder, or a
//! plain local path.

use crate::error::{TransportError, TransportResult};
use crate::remote::{RemoteCollection, RemoteLock};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FsRemote {
    pub root: PathBuf,
}

impl FsRemote {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root: path.as_ref().to_path_buf(),
        }
    }

    /// Resolve an entry name inside the root. Names are flat.
    fn entry_path(&self, name: &str) -> TransportResult<PathBuf> {
        let nested = name.contains(|c: char| c == '/' || c == '\\');
        if name.is_empty() || name == "." || name == ".." || nested {
            return Err(TransportError::Io(format!("invalid entry name {name:?}")));
        }
        Ok(self.root.join(name))
    }

    fn io_error(&self, action: &str, name: &str, err: std::io::Error) -> TransportError {
        TransportError::Io(format!(
            "{action} {}: {err}",
            self.root.join(name).display()
        ))
    }
}

#[async_trait]
impl RemoteCollection for FsRemote {
    async fn open(&self) -> TransportResult<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(TransportError::DirectoryMissing(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(
                TransportError::DirectoryMissing(self.root.display().to_string()),
            ),
            Err(err) => Err(TransportError::Unreachable(format!(
                "{}: {err}",
                self.root.display()
            ))),
        }
    }

    async fn list_entries(&self) -> TransportResult<BTreeSet<String>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| self.io_error("listing", "", e))?;

        let mut names = BTreeSet::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| self.io_error("listing", "", e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }

    async fn download(&self, name: &str) -> TransportResult<Option<Vec<u8>>> {
        let path = self.entry_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error("reading", name, err)),
        }
    }

    async fn upload(&self, name: &str, bytes: &[u8]) -> TransportResult<()> {
        let path = self.entry_path(name)?;
        let staging = self.root.join(format!(".{name}.{}.part", uuid::Uuid::new_v4()));

        if let Err(err) = tokio::fs::write(&staging, bytes).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(self.io_error("writing", name, err));
        }
        if let Err(err) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(self.io_error("replacing", name, err));
        }

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "uploaded entry");
        Ok(())
    }
}

#[async_trait]
impl RemoteLock for FsRemote {
    async fn create_marker(&self, name: &str, contents: &[u8]) -> TransportResult<()> {
        let path = self.entry_path(name)?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| self.io_error("creating marker", name, e))
    }

    async fn delete_marker(&self, name: &str) -> TransportResult<()> {
        let path = self.entry_path(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| self.io_error("deleting marker", name, e))
    }
}
