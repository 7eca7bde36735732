//! Working-directory contract.
//!
//! The directory itself lives inside the worker process; the control plane only
//! consumes it. Paths handed to a [`Directory`] are relative to the run's
//! working directory and have already passed
//! [`validate_filename`](crate::run::validate_filename).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::RemoteError;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryEntry {
    Directory { name: String, path: String },
    File { name: String, path: String, size: u64 },
}

impl DirectoryEntry {
    pub fn name(&self) -> &str {
        match self {
            DirectoryEntry::Directory { name, .. } | DirectoryEntry::File { name, .. } => name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            DirectoryEntry::Directory { path, .. } | DirectoryEntry::File { path, .. } => path,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, DirectoryEntry::Directory { .. })
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// List the directory at `path` ("" is the working directory itself).
    async fn list(&self, path: &str) -> Result<Vec<DirectoryEntry>, RemoteError>;

    async fn make_subdirectory(&self, parent: &str, name: &str) -> Result<String, RemoteError>;

    async fn make_empty_file(&self, parent: &str, name: &str) -> Result<String, RemoteError>;

    async fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, RemoteError>;

    async fn overwrite(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError>;

    async fn append(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    async fn destroy(&self, path: &str) -> Result<(), RemoteError>;

    /// Zip archive of `path` and everything beneath it.
    async fn zip_snapshot(&self, path: &str) -> Result<Vec<u8>, RemoteError>;
}
