//! Flat file collection served by the server.
//!
//! File names are the only identity. Uploads are staged under
//! `<root>/.incoming/` and renamed into place once complete, so a partial
//! upload never shows up in a listing.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tracing::debug;
use uuid::Uuid;

use crate::error::TransferError;
use crate::transfer::constants::INCOMING_DIR;
use crate::transfer::message::FileEntry;
use crate::transfer::utils::{format_size, is_plain_file_name, open_secure_file, sanitize_file_name};

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open (creating if needed) the storage directory
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(INCOMING_DIR)).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List the regular files at the top level, in directory order
    pub async fn list(&self) -> io::Result<Vec<FileEntry>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            // Follows symlinks, like a plain "is this a file" check would
            let metadata = match fs::metadata(entry.path()).await {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            // A lossy name could never be requested back
            let Ok(name) = entry.file_name().into_string() else {
                debug!("Skipping non UTF-8 name {:?}", entry.file_name());
                continue;
            };

            let size = metadata.len();
            files.push(FileEntry {
                name,
                size,
                size_formatted: format_size(size),
            });
        }

        Ok(files)
    }

    /// Open a stored file for reading. `Ok(None)` when no such file exists.
    ///
    /// Only plain base names are looked up, so a request can never resolve
    /// outside the storage root.
    pub async fn open_for_download(&self, name: &str) -> io::Result<Option<(File, u64)>> {
        if !is_plain_file_name(name) {
            return Ok(None);
        }

        let path = self.root.join(name);
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !metadata.is_file() {
            return Ok(None);
        }

        let file = File::open(&path).await?;
        Ok(Some((file, metadata.len())))
    }

    /// Reserve a staging file for an upload of `requested_name`
    pub fn begin_upload(&self, requested_name: &str) -> Result<PendingUpload, TransferError> {
        if requested_name.is_empty() {
            return Err(TransferError::InvalidUpload("missing filename".to_string()));
        }
        let file_name = sanitize_file_name(requested_name).ok_or_else(|| {
            TransferError::InvalidUpload(format!("unusable filename {:?}", requested_name))
        })?;

        Ok(PendingUpload {
            final_path: self.root.join(&file_name),
            staging_path: self
                .root
                .join(INCOMING_DIR)
                .join(format!("{}.part", Uuid::new_v4().simple())),
            file_name,
        })
    }
}

/// An upload in progress: staged content plus its final destination
#[derive(Debug)]
pub struct PendingUpload {
    pub file_name: String,
    pub staging_path: PathBuf,
    pub final_path: PathBuf,
}

impl PendingUpload {
    pub async fn create(&self) -> io::Result<File> {
        open_secure_file(&self.staging_path).await
    }

    /// Move the staged content into the collection, replacing any existing file
    pub async fn commit(&self) -> io::Result<()> {
        fs::rename(&self.staging_path, &self.final_path).await
    }

    pub async fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.staging_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Failed to remove {:?}: {}", self.staging_path, e);
            }
        }
    }
}
