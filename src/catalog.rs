//! Flat-file catalog of the ISO and microkernel directories.
//!
//! Unlike the inventory, the catalog keeps no records: every call looks at
//! the directory as it is on disk.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::{ServiceError, ServiceResult},
    fsop::{self, FsOps, ISO_EXTENSION},
    upload::{self, UploadStream},
    util::config::ResolvedPaths,
};

const KB: u64 = 1_000;
const MB: u64 = 1_000_000;
const GB: u64 = 1_000_000_000;

/// Human readable size using decimal multiples.
pub fn prettify_file_size(size: u64) -> String {
    let s = size as f64;
    if size >= GB {
        format!("{:.2} GB", s / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", s / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", s / KB as f64)
    } else {
        format!("{size} Byte")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: String,
    pub uploaded: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Iso,
    Microkernel,
}

impl AssetKind {
    fn accepts(self, name: &str) -> bool {
        match self {
            AssetKind::Iso => name.ends_with(ISO_EXTENSION),
            AssetKind::Microkernel => true,
        }
    }
}

pub struct Catalog {
    paths: ResolvedPaths,
    fs: FsOps,
}

impl Catalog {
    pub fn new(paths: ResolvedPaths, fs: FsOps) -> Self {
        Self { paths, fs }
    }

    fn dir(&self, kind: AssetKind) -> &Path {
        match kind {
            AssetKind::Iso => &self.paths.iso_dir,
            AssetKind::Microkernel => &self.paths.microkernel_dir,
        }
    }

    fn file_path(&self, kind: AssetKind, name: &str) -> ServiceResult<PathBuf> {
        if !fsop::is_plain_file_name(name) {
            return Err(ServiceError::bad_request("Invalid file name"));
        }
        Ok(self.dir(kind).join(name))
    }

    pub async fn get_all_iso(&self) -> ServiceResult<Vec<FileEntry>> {
        self.list(AssetKind::Iso).await
    }

    pub async fn get_all_microkernel(&self) -> ServiceResult<Vec<FileEntry>> {
        self.list(AssetKind::Microkernel).await
    }

    /// Regular files of `kind` in its directory, sorted by name.
    pub async fn list(&self, kind: AssetKind) -> ServiceResult<Vec<FileEntry>> {
        let dir = self.dir(kind);
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            tracing::error!("cannot list {}: {e}", dir.display());
            ServiceError::internal("Fail listing files")
        })?;

        let mut files = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("cannot list {}: {e}", dir.display());
                    return Err(ServiceError::internal("Fail listing files"));
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !kind.accepts(&name) {
                continue;
            }
            if let Some(file) = self.describe(&entry.path(), name).await {
                files.push(file);
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Descriptor of a regular file; `None` for directories and dangling links.
    async fn describe(&self, path: &Path, name: String) -> Option<FileEntry> {
        let meta = match self.fs.get_file_stat(path).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("skipping {}: {e}", path.display());
                return None;
            }
        };
        if !meta.is_file() {
            return None;
        }
        let uploaded: SystemTime = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Some(FileEntry {
            name,
            size: prettify_file_size(meta.len()),
            uploaded: uploaded.into(),
        })
    }

    pub async fn delete_iso(&self, name: &str) -> ServiceResult<FileEntry> {
        self.delete(AssetKind::Iso, name).await
    }

    pub async fn delete_microkernel(&self, name: &str) -> ServiceResult<FileEntry> {
        self.delete(AssetKind::Microkernel, name).await
    }

    /// Remove `name` and return its descriptor as it was before removal.
    pub async fn delete(&self, kind: AssetKind, name: &str) -> ServiceResult<FileEntry> {
        let path = self.file_path(kind, name)?;
        let entry = if kind.accepts(name) {
            self.describe(&path, name.to_string()).await
        } else {
            None
        };
        let entry = entry.ok_or_else(|| ServiceError::not_found("No file match query"))?;

        self.fs.remove_file(&path).await.map_err(|e| {
            tracing::error!("delete of {} failed: {e}", path.display());
            ServiceError::internal("Fail deleting file")
        })?;
        tracing::info!("deleted {}", path.display());
        Ok(entry)
    }

    /// Store an uploaded file under `name` and describe the result.
    pub async fn upload(
        &self,
        kind: AssetKind,
        name: &str,
        body: UploadStream,
    ) -> ServiceResult<FileEntry> {
        let path = self.file_path(kind, name)?;
        upload::receive_file(&self.fs, body, &path).await?;
        self.describe(&path, name.to_string())
            .await
            .ok_or_else(|| ServiceError::internal("Fail reading uploaded file"))
    }
}
