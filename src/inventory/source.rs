//! Acquiring the ISO for a new image.
//!
//! Adding an image from a source is a short pipeline:
//!
//! 1. claim the (name, version) and check it is not recorded yet
//! 2. acquire the ISO into the ISO directory (link, download or upload)
//! 3. mount and persist through [`Inventory::add_image`](super::Inventory::add_image)'s path
//!
//! Step 2 only writes names that are free in the ISO directory and registers
//! what it created in a [`Rollback`]; if step 3 fails those files are removed
//! again so a failed add leaves the ISO directory as it was.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use uuid::Uuid;

use super::{image::RawImage, Claim, Image, ImageStatus, Inventory};
use crate::{
    error::{ServiceError, ServiceResult},
    fsop::{self, FsOps},
    upload::{self, UploadStream},
};

/// Where the bytes of a new image come from.
pub enum IsoSource {
    /// A file already present in the ISO directory.
    Store(String),
    /// A local path, linked into the ISO directory.
    Local(PathBuf),
    /// A URL downloaded into the ISO directory.
    Web(String),
    /// A request body streamed into the ISO directory under the given name.
    Client { iso: String, body: UploadStream },
}

impl fmt::Debug for IsoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsoSource::Store(s) => f.debug_tuple("Store").field(s).finish(),
            IsoSource::Local(p) => f.debug_tuple("Local").field(p).finish(),
            IsoSource::Web(u) => f.debug_tuple("Web").field(u).finish(),
            IsoSource::Client { iso, .. } => f.debug_struct("Client").field("iso", iso).finish(),
        }
    }
}

/// Files created by completed steps, removed again unless committed.
pub(crate) struct Rollback<'a> {
    fs: &'a FsOps,
    created: Vec<PathBuf>,
}

impl<'a> Rollback<'a> {
    pub(crate) fn new(fs: &'a FsOps) -> Self {
        Self {
            fs,
            created: Vec::new(),
        }
    }

    pub(crate) fn remove_on_failure(&mut self, path: PathBuf) {
        self.created.push(path);
    }

    pub(crate) fn commit(mut self) {
        self.created.clear();
    }

    pub(crate) async fn run(self) {
        for path in self.created.iter().rev() {
            tracing::info!("rolling back {}", path.display());
            if let Err(e) = self.fs.remove_file(path).await {
                tracing::warn!("rollback could not remove {}: {e}", path.display());
            }
        }
    }
}

impl Inventory {
    /// Add `name`/`version` with its ISO taken from `source`.
    pub async fn add_image_from_source(
        &self,
        name: &str,
        version: &str,
        source: IsoSource,
    ) -> ServiceResult<Image> {
        tracing::info!("adding image {name} {version} from {source:?}");
        let _claim = self.claim(name, version)?;
        self.ensure_absent(name, version).await?;

        let mut rollback = Rollback::new(&self.fs);
        let (iso, _iso_claim) = match self.acquire(name, version, source, &mut rollback).await {
            Ok(acquired) => acquired,
            Err(e) => {
                rollback.run().await;
                return Err(e);
            }
        };

        let raw = RawImage {
            id: Some(Uuid::new_v4().to_string()),
            name: Some(name.to_string()),
            version: Some(version.to_string()),
            iso: Some(iso),
            status: Some("preparing".to_string()),
        };
        let result = match Image::try_from(&raw) {
            Ok(image) => self.mount_and_persist(image).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(image) => {
                rollback.commit();
                Ok(image)
            }
            Err(e) => {
                rollback.run().await;
                Err(e)
            }
        }
    }

    /// Put the ISO in place and return its file name inside the ISO directory.
    ///
    /// A name written by this call stays claimed until the returned guard drops.
    async fn acquire(
        &self,
        name: &str,
        version: &str,
        source: IsoSource,
        rollback: &mut Rollback<'_>,
    ) -> ServiceResult<(String, Option<Claim<'_, String>>)> {
        match source {
            IsoSource::Store(iso) => {
                if !fsop::is_plain_file_name(&iso) {
                    return Err(ServiceError::bad_request("Invalid ISO name"));
                }
                Ok((iso, None))
            }
            IsoSource::Local(path) => self.link_local(&path, rollback).await,
            IsoSource::Web(url) => {
                let iso = fsop::get_iso_name_from_web_link(name, version, &url);
                let claim = self.claim_new_iso(&iso).await?;
                let pending = Image::new(name, version, iso.clone(), ImageStatus::Preparing);
                let path = self.download_iso(&pending, &url).await?;
                rollback.remove_on_failure(path);
                Ok((iso, Some(claim)))
            }
            IsoSource::Client { iso, body } => {
                if !fsop::is_plain_file_name(&iso) {
                    return Err(ServiceError::bad_request("Invalid ISO name"));
                }
                let claim = self.claim_new_iso(&iso).await?;
                let target = self.iso_path(&iso);
                upload::receive_file(&self.fs, body, &target).await?;
                rollback.remove_on_failure(target);
                Ok((iso, Some(claim)))
            }
        }
    }

    /// Link a local ISO into the ISO directory unless it already lives there.
    async fn link_local(
        &self,
        path: &Path,
        rollback: &mut Rollback<'_>,
    ) -> ServiceResult<(String, Option<Claim<'_, String>>)> {
        let iso = fsop::get_iso_name_from_path(&path.to_string_lossy())
            .map_err(|e| ServiceError::bad_request(e.to_string()))?;

        if !self.fs.check_path_readable(path) {
            return Err(ServiceError::not_found("Path is not readable"));
        }

        let source = tokio::fs::canonicalize(path).await.map_err(|e| {
            tracing::error!("cannot resolve {}: {e}", path.display());
            ServiceError::not_found("Path is not readable")
        })?;

        let iso_dir = tokio::fs::canonicalize(&self.paths.iso_dir)
            .await
            .unwrap_or_else(|_| self.paths.iso_dir.clone());
        if source.parent() == Some(iso_dir.as_path()) {
            return Ok((iso, None));
        }

        let claim = self.claim_new_iso(&iso).await?;
        let dest = self.iso_path(&iso);
        self.fs
            .create_symbol_link(&source, &dest)
            .await
            .map_err(|e| {
                tracing::error!("symlink {} -> {} failed: {e}", dest.display(), source.display());
                ServiceError::internal("Error creating symbol link to ISO file")
            })?;
        rollback.remove_on_failure(dest);
        Ok((iso, Some(claim)))
    }
}
