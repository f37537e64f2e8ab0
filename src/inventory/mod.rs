//! # Inventory: image lifecycle and mount reconciliation
//!
//! The inventory owns the image records and keeps them consistent with the
//! loop mounts under the HTTP root. An image moves through
//!
//! ```text
//! absent ──add──▶ preparing ──mount ok──▶ OK ──delete──▶ absent
//!                     │
//!                     └──mount failed──▶ (not persisted)
//! ```
//!
//! A record is written only once its ISO is mounted at
//! `{http_root}/{name}/{version}`. At boot every `OK` record is mounted again
//! and any record that cannot be served is dropped, so after
//! [`Inventory::load_config_at_boot`] the store only lists servable images.
//!
//! ## Example
//!
//! ```rust,ignore
//! use image_service::prelude::*;
//! use std::sync::Arc;
//!
//! let paths = ServiceConfig::default().resolve(&std::env::current_dir()?);
//! let fs = FsOps::new(Arc::new(TokioRunner::default()));
//! let inventory = Inventory::new(paths, fs);
//! inventory.initialize().await?;
//! inventory.boot().await?;
//!
//! let image = inventory
//!     .add_image_from_source("centos", "7.0", IsoSource::Store("centos-7.0.iso".into()))
//!     .await?;
//! ```

pub mod image;
pub mod source;

use std::{hash::Hash, path::PathBuf};

use dashmap::DashSet;
use tokio::sync::OnceCell;

pub use image::{validate_image_object, Image, ImageQuery, ImageStatus, RawImage};
pub use source::IsoSource;

use crate::{
    error::{FsError, ServiceError, ServiceResult, StoreError},
    fsop::{self, FsOps},
    store::ImageStore,
    util::config::ResolvedPaths,
};

/// Startup failure: the service cannot run without its directories and store.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of the boot-time reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootReport {
    /// Records whose mount was re-established.
    pub restored: Vec<Image>,
    /// Records dropped because they were not `OK` or could not be mounted.
    pub removed: Vec<Image>,
}

pub struct Inventory {
    paths: ResolvedPaths,
    fs: FsOps,
    store: OnceCell<ImageStore>,
    in_flight: DashSet<(String, String)>,
    isos_in_flight: DashSet<String>,
}

/// Marks a key as taken by an add in progress; released on drop.
struct Claim<'a, K: Eq + Hash> {
    set: &'a DashSet<K>,
    key: K,
}

impl<K: Eq + Hash> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

impl Inventory {
    pub fn new(paths: ResolvedPaths, fs: FsOps) -> Self {
        Self {
            paths,
            fs,
            store: OnceCell::new(),
            in_flight: DashSet::new(),
            isos_in_flight: DashSet::new(),
        }
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    pub fn fs(&self) -> &FsOps {
        &self.fs
    }

    /// Prepare the ISO, microkernel and HTTP root directories and load the store.
    ///
    /// Safe to call again: directories are re-checked, the loaded store is kept.
    pub async fn initialize(&self) -> Result<(), InitError> {
        self.fs.prepare_writable_dir(&self.paths.iso_dir).await?;
        self.fs
            .prepare_writable_dir(&self.paths.microkernel_dir)
            .await?;
        self.fs.prepare_writable_dir(&self.paths.http_root).await?;

        self.store
            .get_or_try_init(|| ImageStore::load(self.paths.inventory_file.clone()))
            .await?;
        Ok(())
    }

    fn store(&self) -> ServiceResult<&ImageStore> {
        self.store
            .get()
            .ok_or_else(|| ServiceError::internal("Inventory is not initialized"))
    }

    pub fn mount_dir(&self, image: &Image) -> PathBuf {
        self.paths.http_root.join(&image.name).join(&image.version)
    }

    pub fn iso_path(&self, iso: &str) -> PathBuf {
        self.paths.iso_dir.join(iso)
    }

    /// Drop stale mounts left under the HTTP root, then reconcile the records.
    pub async fn boot(&self) -> ServiceResult<BootReport> {
        let stale = self.fs.unmount_all_under(&self.paths.http_root).await;
        if stale > 0 {
            tracing::info!("removed {stale} stale mounts under {}", self.paths.http_root.display());
        }
        self.load_config_at_boot().await
    }

    /// Re-establish the mount of every `OK` record; delete everything else.
    pub async fn load_config_at_boot(&self) -> ServiceResult<BootReport> {
        let store = self.store()?;
        let images = store.find_images_by_query(&ImageQuery::default()).await;
        tracing::info!("loading {} images from inventory", images.len());

        let mut report = BootReport::default();
        for image in images {
            let by_id = ImageQuery {
                id: Some(image.id.to_string()),
                ..Default::default()
            };

            if !image.status.is_ok() {
                tracing::info!(
                    "remove bad image {} {} (status: {})",
                    image.name,
                    image.version,
                    image.status
                );
                store.delete_image(&by_id).await?;
                report.removed.push(image);
                continue;
            }

            tracing::info!("loading {} {}", image.name, image.version);
            match self.setup_dir(&image).await {
                Ok(_) => {
                    store
                        .update_image_status(&image.name, &image.version, ImageStatus::Ok)
                        .await?;
                    report.restored.push(image);
                }
                Err(e) => {
                    tracing::warn!(
                        "cannot restore {} {}: {e}; removing record",
                        image.name,
                        image.version
                    );
                    store.delete_image(&by_id).await?;
                    report.removed.push(image);
                }
            }
        }
        Ok(report)
    }

    /// Validate `raw`, mount its ISO and persist it with status `OK`.
    pub async fn add_image(&self, raw: &RawImage) -> ServiceResult<Image> {
        let image = Image::try_from(raw)?;
        let _claim = self.claim(&image.name, &image.version)?;
        self.ensure_absent(&image.name, &image.version).await?;
        self.mount_and_persist(image).await
    }

    fn claim(&self, name: &str, version: &str) -> ServiceResult<Claim<'_, (String, String)>> {
        let key = (name.to_string(), version.to_string());
        if !self.in_flight.insert(key.clone()) {
            return Err(ServiceError::bad_request("Image is already being added"));
        }
        Ok(Claim {
            set: &self.in_flight,
            key,
        })
    }

    /// Reserve a new file name in the ISO directory.
    ///
    /// Fails if a file of that name exists or another add is writing it, so
    /// acquiring an ISO never replaces one already in the store.
    async fn claim_new_iso(&self, iso: &str) -> ServiceResult<Claim<'_, String>> {
        if !self.isos_in_flight.insert(iso.to_string()) {
            return Err(ServiceError::bad_request("ISO file is already being added"));
        }
        let claim = Claim {
            set: &self.isos_in_flight,
            key: iso.to_string(),
        };
        let target = self.iso_path(iso);
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            tracing::warn!("refusing to replace {}", target.display());
            return Err(ServiceError::bad_request("ISO file already exists"));
        }
        Ok(claim)
    }

    async fn ensure_absent(&self, name: &str, version: &str) -> ServiceResult<()> {
        if self
            .store()?
            .find_one_image_by_name_version(name, version)
            .await
            .is_some()
        {
            return Err(ServiceError::bad_request("Image already exists"));
        }
        Ok(())
    }

    fn check_segments(image: &Image) -> ServiceResult<()> {
        for (field, value) in [
            ("name", &image.name),
            ("version", &image.version),
            ("iso", &image.iso),
        ] {
            if !fsop::is_plain_file_name(value) {
                tracing::error!("bad image to add, {field} is not a plain name: {value}");
                return Err(ServiceError::bad_request("Invalid image parameters specified"));
            }
        }
        Ok(())
    }

    async fn mount_and_persist(&self, image: Image) -> ServiceResult<Image> {
        Self::check_segments(&image)?;
        let mount_dir = self.setup_dir(&image).await?;

        let image = Image {
            status: ImageStatus::Ok,
            ..image
        };
        match self.store()?.add_image(image).await {
            Ok(image) => {
                tracing::info!("image {} {} added", image.name, image.version);
                Ok(image)
            }
            Err(e) => {
                // Not persisted, so it must not stay mounted either.
                if let Err(ue) = self.fs.unmount_iso(&mount_dir).await {
                    tracing::warn!("rollback unmount of {} failed: {ue}", mount_dir.display());
                }
                self.fs.remove_dir_and_empty_parent(&mount_dir).await;
                Err(e.into())
            }
        }
    }

    /// Loop-mount the image's ISO at its mount directory.
    pub async fn setup_dir(&self, image: &Image) -> ServiceResult<PathBuf> {
        let mount_dir = self.mount_dir(image);
        let iso_file = self.iso_path(&image.iso);

        if !self.fs.check_path_readable(&iso_file) {
            return Err(ServiceError::not_found("error: ISO file not found"));
        }

        // A leftover mount here would end up stacked under the new one.
        if let Err(e) = self.fs.unmount_iso(&mount_dir).await {
            tracing::debug!("pre-mount unmount of {}: {e}", mount_dir.display());
        }

        match self.fs.mount_iso(&iso_file, &mount_dir).await {
            Ok(_) => Ok(mount_dir),
            Err(e) => {
                tracing::error!("mount of {} failed: {e}", iso_file.display());
                self.fs.remove_dir_and_empty_parent(&mount_dir).await;
                Err(ServiceError::internal("error: Fail mounting ISO"))
            }
        }
    }

    /// Download `url` into the ISO directory under `image.iso`.
    ///
    /// An empty result is treated as a bad link: the file is removed. The
    /// target is overwritten, so callers reserve the name first.
    pub async fn download_iso(&self, image: &Image, url: &str) -> ServiceResult<PathBuf> {
        use validator::ValidateUrl;

        let has_scheme = ["http://", "https://", "ftp://"]
            .iter()
            .any(|scheme| url.starts_with(scheme));
        if !has_scheme || !url.to_string().validate_url() {
            return Err(ServiceError::bad_request("Not a valid web link"));
        }
        if !fsop::is_plain_file_name(&image.iso) {
            return Err(ServiceError::bad_request("Invalid image parameters specified"));
        }

        let target = self.iso_path(&image.iso);
        let outcome = match self.fs.download_iso(url, &target).await {
            Ok(_) => match self.fs.get_file_size(&target).await {
                Ok(0) => Err("downloaded file is empty".to_string()),
                Ok(_) => Ok(()),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => Ok(target),
            Err(reason) => {
                tracing::error!("download of {url} failed: {reason}");
                if let Err(e) = self.fs.remove_file(&target).await {
                    tracing::warn!("could not remove {}: {e}", target.display());
                }
                Err(ServiceError::bad_request("Error downloading ISO file"))
            }
        }
    }

    pub async fn find_images_by_query(&self, query: &ImageQuery) -> ServiceResult<Vec<Image>> {
        Ok(self.store()?.find_images_by_query(query).await)
    }

    pub async fn get_one_image_by_name_version(
        &self,
        name: &str,
        version: &str,
    ) -> ServiceResult<Option<Image>> {
        Ok(self
            .store()?
            .find_one_image_by_name_version(name, version)
            .await)
    }

    /// Unmount and delete every matching image, pruning its mount directory.
    pub async fn delete_image_by_query(&self, query: &ImageQuery) -> ServiceResult<Vec<Image>> {
        let store = self.store()?;
        let images = store.find_images_by_query(query).await;
        if images.is_empty() {
            return Err(ServiceError::not_found("No image matching query"));
        }

        let mut deleted = Vec::with_capacity(images.len());
        for image in images {
            let mount_dir = self.mount_dir(&image);
            tracing::info!("removing {} {}", image.name, image.version);

            if let Err(e) = self.fs.unmount_iso(&mount_dir).await {
                // Only a mount that is still there blocks the delete.
                match self.fs.is_mounted(&mount_dir).await {
                    Ok(false) => {
                        tracing::warn!("{} was not mounted: {e}", mount_dir.display())
                    }
                    Ok(true) => {
                        tracing::error!("umount of {} failed: {e}", mount_dir.display());
                        return Err(ServiceError::internal("Error umount iso"));
                    }
                    Err(te) => {
                        tracing::error!(
                            "umount of {} failed ({e}) and mount state is unknown: {te}",
                            mount_dir.display()
                        );
                        return Err(ServiceError::internal("Error umount iso"));
                    }
                }
            }

            store
                .delete_image(&ImageQuery {
                    id: Some(image.id.to_string()),
                    ..Default::default()
                })
                .await?;
            self.fs.remove_dir_and_empty_parent(&mount_dir).await;
            tracing::info!("image {} {} removed", image.name, image.version);
            deleted.push(image);
        }
        Ok(deleted)
    }
}
