//! Metadata store for image records.
//!
//! Records live in memory and are mirrored to a single JSON document:
//!
//! ```json
//! { "images": [ { "id": "...", "name": "centos", "version": "7.0",
//!                 "iso": "centos-7.0.iso", "status": "OK" } ] }
//! ```
//!
//! Every mutation rewrites the document before returning. The store does not
//! enforce uniqueness; the inventory checks before inserting.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    error::StoreError,
    inventory::image::{Image, ImageQuery, ImageStatus},
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct InventoryDocument {
    #[serde(default)]
    images: Vec<Image>,
}

pub struct ImageStore {
    path: PathBuf,
    images: Mutex<Vec<Image>>,
}

impl ImageStore {
    /// Load the document at `path`. A missing file is an error.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("failed to load inventory file {}", path.display());
                return Err(StoreError::Missing { path });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let doc = serde_json::from_str::<InventoryDocument>(&content).map_err(|source| {
            StoreError::Parse {
                path: path.clone(),
                source,
            }
        })?;

        info!(
            "inventory file loaded: {} ({} images)",
            path.display(),
            doc.images.len()
        );
        Ok(Self {
            path,
            images: Mutex::new(doc.images),
        })
    }

    /// Write an empty document at `path` unless a file is already there.
    ///
    /// Returns whether a file was created.
    pub async fn create_if_missing(path: &Path) -> Result<bool, StoreError> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?
        {
            return Ok(false);
        }
        write_document(path, &[]).await?;
        info!("created empty inventory file {}", path.display());
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records matching `query`, in insertion order.
    pub async fn find_images_by_query(&self, query: &ImageQuery) -> Vec<Image> {
        self.images
            .lock()
            .await
            .iter()
            .filter(|img| query.matches(img))
            .cloned()
            .collect()
    }

    pub async fn find_one_by_query(&self, query: &ImageQuery) -> Option<Image> {
        self.images
            .lock()
            .await
            .iter()
            .find(|img| query.matches(img))
            .cloned()
    }

    pub async fn find_one_image_by_name_version(&self, name: &str, version: &str) -> Option<Image> {
        self.find_one_by_query(&ImageQuery::name_version(name, version))
            .await
    }

    /// Append a record.
    pub async fn add_image(&self, image: Image) -> Result<Image, StoreError> {
        let mut images = self.images.lock().await;
        images.push(image.clone());
        if let Err(e) = write_document(&self.path, &images).await {
            images.pop();
            return Err(e);
        }
        Ok(image)
    }

    /// Set the status of the first record with this name and version.
    pub async fn update_image_status(
        &self,
        name: &str,
        version: &str,
        status: ImageStatus,
    ) -> Result<Option<Image>, StoreError> {
        let mut images = self.images.lock().await;
        let Some(img) = images
            .iter_mut()
            .find(|i| i.name == name && i.version == version)
        else {
            return Ok(None);
        };
        let previous = std::mem::replace(&mut img.status, status);
        let updated = img.clone();
        if let Err(e) = write_document(&self.path, &images).await {
            if let Some(img) = images
                .iter_mut()
                .find(|i| i.name == name && i.version == version)
            {
                img.status = previous;
            }
            return Err(e);
        }
        Ok(Some(updated))
    }

    /// Remove every record matching `query` and return the removed ones.
    pub async fn delete_image(&self, query: &ImageQuery) -> Result<Vec<Image>, StoreError> {
        let mut images = self.images.lock().await;
        let (removed, kept): (Vec<Image>, Vec<Image>) =
            images.drain(..).partition(|img| query.matches(img));
        if removed.is_empty() {
            *images = kept;
            return Ok(removed);
        }
        if let Err(e) = write_document(&self.path, &kept).await {
            // Put the original order back.
            let mut restored = kept;
            restored.extend(removed);
            *images = restored;
            return Err(e);
        }
        *images = kept;
        Ok(removed)
    }
}

async fn write_document(path: &Path, images: &[Image]) -> Result<(), StoreError> {
    #[derive(Serialize)]
    struct DocumentRef<'a> {
        images: &'a [Image],
    }

    let data = serde_json::to_vec_pretty(&DocumentRef { images }).map_err(|source| {
        StoreError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &data).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}
