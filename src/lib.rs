//! # Image Service Library
//!
//! Manages OS installation images for network boot. Each image record names an
//! ISO file, and the ISO is loop-mounted read-only at
//! `{http_root}/{name}/{version}` so its contents can be served as plain files.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use image_service::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::load("config.toml")?;
//!     let paths = config.resolve(&std::env::current_dir()?);
//!     let fs = FsOps::new(Arc::new(TokioRunner::new(config.command_timeout())));
//!
//!     let inventory = Arc::new(Inventory::new(paths.clone(), fs.clone()));
//!     inventory.initialize().await?;
//!     inventory.boot().await?;
//!
//!     let state = AppState {
//!         inventory,
//!         catalog: Arc::new(Catalog::new(paths, fs)),
//!     };
//!     ImageDaemon::new(state)
//!         .serve(config.northbound_addr, config.southbound_addr, shutdown_signal())
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Adding an image
//!
//! The ISO for a new image can come from four places:
//!
//! ```rust,ignore
//! // already in the ISO directory
//! inventory.add_image_from_source("centos", "7.0", IsoSource::Store("centos-7.0.iso".into())).await?;
//! // a local path, symlinked into the ISO directory
//! inventory.add_image_from_source("esxi", "6.5", IsoSource::Local("/data/esxi-6.5.iso".into())).await?;
//! // a URL, downloaded with wget
//! inventory.add_image_from_source("ubuntu", "16.04", IsoSource::Web(url)).await?;
//! // a streamed upload
//! inventory.add_image_from_source("rhel", "7.2", IsoSource::Client { iso, body }).await?;
//! ```
//!
//! ## Core Components
//!
//! - [`inventory`]: image lifecycle and boot-time mount reconciliation
//! - [`store`]: JSON-backed image records
//! - [`fsop`]: mounts, symlinks, downloads and access probes
//! - [`catalog`]: flat ISO and microkernel file listings
//! - [`daemon`]: HTTP API and static file server
//! - [`util::config`]: configuration management

#[macro_use]
extern crate log;

pub mod catalog;
pub mod daemon;
pub mod error;
pub mod fsop;
pub mod inventory;
pub mod store;
pub mod upload;
pub mod util;

/// Commonly used types.
///
/// ```rust,ignore
/// use image_service::prelude::*;
/// ```
pub mod prelude {
    pub use crate::catalog::{AssetKind, Catalog, FileEntry};
    pub use crate::daemon::{
        shutdown_signal, ApiError, AppState, ErrorBody, HealthResponse, ImageDaemon,
    };
    pub use crate::error::{FsError, ServiceError, ServiceResult, StoreError};
    pub use crate::fsop::{FsOps, ProcessOutput, ProcessRunner, TokioRunner};
    pub use crate::inventory::{Image, ImageQuery, ImageStatus, Inventory, IsoSource, RawImage};
    pub use crate::store::ImageStore;
    pub use crate::util::config::{ResolvedPaths, ServiceConfig};
}

pub use inventory::{Image, Inventory, IsoSource};
pub use util::config::ServiceConfig;
