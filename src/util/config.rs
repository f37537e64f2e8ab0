//! Service configuration.
//!
//! The configuration is read once from a TOML file at startup and handed to
//! the components that need it. Every key is optional; missing keys fall back
//! to the defaults below. Keys may be written either in snake_case or in the
//! camelCase spelling used by older deployments (`isoDir`, `inventoryFile`, ...).
//!
//! ```toml
//! iso_dir = "./static/iso"
//! microkernel_dir = "./static/common"
//! http_file_service_root_dir = "./static/files"
//! inventory_file = "./inventory.json"
//! northbound_addr = "0.0.0.0:7070"
//! southbound_addr = "0.0.0.0:9090"
//! command_timeout_secs = 3600
//! ```

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

pub const DEFAULT_ISO_DIR: &str = "./static/iso";
pub const DEFAULT_MICROKERNEL_DIR: &str = "./static/common";
pub const DEFAULT_HTTP_ROOT_DIR: &str = "./static/files";
pub const DEFAULT_INVENTORY_FILE: &str = "./inventory.json";
pub const DEFAULT_NORTHBOUND_ADDR: &str = "0.0.0.0:7070";
pub const DEFAULT_SOUTHBOUND_ADDR: &str = "0.0.0.0:9090";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding ISO files.
    #[serde(alias = "isoDir")]
    pub iso_dir: PathBuf,
    /// Directory holding microkernel boot assets.
    #[serde(alias = "microkernelDir")]
    pub microkernel_dir: PathBuf,
    /// Root of the static file tree; images are mounted at `{root}/{name}/{version}`.
    #[serde(alias = "httpFileServiceRootDir")]
    pub http_file_service_root_dir: PathBuf,
    /// JSON document holding image records.
    #[serde(alias = "inventoryFile")]
    pub inventory_file: PathBuf,
    #[serde(alias = "northboundAddr")]
    pub northbound_addr: SocketAddr,
    #[serde(alias = "southboundAddr")]
    pub southbound_addr: SocketAddr,
    /// Upper bound for a single mount, unmount or download command.
    #[serde(alias = "commandTimeoutSecs")]
    pub command_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            iso_dir: PathBuf::from(DEFAULT_ISO_DIR),
            microkernel_dir: PathBuf::from(DEFAULT_MICROKERNEL_DIR),
            http_file_service_root_dir: PathBuf::from(DEFAULT_HTTP_ROOT_DIR),
            inventory_file: PathBuf::from(DEFAULT_INVENTORY_FILE),
            northbound_addr: default_addr(DEFAULT_NORTHBOUND_ADDR),
            southbound_addr: default_addr(DEFAULT_SOUTHBOUND_ADDR),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

fn default_addr(s: &str) -> SocketAddr {
    s.parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Resolve every directory against `base`, normally the working directory.
    pub fn resolve(&self, base: &Path) -> ResolvedPaths {
        // Drop `.` segments so paths compare equal to kernel mount table entries.
        let join = |p: &Path| -> PathBuf { base.join(p).components().collect() };
        ResolvedPaths {
            iso_dir: join(&self.iso_dir),
            microkernel_dir: join(&self.microkernel_dir),
            http_root: join(&self.http_file_service_root_dir),
            inventory_file: join(&self.inventory_file),
        }
    }
}

/// Absolute locations the inventory and catalog operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub iso_dir: PathBuf,
    pub microkernel_dir: PathBuf,
    pub http_root: PathBuf,
    pub inventory_file: PathBuf,
}

impl ResolvedPaths {
    /// Lay all paths out under one root, as tests and sandboxes do.
    pub fn under(root: &Path) -> Self {
        ServiceConfig::default().resolve(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let cfg = ServiceConfig::from_toml_str("iso_dir = \"/srv/iso\"").unwrap();
        assert_eq!(cfg.iso_dir, PathBuf::from("/srv/iso"));
        assert_eq!(cfg.microkernel_dir, PathBuf::from(DEFAULT_MICROKERNEL_DIR));
        assert_eq!(cfg.command_timeout_secs, DEFAULT_COMMAND_TIMEOUT_SECS);
        assert_eq!(cfg.northbound_addr.port(), 7070);
    }

    #[test]
    fn camel_case_keys_are_accepted() {
        let cfg = ServiceConfig::from_toml_str(
            r#"
            isoDir = "./a"
            httpFileServiceRootDir = "./b"
            inventoryFile = "./c.json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.iso_dir, PathBuf::from("./a"));
        assert_eq!(cfg.http_file_service_root_dir, PathBuf::from("./b"));
        assert_eq!(cfg.inventory_file, PathBuf::from("./c.json"));
    }

    #[test]
    fn resolve_joins_relative_and_keeps_absolute() {
        let cfg = ServiceConfig {
            iso_dir: PathBuf::from("/abs/iso"),
            ..Default::default()
        };
        let paths = cfg.resolve(Path::new("/work"));
        assert_eq!(paths.iso_dir, PathBuf::from("/abs/iso"));
        assert_eq!(paths.http_root, PathBuf::from("/work/static/files"));
        assert_eq!(
            paths.http_root.to_str(),
            Some("/work/static/files"),
            "no `.` segment left in the rendered path"
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ServiceConfig::load("/nonexistent/config.toml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
