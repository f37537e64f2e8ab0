//! # Filesystem operations
//!
//! The one place that touches the OS: directory preparation, access probes,
//! symlinks, file removal, loop mounts and ISO downloads. Every operation
//! either succeeds or returns an [`FsError`]; callers decide which failures
//! are fatal and which are best-effort.
//!
//! External programs are started through a [`ProcessRunner`]:
//!
//! | operation       | command                              |
//! |-----------------|--------------------------------------|
//! | `mount_iso`     | `mount -o loop,ro <iso> <dir>`       |
//! | `unmount_iso`   | `umount <dir>`                       |
//! | `download_iso`  | `wget -q -O <dest> <url>`            |

#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod runner;

use std::{
    ffi::{CString, OsString},
    os::unix::{ffi::OsStrExt, fs::DirBuilderExt},
    path::{Path, PathBuf},
    sync::Arc,
};

pub use runner::{ProcessOutput, ProcessRunner, TokioRunner};

use crate::error::FsError;

pub const ISO_EXTENSION: &str = ".iso";
const DIR_MODE: u32 = 0o775;
const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";

/// Handle over the side-effecting filesystem primitives.
#[derive(Clone)]
pub struct FsOps {
    runner: Arc<dyn ProcessRunner>,
    mount_table: PathBuf,
}

impl FsOps {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
        }
    }

    /// Read mounts from `path` instead of the kernel mount table.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    /// Ensure `path` exists as a writable directory, creating it with mode 0775.
    pub async fn prepare_writable_dir(&self, path: &Path) -> Result<(), FsError> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| FsError::io(path, e))?
        {
            self.check_path_writable(path)?;
            return Ok(());
        }

        info!("creating folder {}", path.display());
        let p = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(&p)
        })
        .await
        .map_err(|e| FsError::io(path, std::io::Error::other(e)))?
        .map_err(|e| {
            error!("error creating folder {}: {e}", path.display());
            FsError::io(path, e)
        })
    }

    /// Probe read access. Never fails; a missing path is simply not readable.
    pub fn check_path_readable(&self, path: &Path) -> bool {
        let ok = access(path, libc::R_OK);
        if !ok {
            warn!("path is not readable: {}", path.display());
        }
        ok
    }

    /// Probe read and write access, failing when either is missing.
    pub fn check_path_writable(&self, path: &Path) -> Result<bool, FsError> {
        if access(path, libc::R_OK | libc::W_OK) {
            Ok(true)
        } else {
            error!("path is not writable: {}", path.display());
            Err(FsError::NotWritable {
                path: path.to_path_buf(),
            })
        }
    }

    async fn exec(&self, program: &str, args: Vec<OsString>) -> Result<ProcessOutput, FsError> {
        let output = self.runner.run(program, &args).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(FsError::CommandFailed {
                command: runner::render_command(program, &args),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Loop-mount `iso_path` read-only onto `mount_dir`, creating the directory first.
    pub async fn mount_iso(
        &self,
        iso_path: &Path,
        mount_dir: &Path,
    ) -> Result<ProcessOutput, FsError> {
        self.prepare_writable_dir(mount_dir).await?;
        info!("mounting {} at {}", iso_path.display(), mount_dir.display());
        self.exec(
            "mount",
            vec![
                "-o".into(),
                "loop,ro".into(),
                iso_path.as_os_str().to_owned(),
                mount_dir.as_os_str().to_owned(),
            ],
        )
        .await
    }

    /// Unmount `mount_dir`. Callers doing this defensively should ignore the error.
    pub async fn unmount_iso(&self, mount_dir: &Path) -> Result<ProcessOutput, FsError> {
        info!("unmounting {}", mount_dir.display());
        self.exec("umount", vec![mount_dir.as_os_str().to_owned()])
            .await
    }

    /// Fetch `url` into `dest` with wget.
    pub async fn download_iso(&self, url: &str, dest: &Path) -> Result<ProcessOutput, FsError> {
        info!("downloading {url} to {}", dest.display());
        self.exec(
            "wget",
            vec![
                "-q".into(),
                "-O".into(),
                dest.as_os_str().to_owned(),
                url.into(),
            ],
        )
        .await
    }

    /// Create or replace a symlink at `dest` pointing to `source`.
    pub async fn create_symbol_link(&self, source: &Path, dest: &Path) -> Result<(), FsError> {
        info!("creating symbol link {} -> {}", dest.display(), source.display());
        if let Some(parent) = dest.parent() {
            self.prepare_writable_dir(parent).await?;
        }
        if tokio::fs::symlink_metadata(dest).await.is_ok() {
            tokio::fs::remove_file(dest)
                .await
                .map_err(|e| FsError::io(dest, e))?;
        }
        tokio::fs::symlink(source, dest)
            .await
            .map_err(|e| FsError::io(dest, e))
    }

    /// Remove a file or symlink. An already absent file is not an error.
    pub async fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        info!("removing file {}", path.display());
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::io(path, e)),
        }
    }

    /// Remove the directory `path`, then its parent if that is left empty.
    ///
    /// Best-effort: failures are logged and swallowed.
    pub async fn remove_dir_and_empty_parent(&self, path: &Path) {
        info!("removing folder {}", path.display());
        if let Err(e) = tokio::fs::remove_dir(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {e}", path.display());
            }
        }

        let Some(parent) = path.parent() else {
            return;
        };
        match tokio::fs::read_dir(parent).await {
            Ok(mut entries) => match entries.next_entry().await {
                Ok(None) => {
                    info!("removing empty folder {}", parent.display());
                    if let Err(e) = tokio::fs::remove_dir(parent).await {
                        warn!("could not remove {}: {e}", parent.display());
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => warn!("could not list {}: {e}", parent.display()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not list {}: {e}", parent.display()),
        }
    }

    pub async fn get_file_stat(&self, path: &Path) -> Result<std::fs::Metadata, FsError> {
        tokio::fs::metadata(path)
            .await
            .map_err(|e| FsError::io(path, e))
    }

    pub async fn get_file_size(&self, path: &Path) -> Result<u64, FsError> {
        Ok(self.get_file_stat(path).await?.len())
    }

    async fn read_mount_points(&self) -> Result<Vec<PathBuf>, FsError> {
        let table = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|e| FsError::io(&self.mount_table, e))?;
        Ok(table
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(|field| PathBuf::from(unescape_mount_field(field)))
            .collect())
    }

    /// Whether `dir` is currently a mount point.
    pub async fn is_mounted(&self, dir: &Path) -> Result<bool, FsError> {
        Ok(self.read_mount_points().await?.iter().any(|m| m == dir))
    }

    /// Mount points found in the mount table that lie under `root`, deepest first.
    pub async fn list_mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>, FsError> {
        let mut mounts: Vec<PathBuf> = self
            .read_mount_points()
            .await?
            .into_iter()
            .filter(|p| p.starts_with(root) && p != root)
            .collect();
        mounts.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        Ok(mounts)
    }

    /// Unmount everything below `root`. Returns how many unmounts succeeded.
    pub async fn unmount_all_under(&self, root: &Path) -> usize {
        let mounts = match self.list_mounts_under(root).await {
            Ok(m) => m,
            Err(e) => {
                warn!("cannot read mount table: {e}");
                return 0;
            }
        };
        let mut count = 0;
        for m in mounts {
            match self.unmount_iso(&m).await {
                Ok(_) => count += 1,
                Err(e) => warn!("stale mount {} not removed: {e}", m.display()),
            }
        }
        count
    }
}

fn access(path: &Path, mode: libc::c_int) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), mode) == 0 }
}

/// Decode the octal escapes (`\040` etc.) the kernel uses in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|oct| u8::from_str_radix(oct, 8).ok());
            if let Some(v) = decoded {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// True for a single path segment that cannot escape its parent directory.
pub fn is_plain_file_name(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains('/') && !s.contains('\0')
}

/// The last `/`-separated segment of `s`.
pub fn get_file_name_from_str(s: &str) -> &str {
    s.rsplit('/').next().unwrap_or("")
}

/// File name of a local ISO path; it must end in `.iso`.
pub fn get_iso_name_from_path(s: &str) -> Result<String, FsError> {
    let name = get_file_name_from_str(s);
    if name.len() > ISO_EXTENSION.len() && name.ends_with(ISO_EXTENSION) {
        Ok(name.to_string())
    } else {
        Err(FsError::InvalidIsoName {
            input: s.to_string(),
        })
    }
}

/// File name to store a downloaded ISO under.
///
/// Uses the trailing URL segment when it names an ISO, else `{name}-{version}.iso`.
pub fn get_iso_name_from_web_link(name: &str, version: &str, url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    get_iso_name_from_path(path).unwrap_or_else(|_| format!("{name}-{version}{ISO_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ops() -> FsOps {
        FsOps::new(Arc::new(TokioRunner::default()))
    }

    #[test]
    fn iso_name_from_path() {
        assert_eq!(
            get_iso_name_from_path("/tmp/dl/centos-7.iso").unwrap(),
            "centos-7.iso"
        );
        assert_eq!(get_iso_name_from_path("centos.iso").unwrap(), "centos.iso");
        assert!(matches!(
            get_iso_name_from_path("/tmp/dl/centos-7.img"),
            Err(FsError::InvalidIsoName { .. })
        ));
        assert!(get_iso_name_from_path("/tmp/dl/").is_err());
        assert!(get_iso_name_from_path(".iso").is_err());
    }

    #[test]
    fn iso_name_from_web_link() {
        assert_eq!(
            get_iso_name_from_web_link("centos", "7.0", "http://mirror/x/CentOS-7.iso"),
            "CentOS-7.iso"
        );
        assert_eq!(
            get_iso_name_from_web_link("centos", "7.0", "http://mirror/x/CentOS-7.iso?dl=1"),
            "CentOS-7.iso"
        );
        assert_eq!(
            get_iso_name_from_web_link("centos", "7.0", "http://mirror/download"),
            "centos-7.0.iso"
        );
    }

    #[test]
    fn plain_file_names() {
        assert!(is_plain_file_name("centos-7.iso"));
        assert!(!is_plain_file_name("../etc/passwd"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }

    #[tokio::test]
    async fn is_mounted_reads_table() {
        let root = tempdir().unwrap();
        let table = root.path().join("mounts");
        std::fs::write(&table, "/dev/loop0 /srv/files/centos/7.0 iso9660 ro 0 0\n").unwrap();
        let ops = ops().with_mount_table(&table);
        assert!(ops.is_mounted(Path::new("/srv/files/centos/7.0")).await.unwrap());
        assert!(!ops.is_mounted(Path::new("/srv/files/centos/8.0")).await.unwrap());
    }

    #[test]
    fn mount_table_escapes() {
        assert_eq!(unescape_mount_field("/srv/my\\040dir"), "/srv/my dir");
        assert_eq!(unescape_mount_field("/plain"), "/plain");
        assert_eq!(unescape_mount_field("/trailing\\"), "/trailing\\");
    }

    #[tokio::test]
    async fn prepare_writable_dir_creates_nested() {
        let root = tempdir().unwrap();
        let dir = root.path().join("a/b/c");
        ops().prepare_writable_dir(&dir).await.unwrap();
        assert!(dir.is_dir());
        // Second call is a no-op on an existing writable dir.
        ops().prepare_writable_dir(&dir).await.unwrap();
    }

    #[test]
    fn readable_probe_does_not_fail_on_missing() {
        let root = tempdir().unwrap();
        assert!(!ops().check_path_readable(&root.path().join("missing")));
        assert!(ops().check_path_readable(root.path()));
    }

    #[tokio::test]
    async fn remove_file_tolerates_absent() {
        let root = tempdir().unwrap();
        let f = root.path().join("x.iso");
        tokio::fs::write(&f, b"data").await.unwrap();
        ops().remove_file(&f).await.unwrap();
        assert!(!f.exists());
        ops().remove_file(&f).await.unwrap();
    }

    #[tokio::test]
    async fn symlink_overwrites_existing() {
        let root = tempdir().unwrap();
        let a = root.path().join("a.iso");
        let b = root.path().join("b.iso");
        tokio::fs::write(&a, b"a").await.unwrap();
        tokio::fs::write(&b, b"b").await.unwrap();
        let dest = root.path().join("store/link.iso");

        ops().create_symbol_link(&a, &dest).await.unwrap();
        ops().create_symbol_link(&b, &dest).await.unwrap();
        assert_eq!(std::fs::read_link(&dest).unwrap(), b);
    }

    #[tokio::test]
    async fn prune_removes_empty_parent_only() {
        let root = tempdir().unwrap();
        let v1 = root.path().join("centos/7.0");
        let v2 = root.path().join("centos/8.0");
        std::fs::create_dir_all(&v1).unwrap();
        std::fs::create_dir_all(&v2).unwrap();

        ops().remove_dir_and_empty_parent(&v1).await;
        assert!(!v1.exists());
        assert!(root.path().join("centos").exists());

        ops().remove_dir_and_empty_parent(&v2).await;
        assert!(!root.path().join("centos").exists());

        // Already gone: must not panic or error.
        ops().remove_dir_and_empty_parent(&v2).await;
    }

    #[tokio::test]
    async fn mounts_under_root_are_listed_deepest_first() {
        let root = tempdir().unwrap();
        let table = root.path().join("mounts");
        std::fs::write(
            &table,
            "proc /proc proc rw 0 0\n\
             /dev/loop0 /srv/files/centos/7.0 iso9660 ro 0 0\n\
             /dev/loop1 /srv/files/esxi/6.5\\040u1 iso9660 ro 0 0\n\
             /dev/loop2 /srv/files/centos/7.0/nested iso9660 ro 0 0\n\
             /dev/loop3 /srv/other iso9660 ro 0 0\n",
        )
        .unwrap();

        let mounts = ops()
            .with_mount_table(&table)
            .list_mounts_under(Path::new("/srv/files"))
            .await
            .unwrap();
        assert_eq!(
            mounts,
            vec![
                PathBuf::from("/srv/files/centos/7.0/nested"),
                PathBuf::from("/srv/files/centos/7.0"),
                PathBuf::from("/srv/files/esxi/6.5 u1"),
            ]
        );
    }
}
