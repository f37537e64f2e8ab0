//! Integration tests for the image inventory.
//!
//! Unit tests (no root required):
//! ```bash
//! cargo test --test inventory_test -- --test-threads=1
//! ```
//!
//! Loop-mount tests (require root and an ISO authoring tool):
//! ```bash
//! sudo -E cargo test --test inventory_test -- --ignored --nocapture --test-threads=1
//! ```

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use image_service::{
    fsop::{mock::MockRunner, FsOps, TokioRunner},
    inventory::{ImageQuery, ImageStatus, Inventory, IsoSource, RawImage},
    store::ImageStore,
    util::config::{ResolvedPaths, ServiceConfig},
};
use serial_test::serial;
use tempfile::tempdir;
use tokio::time::Duration;
use uuid::Uuid;

fn mocked(root: &Path) -> (Arc<MockRunner>, FsOps) {
    let table = root.join("mounts");
    let runner = Arc::new(MockRunner::with_mount_table(&table));
    let fs = FsOps::new(runner.clone()).with_mount_table(table);
    (runner, fs)
}

async fn inventory_at(root: &Path, fs: FsOps) -> Inventory {
    let paths = ResolvedPaths::under(root);
    ImageStore::create_if_missing(&paths.inventory_file)
        .await
        .unwrap();
    let inventory = Inventory::new(paths, fs);
    inventory.initialize().await.unwrap();
    inventory
}

// =============================================================================
// Mocked mount tests (no root required)
// =============================================================================

#[tokio::test]
async fn test_restart_restores_mounts() {
    let root = tempdir().unwrap();
    let (_runner, fs) = mocked(root.path());

    let first = inventory_at(root.path(), fs.clone()).await;
    std::fs::write(first.iso_path("centos-7.0.iso"), b"ISO").unwrap();
    let image = first
        .add_image_from_source("centos", "7.0", IsoSource::Store("centos-7.0.iso".into()))
        .await
        .unwrap();
    drop(first);

    // A second process over the same files finds the previous mount still in place.
    let second = inventory_at(root.path(), fs.clone()).await;
    let report = second.boot().await.unwrap();
    assert_eq!(report.restored, vec![image.clone()]);
    assert!(report.removed.is_empty());
    assert!(fs.is_mounted(&second.mount_dir(&image)).await.unwrap());
    assert_eq!(fs.list_mounts_under(&second.paths().http_root).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_boot_leaves_only_servable_records() {
    let root = tempdir().unwrap();
    let (_runner, fs) = mocked(root.path());
    let paths = ResolvedPaths::under(root.path());
    let doc = serde_json::json!({
        "images": [
            {"id": Uuid::new_v4(), "name": "centos", "version": "7.0", "iso": "centos-7.0.iso", "status": "OK"},
            {"id": Uuid::new_v4(), "name": "centos", "version": "6.5", "iso": "gone.iso", "status": "OK"},
            {"id": Uuid::new_v4(), "name": "esxi", "version": "6.0", "iso": "esxi.iso", "status": "preparing"},
            {"id": Uuid::new_v4(), "name": "rhel", "version": "7.2", "iso": "rhel.iso", "status": "download failed"}
        ]
    });
    std::fs::create_dir_all(&paths.iso_dir).unwrap();
    std::fs::write(&paths.inventory_file, doc.to_string()).unwrap();
    for iso in ["centos-7.0.iso", "esxi.iso", "rhel.iso"] {
        std::fs::write(paths.iso_dir.join(iso), b"ISO").unwrap();
    }

    let inventory = inventory_at(root.path(), fs.clone()).await;
    let report = inventory.boot().await.unwrap();
    assert_eq!(report.restored.len(), 1);
    assert_eq!(report.removed.len(), 3);

    let on_disk = ImageStore::load(&paths.inventory_file).await.unwrap();
    let remaining = on_disk.find_images_by_query(&ImageQuery::default()).await;
    assert_eq!(remaining.len(), 1);
    for image in remaining {
        assert_eq!(image.status, ImageStatus::Ok);
        assert!(fs.is_mounted(&inventory.mount_dir(&image)).await.unwrap());
    }
}

#[tokio::test]
async fn test_second_add_fails_and_store_holds_one() {
    let root = tempdir().unwrap();
    let (_runner, fs) = mocked(root.path());
    let inventory = inventory_at(root.path(), fs).await;
    std::fs::write(inventory.iso_path("centos-7.0.iso"), b"ISO").unwrap();

    let raw = RawImage {
        id: Some(Uuid::new_v4().to_string()),
        name: Some("centos".into()),
        version: Some("7.0".into()),
        iso: Some("centos-7.0.iso".into()),
        status: Some("preparing".into()),
    };
    inventory.add_image(&raw).await.unwrap();
    assert!(inventory.add_image(&raw).await.is_err());

    let matching = inventory
        .find_images_by_query(&ImageQuery::name_version("centos", "7.0"))
        .await
        .unwrap();
    assert_eq!(matching.len(), 1);
}

#[tokio::test]
async fn test_concurrent_adds_persist_once() {
    let root = tempdir().unwrap();
    let (_runner, fs) = mocked(root.path());
    let inventory = Arc::new(inventory_at(root.path(), fs).await);
    std::fs::write(inventory.iso_path("centos-7.0.iso"), b"ISO").unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let inv = inventory.clone();
        handles.push(tokio::spawn(async move {
            inv.add_image_from_source("centos", "7.0", IsoSource::Store("centos-7.0.iso".into()))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
    let all = inventory
        .find_images_by_query(&ImageQuery::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_relative_config_resolves_against_working_directory() {
    let root = tempdir().unwrap();
    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(root.path()).unwrap();

    let config = ServiceConfig::from_toml_str(
        r#"
        isoDir = "./iso"
        httpFileServiceRootDir = "./files"
        "#,
    )
    .unwrap();
    let paths = config.resolve(&std::env::current_dir().unwrap());
    std::env::set_current_dir(previous).unwrap();

    let canonical = std::fs::canonicalize(root.path()).unwrap();
    assert_eq!(paths.iso_dir, canonical.join("iso"));
    assert_eq!(paths.http_root, canonical.join("files"));
}

// =============================================================================
// Real loop mount tests (require root)
// =============================================================================

fn loop_mount_prereqs_available() -> bool {
    let uid = unsafe { libc::geteuid() };
    if uid != 0 {
        println!("Skipping: requires root privileges");
        return false;
    }

    if !Path::new("/dev/loop-control").exists() {
        println!("Skipping: loop devices not available");
        return false;
    }

    if iso_tool().is_none() {
        println!("Skipping: no genisoimage, mkisofs or xorriso found");
        return false;
    }

    true
}

fn iso_tool() -> Option<Vec<&'static str>> {
    [
        vec!["genisoimage"],
        vec!["mkisofs"],
        vec!["xorriso", "-as", "mkisofs"],
    ]
    .into_iter()
    .find(|cmd| Command::new(cmd[0]).arg("--version").output().is_ok())
}

fn build_iso(content_dir: &Path, out: &Path) {
    let cmd = iso_tool().unwrap();
    let status = Command::new(cmd[0])
        .args(&cmd[1..])
        .args(["-quiet", "-R", "-o"])
        .arg(out)
        .arg(content_dir)
        .status()
        .unwrap();
    assert!(status.success(), "ISO authoring failed");
}

/// Add an image backed by a real ISO, read it through the mount, then delete it.
///
/// Run with:
///   sudo -E cargo test --test inventory_test test_loop_mount_round_trip -- --exact --ignored --nocapture
#[tokio::test]
#[ignore]
#[serial]
async fn test_loop_mount_round_trip() {
    let test_future = async {
        if !loop_mount_prereqs_available() {
            return;
        }

        let base = PathBuf::from(format!("/tmp/image_service_test_{}", Uuid::new_v4()));
        let content = base.join("content");
        std::fs::create_dir_all(content.join("images/pxeboot")).unwrap();
        std::fs::write(content.join("images/pxeboot/vmlinuz"), b"kernel").unwrap();

        let fs = FsOps::new(Arc::new(TokioRunner::new(Duration::from_secs(60))));
        let inventory = inventory_at(&base, fs.clone()).await;
        build_iso(&content, &inventory.iso_path("fixture-1.0.iso"));

        let image = inventory
            .add_image_from_source("fixture", "1.0", IsoSource::Store("fixture-1.0.iso".into()))
            .await
            .expect("add should mount the ISO");
        assert_eq!(image.status, ImageStatus::Ok);

        let mount_dir = inventory.mount_dir(&image);
        assert!(fs.is_mounted(&mount_dir).await.unwrap());
        let kernel = std::fs::read(mount_dir.join("images/pxeboot/vmlinuz")).unwrap();
        assert_eq!(kernel, b"kernel");
        println!("✓ ISO contents visible at {}", mount_dir.display());

        inventory
            .delete_image_by_query(&ImageQuery::name_version("fixture", "1.0"))
            .await
            .expect("delete should unmount");
        assert!(!mount_dir.exists());
        assert!(!fs.is_mounted(&mount_dir).await.unwrap());
        println!("✓ Mount removed and directory pruned");

        let _ = std::fs::remove_dir_all(&base);
    };

    match tokio::time::timeout(Duration::from_secs(120), test_future).await {
        Ok(_) => println!("✓ Test passed"),
        Err(_) => panic!("Test timed out after 120 seconds"),
    }
}

/// Stale loop mounts from a previous run are removed at boot.
///
/// Run with:
///   sudo -E cargo test --test inventory_test test_boot_clears_stale_loop_mounts -- --exact --ignored --nocapture
#[tokio::test]
#[ignore]
#[serial]
async fn test_boot_clears_stale_loop_mounts() {
    if !loop_mount_prereqs_available() {
        return;
    }

    let base = PathBuf::from(format!("/tmp/image_service_stale_{}", Uuid::new_v4()));
    let content = base.join("content");
    std::fs::create_dir_all(&content).unwrap();
    std::fs::write(content.join("README"), b"stale").unwrap();

    let fs = FsOps::new(Arc::new(TokioRunner::new(Duration::from_secs(60))));
    let inventory = inventory_at(&base, fs.clone()).await;
    let iso = inventory.iso_path("stale.iso");
    build_iso(&content, &iso);

    let stale = inventory.paths().http_root.join("orphan/0.1");
    fs.mount_iso(&iso, &stale).await.unwrap();
    assert!(fs.is_mounted(&stale).await.unwrap());

    let report = inventory.boot().await.unwrap();
    assert!(report.restored.is_empty());
    assert!(!fs.is_mounted(&stale).await.unwrap());

    let _ = std::fs::remove_dir_all(&base);
}
