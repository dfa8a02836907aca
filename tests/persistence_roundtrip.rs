//! Images survive flush and remount

use pixelmap::core::layout::{sidecar_path, LayoutSource};
use pixelmap::{MountConfig, PixelMapError, PixelMapFs, ZoneThresholds};
use tempfile::TempDir;

#[test]
fn test_flush_and_remount() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("store.png");

    {
        let fs = PixelMapFs::create_image(&image, 256, MountConfig::read_write()).unwrap();
        fs.write("/notes/today.md", b"# Today\n- ship it\n", 0).unwrap();
        fs.write("/big.bin", &vec![0xC3; 12_345], 0).unwrap();
        fs.create("/empty", 0o600).unwrap();
        fs.destroy().unwrap();
    }

    let fs = PixelMapFs::mount(&image, MountConfig::default()).unwrap();
    assert_eq!(fs.layout_source(), LayoutSource::Embedded);
    assert_eq!(
        fs.read("/notes/today.md", 100, 0).unwrap(),
        b"# Today\n- ship it\n"
    );
    assert_eq!(fs.read("/big.bin", 20_000, 0).unwrap(), vec![0xC3; 12_345]);

    let empty = fs.getattr("/empty").unwrap();
    assert_eq!(empty.size, 0);
    assert_eq!(empty.mode, 0o600);
    assert!(fs.read("/empty", 10, 0).unwrap().is_empty());
    assert!(!sidecar_path(&image).exists());
}

#[test]
fn test_remount_keeps_allocations() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("alloc.png");
    {
        let fs = PixelMapFs::create_image(&image, 128, MountConfig::read_write()).unwrap();
        fs.write("/a", &vec![1u8; 8192], 0).unwrap();
        fs.flush().unwrap();
    }

    let fs = PixelMapFs::mount(&image, MountConfig::read_write()).unwrap();
    let before = fs.statfs();
    fs.write("/b", &vec![2u8; 8192], 0).unwrap();
    assert_eq!(fs.statfs().free_clusters, before.free_clusters - 2);
    assert_eq!(fs.read("/a", 8192, 0).unwrap(), vec![1u8; 8192]);
    assert_eq!(fs.read("/b", 8192, 0).unwrap(), vec![2u8; 8192]);
}

#[test]
fn test_oversized_vat_goes_to_sidecar() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("crowded.png");
    let names: Vec<String> = (0..12).map(|i| format!("/{}{:02}", "n".repeat(300), i)).collect();

    {
        let fs = PixelMapFs::create_image(&image, 128, MountConfig::read_write()).unwrap();
        for (i, name) in names.iter().enumerate() {
            fs.write(name, &[i as u8; 16], 0).unwrap();
        }
        fs.flush().unwrap();
    }
    assert!(sidecar_path(&image).exists());

    let fs = PixelMapFs::mount(&image, MountConfig::default()).unwrap();
    assert_eq!(fs.layout_source(), LayoutSource::Sidecar);
    for (i, name) in names.iter().enumerate() {
        assert_eq!(fs.read(name, 16, 0).unwrap(), vec![i as u8; 16]);
    }
}

#[test]
fn test_compressed_file_survives_remount() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("cold.png");
    let mut config = MountConfig::read_write();
    config.zones = ZoneThresholds {
        hot: 0.001,
        warm: 0.002,
        temperate: 0.003,
        cool: 0.004,
    };
    let text: Vec<u8> = b"0123456789abcdef".iter().copied().cycle().take(30_000).collect();

    {
        let fs = PixelMapFs::create_image(&image, 256, config.clone()).unwrap();
        fs.write("/cold.log", &text, 0).unwrap();
        assert_eq!(fs.compress_idle(pixelmap::core::unix_now() + 7200.0).unwrap(), 1);
        fs.flush().unwrap();
    }

    let fs = PixelMapFs::mount(&image, config).unwrap();
    let info = fs.getattr("/cold.log").unwrap();
    assert!(info.compressed);
    assert_eq!(info.chain.len(), 1);
    assert_eq!(fs.read("/cold.log", 40_000, 0).unwrap(), text);
    assert_eq!(fs.read("/cold.log", 4, 16).unwrap(), b"0123");
}

#[test]
fn test_access_log_written_on_destroy() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("log.png");
    let fs = PixelMapFs::create_image(&image, 128, MountConfig::read_write()).unwrap();
    fs.write("/r", b"read me", 0).unwrap();
    for _ in 0..3 {
        fs.read("/r", 7, 0).unwrap();
    }
    fs.destroy().unwrap();

    let log = std::fs::read(dir.path().join("log.png.access.json")).unwrap();
    let counts: std::collections::BTreeMap<String, u64> = serde_json::from_slice(&log).unwrap();
    assert_eq!(counts.get("r"), Some(&3));
}

#[test]
fn test_history_import_version_mismatch() {
    let fs = PixelMapFs::format(128, MountConfig::read_write()).unwrap();
    fs.write("/h", b"x", 0).unwrap();
    fs.read("/h", 1, 0).unwrap();

    let mut doc = fs.export_access_history();
    assert_eq!(doc.entries.len(), 1);
    doc.version = "0.1".to_string();
    assert!(matches!(
        fs.import_access_history(doc),
        Err(PixelMapError::VersionMismatch { .. })
    ));
}

#[test]
fn test_corrupt_png_is_an_error() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("garbage.png");
    std::fs::write(&image, b"definitely not a png").unwrap();
    assert!(PixelMapFs::mount(&image, MountConfig::default()).is_err());
}
