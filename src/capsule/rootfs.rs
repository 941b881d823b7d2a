//! Rootfs assembly from image layers.
//!
//! Layers are gzip (or plain) tar archives applied bottom-to-top into
//! a private directory, with overlay whiteout handling: `.wh.<name>`
//! deletes `<name>` from lower layers, `.wh..wh..opq` clears a
//! directory before the current layer repopulates it.
//!
//! Extraction is hostile-input code. Entry paths are rejected on `..`
//! components or absolute forms, link targets are checked against
//! rootfs escape, and cumulative size is capped.

use crate::constants::{MAX_LAYER_SIZE, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};
use crate::image::LayerDesc;
use crate::store::ContentStore;
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Component, Path};
use tar::Archive;
use tracing::debug;

/// Cap on entries per layer, against inode exhaustion.
const MAX_FILES_PER_LAYER: usize = 500_000;

/// Opaque-directory whiteout marker.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Extracts `layers` into `rootfs`, applying whiteouts in order.
pub fn extract_layers(layers: &[LayerDesc], rootfs: &Path, store: &ContentStore) -> Result<()> {
    fs::create_dir_all(rootfs).map_err(|e| Error::StorageError {
        path: rootfs.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut total_size = 0u64;
    for layer in layers {
        debug!(digest = %layer.digest, "extracting layer");
        let data = store.get(&layer.digest)?;
        if data.len() as u64 > MAX_LAYER_SIZE {
            return Err(Error::InvalidContent(format!(
                "layer {} exceeds {MAX_LAYER_SIZE} bytes",
                layer.digest
            )));
        }
        total_size = apply_layer(&data, &layer.media_type, rootfs, total_size)?;
    }
    Ok(())
}

fn apply_layer(data: &[u8], media_type: &str, rootfs: &Path, mut total_size: u64) -> Result<u64> {
    let reader: Box<dyn Read + '_> = if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
        Box::new(GzDecoder::new(data))
    } else {
        Box::new(data)
    };
    let mut archive = Archive::new(reader);

    let mut file_count = 0usize;
    for entry in archive.entries().map_err(|e| Error::InvalidContent(format!("bad layer archive: {e}")))? {
        file_count += 1;
        if file_count > MAX_FILES_PER_LAYER {
            return Err(Error::InvalidContent(format!(
                "layer exceeds {MAX_FILES_PER_LAYER} entries"
            )));
        }

        let mut entry = entry.map_err(|e| Error::InvalidContent(format!("bad layer entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::InvalidContent(format!("bad entry path: {e}")))?
            .into_owned();

        check_entry_path(&path)?;

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if filename == OPAQUE_WHITEOUT {
            let dir = rootfs.join(path.parent().unwrap_or(Path::new("")));
            if dir.exists() {
                let _ = fs::remove_dir_all(&dir);
                let _ = fs::create_dir_all(&dir);
            }
            continue;
        }
        if let Some(target) = filename.strip_prefix(".wh.") {
            let target_path = rootfs.join(path.parent().unwrap_or(Path::new(""))).join(target);
            let _ = fs::remove_file(&target_path);
            let _ = fs::remove_dir_all(&target_path);
            continue;
        }

        total_size += entry.size();
        if total_size > MAX_ROOTFS_SIZE {
            return Err(Error::InvalidContent(format!(
                "rootfs exceeds {MAX_ROOTFS_SIZE} bytes"
            )));
        }

        let entry_type = entry.header().entry_type();
        if (entry_type.is_symlink() || entry_type.is_hard_link())
            && let Ok(Some(target)) = entry.link_name()
        {
            check_link_target(&path, &target)?;
        }

        entry
            .unpack_in(rootfs)
            .map_err(|e| Error::InvalidContent(format!("unpack of {} failed: {e}", path.display())))?;
    }
    Ok(total_size)
}

fn check_entry_path(path: &Path) -> Result<()> {
    if path.is_absolute() {
        return Err(Error::InvalidContent(format!(
            "absolute entry path {}",
            path.display()
        )));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::InvalidContent(format!(
                "entry path {} traverses upward",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Rejects link targets that resolve above the rootfs.
///
/// A malicious lower layer could plant a link pointing outside the
/// tree for a later layer (or the capsule itself) to write through.
fn check_link_target(entry_path: &Path, target: &Path) -> Result<()> {
    if target.is_absolute() {
        // Absolute targets are re-rooted at extraction time; upward
        // components would still escape.
        if target.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::InvalidContent(format!(
                "link target {} escapes rootfs",
                target.display()
            )));
        }
        return Ok(());
    }

    let parent = entry_path.parent().unwrap_or(Path::new(""));
    let mut depth: i32 = parent.components().filter(|c| matches!(c, Component::Normal(_))).count() as i32;
    for component in target.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(Error::InvalidContent(format!(
                "link target {} escapes rootfs",
                target.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ObjectKind;
    use tempfile::TempDir;

    fn tar_layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_plain_tar_layer() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path().join("store")).unwrap();
        let rootfs = temp.path().join("rootfs");

        let archive = tar_layer(&[("etc/hostname", b"capsule")]);
        let digest = store.put(&archive, ObjectKind::Layer).unwrap();
        let layers = [LayerDesc {
            digest,
            size: archive.len() as u64,
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
        }];

        extract_layers(&layers, &rootfs, &store).unwrap();
        assert_eq!(fs::read(rootfs.join("etc/hostname")).unwrap(), b"capsule");
    }

    #[test]
    fn upper_layer_whiteout_removes_file() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path().join("store")).unwrap();
        let rootfs = temp.path().join("rootfs");

        let lower = tar_layer(&[("app/config", b"v1")]);
        let upper = tar_layer(&[("app/.wh.config", b"")]);
        let mut layers = Vec::new();
        for archive in [&lower, &upper] {
            let digest = store.put(archive, ObjectKind::Layer).unwrap();
            layers.push(LayerDesc {
                digest,
                size: archive.len() as u64,
                media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
            });
        }

        extract_layers(&layers, &rootfs, &store).unwrap();
        assert!(!rootfs.join("app/config").exists());
    }

    #[test]
    fn traversal_entry_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path().join("store")).unwrap();
        let rootfs = temp.path().join("rootfs");

        let archive = tar_layer(&[("../escape", b"pwned")]);
        let digest = store.put(&archive, ObjectKind::Layer).unwrap();
        let layers = [LayerDesc {
            digest,
            size: archive.len() as u64,
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
        }];

        assert!(extract_layers(&layers, &rootfs, &store).is_err());
        assert!(!temp.path().join("escape").exists());
    }
}
