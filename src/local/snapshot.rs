use crate::constants::{ARCHIVE_MANIFEST_FILE, PREVIOUS_IMAGE_DIR_PREFIX};
use crate::error::{ImageError, IoContext, Result};
use crate::local::daemon::DaemonClient;
use crate::oci::config::ConfigFile;
use crate::oci::manifest::ArchiveManifestEntry;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

/// One layer of an exported image: its diff ID and the extracted layer file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLayer {
    pub diff_id: String,
    pub path: PathBuf,
}

/// A persisted image exported to a temporary directory and indexed by
/// diff ID. The directory is removed when the snapshot is dropped.
#[derive(Debug)]
pub struct Snapshot {
    _dir: TempDir,
    layers: Vec<SnapshotLayer>,
}

impl Snapshot {
    /// Export `name` from the daemon, unpack it and index its layers
    pub async fn export(
        daemon: &dyn DaemonClient,
        name: &str,
        temp_root: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(PREVIOUS_IMAGE_DIR_PREFIX);
        let dir = match temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .io_context(|| "local reuse-layer create temp dir")?;

        let archive_path = dir.path().join("image.tar");
        let mut file = tokio::fs::File::create(&archive_path)
            .await
            .io_context(|| format!("create {}", archive_path.display()))?;
        daemon.export_archive(name, &mut file).await?;
        file.flush()
            .await
            .io_context(|| format!("write {}", archive_path.display()))?;
        drop(file);

        let image = name.to_string();
        tokio::task::spawn_blocking(move || {
            let root = dir.path().join("image");
            unpack(&archive_path, &root)?;
            if let Err(e) = fs::remove_file(&archive_path) {
                tracing::warn!(path = %archive_path.display(), error = %e, "Could not remove exported archive");
            }
            let layers = index(&image, &root)?;
            tracing::debug!(image = %image, layers = layers.len(), "Previous image exported");
            Ok(Snapshot { _dir: dir, layers })
        })
        .await
        .map_err(|e| ImageError::daemon(format!("export {}", name), e))?
    }

    /// File of the first layer with `diff_id`
    pub fn path_of(&self, diff_id: &str) -> Option<&Path> {
        self.layers
            .iter()
            .find(|l| l.diff_id == diff_id)
            .map(|l| l.path.as_path())
    }
}

fn unpack(archive_path: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive_path).io_context(|| format!("open {}", archive_path.display()))?;
    fs::create_dir_all(dest).io_context(|| format!("create {}", dest.display()))?;
    tar::Archive::new(file)
        .unpack(dest)
        .io_context(|| format!("untar {}", archive_path.display()))
}

/// Read `manifest.json` and the config it names from an unpacked save
/// archive, pairing each layer file with its diff ID.
pub fn index(image: &str, root: &Path) -> Result<Vec<SnapshotLayer>> {
    let corrupt = |reason: String| ImageError::ArchiveCorrupt {
        image: image.to_string(),
        reason,
    };

    let manifest_path = root.join(ARCHIVE_MANIFEST_FILE);
    let raw = fs::read(&manifest_path)
        .io_context(|| format!("read {}", manifest_path.display()))?;
    let mut manifest: Vec<ArchiveManifestEntry> = serde_json::from_slice(&raw)
        .map_err(|e| ImageError::json(format!("parse {}", ARCHIVE_MANIFEST_FILE), e))?;
    if manifest.len() != 1 {
        return Err(corrupt(format!(
            "manifest.json had unexpected number of entries: {}",
            manifest.len()
        )));
    }
    let entry = manifest.remove(0);

    let config_path = root.join(&entry.config);
    let raw = fs::read(&config_path).io_context(|| format!("read {}", config_path.display()))?;
    let config: ConfigFile = serde_json::from_slice(&raw)
        .map_err(|e| ImageError::json(format!("parse {}", entry.config), e))?;

    let diff_ids = config.rootfs.diff_ids;
    if entry.layers.len() != diff_ids.len() {
        return Err(corrupt(format!(
            "layers and diff IDs do not match, there are {} layers and {} diffIDs",
            entry.layers.len(),
            diff_ids.len()
        )));
    }

    Ok(diff_ids
        .into_iter()
        .zip(entry.layers)
        .map(|(diff_id, layer)| SnapshotLayer {
            diff_id,
            path: root.join(layer),
        })
        .collect())
}
