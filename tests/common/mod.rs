//! In-memory daemon and registry used by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use imgkit::constants::{
    DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE,
};
use imgkit::error::{ImageError, Result};
use imgkit::local::daemon::InspectRootFs;
use imgkit::local::{ArchiveStream, DaemonClient, ImageInspect};
use imgkit::oci::config::{ConfigFile, ContainerConfig};
use imgkit::oci::manifest::{ArchiveManifestEntry, Descriptor, ImageManifest};
use imgkit::oci::registry::{Credentials, Registry};
use imgkit::oci::utils::{prefixed, sha256_bytes};
use imgkit::reference::Reference;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub fn diff_id(content: &[u8]) -> String {
    prefixed(&sha256_bytes(content))
}

pub fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

/// Write a layer tarball stand-in and return its path
pub fn layer_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

pub fn labels(pairs: &[(&str, &str)]) -> ContainerConfig {
    let mut config = ContainerConfig::default();
    for (k, v) in pairs {
        config.labels.insert(k.to_string(), v.to_string());
    }
    config
}

fn tar_entries(bytes: &[u8]) -> std::result::Result<HashMap<String, Vec<u8>>, String> {
    let mut archive = tar::Archive::new(bytes);
    let mut entries = HashMap::new();
    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let name = entry
            .path()
            .map_err(|e| e.to_string())?
            .to_string_lossy()
            .to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(|e| e.to_string())?;
        entries.insert(name, data);
    }
    Ok(entries)
}

fn append(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, data).unwrap();
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub id: String,
    pub tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub raw_config: Vec<u8>,
    pub config: ConfigFile,
}

impl StoredImage {
    fn answers_to(&self, name: &str) -> bool {
        self.id == name
            || self
                .tags
                .iter()
                .any(|t| t == name || *t == format!("{}:latest", name))
    }

    pub fn diff_ids(&self) -> &[String] {
        &self.config.rootfs.diff_ids
    }
}

/// Daemon image store that speaks the save/load archive format
#[derive(Default)]
pub struct MemoryDaemon {
    images: Mutex<Vec<StoredImage>>,
    layers: Mutex<HashMap<String, Vec<u8>>>,
    exports: AtomicUsize,
    imports: AtomicUsize,
    fail_imports: AtomicBool,
    drop_imports: AtomicBool,
}

impl MemoryDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an image built from raw layer contents, returning its diff IDs
    pub fn seed(&self, name: &str, config: ContainerConfig, layers: &[&str]) -> Vec<String> {
        let diff_ids: Vec<String> = layers.iter().map(|l| diff_id(l.as_bytes())).collect();
        {
            let mut store = self.layers.lock();
            for (id, content) in diff_ids.iter().zip(layers) {
                store.insert(id.clone(), content.as_bytes().to_vec());
            }
        }
        let config =
            ConfigFile::for_layers(config, Some("amd64".to_string()), diff_ids.clone(), Utc::now());
        let raw_config = serde_json::to_vec(&config).unwrap();
        self.store(StoredImage {
            id: diff_id(&raw_config),
            tags: vec![name.to_string()],
            repo_digests: Vec::new(),
            raw_config,
            config,
        });
        diff_ids
    }

    fn store(&self, image: StoredImage) {
        let mut images = self.images.lock();
        for existing in images.iter_mut() {
            existing.tags.retain(|t| !image.tags.contains(t));
        }
        images.retain(|i| i.id != image.id);
        images.push(image);
    }

    pub fn set_repo_digests(&self, name: &str, digests: &[&str]) {
        let mut images = self.images.lock();
        if let Some(image) = images.iter_mut().find(|i| i.answers_to(name)) {
            image.repo_digests = digests.iter().map(|d| d.to_string()).collect();
        }
    }

    pub fn image(&self, name: &str) -> Option<StoredImage> {
        self.images.lock().iter().find(|i| i.answers_to(name)).cloned()
    }

    pub fn layer(&self, diff_id: &str) -> Option<Vec<u8>> {
        self.layers.lock().get(diff_id).cloned()
    }

    pub fn export_count(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }

    pub fn import_count(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    /// Reject every archive after reading it
    pub fn fail_imports(&self) {
        self.fail_imports.store(true, Ordering::SeqCst);
    }

    /// Accept archives but keep nothing
    pub fn drop_imports(&self) {
        self.drop_imports.store(true, Ordering::SeqCst);
    }

    fn load(&self, bytes: &[u8]) -> std::result::Result<(), String> {
        let entries = tar_entries(bytes)?;
        let manifest = entries
            .get("manifest.json")
            .ok_or_else(|| "archive has no manifest.json".to_string())?;
        let manifest: Vec<ArchiveManifestEntry> =
            serde_json::from_slice(manifest).map_err(|e| e.to_string())?;
        if manifest.len() != 1 {
            return Err(format!("expected 1 image, got {}", manifest.len()));
        }
        let entry = &manifest[0];

        let raw_config = entries
            .get(&entry.config)
            .cloned()
            .ok_or_else(|| format!("missing config {}", entry.config))?;
        let config: ConfigFile = serde_json::from_slice(&raw_config).map_err(|e| e.to_string())?;
        if entry.layers.len() != config.rootfs.diff_ids.len() {
            return Err("layer count does not match diff IDs".to_string());
        }

        let mut added = Vec::new();
        for (name, id) in entry.layers.iter().zip(&config.rootfs.diff_ids) {
            if name.is_empty() {
                if !self.layers.lock().contains_key(id) {
                    return Err(format!("layer {} is not in the store", id));
                }
                continue;
            }
            let content = entries
                .get(name)
                .ok_or_else(|| format!("missing layer entry {}", name))?;
            if &diff_id(content) != id {
                return Err(format!("layer {} does not hash to {}", name, id));
            }
            added.push((id.clone(), content.clone()));
        }

        if self.drop_imports.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.layers.lock().extend(added);
        self.store(StoredImage {
            id: diff_id(&raw_config),
            tags: entry.repo_tags.clone(),
            repo_digests: Vec::new(),
            raw_config,
            config,
        });
        Ok(())
    }

    fn save_archive(&self, image: &StoredImage) -> Vec<u8> {
        let store = self.layers.lock();
        let mut builder = tar::Builder::new(Vec::new());
        let config_name = format!("{}.json", image.id.trim_start_matches("sha256:"));
        append(&mut builder, &config_name, &image.raw_config);

        let mut names = Vec::new();
        for id in image.diff_ids() {
            let name = format!("{}/layer.tar", id.trim_start_matches("sha256:"));
            let content = store.get(id).cloned().unwrap_or_default();
            append(&mut builder, &name, &content);
            names.push(name);
        }
        let manifest = vec![ArchiveManifestEntry {
            config: config_name,
            repo_tags: image.tags.clone(),
            layers: names,
        }];
        append(
            &mut builder,
            "manifest.json",
            &serde_json::to_vec(&manifest).unwrap(),
        );
        builder.into_inner().unwrap()
    }
}

#[async_trait]
impl DaemonClient for MemoryDaemon {
    async fn inspect(&self, name: &str) -> Result<Option<ImageInspect>> {
        Ok(self.image(name).map(|image| ImageInspect {
            id: image.id.clone(),
            repo_tags: image.tags.clone(),
            repo_digests: image.repo_digests.clone(),
            created: image.config.created.clone(),
            architecture: image.config.architecture.clone(),
            config: Some(image.config.config.clone()),
            rootfs: InspectRootFs {
                layers: image.config.rootfs.diff_ids.clone(),
            },
        }))
    }

    async fn import_archive(&self, mut archive: ArchiveStream) -> Result<()> {
        self.imports.fetch_add(1, Ordering::SeqCst);
        let mut bytes = Vec::new();
        archive
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| ImageError::daemon("load", e))?;
        if self.fail_imports.load(Ordering::SeqCst) {
            return Err(ImageError::daemon("load", "daemon refused archive"));
        }
        self.load(&bytes).map_err(|e| ImageError::daemon("load", e))
    }

    async fn export_archive(
        &self,
        name: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        let image = self
            .image(name)
            .ok_or_else(|| ImageError::daemon(format!("save {}", name), "No such image"))?;
        let bytes = self.save_archive(&image);
        dest.write_all(&bytes)
            .await
            .map_err(|e| ImageError::io("write export", e))?;
        dest.flush()
            .await
            .map_err(|e| ImageError::io("write export", e))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut images = self.images.lock();
        let before = images.len();
        images.retain(|i| i.id != id);
        if images.len() == before {
            return Err(ImageError::daemon(format!("remove {}", id), "No such image"));
        }
        Ok(())
    }
}

fn repo_key(reference: &Reference) -> String {
    format!("{}/{}", reference.registry(), reference.repository())
}

/// Registry keeping blobs and manifests per repository
#[derive(Default)]
pub struct MemoryRegistry {
    blobs: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    manifests: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    manifest_fetches: AtomicUsize,
    blob_uploads: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_blob(&self, key: &str, digest: String, data: Vec<u8>) {
        self.blobs
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(digest, data);
    }

    /// Store a manifest under the reference's tag and its digest
    pub fn insert_manifest(&self, reference: &Reference, raw: Vec<u8>) -> String {
        let digest = diff_id(&raw);
        let mut manifests = self.manifests.lock();
        let repo = manifests.entry(repo_key(reference)).or_default();
        repo.insert(reference.identifier().to_string(), raw.clone());
        repo.insert(digest.clone(), raw);
        digest
    }

    /// Push an image built from raw layer contents, returning its diff IDs
    pub fn seed(&self, name: &str, config: ContainerConfig, layers: &[&str]) -> Vec<String> {
        let reference = Reference::parse(name).unwrap();
        let key = repo_key(&reference);
        let diff_ids: Vec<String> = layers.iter().map(|l| diff_id(l.as_bytes())).collect();

        let mut descriptors = Vec::new();
        for content in layers {
            let blob = gzip(content.as_bytes());
            let digest = diff_id(&blob);
            descriptors.push(Descriptor {
                media_type: DOCKER_LAYER_MEDIA_TYPE.to_string(),
                digest: digest.clone(),
                size: blob.len() as u64,
            });
            self.insert_blob(&key, digest, blob);
        }

        let config =
            ConfigFile::for_layers(config, Some("amd64".to_string()), diff_ids.clone(), Utc::now());
        let raw_config = serde_json::to_vec(&config).unwrap();
        let config_digest = diff_id(&raw_config);
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(DOCKER_MANIFEST_MEDIA_TYPE.to_string()),
            config: Descriptor {
                media_type: DOCKER_CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest.clone(),
                size: raw_config.len() as u64,
            },
            layers: descriptors,
        };
        self.insert_blob(&key, config_digest, raw_config);
        self.insert_manifest(&reference, serde_json::to_vec(&manifest).unwrap());
        diff_ids
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        let reference = Reference::parse(repository).unwrap();
        self.blobs
            .lock()
            .get(&repo_key(&reference))
            .map(|blobs| blobs.contains_key(digest))
            .unwrap_or(false)
    }

    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    pub fn blob_uploads(&self) -> usize {
        self.blob_uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn manifest(
        &self,
        reference: &Reference,
        _auth: Option<&Credentials>,
    ) -> Result<Option<(String, Vec<u8>)>> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .manifests
            .lock()
            .get(&repo_key(reference))
            .and_then(|repo| repo.get(reference.identifier()))
            .map(|raw| (diff_id(raw), raw.clone())))
    }

    async fn blob(
        &self,
        repository: &Reference,
        digest: &str,
        _auth: Option<&Credentials>,
    ) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(&repo_key(repository))
            .and_then(|blobs| blobs.get(digest))
            .cloned()
            .ok_or_else(|| ImageError::registry(format!("download blob {}", digest), "blob unknown"))
    }

    async fn blob_exists(
        &self,
        repository: &Reference,
        digest: &str,
        _auth: Option<&Credentials>,
    ) -> Result<bool> {
        Ok(self
            .blobs
            .lock()
            .get(&repo_key(repository))
            .map(|blobs| blobs.contains_key(digest))
            .unwrap_or(false))
    }

    async fn put_blob(
        &self,
        repository: &Reference,
        digest: &str,
        data: Vec<u8>,
        _auth: Option<&Credentials>,
    ) -> Result<()> {
        if diff_id(&data) != digest {
            return Err(ImageError::registry(
                format!("upload blob {}", digest),
                "digest does not match content",
            ));
        }
        self.blob_uploads.fetch_add(1, Ordering::SeqCst);
        self.insert_blob(&repo_key(repository), digest.to_string(), data);
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        _media_type: &str,
        data: Vec<u8>,
        _auth: Option<&Credentials>,
    ) -> Result<String> {
        let manifest: ImageManifest = serde_json::from_slice(&data)
            .map_err(|e| ImageError::json("parse pushed manifest", e))?;
        {
            let blobs = self.blobs.lock();
            let repo = blobs.get(&repo_key(reference));
            let present = |digest: &str| repo.map(|b| b.contains_key(digest)).unwrap_or(false);
            if let Some(missing) = std::iter::once(&manifest.config)
                .chain(&manifest.layers)
                .find(|d| !present(d.digest.as_str()))
            {
                return Err(ImageError::registry(
                    format!("upload manifest {}", reference),
                    format!("blob {} unknown to repository", missing.digest),
                ));
            }
        }
        Ok(self.insert_manifest(reference, data))
    }
}
