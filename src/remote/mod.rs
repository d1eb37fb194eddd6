//! Remote backend: images stored in a registry repository.

pub mod keychain;

pub use keychain::{AnonymousKeychain, Credentials, DockerConfigKeychain, Keychain};

use crate::constants::{
    DEFAULT_OS, DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE,
};
use crate::error::{ImageError, IoContext, Result};
use crate::image::{private, Backend, Image, ImageState};
use crate::layer::{find_layer, BlobRef, Layer, LayerSource};
use crate::oci::config::{ConfigFile, ContainerConfig, History};
use crate::oci::manifest::{Descriptor, ImageManifest};
use crate::oci::registry::Registry;
use crate::oci::utils::{prefixed, sha256_bytes};
use crate::previous::PreviousImage;
use crate::rebase;
use crate::reference::Reference;
use crate::{log_layer_added, log_layer_reused, log_rebase};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::any::Any;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// An image as a registry serves it: config plus blob-backed layers
#[derive(Debug, Clone)]
struct Resolved {
    digest: String,
    config_file: ConfigFile,
    layers: Vec<Layer>,
}

async fn resolve(
    registry: &dyn Registry,
    keychain: &dyn Keychain,
    name: &str,
) -> Result<Option<Resolved>> {
    let reference = Reference::parse(name)?;
    let auth = keychain.resolve(reference.registry())?;

    let Some((digest, raw)) = registry.manifest(&reference, auth.as_ref()).await? else {
        return Ok(None);
    };
    let value: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| ImageError::json(format!("parse manifest of {}", name), e))?;
    if value.get("manifests").is_some() {
        return Err(ImageError::BackendUnsupported {
            operation: format!("resolve {}", name),
            reason: "reference points at a manifest list".to_string(),
        });
    }
    let manifest: ImageManifest = serde_json::from_value(value)
        .map_err(|e| ImageError::json(format!("parse manifest of {}", name), e))?;

    let raw_config = registry
        .blob(&reference, &manifest.config.digest, auth.as_ref())
        .await?;
    let config_file: ConfigFile = serde_json::from_slice(&raw_config)
        .map_err(|e| ImageError::json(format!("parse config of {}", name), e))?;

    if config_file.rootfs.diff_ids.len() != manifest.layers.len() {
        return Err(ImageError::registry(
            format!("resolve {}", name),
            format!(
                "manifest has {} layers and config has {} diff IDs",
                manifest.layers.len(),
                config_file.rootfs.diff_ids.len()
            ),
        ));
    }
    let layers = config_file
        .rootfs
        .diff_ids
        .iter()
        .zip(manifest.layers)
        .map(|(diff_id, descriptor)| Layer {
            diff_id: diff_id.clone(),
            source: LayerSource::Blob(BlobRef {
                repository: reference.clone(),
                descriptor,
            }),
        })
        .collect();

    Ok(Some(Resolved {
        digest,
        config_file,
        layers,
    }))
}

/// An image in a registry.
///
/// Edits are kept in memory; [`Image::save`] pushes the missing blobs,
/// the config and a schema 2 manifest.
pub struct RemoteImage {
    state: ImageState,
    registry: Arc<dyn Registry>,
    keychain: Arc<dyn Keychain>,
    config_file: ConfigFile,
    digest: Option<String>,
    previous: PreviousImage<Vec<Layer>>,
}

impl RemoteImage {
    /// Resolve `name` through the registry. A missing image is not an
    /// error: the instance reports `found() == false`.
    pub async fn new(
        name: &str,
        registry: Arc<dyn Registry>,
        keychain: Arc<dyn Keychain>,
    ) -> Result<Self> {
        let resolved = resolve(registry.as_ref(), keychain.as_ref(), name).await?;
        let mut image = Self {
            state: ImageState::new(name, None, Vec::new()),
            registry,
            keychain,
            config_file: ConfigFile::default(),
            digest: None,
            previous: PreviousImage::new(),
        };
        if let Some(resolved) = resolved {
            debug!(image = %name, layers = resolved.layers.len(), "Resolved remote image");
            image.state.config = Some(resolved.config_file.config.clone());
            image.state.layers = resolved.layers;
            image.config_file = resolved.config_file;
            image.digest = Some(resolved.digest);
        }
        Ok(image)
    }

    /// A new image with an empty config and no layers
    pub fn empty(name: &str, registry: Arc<dyn Registry>, keychain: Arc<dyn Keychain>) -> Self {
        Self {
            state: ImageState::new(name, Some(ContainerConfig::default()), Vec::new()),
            registry,
            keychain,
            config_file: ConfigFile::default(),
            digest: None,
            previous: PreviousImage::new(),
        }
    }

    /// How many times the previous image has been resolved
    pub fn previous_fetch_count(&self) -> usize {
        self.previous.fetch_count()
    }

    /// The layer stack with sources, bottom to top
    pub fn layers(&self) -> &[Layer] {
        &self.state.layers
    }

    async fn load_previous(&self) -> Result<Arc<Vec<Layer>>> {
        let registry = Arc::clone(&self.registry);
        let keychain = Arc::clone(&self.keychain);
        let name = self.state.name.clone();
        self.previous
            .ensure_loaded(|| async move {
                debug!(image = %name, "Resolving previous image");
                resolve(registry.as_ref(), keychain.as_ref(), &name)
                    .await?
                    .map(|resolved| resolved.layers)
                    .ok_or_else(|| ImageError::not_found(&name, "load previous image"))
            })
            .await
    }

    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let auth = self.keychain.resolve(blob.repository.registry())?;
        self.registry
            .blob(&blob.repository, &blob.descriptor.digest, auth.as_ref())
            .await
    }

    fn open_layer(
        &self,
        layer: &Layer,
        compressed: Option<Vec<u8>>,
    ) -> Result<Box<dyn Read + Send>> {
        match (&layer.source, compressed) {
            (LayerSource::File(path), _) => {
                let file = std::fs::File::open(path)
                    .io_context(|| format!("open layer: {}", path.display()))?;
                Ok(Box::new(file))
            }
            (LayerSource::Blob(_), Some(bytes)) => {
                Ok(Box::new(GzDecoder::new(Cursor::new(bytes))))
            }
            _ => Err(ImageError::BackendUnsupported {
                operation: "get layer".to_string(),
                reason: format!("layer '{}' has no readable source", layer.diff_id),
            }),
        }
    }

    /// Make sure `layer` is in `target`, returning its descriptor there
    async fn push_layer(
        &self,
        target: &Reference,
        auth: Option<&Credentials>,
        layer: &Layer,
    ) -> Result<Descriptor> {
        match &layer.source {
            LayerSource::File(path) => {
                let (data, digest) = gzip_layer(path.clone()).await?;
                let descriptor = Descriptor {
                    media_type: DOCKER_LAYER_MEDIA_TYPE.to_string(),
                    digest: digest.clone(),
                    size: data.len() as u64,
                };
                if self.registry.blob_exists(target, &digest, auth).await? {
                    debug!(digest = %crate::logging::short_id(&digest), "Skipping existing blob");
                } else {
                    self.registry.put_blob(target, &digest, data, auth).await?;
                }
                Ok(descriptor)
            }
            LayerSource::Blob(blob) => {
                let digest = &blob.descriptor.digest;
                if !blob.repository.same_repository(target)
                    && !self.registry.blob_exists(target, digest, auth).await?
                {
                    debug!(
                        digest = %crate::logging::short_id(digest),
                        from = %blob.repository,
                        "Copying blob across repositories"
                    );
                    let data = self.download(blob).await?;
                    self.registry.put_blob(target, digest, data, auth).await?;
                }
                Ok(blob.descriptor.clone())
            }
            LayerSource::Existing => Err(ImageError::BackendUnsupported {
                operation: "push layer".to_string(),
                reason: format!("layer '{}' has no content to push", layer.diff_id),
            }),
        }
    }
}

/// Gzip an uncompressed layer tarball, returning the blob and its digest
async fn gzip_layer(path: PathBuf) -> Result<(Vec<u8>, String)> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)
            .io_context(|| format!("open layer: {}", path.display()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::copy(&mut file, &mut encoder)
            .io_context(|| format!("compress layer: {}", path.display()))?;
        let data = encoder
            .finish()
            .io_context(|| format!("compress layer: {}", path.display()))?;
        let digest = prefixed(&sha256_bytes(&data));
        Ok((data, digest))
    })
    .await
    .map_err(|e| {
        ImageError::io(
            "compress layer",
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        )
    })?
}

fn layer_history_len(history: &[History]) -> usize {
    history.iter().filter(|h| h.empty_layer != Some(true)).count()
}

/// History of a rebased image: the new base's entries, then the entries
/// recorded after the `base_layers`-th layer of the current history.
fn rebased_history(base: &[History], current: &[History], base_layers: usize) -> Vec<History> {
    let mut seen = 0;
    let retained = current
        .iter()
        .position(|h| {
            if h.empty_layer != Some(true) {
                seen += 1;
            }
            seen == base_layers
        })
        .map(|i| &current[i + 1..])
        .unwrap_or_default();
    base.iter().chain(retained).cloned().collect()
}

impl private::Sealed for RemoteImage {
    fn state(&self) -> &ImageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ImageState {
        &mut self.state
    }
}

#[async_trait]
impl Image for RemoteImage {
    fn backend(&self) -> Backend {
        Backend::Remote
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn created_at(&self) -> Result<DateTime<Utc>> {
        if !self.found() {
            return Err(ImageError::not_found(&self.state.name, "get creation time"));
        }
        self.config_file.created_at().ok_or_else(|| {
            ImageError::registry(
                format!("created time of {}", self.state.name),
                "missing or malformed timestamp",
            )
        })
    }

    async fn digest(&self) -> Result<String> {
        self.digest
            .clone()
            .ok_or_else(|| ImageError::not_found(&self.state.name, "get digest"))
    }

    async fn rename(&mut self, name: &str) {
        self.state.name = name.to_string();
    }

    async fn add_layer(&mut self, path: &Path) -> Result<()> {
        let owned = path.to_path_buf();
        let layer = tokio::task::spawn_blocking(move || Layer::from_file(&owned))
            .await
            .map_err(|e| {
                ImageError::io(
                    format!("hash layer: {}", path.display()),
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })??;
        log_layer_added!(self.state.name, layer.diff_id);
        self.state.layers.push(layer);
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let previous = self.load_previous().await?;
        let layer = find_layer(previous.as_slice(), diff_id)
            .cloned()
            .ok_or_else(|| ImageError::LayerNotFound {
                image: self.state.name.clone(),
                diff_id: diff_id.to_string(),
            })?;
        self.state.layers.push(layer);
        log_layer_reused!(self.state.name, diff_id, "previous-image");
        Ok(())
    }

    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> Result<()> {
        let split = rebase::split_for_rebase(&self.state.name, &self.state.layers, base_top_layer)?;
        let base = new_base
            .as_any()
            .downcast_ref::<RemoteImage>()
            .ok_or_else(|| ImageError::BackendUnsupported {
                operation: "rebase".to_string(),
                reason: format!(
                    "remote image '{}' cannot take {} base '{}'",
                    self.state.name,
                    new_base.backend(),
                    new_base.name()
                ),
            })?;
        if !base.found() {
            return Err(ImageError::BaseImageUnreadable {
                base: base.name().to_string(),
                reason: "image does not exist".to_string(),
            });
        }

        let kept = split.kept();
        let replaced = split.base.len();
        let layers = rebase::compose(&base.state.layers, split.retained);
        self.state.layers = layers;
        self.config_file.history = rebased_history(
            &base.config_file.history,
            &self.config_file.history,
            replaced,
        );
        self.config_file.architecture = base.config_file.architecture.clone();
        self.config_file.os = base.config_file.os.clone();
        log_rebase!(self.state.name, base.name(), kept);
        Ok(())
    }

    async fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>> {
        let layer = match find_layer(&self.state.layers, diff_id) {
            Some(layer) => layer.clone(),
            None => {
                let previous = self.load_previous().await?;
                find_layer(previous.as_slice(), diff_id)
                    .cloned()
                    .ok_or_else(|| ImageError::LayerNotFound {
                        image: self.state.name.clone(),
                        diff_id: diff_id.to_string(),
                    })?
            }
        };
        let compressed = match &layer.source {
            LayerSource::Blob(blob) => Some(self.download(blob).await?),
            _ => None,
        };
        self.open_layer(&layer, compressed)
    }

    async fn save(&mut self) -> Result<String> {
        let reference = Reference::parse(&self.state.name)?;
        let auth = self.keychain.resolve(reference.registry())?;
        let config = self
            .state
            .config
            .clone()
            .ok_or_else(|| ImageError::not_found(&self.state.name, "save"))?;

        let mut descriptors = Vec::with_capacity(self.state.layers.len());
        for layer in &self.state.layers {
            descriptors.push(self.push_layer(&reference, auth.as_ref(), layer).await?);
        }

        let created = Utc::now().to_rfc3339();
        let mut config_file = self.config_file.clone();
        config_file.created = Some(created.clone());
        config_file.config = config;
        if config_file.os.is_empty() {
            config_file.os = DEFAULT_OS.to_string();
        }
        config_file.rootfs.diff_ids = self.state.diff_ids();
        if layer_history_len(&config_file.history) != self.state.layers.len() {
            config_file.history = self
                .state
                .layers
                .iter()
                .map(|_| History {
                    created: Some(created.clone()),
                    ..Default::default()
                })
                .collect();
        }

        let raw_config = serde_json::to_vec(&config_file)
            .map_err(|e| ImageError::json("generate config file", e))?;
        let config_digest = prefixed(&sha256_bytes(&raw_config));
        let config_descriptor = Descriptor {
            media_type: DOCKER_CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest.clone(),
            size: raw_config.len() as u64,
        };
        if !self
            .registry
            .blob_exists(&reference, &config_digest, auth.as_ref())
            .await?
        {
            self.registry
                .put_blob(&reference, &config_digest, raw_config, auth.as_ref())
                .await?;
        }

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(DOCKER_MANIFEST_MEDIA_TYPE.to_string()),
            config: config_descriptor,
            layers: descriptors.clone(),
        };
        let raw_manifest = serde_json::to_vec(&manifest)
            .map_err(|e| ImageError::json("generate manifest", e))?;
        let digest = self
            .registry
            .put_manifest(
                &reference,
                DOCKER_MANIFEST_MEDIA_TYPE,
                raw_manifest,
                auth.as_ref(),
            )
            .await?;

        for (layer, descriptor) in self.state.layers.iter_mut().zip(descriptors) {
            if let LayerSource::File(_) = layer.source {
                layer.source = LayerSource::Blob(BlobRef {
                    repository: reference.clone(),
                    descriptor,
                });
            }
        }
        self.config_file = config_file;
        self.digest = Some(digest.clone());

        info!(
            image = %self.state.name,
            digest = %crate::logging::short_id(&digest),
            layers = self.state.layers.len(),
            "Image pushed"
        );
        Ok(digest)
    }

    async fn delete(&self) -> Result<()> {
        Err(ImageError::BackendUnsupported {
            operation: "delete".to_string(),
            reason: format!("remote image '{}' cannot be deleted", self.state.name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_gzip_layer_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layer.tar");
        std::fs::write(&path, b"uncompressed layer").unwrap();

        let (data, digest) = gzip_layer(path).await.unwrap();
        assert_eq!(digest, format!("sha256:{}", sha256_bytes(&data)));

        let mut out = Vec::new();
        GzDecoder::new(&data[..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"uncompressed layer");
    }

    fn step(created_by: &str) -> History {
        History {
            created_by: Some(created_by.to_string()),
            ..Default::default()
        }
    }

    fn empty_step(created_by: &str) -> History {
        History {
            empty_layer: Some(true),
            ..step(created_by)
        }
    }

    fn created_by(history: &[History]) -> Vec<&str> {
        history
            .iter()
            .map(|h| h.created_by.as_deref().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_rebased_history_replaces_base_entries() {
        let current = vec![step("b1"), step("b2"), step("a1")];
        let base = vec![step("c1"), step("c2")];

        let history = rebased_history(&base, &current, 2);
        assert_eq!(created_by(&history), vec!["c1", "c2", "a1"]);
        assert_eq!(layer_history_len(&history), 3);
    }

    #[test]
    fn test_rebased_history_skips_empty_layer_entries() {
        let current = vec![
            step("b1"),
            empty_step("ENV base"),
            step("a1"),
            empty_step("CMD app"),
        ];
        let base = vec![empty_step("LABEL c"), step("c1")];

        let history = rebased_history(&base, &current, 1);
        assert_eq!(
            created_by(&history),
            vec!["LABEL c", "c1", "ENV base", "a1", "CMD app"]
        );
        assert_eq!(layer_history_len(&history), 2);
    }
}
