//! Local backend: images stored in a container daemon.

pub mod daemon;
pub mod snapshot;

pub use daemon::{ArchiveStream, DaemonClient, DockerCli, ImageInspect};
pub use snapshot::{Snapshot, SnapshotLayer};

use crate::error::{ImageError, IoContext, Result};
use crate::export::{self, ImageArchive};
use crate::image::{private, Backend, Image, ImageState};
use crate::layer::{Layer, LayerSource};
use crate::oci::config::{parse_timestamp, ConfigFile, ContainerConfig};
use crate::previous::PreviousImage;
use crate::rebase;
use crate::reference::Reference;
use crate::{log_layer_added, log_layer_reused, log_rebase};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// An image in the local daemon's store.
///
/// Config edits and layer changes stay in memory until [`Image::save`]
/// streams a complete archive into the daemon.
pub struct LocalImage {
    state: ImageState,
    daemon: Arc<dyn DaemonClient>,
    id: Option<String>,
    repo_digests: Vec<String>,
    created: Option<String>,
    architecture: Option<String>,
    previous: PreviousImage<Snapshot>,
    /// Diff IDs the persisted image under the current name has right above
    /// our layers; reusing them needs no export.
    fast_path: VecDeque<String>,
    temp_root: Option<PathBuf>,
}

impl LocalImage {
    /// Load `name` from the daemon. A missing image is not an error: the
    /// instance reports `found() == false` and refuses config access.
    pub async fn new(name: &str, daemon: Arc<dyn DaemonClient>) -> Result<Self> {
        let inspect = daemon.inspect(name).await?;
        let mut image = Self::with_state(ImageState::new(name, None, Vec::new()), daemon);
        if let Some(inspect) = inspect {
            debug!(image = %name, layers = inspect.rootfs.layers.len(), "Loaded local image");
            image.state.config = Some(inspect.config.clone().unwrap_or_default());
            image.state.layers = inspect
                .rootfs
                .layers
                .iter()
                .map(|id| Layer::existing(id.as_str()))
                .collect();
            image.apply_inspect(inspect);
        }
        Ok(image)
    }

    /// A new image with an empty config and no layers
    pub fn empty(name: &str, daemon: Arc<dyn DaemonClient>) -> Self {
        Self::with_state(
            ImageState::new(name, Some(ContainerConfig::default()), Vec::new()),
            daemon,
        )
    }

    fn with_state(state: ImageState, daemon: Arc<dyn DaemonClient>) -> Self {
        Self {
            state,
            daemon,
            id: None,
            repo_digests: Vec::new(),
            created: None,
            architecture: None,
            previous: PreviousImage::new(),
            fast_path: VecDeque::new(),
            temp_root: None,
        }
    }

    /// Export previous images under `dir` instead of the system temp dir
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(dir.into());
        self
    }

    fn apply_inspect(&mut self, inspect: ImageInspect) {
        self.id = Some(inspect.id);
        self.repo_digests = inspect.repo_digests;
        self.created = inspect.created;
        self.architecture = inspect.architecture;
    }

    /// Daemon ID of the persisted image, if any
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Pending fast-path diff IDs, bottom first
    pub fn fast_path(&self) -> Vec<String> {
        self.fast_path.iter().cloned().collect()
    }

    /// How many times the previous image has been exported
    pub fn previous_fetch_count(&self) -> usize {
        self.previous.fetch_count()
    }

    async fn load_previous(&self) -> Result<Arc<Snapshot>> {
        let daemon = Arc::clone(&self.daemon);
        let name = self.state.name.clone();
        let temp_root = self.temp_root.clone();
        self.previous
            .ensure_loaded(|| async move {
                debug!(image = %name, "Exporting previous image");
                Snapshot::export(daemon.as_ref(), &name, temp_root.as_deref()).await
            })
            .await
    }

    /// Whether `other` starts with every layer this image currently has
    fn same_base(&self, other: &[String]) -> bool {
        other.len() >= self.state.layers.len()
            && self
                .state
                .layers
                .iter()
                .zip(other)
                .all(|(layer, id)| &layer.diff_id == id)
    }
}

impl private::Sealed for LocalImage {
    fn state(&self) -> &ImageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ImageState {
        &mut self.state
    }
}

#[async_trait]
impl Image for LocalImage {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn created_at(&self) -> Result<DateTime<Utc>> {
        let created = self
            .created
            .as_deref()
            .ok_or_else(|| ImageError::not_found(&self.state.name, "get creation time"))?;
        parse_timestamp(created).ok_or_else(|| {
            ImageError::daemon(
                format!("created time of {}", self.state.name),
                format!("malformed timestamp '{}'", created),
            )
        })
    }

    async fn digest(&self) -> Result<String> {
        if !self.found() {
            return Err(ImageError::not_found(&self.state.name, "get digest"));
        }
        let Some(repo_digest) = self.repo_digests.first() else {
            return Ok(String::new());
        };
        match repo_digest.split_once('@') {
            Some((_, digest)) if !digest.contains('@') => Ok(digest.to_string()),
            _ => Err(ImageError::daemon(
                format!("digest of {}", self.state.name),
                format!("malformed digest '{}'", repo_digest),
            )),
        }
    }

    async fn rename(&mut self, name: &str) {
        self.fast_path.clear();
        match self.daemon.inspect(name).await {
            Ok(Some(prev)) if self.same_base(&prev.rootfs.layers) => {
                self.fast_path = prev.rootfs.layers[self.state.layers.len()..]
                    .iter()
                    .cloned()
                    .collect();
                debug!(
                    image = %name,
                    pending = self.fast_path.len(),
                    "Fast-path reuse enabled"
                );
            }
            Ok(_) => {}
            Err(e) => debug!(image = %name, error = %e, "No fast path for rename"),
        }
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
        self.fast_path.clear();
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        if self.fast_path.front().map(String::as_str) == Some(diff_id) {
            self.fast_path.pop_front();
            self.state.layers.push(Layer::existing(diff_id));
            log_layer_reused!(self.state.name, diff_id, "fast-path");
            return Ok(());
        }

        let snapshot = self.load_previous().await?;
        let path = snapshot
            .path_of(diff_id)
            .ok_or_else(|| ImageError::LayerNotFound {
                image: self.state.name.clone(),
                diff_id: diff_id.to_string(),
            })?;
        self.state.layers.push(Layer {
            diff_id: diff_id.to_string(),
            source: LayerSource::File(path.to_path_buf()),
        });
        self.fast_path.clear();
        log_layer_reused!(self.state.name, diff_id, "previous-image");
        Ok(())
    }

    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> Result<()> {
        let split = rebase::split_for_rebase(&self.state.name, &self.state.layers, base_top_layer)?;
        let kept = split.kept();

        if new_base.backend() != Backend::Local {
            return Err(ImageError::BackendUnsupported {
                operation: "rebase".to_string(),
                reason: format!(
                    "local image '{}' cannot take {} base '{}'",
                    self.state.name,
                    new_base.backend(),
                    new_base.name()
                ),
            });
        }

        let base_inspect = match self.daemon.inspect(new_base.name()).await {
            Ok(Some(inspect)) => inspect,
            Ok(None) => {
                return Err(ImageError::BaseImageUnreadable {
                    base: new_base.name().to_string(),
                    reason: "image does not exist".to_string(),
                })
            }
            Err(e) => {
                return Err(ImageError::BaseImageUnreadable {
                    base: new_base.name().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        // Layers only the daemon holds are materialized from the persisted
        // image; unsaved file layers are carried as they are.
        let snapshot = self.load_previous().await?;
        let retained = split
            .retained
            .iter()
            .map(|current| match current.source {
                LayerSource::File(_) => Ok(current.clone()),
                _ => snapshot
                    .path_of(&current.diff_id)
                    .map(|path| Layer {
                        diff_id: current.diff_id.clone(),
                        source: LayerSource::File(path.to_path_buf()),
                    })
                    .ok_or_else(|| ImageError::ArchiveCorrupt {
                        image: self.state.name.clone(),
                        reason: format!(
                            "exported image has no layer with diff ID '{}'",
                            current.diff_id
                        ),
                    }),
            })
            .collect::<Result<Vec<Layer>>>()?;

        let base: Vec<Layer> = base_inspect
            .rootfs
            .layers
            .iter()
            .map(|id| Layer::existing(id.as_str()))
            .collect();
        self.state.layers = rebase::compose(&base, &retained);
        self.fast_path.clear();
        log_rebase!(self.state.name, new_base.name(), kept);
        Ok(())
    }

    async fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>> {
        let snapshot = self.load_previous().await?;
        let path = snapshot
            .path_of(diff_id)
            .ok_or_else(|| ImageError::LayerNotFound {
                image: self.state.name.clone(),
                diff_id: diff_id.to_string(),
            })?;
        let file = std::fs::File::open(path)
            .io_context(|| format!("open layer: {}", path.display()))?;
        Ok(Box::new(file))
    }

    async fn save(&mut self) -> Result<String> {
        let repo_tag = Reference::parse(&self.state.name)?.tagged_name()?;
        let config = ConfigFile::for_layers(
            self.state.config.clone().unwrap_or_default(),
            self.architecture.clone(),
            self.state.diff_ids(),
            Utc::now(),
        );
        let archive = ImageArchive::new(&config, repo_tag, &self.state.layers)?;
        let image_id = archive.image_id();

        export::load_into(self.daemon.as_ref(), archive).await?;
        self.previous.reset();

        let inspect = self
            .daemon
            .inspect(&image_id)
            .await?
            .ok_or_else(|| ImageError::SaveFailed {
                image: self.state.name.clone(),
                reason: format!("daemon does not report image {}", image_id),
            })?;
        self.apply_inspect(inspect);
        for layer in &mut self.state.layers {
            layer.source = LayerSource::Existing;
        }

        info!(
            image = %self.state.name,
            id = %crate::logging::short_id(&image_id),
            layers = self.state.layers.len(),
            "Image saved"
        );
        Ok(image_id)
    }

    async fn delete(&self) -> Result<()> {
        match &self.id {
            Some(id) => self.daemon.remove(id).await,
            None => Ok(()),
        }
    }
}
