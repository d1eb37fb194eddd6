use crate::constants::ARCHIVE_MANIFEST_FILE;
use crate::error::{ImageError, IoContext, Result};
use crate::layer::{Layer, LayerSource};
use crate::oci::config::ConfigFile;
use crate::oci::manifest::ArchiveManifestEntry;
use crate::oci::utils::{prefixed, sha256_bytes, sha256_string};
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::{Builder, Header};

/// A daemon-loadable image archive, ready to be streamed.
///
/// Holds the serialized config (whose hash is the image ID), the repository
/// tag and one entry per layer. Layers carried by reference have no entry;
/// the manifest keeps an empty name in their position.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    config_json: Vec<u8>,
    config_hex: String,
    repo_tag: String,
    layers: Vec<Option<PathBuf>>,
}

impl ImageArchive {
    pub fn new(config: &ConfigFile, repo_tag: String, layers: &[Layer]) -> Result<Self> {
        let config_json =
            serde_json::to_vec(config).map_err(|e| ImageError::json("generate config file", e))?;
        let config_hex = sha256_bytes(&config_json);

        let layers = layers
            .iter()
            .map(|layer| match &layer.source {
                LayerSource::File(path) => Ok(Some(path.clone())),
                LayerSource::Existing => Ok(None),
                LayerSource::Blob(_) => Err(ImageError::BackendUnsupported {
                    operation: "write daemon archive".to_string(),
                    reason: format!("layer '{}' is a registry blob", layer.diff_id),
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config_json,
            config_hex,
            repo_tag,
            layers,
        })
    }

    /// `sha256:<hex>` of the config bytes
    pub fn image_id(&self) -> String {
        prefixed(&self.config_hex)
    }

    pub fn config_name(&self) -> String {
        format!("{}.json", self.config_hex)
    }

    /// Entry name for a layer file, derived from its path
    pub fn layer_entry_name(path: &Path) -> String {
        format!("{}.tar", sha256_string(&path.to_string_lossy()))
    }

    pub fn manifest(&self) -> Vec<ArchiveManifestEntry> {
        vec![ArchiveManifestEntry {
            config: self.config_name(),
            repo_tags: vec![self.repo_tag.clone()],
            layers: self
                .layers
                .iter()
                .map(|path| match path {
                    Some(path) => Self::layer_entry_name(path),
                    None => String::new(),
                })
                .collect(),
        }]
    }

    /// Write the whole archive: config, layer files, then `manifest.json`
    pub fn write_to<W: Write>(&self, writer: W) -> Result<W> {
        let mut tar = Builder::new(writer);

        append_bytes(&mut tar, &self.config_name(), &self.config_json)?;

        let mut written = HashSet::new();
        for path in self.layers.iter().flatten() {
            let name = Self::layer_entry_name(path);
            if !written.insert(name.clone()) {
                continue;
            }
            let file = File::open(path).io_context(|| format!("open layer: {}", path.display()))?;
            let size = file
                .metadata()
                .io_context(|| format!("stat layer: {}", path.display()))?
                .len();
            let mut header = Header::new_gnu();
            header.set_size(size);
            header.set_mode(0o644);
            tar.append_data(&mut header, &name, file)
                .io_context(|| format!("add layer to archive: {}", path.display()))?;
        }

        let manifest = serde_json::to_vec(&self.manifest())
            .map_err(|e| ImageError::json("generate archive manifest", e))?;
        append_bytes(&mut tar, ARCHIVE_MANIFEST_FILE, &manifest)?;

        tar.into_inner().io_context(|| "finish archive")
    }
}

fn append_bytes<W: Write>(tar: &mut Builder<W>, name: &str, contents: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    tar.append_data(&mut header, name, contents)
        .io_context(|| format!("add {} to archive", name))
}
