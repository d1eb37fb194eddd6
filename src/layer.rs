//! Layer reference model: a layer is identified by its diff ID, the sha256
//! of its uncompressed content, and carries one of a few backend-specific
//! sources that can produce those bytes.

use crate::error::{IoContext, Result};
use crate::oci::manifest::Descriptor;
use crate::oci::utils::{prefixed, sha256_reader};
use crate::reference::Reference;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    /// Already present in the target store, carried by reference only
    Existing,
    /// Uncompressed layer tarball on local disk
    File(PathBuf),
    /// Compressed blob stored in a registry repository
    Blob(BlobRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub repository: Reference,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub diff_id: String,
    pub source: LayerSource,
}

impl Layer {
    /// Layer backed by an uncompressed tarball; hashes the whole file
    pub fn from_file(path: &Path) -> Result<Self> {
        let diff_id = diff_id_of_file(path)?;
        Ok(Self {
            diff_id,
            source: LayerSource::File(path.to_path_buf()),
        })
    }

    pub fn existing(diff_id: impl Into<String>) -> Self {
        Self {
            diff_id: diff_id.into(),
            source: LayerSource::Existing,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            LayerSource::File(path) => Some(path),
            _ => None,
        }
    }
}

/// Anything that can be located in a layer stack by diff ID
pub trait HasDiffId {
    fn diff_id(&self) -> &str;
}

impl HasDiffId for Layer {
    fn diff_id(&self) -> &str {
        &self.diff_id
    }
}

impl HasDiffId for String {
    fn diff_id(&self) -> &str {
        self
    }
}

/// `sha256:<hex>` of a file's raw bytes
pub fn diff_id_of_file(path: &Path) -> Result<String> {
    let file = File::open(path).io_context(|| format!("open layer: {}", path.display()))?;
    let (hex, _) = sha256_reader(BufReader::new(file))
        .io_context(|| format!("calculate checksum: {}", path.display()))?;
    Ok(prefixed(&hex))
}

/// Index of the first layer with `diff_id`, scanning from the bottom
pub fn position<T: HasDiffId>(layers: &[T], diff_id: &str) -> Option<usize> {
    layers.iter().position(|l| l.diff_id() == diff_id)
}

/// First layer with `diff_id` in a known set
pub fn find_layer<'a, T: HasDiffId>(layers: &'a [T], diff_id: &str) -> Option<&'a T> {
    position(layers, diff_id).map(|i| &layers[i])
}
