use crate::error::{ImageError, Result};
use crate::layer::Layer;
use crate::oci::config::ContainerConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::io::Read;
use std::path::Path;

/// Where an image lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Remote,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Remote => write!(f, "remote"),
        }
    }
}

/// In-memory metadata and layer stack shared by both backends.
///
/// `config` is `None` when the image did not exist in its store; reads and
/// writes of config fields then fail with `NotFound`.
#[derive(Debug, Clone)]
pub struct ImageState {
    pub name: String,
    pub config: Option<ContainerConfig>,
    pub layers: Vec<Layer>,
}

impl ImageState {
    pub fn new(name: &str, config: Option<ContainerConfig>, layers: Vec<Layer>) -> Self {
        Self {
            name: name.to_string(),
            config,
            layers,
        }
    }

    fn config_for(&self, what: &str) -> Result<&ContainerConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| ImageError::not_found(&self.name, what))
    }

    fn config_mut_for(&mut self, what: &str) -> Result<&mut ContainerConfig> {
        let name = &self.name;
        self.config
            .as_mut()
            .ok_or_else(|| ImageError::not_found(name, what))
    }

    /// Label value, empty when the key is absent
    pub fn label(&self, key: &str) -> Result<String> {
        let config = self.config_for("get label")?;
        Ok(config.labels.get(key).cloned().unwrap_or_default())
    }

    /// Env value, empty when the key is absent
    pub fn env(&self, key: &str) -> Result<String> {
        let config = self.config_for("get env var")?;
        Ok(config.env_value(key).unwrap_or_default().to_string())
    }

    pub fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.config_mut_for("set label")?
            .labels
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        self.config_mut_for("set env var")?.set_env(key, value);
        Ok(())
    }

    pub fn set_entrypoint(&mut self, args: &[&str]) -> Result<()> {
        self.config_mut_for("set entrypoint")?.entrypoint =
            Some(args.iter().map(|s| s.to_string()).collect());
        Ok(())
    }

    pub fn set_cmd(&mut self, args: &[&str]) -> Result<()> {
        self.config_mut_for("set cmd")?.cmd = Some(args.iter().map(|s| s.to_string()).collect());
        Ok(())
    }

    pub fn top_layer(&self) -> Result<String> {
        self.layers
            .last()
            .map(|l| l.diff_id.clone())
            .ok_or_else(|| ImageError::EmptyImage {
                image: self.name.clone(),
            })
    }

    pub fn diff_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.diff_id.clone()).collect()
    }
}

pub(crate) mod private {
    use super::ImageState;

    pub trait Sealed {
        fn state(&self) -> &ImageState;
        fn state_mut(&mut self) -> &mut ImageState;
    }
}

/// Uniform operations over a container image, wherever it is stored.
///
/// Implemented by [`crate::local::LocalImage`] and
/// [`crate::remote::RemoteImage`] only.
#[async_trait]
pub trait Image: private::Sealed + Send + Sync {
    fn backend(&self) -> Backend;

    fn as_any(&self) -> &dyn Any;

    fn name(&self) -> &str {
        &self.state().name
    }

    /// Whether the image existed in its store when this instance was built
    fn found(&self) -> bool {
        self.state().config.is_some()
    }

    fn config(&self) -> Option<&ContainerConfig> {
        self.state().config.as_ref()
    }

    /// Diff IDs of the current layer stack, bottom to top
    fn diff_ids(&self) -> Vec<String> {
        self.state().diff_ids()
    }

    fn label(&self, key: &str) -> Result<String> {
        self.state().label(key)
    }

    fn env(&self, key: &str) -> Result<String> {
        self.state().env(key)
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.state_mut().set_label(key, value)
    }

    fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        self.state_mut().set_env(key, value)
    }

    fn set_entrypoint(&mut self, args: &[&str]) -> Result<()> {
        self.state_mut().set_entrypoint(args)
    }

    fn set_cmd(&mut self, args: &[&str]) -> Result<()> {
        self.state_mut().set_cmd(args)
    }

    fn top_layer(&self) -> Result<String> {
        self.state().top_layer()
    }

    fn created_at(&self) -> Result<DateTime<Utc>>;

    async fn digest(&self) -> Result<String>;

    /// Point subsequent persistence at `name`
    async fn rename(&mut self, name: &str);

    /// Append the uncompressed layer tarball at `path`
    async fn add_layer(&mut self, path: &Path) -> Result<()>;

    /// Append a layer the store already holds, by diff ID
    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()>;

    /// Replace every layer up to and including `base_top_layer` with the
    /// layers of `new_base`
    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> Result<()>;

    /// Uncompressed bytes of one layer
    async fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>>;

    /// Persist the image under its current name, returning its identifier
    async fn save(&mut self) -> Result<String>;

    async fn delete(&self) -> Result<()>;
}
