use crate::constants::DEFAULT_REGISTRY;
use crate::error::{ImageError, Result};
pub use crate::oci::registry::Credentials;
use base64::Engine;
use std::path::{Path, PathBuf};

/// Credential capability: who to present ourselves as to a registry host
pub trait Keychain: Send + Sync {
    fn resolve(&self, registry: &str) -> Result<Option<Credentials>>;
}

/// Never presents credentials
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousKeychain;

impl Keychain for AnonymousKeychain {
    fn resolve(&self, _registry: &str) -> Result<Option<Credentials>> {
        Ok(None)
    }
}

/// Reads `auths` from a docker `config.json`
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    config_dir: PathBuf,
}

impl DockerConfigKeychain {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

/// Keys a registry may be stored under in `auths`
fn auth_keys(registry: &str) -> Vec<String> {
    let mut keys = vec![registry.to_string(), format!("https://{}", registry)];
    if registry == DEFAULT_REGISTRY || registry == "docker.io" {
        keys.push("https://index.docker.io/v1/".to_string());
        keys.push("docker.io".to_string());
    }
    keys
}

impl Keychain for DockerConfigKeychain {
    fn resolve(&self, registry: &str) -> Result<Option<Credentials>> {
        let path = self.config_dir.join("config.json");
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ImageError::io(format!("read {}", path.display()), e)),
        };
        let config: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| ImageError::json(format!("parse {}", path.display()), e))?;

        let Some(auths) = config.get("auths").and_then(|a| a.as_object()) else {
            return Ok(None);
        };
        let Some(entry) = auth_keys(registry).iter().find_map(|k| auths.get(k)) else {
            return Ok(None);
        };

        if let Some(token) = entry
            .get("registrytoken")
            .or_else(|| entry.get("identitytoken"))
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
        {
            return Ok(Some(Credentials::Bearer(token.to_string())));
        }

        let Some(encoded) = entry.get("auth").and_then(|a| a.as_str()) else {
            return Ok(None);
        };
        let malformed = |reason: String| ImageError::Registry {
            context: format!("credentials for {}", registry),
            message: reason,
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| malformed(e.to_string()))?;
        let decoded = String::from_utf8(decoded).map_err(|e| malformed(e.to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| malformed("auth is not user:password".to_string()))?;

        Ok(Some(Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }))
    }
}
