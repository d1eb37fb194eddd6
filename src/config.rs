use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Runtime settings, read from the environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Docker binary driven by the local backend
    pub docker_bin: String,
    /// Where previous-image exports go; system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    /// Directory holding `config.json` with registry credentials
    pub docker_config_dir: Option<PathBuf>,
    /// Registries reached over plain http
    pub insecure_registries: Vec<String>,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            temp_dir: None,
            docker_config_dir: None,
            insecure_registries: Vec::new(),
            log_json: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset or empty values keep defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let docker_config_dir = get("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| get("HOME").map(|home| PathBuf::from(home).join(".docker")));

        Self {
            docker_bin: get("IMGKIT_DOCKER").unwrap_or(defaults.docker_bin),
            temp_dir: get("IMGKIT_TMPDIR").map(PathBuf::from),
            docker_config_dir,
            insecure_registries: get("IMGKIT_INSECURE_REGISTRIES")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            log_json: get("IMGKIT_LOG_JSON")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.log_json),
        }
    }
}
