use crate::constants::{DEFAULT_OS, ROOTFS_TYPE_LAYERS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Image config object, as stored in a registry config blob or a daemon
/// archive's `<id>.json` entry.
///
/// Fields imgkit does not model are kept in `extra` so they survive a
/// read-modify-write cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<History>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The `config` section: runtime defaults for containers made from the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Labels", default, deserialize_with = "nullable")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "Env", default, deserialize_with = "nullable")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default, deserialize_with = "nullable")]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: ROOTFS_TYPE_LAYERS.to_string(),
            diff_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// Docker writes `null` for empty maps and lists; treat it as empty.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ContainerConfig {
    /// Value of `key` in the `KEY=VALUE` env list, if present
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| match entry.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            None if entry == key => Some(""),
            _ => None,
        })
    }

    /// Replace `key` in place, or append it when absent. Order of existing
    /// entries is never changed.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        let existing = self
            .env
            .iter()
            .position(|e| e.split_once('=').map(|(k, _)| k).unwrap_or(e) == key);
        match existing {
            Some(i) => self.env[i] = entry,
            None => self.env.push(entry),
        }
    }
}

impl ConfigFile {
    /// Config object for an image whose layer stack is `diff_ids`, stamped
    /// with `created`. History gets one entry per layer.
    pub fn for_layers(
        config: ContainerConfig,
        architecture: Option<String>,
        diff_ids: Vec<String>,
        created: DateTime<Utc>,
    ) -> Self {
        let created = created.to_rfc3339();
        let history = diff_ids
            .iter()
            .map(|_| History {
                created: Some(created.clone()),
                ..Default::default()
            })
            .collect();
        Self {
            architecture,
            os: DEFAULT_OS.to_string(),
            created: Some(created),
            config,
            rootfs: RootFs {
                fs_type: ROOTFS_TYPE_LAYERS.to_string(),
                diff_ids,
            },
            history,
            extra: BTreeMap::new(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.created.as_deref()?)
    }
}

/// Parse the RFC 3339 timestamps Docker and registries emit
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
