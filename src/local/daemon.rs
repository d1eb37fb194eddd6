use crate::error::{ImageError, IoContext, Result};
use crate::oci::config::ContainerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

pub type ArchiveStream = Box<dyn AsyncRead + Send + Unpin>;

/// The subset of the daemon's image inspection imgkit relies on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInspect {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "RepoTags", default, deserialize_with = "nullable")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "RepoDigests", default, deserialize_with = "nullable")]
    pub repo_digests: Vec<String>,
    #[serde(rename = "Created", default)]
    pub created: Option<String>,
    #[serde(rename = "Architecture", default)]
    pub architecture: Option<String>,
    #[serde(rename = "Config", default)]
    pub config: Option<ContainerConfig>,
    #[serde(rename = "RootFS", default)]
    pub rootfs: InspectRootFs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectRootFs {
    #[serde(rename = "Layers", default, deserialize_with = "nullable")]
    pub layers: Vec<String>,
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Image store of a local container daemon
#[async_trait]
pub trait DaemonClient: Send + Sync {
    /// Inspection metadata for `name` (a reference or an image ID), or
    /// `None` when the daemon has no such image
    async fn inspect(&self, name: &str) -> Result<Option<ImageInspect>>;

    /// Load a save-format archive, reading it as it arrives
    async fn import_archive(&self, archive: ArchiveStream) -> Result<()>;

    /// Write the save-format archive of `name` into `dest`
    async fn export_archive(
        &self,
        name: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    /// Force-remove an image
    async fn remove(&self, id: &str) -> Result<()>;
}

/// [`DaemonClient`] driving the `docker` command line
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

fn stderr_text(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr).trim().to_string()
}

#[async_trait]
impl DaemonClient for DockerCli {
    async fn inspect(&self, name: &str) -> Result<Option<ImageInspect>> {
        let output = self
            .command()
            .args(["image", "inspect", name])
            .output()
            .await
            .io_context(|| format!("run {} image inspect", self.bin))?;

        if !output.status.success() {
            let message = stderr_text(&output.stderr);
            if message.to_lowercase().contains("no such image") {
                return Ok(None);
            }
            return Err(ImageError::daemon(format!("inspect {}", name), message));
        }

        let mut found: Vec<ImageInspect> = serde_json::from_slice(&output.stdout)
            .map_err(|e| ImageError::json(format!("parse inspection of {}", name), e))?;
        if found.is_empty() {
            return Ok(None);
        }
        Ok(Some(found.swap_remove(0)))
    }

    async fn import_archive(&self, mut archive: ArchiveStream) -> Result<()> {
        let mut child = self
            .command()
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .io_context(|| format!("run {} load", self.bin))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ImageError::daemon("load", "stdin unavailable"))?;
        let copied = tokio::io::copy(&mut archive, &mut stdin).await;
        let closed = stdin.shutdown().await;
        drop(stdin);
        if copied.is_err() {
            // A truncated archive must not be loaded.
            let _ = child.start_kill();
        }

        let output = child
            .wait_with_output()
            .await
            .io_context(|| format!("wait for {} load", self.bin))?;
        copied.io_context(|| "stream archive into load")?;
        if !output.status.success() {
            return Err(ImageError::daemon("load", stderr_text(&output.stderr)));
        }
        closed.io_context(|| "close load input")?;
        Ok(())
    }

    async fn export_archive(
        &self,
        name: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let mut child = self
            .command()
            .args(["save", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .io_context(|| format!("run {} save", self.bin))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ImageError::daemon("save", "stdout unavailable"))?;
        let copied = tokio::io::copy(&mut stdout, &mut *dest).await;

        let output = child
            .wait_with_output()
            .await
            .io_context(|| format!("wait for {} save", self.bin))?;
        if !output.status.success() {
            return Err(ImageError::daemon(
                format!("save {}", name),
                stderr_text(&output.stderr),
            ));
        }
        copied.io_context(|| format!("export {}", name))?;
        dest.flush()
            .await
            .io_context(|| format!("flush export of {}", name))?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let output = self
            .command()
            .args(["image", "rm", "--force", id])
            .output()
            .await
            .io_context(|| format!("run {} image rm", self.bin))?;
        if !output.status.success() {
            return Err(ImageError::daemon(
                format!("remove {}", id),
                stderr_text(&output.stderr),
            ));
        }
        Ok(())
    }
}
