use crate::constants::{DEFAULT_REGISTRY, DOCKER_MANIFEST_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE};
use crate::error::{ImageError, Result};
use crate::oci::utils::{prefixed, sha256_bytes};
use crate::reference::Reference;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};

/// Credentials presented to a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Registry capability: content-addressed blobs and manifests per repository
#[async_trait]
pub trait Registry: Send + Sync {
    /// Manifest digest and raw bytes, or `None` when the reference is unknown
    async fn manifest(
        &self,
        reference: &Reference,
        auth: Option<&Credentials>,
    ) -> Result<Option<(String, Vec<u8>)>>;

    async fn blob(
        &self,
        repository: &Reference,
        digest: &str,
        auth: Option<&Credentials>,
    ) -> Result<Vec<u8>>;

    async fn blob_exists(
        &self,
        repository: &Reference,
        digest: &str,
        auth: Option<&Credentials>,
    ) -> Result<bool>;

    async fn put_blob(
        &self,
        repository: &Reference,
        digest: &str,
        data: Vec<u8>,
        auth: Option<&Credentials>,
    ) -> Result<()>;

    /// Store a manifest under the reference's tag, returning its digest
    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        data: Vec<u8>,
        auth: Option<&Credentials>,
    ) -> Result<String>;
}

/// [`Registry`] over the Docker Registry HTTP API v2
pub struct HttpRegistry {
    client: Client,
    insecure: Vec<String>,
}

impl HttpRegistry {
    /// `insecure` lists registries reached over plain http
    pub fn new(insecure: Vec<String>) -> Self {
        Self {
            client: Client::new(),
            insecure,
        }
    }

    fn base_url(&self, registry: &str) -> String {
        let host = registry.split(':').next().unwrap_or(registry);
        let scheme = if host == "localhost"
            || host == "127.0.0.1"
            || self.insecure.iter().any(|r| r == registry)
        {
            "http"
        } else {
            "https"
        };
        let registry = if registry == DEFAULT_REGISTRY {
            "registry-1.docker.io"
        } else {
            registry
        };
        format!("{}://{}/v2", scheme, registry)
    }

    fn repo_url(&self, reference: &Reference) -> String {
        format!(
            "{}/{}",
            self.base_url(reference.registry()),
            reference.repository()
        )
    }
}

impl Default for HttpRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn authorize(rb: RequestBuilder, auth: Option<&Credentials>) -> RequestBuilder {
    match auth {
        Some(Credentials::Basic { username, password }) => rb.basic_auth(username, Some(password)),
        Some(Credentials::Bearer(token)) => rb.bearer_auth(token),
        None => rb,
    }
}

async fn send(rb: RequestBuilder, context: &str) -> Result<reqwest::Response> {
    rb.send()
        .await
        .map_err(|e| ImageError::registry(context, e))
}

fn failed(context: &str, status: StatusCode) -> ImageError {
    ImageError::registry(context, format!("unexpected status {}", status))
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn manifest(
        &self,
        reference: &Reference,
        auth: Option<&Credentials>,
    ) -> Result<Option<(String, Vec<u8>)>> {
        let context = format!("fetch manifest {}", reference);
        let url = format!(
            "{}/manifests/{}",
            self.repo_url(reference),
            reference.identifier()
        );
        let rb = self.client.get(&url).header(
            "Accept",
            format!("{}, {}", DOCKER_MANIFEST_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE),
        );
        let resp = send(authorize(rb, auth), &context).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(failed(&context, resp.status()));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| ImageError::registry(&context, e))?
            .to_vec();
        Ok(Some((prefixed(&sha256_bytes(&body)), body)))
    }

    async fn blob(
        &self,
        repository: &Reference,
        digest: &str,
        auth: Option<&Credentials>,
    ) -> Result<Vec<u8>> {
        let context = format!("download blob {}", digest);
        let url = format!("{}/blobs/{}", self.repo_url(repository), digest);
        let resp = send(authorize(self.client.get(&url), auth), &context).await?;
        if !resp.status().is_success() {
            return Err(failed(&context, resp.status()));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| ImageError::registry(&context, e))?;
        Ok(body.to_vec())
    }

    async fn blob_exists(
        &self,
        repository: &Reference,
        digest: &str,
        auth: Option<&Credentials>,
    ) -> Result<bool> {
        let context = format!("check blob {}", digest);
        let url = format!("{}/blobs/{}", self.repo_url(repository), digest);
        let resp = send(authorize(self.client.head(&url), auth), &context).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(failed(&context, s)),
        }
    }

    async fn put_blob(
        &self,
        repository: &Reference,
        digest: &str,
        data: Vec<u8>,
        auth: Option<&Credentials>,
    ) -> Result<()> {
        let context = format!("upload blob {}", digest);
        let start = format!("{}/blobs/uploads/", self.repo_url(repository));
        let resp = send(authorize(self.client.post(&start), auth), &context).await?;
        if !resp.status().is_success() {
            return Err(failed(&context, resp.status()));
        }

        let location = resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ImageError::registry(&context, "no Location header in upload"))?;
        // Location may be relative to the registry root.
        let mut url = Url::parse(&start)
            .and_then(|base| base.join(location))
            .map_err(|e| ImageError::registry(&context, e))?;
        url.query_pairs_mut().append_pair("digest", digest);

        let rb = self
            .client
            .put(url)
            .header("Content-Type", "application/octet-stream")
            .body(data);
        let resp = send(authorize(rb, auth), &context).await?;
        if !resp.status().is_success() {
            return Err(failed(&context, resp.status()));
        }
        tracing::debug!(digest = %crate::logging::short_id(digest), "Blob uploaded");
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        data: Vec<u8>,
        auth: Option<&Credentials>,
    ) -> Result<String> {
        let context = format!("upload manifest {}", reference);
        let digest = prefixed(&sha256_bytes(&data));
        let url = format!(
            "{}/manifests/{}",
            self.repo_url(reference),
            reference.identifier()
        );
        let rb = self
            .client
            .put(&url)
            .header("Content-Type", media_type)
            .body(data);
        let resp = send(authorize(rb, auth), &context).await?;
        if !resp.status().is_success() {
            return Err(failed(&context, resp.status()));
        }
        Ok(digest)
    }
}
