use crate::constants::{DEFAULT_REGISTRY, DEFAULT_TAG};
use crate::error::{ImageError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Parsed image reference: `[registry/]repository[:tag][@digest]`.
///
/// The first path section is taken as a registry when it contains a dot or
/// a colon, or is exactly `localhost`. Names without a registry live on the
/// default registry, and single-section names there get the `library/`
/// prefix. The repository is also kept as written, so names round-trip
/// into archive tags the way a user typed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    written: String,
    tag: Option<String>,
    digest: Option<String>,
}

fn component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap())
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap())
}

fn digest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:[+._-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").unwrap())
}

impl Reference {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| ImageError::InvalidReference {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => {
                if !digest_re().is_match(digest) {
                    return Err(invalid("malformed digest"));
                }
                (rest, Some(digest.to_string()))
            }
            None => (input, None),
        };

        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let tag = &rest[last_slash + i + 1..];
                if !tag_re().is_match(tag) {
                    return Err(invalid("malformed tag"));
                }
                (&rest[..last_slash + i], Some(tag.to_string()))
            }
            None => (rest, None),
        };

        if name.is_empty() {
            return Err(invalid("empty repository"));
        }

        let (registry, path) = match name.split_once('/') {
            Some((first, path))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), path)
            }
            _ => (DEFAULT_REGISTRY.to_string(), name),
        };

        if path.split('/').any(|c| !component_re().is_match(c)) {
            return Err(invalid("repository must be lowercase path components"));
        }

        let repository = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("library/{}", path)
        } else {
            path.to_string()
        };

        Ok(Self {
            registry,
            repository,
            written: name.to_string(),
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path on the registry, e.g. `library/ubuntu`
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Tag or digest to address the manifest with
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// `repository:tag` as written, with the default tag filled in.
    /// Digest-only references cannot be tagged.
    pub fn tagged_name(&self) -> Result<String> {
        match (&self.tag, &self.digest) {
            (None, Some(_)) => Err(ImageError::InvalidReference {
                reference: self.to_string(),
                reason: "a tag is required, got a digest reference".to_string(),
            }),
            (tag, _) => Ok(format!(
                "{}:{}",
                self.written,
                tag.as_deref().unwrap_or(DEFAULT_TAG)
            )),
        }
    }

    /// Whether two references point into the same repository
    pub fn same_repository(&self, other: &Reference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.written)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Reference {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_uses_defaults() {
        let r = Reference::parse("ubuntu").unwrap();
        assert_eq!(r.registry(), "index.docker.io");
        assert_eq!(r.repository(), "library/ubuntu");
        assert_eq!(r.identifier(), "latest");
        assert_eq!(r.tagged_name().unwrap(), "ubuntu:latest");
    }

    #[test]
    fn test_registry_with_port() {
        let r = Reference::parse("localhost:5000/team/app:v1.2").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "team/app");
        assert_eq!(r.tag(), Some("v1.2"));
        assert_eq!(r.to_string(), "localhost:5000/team/app:v1.2");
    }

    #[test]
    fn test_dotted_registry_and_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = Reference::parse(&format!("ghcr.io/owner/repo@{}", digest)).unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "owner/repo");
        assert_eq!(r.identifier(), digest);
        assert!(r.tagged_name().is_err());
    }

    #[test]
    fn test_first_section_without_dot_is_repository() {
        let r = Reference::parse("library/busybox:1").unwrap();
        assert_eq!(r.registry(), "index.docker.io");
        assert_eq!(r.repository(), "library/busybox");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("UPPER/case").is_err());
        assert!(Reference::parse("app:").is_err());
        assert!(Reference::parse("app@sha256:zz").is_err());
        assert!(Reference::parse("app/").is_err());
    }

    #[test]
    fn test_same_repository() {
        let a = Reference::parse("registry.local/app:1").unwrap();
        let b = Reference::parse("registry.local/app:2").unwrap();
        let c = Reference::parse("registry.local/base:1").unwrap();
        assert!(a.same_repository(&b));
        assert!(!a.same_repository(&c));
    }
}
