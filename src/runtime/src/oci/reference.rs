//! OCI image reference parsing.
//!
//! Parses image references like `docker.io/bitnami/wordpress:6.4` into
//! structured components, normalizing Docker Hub names the way registries
//! resolve them (`nginx` → `index.docker.io/library/nginx:latest`).

use relok_core::error::{MoverError, Result};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Registry names that alias the default registry.
const DEFAULT_REGISTRY_ALIASES: &[&str] = &["docker.io", "registry-1.docker.io"];

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "index.docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "bitnami/wordpress")
    pub repository: String,
    /// Tag (e.g., "latest", "6.4.2")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → index.docker.io/library/nginx:latest
    /// - `nginx:1.25` → index.docker.io/library/nginx:1.25
    /// - `bitnami/wordpress` → index.docker.io/bitnami/wordpress:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    /// - `localhost:5000/image:tag` → localhost:5000/image:tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MoverError::TemplateRender(
                "Empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest_part)) => {
                validate_digest(reference, digest_part)?;
                (name_tag, Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // Split tag (: separator, but only after the last /)
        let last_segment_start = name_tag.rfind('/').map_or(0, |p| p + 1);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon = last_segment_start + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(ref tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = Self::split_registry_repository(name)?;
        validate_repository(reference, &repository)?;

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry hostname when it contains a dot
        // or colon, or is "localhost"
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(MoverError::TemplateRender(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                let registry = normalize_registry(first);
                let repository = if registry == DEFAULT_REGISTRY && !rest.contains('/') {
                    format!("library/{}", rest)
                } else {
                    rest.to_string()
                };
                return Ok((registry, repository));
            }
        }

        // No registry detected, use default
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// `registry/repository` without tag or digest.
    pub fn context(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Same repository, pinned to a digest instead of a tag.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.context();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = MoverError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Map Docker Hub aliases onto the canonical registry name.
pub fn normalize_registry(registry: &str) -> String {
    if DEFAULT_REGISTRY_ALIASES.contains(&registry) {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry.to_string()
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    let valid = match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(MoverError::TemplateRender(format!(
            "Invalid digest format in reference '{}': expected algorithm:hex",
            reference
        )))
    }
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));
    if valid {
        Ok(())
    } else {
        Err(MoverError::TemplateRender(format!(
            "Invalid tag '{}' in reference '{}'",
            tag, reference
        )))
    }
}

fn validate_repository(reference: &str, repository: &str) -> Result<()> {
    let valid = repository.split('/').all(|component| {
        !component.is_empty()
            && component.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
    });
    if valid {
        Ok(())
    } else {
        Err(MoverError::TemplateRender(format!(
            "Invalid repository '{}' in reference '{}'",
            repository, reference
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "index.docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("ubuntu:latest").unwrap();
        assert_eq!(r.full_reference(), "index.docker.io/library/ubuntu:latest");
    }

    #[test]
    fn test_parse_docker_io_alias() {
        let r = ImageReference::parse("docker.io/bitnami/wordpress:1.2.3").unwrap();
        assert_eq!(r.registry, "index.docker.io");
        assert_eq!(r.repository, "bitnami/wordpress");
        assert_eq!(r.tag, Some("1.2.3".to_string()));
    }

    #[test]
    fn test_parse_docker_io_single_segment() {
        let r = ImageReference::parse("docker.io/nginx").unwrap();
        assert_eq!(r.repository, "library/nginx");
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageReference::parse("ghcr.io/org/code:v0.1.0").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/code");
        assert_eq!(r.tag, Some("v0.1.0".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse(&format!("ghcr.io/org/code@{}", DIGEST)).unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(DIGEST));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/code:v1@{}", DIGEST)).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest.as_deref(), Some(DIGEST));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/myimage:v1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port_no_tag() {
        let r = ImageReference::parse("myregistry.io:5000/team/app").unwrap();
        assert_eq!(r.registry, "myregistry.io:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("nginx@invaliddigest").is_err());
        assert!(ImageReference::parse("Upper/Case").is_err());
        assert!(ImageReference::parse("<no value>/thing").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
    }

    #[test]
    fn test_context_and_with_digest() {
        let r = ImageReference::parse("harbor.io/lib/nginx:1.25").unwrap();
        assert_eq!(r.context(), "harbor.io/lib/nginx");
        assert_eq!(
            r.with_digest(DIGEST).full_reference(),
            format!("harbor.io/lib/nginx@{}", DIGEST)
        );
    }

    #[test]
    fn test_display_roundtrip() {
        let r = ImageReference::parse("quay.io/deep/repo/path:2").unwrap();
        let again: ImageReference = r.to_string().parse().unwrap();
        assert_eq!(r, again);
    }
}
