//! Image manifest types and the canonical manifest serializer.
//!
//! Registries hash the exact manifest bytes they serve. A manifest that is
//! rebuilt locally (for example after an image went through a tarball) only
//! keeps its original digest when it is serialized the same way registries
//! format it: indented JSON with three spaces and the distribution field
//! order. [`CanonicalSerializer`] owns that contract.

use std::collections::BTreeMap;

use oci_spec::image::ImageConfiguration;
use relok_core::error::{MoverError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Manifest media types accepted when pulling.
pub const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] = &[
    OCI_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

/// Content descriptor.
///
/// Kept local rather than reusing `oci_distribution::manifest::OciDescriptor`:
/// that type serializes `digest` ahead of `size`, and manifests rebuilt with it
/// would not hash to the digest the source registry served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: i64,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, size: i64, digest: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            size,
            digest: digest.into(),
            urls: None,
            annotations: None,
        }
    }
}

/// Single-platform image manifest (Docker schema 2 or OCI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageManifest {
    /// Build a schema 2 manifest for a config blob and its layers, choosing
    /// the Docker or OCI media type from the config media type.
    pub fn for_content(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        let media_type = if config.media_type == OCI_CONFIG_MEDIA_TYPE {
            OCI_MANIFEST_MEDIA_TYPE
        } else {
            DOCKER_MANIFEST_MEDIA_TYPE
        };
        Self {
            schema_version: 2,
            media_type: Some(media_type.to_string()),
            artifact_type: None,
            config,
            layers,
            annotations: None,
        }
    }

    /// Media type to announce when pushing.
    pub fn content_type(&self) -> &str {
        self.media_type
            .as_deref()
            .unwrap_or(OCI_MANIFEST_MEDIA_TYPE)
    }
}

/// Parse raw bytes of a single-platform manifest.
pub fn parse_image_manifest(raw: &[u8]) -> Result<ImageManifest> {
    serde_json::from_slice(raw)
        .map_err(|e| MoverError::Serialization(format!("image manifest: {}", e)))
}

/// Serializes a manifest into the exact bytes that get hashed and pushed.
pub trait ManifestSerializer: Send + Sync {
    fn serialize(&self, manifest: &ImageManifest) -> Result<Vec<u8>>;
}

/// Registry-compatible manifest serialization: pretty JSON indented with
/// three spaces, no trailing newline.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalSerializer {
    indent: &'static [u8],
}

impl Default for CanonicalSerializer {
    fn default() -> Self {
        Self { indent: b"   " }
    }
}

impl CanonicalSerializer {
    pub fn with_indent(indent: &'static [u8]) -> Self {
        Self { indent }
    }
}

impl ManifestSerializer for CanonicalSerializer {
    fn serialize(&self, manifest: &ImageManifest) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(self.indent);
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        manifest
            .serialize(&mut serializer)
            .map_err(|e| MoverError::Serialization(format!("manifest: {}", e)))?;
        Ok(out)
    }
}

/// `sha256:<hex>` digest of some bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Split `algorithm:hex` into its parts.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    digest
        .split_once(':')
        .filter(|(alg, hex)| !alg.is_empty() && !hex.is_empty())
        .ok_or_else(|| MoverError::Other(format!("Invalid digest '{}'", digest)))
}

/// Read `rootfs.diff_ids` from a raw image config.
pub fn config_diff_ids(raw_config: &[u8]) -> Result<Vec<String>> {
    let config: ImageConfiguration = serde_json::from_slice(raw_config)
        .map_err(|e| MoverError::Serialization(format!("image config: {}", e)))?;
    Ok(config.rootfs().diff_ids().clone())
}
