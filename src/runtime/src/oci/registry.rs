//! OCI registry client for pulling, pushing and checking images.
//!
//! Uses the `oci-distribution` crate to talk to container registries.
//! Manifests are moved as raw bytes so that the digest recorded at pull time
//! is the digest the target registry ends up serving.

use std::io::{Cursor, Read};
use std::sync::Arc;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use relok_core::config::RetryPolicy;
use relok_core::error::{MoverError, Result};
use relok_core::request::ContainersAuth;

use super::credentials::CredentialStore;
use super::image::{diff_id_at, Image, Layer, LayerReader};
use super::manifest::{
    config_diff_ids, parse_image_manifest, sha256_digest, Descriptor, ImageManifest,
    ACCEPTED_MANIFEST_MEDIA_TYPES,
};
use super::reference::{normalize_registry, ImageReference};

/// Platform selected from multi-platform images.
const DEFAULT_OS: &str = "linux";
const DEFAULT_ARCHITECTURE: &str = "amd64";

/// Registry operations needed to relocate images.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Pull an image and its manifest digest.
    async fn pull(&self, reference: &ImageReference) -> Result<(Arc<dyn Image>, String)>;

    /// Push an image under the given reference (by tag when it has one).
    async fn push(&self, image: Arc<dyn Image>, reference: &ImageReference) -> Result<()>;

    /// Digest currently served for a reference.
    async fn remote_digest(&self, reference: &ImageReference) -> Result<String>;

    /// Decide whether `reference` needs a push to hold `digest`.
    ///
    /// A failed lookup (missing, unauthorized, unreachable) means a push is
    /// required; the push itself surfaces real failures. A different remote
    /// digest is an error unless `force_push` is set. With `force_push` the
    /// image is always pushed.
    async fn check(
        &self,
        digest: &str,
        reference: &ImageReference,
        force_push: bool,
    ) -> Result<bool> {
        let remote = match self.remote_digest(reference).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::debug!(
                    reference = %reference,
                    error = %e,
                    "Target lookup failed, push required"
                );
                return Ok(true);
            }
        };

        if remote == digest {
            return Ok(force_push);
        }
        if force_push {
            tracing::warn!(
                reference = %reference,
                remote = %remote,
                expected = %digest,
                "Overwriting target with a different digest"
            );
            return Ok(true);
        }
        Err(MoverError::DigestMismatch {
            reference: reference.to_string(),
            expected: digest.to_string(),
            actual: remote,
        })
    }
}

/// Push with a fixed number of attempts, collecting every failure.
pub async fn push_with_retry(
    registry: &dyn ContainerRegistry,
    image: Arc<dyn Image>,
    reference: &ImageReference,
    policy: &RetryPolicy,
) -> Result<()> {
    let attempts = policy.effective_attempts();
    let mut errors = Vec::new();

    for attempt in 1..=attempts {
        match registry.push(image.clone(), reference).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    reference = %reference,
                    attempt,
                    attempts,
                    error = %e,
                    "Push attempt failed"
                );
                errors.push(format!("attempt {}: {}", attempt, e));
                if attempt < attempts {
                    let delay = policy.delay_after(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    Err(MoverError::PushFailed {
        reference: reference.to_string(),
        errors,
    })
}

/// Authentication for a registry client.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    auth: ContainersAuth,
}

impl RegistryAuth {
    pub fn new(auth: ContainersAuth) -> Self {
        Self { auth }
    }

    /// Credentials for a registry: explicit credentials when the server
    /// matches, otherwise the default credential store, otherwise anonymous.
    fn for_registry(&self, registry: &str) -> OciRegistryAuth {
        if let ContainersAuth::Credentials {
            server,
            username,
            password,
        } = &self.auth
        {
            if normalize_registry(server) == normalize_registry(registry) {
                return OciRegistryAuth::Basic(username.clone(), password.clone());
            }
        }

        match CredentialStore::default_path().and_then(|store| store.get(registry)) {
            Ok(Some((username, password))) => OciRegistryAuth::Basic(username, password),
            Ok(None) => OciRegistryAuth::Anonymous,
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                OciRegistryAuth::Anonymous
            }
        }
    }
}

/// Registry client backed by `oci-distribution`.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    /// Create a client. `insecure` reaches registries over plain HTTP.
    pub fn new(auth: RegistryAuth, insecure: bool) -> Self {
        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let config = ClientConfig {
            protocol,
            accept_invalid_certificates: insecure,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    async fn pull_manifest(
        &self,
        reference: &ImageReference,
        oci_ref: &Reference,
        auth: &OciRegistryAuth,
    ) -> Result<Vec<u8>> {
        let (raw, _digest) = self
            .client
            .pull_manifest_raw(oci_ref, auth, ACCEPTED_MANIFEST_MEDIA_TYPES)
            .await
            .map_err(|e| registry_error(reference, "Failed to pull manifest", e))?;
        Ok(raw)
    }

    /// Pull the single-platform manifest a reference stands for, resolving
    /// an index to its linux/amd64 entry. Returns the reference that entry
    /// lives under and its raw bytes.
    async fn resolve_manifest(
        &self,
        reference: &ImageReference,
        auth: &OciRegistryAuth,
    ) -> Result<(Reference, Vec<u8>)> {
        let oci_ref = to_oci_reference(reference)?;
        let raw = self.pull_manifest(reference, &oci_ref, auth).await?;
        let platform_digest = match classify_manifest(&raw)? {
            ManifestKind::Image => return Ok((oci_ref, raw)),
            ManifestKind::Index(Some(digest)) => digest,
            ManifestKind::Index(None) => {
                return Err(MoverError::Registry {
                    registry: reference.registry.clone(),
                    message: format!(
                        "{} has no {}/{} image",
                        reference, DEFAULT_OS, DEFAULT_ARCHITECTURE
                    ),
                })
            }
        };

        tracing::debug!(
            reference = %reference,
            digest = %platform_digest,
            "Resolved index entry"
        );
        let oci_ref = to_oci_reference(&reference.with_digest(&platform_digest))?;
        let raw = self.pull_manifest(reference, &oci_ref, auth).await?;
        match classify_manifest(&raw)? {
            ManifestKind::Image => Ok((oci_ref, raw)),
            ManifestKind::Index(_) => Err(MoverError::Registry {
                registry: reference.registry.clone(),
                message: format!("{} resolves to a nested index", reference),
            }),
        }
    }
}

#[async_trait]
impl ContainerRegistry for RegistryClient {
    async fn pull(&self, reference: &ImageReference) -> Result<(Arc<dyn Image>, String)> {
        let auth = self.auth.for_registry(&reference.registry);

        tracing::info!(reference = %reference, "Pulling image");

        let (oci_ref, raw) = self.resolve_manifest(reference, &auth).await?;
        let manifest = parse_image_manifest(&raw)?;
        let digest = sha256_digest(&raw);

        let mut raw_config = Vec::new();
        self.client
            .pull_blob(&oci_ref, &to_oci_descriptor(&manifest.config), &mut raw_config)
            .await
            .map_err(|e| registry_error(reference, "Failed to pull config blob", e))?;

        let diff_ids = config_diff_ids(&raw_config)?;
        let layers = manifest
            .layers
            .iter()
            .enumerate()
            .map(|(i, descriptor)| {
                Arc::new(RemoteLayer {
                    client: self.client.clone(),
                    reference: oci_ref.clone(),
                    registry: reference.registry.clone(),
                    descriptor: descriptor.clone(),
                    diff_id: diff_id_at(&diff_ids, i, descriptor),
                }) as Arc<dyn Layer>
            })
            .collect();

        tracing::info!(reference = %reference, digest = %digest, "Image pulled");

        let image = RemoteImage {
            manifest,
            raw_manifest: raw,
            digest: digest.clone(),
            raw_config,
            layers,
        };
        Ok((Arc::new(image), digest))
    }

    async fn push(&self, image: Arc<dyn Image>, reference: &ImageReference) -> Result<()> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.for_registry(&reference.registry);

        tracing::info!(reference = %reference, digest = %image.digest(), "Pushing image");

        self.client
            .auth(&oci_ref, &auth, RegistryOperation::Push)
            .await
            .map_err(|e| registry_error(reference, "Failed to authenticate", e))?;

        self.client
            .push_blob(&oci_ref, image.raw_config(), &image.manifest().config.digest)
            .await
            .map_err(|e| registry_error(reference, "Failed to push config blob", e))?;

        for layer in image.layers() {
            let data = read_all(layer.compressed().await?).await?;
            tracing::debug!(digest = %layer.digest(), size = data.len(), "Pushing layer");
            self.client
                .push_blob(&oci_ref, &data, layer.digest())
                .await
                .map_err(|e| {
                    registry_error(
                        reference,
                        &format!("Failed to push layer {}", layer.digest()),
                        e,
                    )
                })?;
        }

        let content_type = image
            .manifest()
            .content_type()
            .parse()
            .map_err(|_| MoverError::Registry {
                registry: reference.registry.clone(),
                message: format!(
                    "Invalid manifest media type '{}'",
                    image.manifest().content_type()
                ),
            })?;
        let manifest_url = self
            .client
            .push_manifest_raw(&oci_ref, image.raw_manifest().to_vec(), content_type)
            .await
            .map_err(|e| registry_error(reference, "Failed to push manifest", e))?;

        tracing::info!(
            reference = %reference,
            manifest_url = %manifest_url,
            "Image pushed"
        );
        Ok(())
    }

    /// Digest of the manifest `pull` would select, so a multi-platform tag
    /// compares by its linux/amd64 entry rather than the index.
    async fn remote_digest(&self, reference: &ImageReference) -> Result<String> {
        let auth = self.auth.for_registry(&reference.registry);
        let (_, raw) = self.resolve_manifest(reference, &auth).await?;
        Ok(sha256_digest(&raw))
    }
}

/// Image whose layers are fetched from a registry on first access.
struct RemoteImage {
    manifest: ImageManifest,
    raw_manifest: Vec<u8>,
    digest: String,
    raw_config: Vec<u8>,
    layers: Vec<Arc<dyn Layer>>,
}

impl Image for RemoteImage {
    fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    fn raw_manifest(&self) -> &[u8] {
        &self.raw_manifest
    }

    fn digest(&self) -> &str {
        &self.digest
    }

    fn raw_config(&self) -> &[u8] {
        &self.raw_config
    }

    fn layers(&self) -> Vec<Arc<dyn Layer>> {
        self.layers.clone()
    }
}

struct RemoteLayer {
    client: Client,
    reference: Reference,
    registry: String,
    descriptor: Descriptor,
    diff_id: String,
}

#[async_trait]
impl Layer for RemoteLayer {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn diff_id(&self) -> &str {
        &self.diff_id
    }

    async fn compressed(&self) -> Result<LayerReader> {
        tracing::debug!(
            digest = %self.descriptor.digest,
            size = self.descriptor.size,
            "Pulling layer"
        );
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&self.reference, &to_oci_descriptor(&self.descriptor), &mut data)
            .await
            .map_err(|e| MoverError::Registry {
                registry: self.registry.clone(),
                message: format!("Failed to pull layer {}: {}", self.descriptor.digest, e),
            })?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// What a pulled manifest turned out to be.
#[derive(Debug, PartialEq, Eq)]
enum ManifestKind {
    Image,
    /// Index, with the digest of its linux/amd64 entry when it has one
    Index(Option<String>),
}

fn classify_manifest(raw: &[u8]) -> Result<ManifestKind> {
    let manifest: OciManifest = serde_json::from_slice(raw)
        .map_err(|e| MoverError::Serialization(format!("manifest: {}", e)))?;
    Ok(match manifest {
        OciManifest::Image(_) => ManifestKind::Image,
        OciManifest::ImageIndex(index) => {
            ManifestKind::Index(linux_platform_resolver(&index.manifests))
        }
    })
}

/// Platform resolver that selects the linux/amd64 entry of an index.
///
/// Relocated images are pinned to one platform regardless of the host, so
/// the architecture is fixed rather than taken from the running machine.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry.platform.as_ref().is_some_and(|p| {
                p.os == DEFAULT_OS && p.architecture == DEFAULT_ARCHITECTURE
            })
        })
        .map(|entry| entry.digest.clone())
}

/// Drain a blocking layer reader off the async executor.
pub(crate) async fn read_all(mut reader: LayerReader) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    })
    .await
    .map_err(|e| MoverError::Other(format!("layer reader task failed: {}", e)))?
}

fn to_oci_descriptor(descriptor: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: descriptor.media_type.clone(),
        digest: descriptor.digest.clone(),
        size: descriptor.size,
        urls: None,
        annotations: None,
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
///
/// A tag wins over a digest so pushes record a human-readable tag.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = if let Some(ref tag) = reference.tag {
        format!("{}:{}", reference.context(), tag)
    } else if let Some(ref digest) = reference.digest {
        format!("{}@{}", reference.context(), digest)
    } else {
        format!("{}:latest", reference.context())
    };

    ref_str.parse::<Reference>().map_err(|e| {
        MoverError::TemplateRender(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

fn registry_error(
    reference: &ImageReference,
    context: &str,
    err: impl std::fmt::Display,
) -> MoverError {
    MoverError::Registry {
        registry: reference.registry.clone(),
        message: format!("{} for {}: {}", context, reference, err),
    }
}
