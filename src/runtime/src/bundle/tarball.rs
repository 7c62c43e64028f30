//! Multi-reference image tarball.
//!
//! Layout follows `docker save`:
//!
//! ```text
//! sha256:<hex>        image config, named by its digest
//! <hex>.tar.gz        compressed layer blobs, each written once
//! manifest.json       [{"Config", "RepoTags", "Layers", "LayerSources"}]
//! ```
//!
//! `manifest.json` is written last. `RepoTags` holds full references, so
//! digest-pinned images are addressable too. Reading rebuilds each image
//! manifest with the canonical serializer, which keeps the manifest digest
//! identical to the one recorded when the image was pulled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use relok_core::error::{MoverError, Result};
use serde::{Deserialize, Serialize};

use crate::oci::image::{Image, Layer, LayerReader};
use crate::oci::manifest::{
    config_diff_ids, sha256_digest, split_digest, CanonicalSerializer, Descriptor,
    ImageManifest, ManifestSerializer, DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE,
    OCI_CONFIG_MEDIA_TYPE,
};
use crate::oci::registry::read_all;
use crate::oci::{ContainerRegistry, ImageReference};

pub const MANIFEST_FILE: &str = "manifest.json";

/// One image in `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TarballEntry {
    pub config: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub layer_sources: BTreeMap<String, Descriptor>,
}

/// Write `images` to a tarball at `path`. References sharing an image are
/// recorded on a single entry.
pub async fn write_tarball(path: &Path, images: &[(ImageReference, Arc<dyn Image>)]) -> Result<()> {
    let file = File::create(path).map_err(|e| {
        MoverError::Archive(format!("Failed to create {}: {}", path.display(), e))
    })?;
    let mut builder = tar::Builder::new(file);
    let mut entries: Vec<(String, TarballEntry)> = Vec::new();
    let mut written: HashSet<String> = HashSet::new();

    for (reference, image) in images {
        if let Some((_, entry)) = entries.iter_mut().find(|(d, _)| d.as_str() == image.digest()) {
            entry.repo_tags.push(reference.full_reference());
            continue;
        }

        let manifest = image.manifest();
        let config_name = manifest.config.digest.clone();
        if written.insert(config_name.clone()) {
            append(&mut builder, &config_name, image.raw_config())?;
        }

        let mut layer_names = Vec::new();
        let mut layer_sources = BTreeMap::new();
        for layer in image.layers() {
            let (_, hex) = split_digest(layer.digest())?;
            let name = format!("{}.tar.gz", hex);
            if written.insert(name.clone()) {
                let data = read_all(layer.compressed().await?).await?;
                append(&mut builder, &name, &data)?;
                tracing::debug!(layer = %layer.digest(), size = data.len(), "Wrote layer");
            }
            layer_sources.insert(layer.digest().to_string(), layer.descriptor().clone());
            layer_names.push(name);
        }

        entries.push((
            image.digest().to_string(),
            TarballEntry {
                config: config_name,
                repo_tags: vec![reference.full_reference()],
                layers: layer_names,
                layer_sources,
            },
        ));
    }

    let manifest: Vec<TarballEntry> = entries.into_iter().map(|(_, e)| e).collect();
    append(&mut builder, MANIFEST_FILE, &serde_json::to_vec(&manifest)?)?;
    builder.finish()?;

    tracing::info!(path = %path.display(), images = manifest.len(), "Wrote image tarball");
    Ok(())
}

fn append<W: std::io::Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| MoverError::Archive(format!("Failed to write {}: {}", name, e)))
}

/// Read access to an image tarball on disk.
///
/// The file is re-scanned for every lookup; nothing is held open between calls.
#[derive(Debug, Clone)]
pub struct ImageTarball {
    path: Arc<PathBuf>,
}

impl ImageTarball {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Result<Vec<TarballEntry>> {
        let raw = read_entry(&self.path, MANIFEST_FILE)?.ok_or_else(|| {
            MoverError::Archive(format!("{} has no {}", self.path.display(), MANIFEST_FILE))
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Image recorded under `reference`.
    pub fn image(&self, reference: &ImageReference) -> Result<Arc<dyn Image>> {
        let wanted = reference.full_reference();
        let entry = self
            .entries()?
            .into_iter()
            .find(|entry| {
                entry.repo_tags.iter().any(|tag| {
                    ImageReference::parse(tag)
                        .map(|r| r.full_reference() == wanted)
                        .unwrap_or(false)
                })
            })
            .ok_or_else(|| {
                MoverError::Archive(format!(
                    "{} not found in {}",
                    wanted,
                    self.path.display()
                ))
            })?;
        Ok(Arc::new(TarballImage::load(self, &entry)?))
    }
}

#[async_trait]
impl ContainerRegistry for ImageTarball {
    async fn pull(&self, reference: &ImageReference) -> Result<(Arc<dyn Image>, String)> {
        let tarball = self.clone();
        let reference = reference.clone();
        let image = tokio::task::spawn_blocking(move || tarball.image(&reference))
            .await
            .map_err(|e| MoverError::Other(format!("tarball read task failed: {}", e)))??;
        let digest = image.digest().to_string();
        Ok((image, digest))
    }

    async fn push(&self, _image: Arc<dyn Image>, reference: &ImageReference) -> Result<()> {
        Err(MoverError::Archive(format!(
            "cannot push {}: image tarball {} is read-only",
            reference,
            self.path.display()
        )))
    }

    async fn remote_digest(&self, reference: &ImageReference) -> Result<String> {
        Ok(self.pull(reference).await?.1)
    }
}

/// Image rebuilt from a tarball entry.
struct TarballImage {
    manifest: ImageManifest,
    raw_manifest: Vec<u8>,
    digest: String,
    raw_config: Vec<u8>,
    layers: Vec<Arc<dyn Layer>>,
}

impl TarballImage {
    fn load(tarball: &ImageTarball, entry: &TarballEntry) -> Result<Self> {
        let raw_config = read_entry(&tarball.path, &entry.config)?.ok_or_else(|| {
            MoverError::Archive(format!("config {} missing from tarball", entry.config))
        })?;
        let diff_ids = config_diff_ids(&raw_config)?;

        let mut sizes: Option<HashMap<String, u64>> = None;
        let mut descriptors = Vec::new();
        for name in &entry.layers {
            let hex = name.trim_end_matches(".tar.gz");
            let digest = format!("sha256:{}", hex);
            let descriptor = match entry.layer_sources.get(&digest) {
                Some(d) => d.clone(),
                None => {
                    if sizes.is_none() {
                        sizes = Some(entry_sizes(&tarball.path)?);
                    }
                    let size = sizes
                        .as_ref()
                        .and_then(|s| s.get(name))
                        .copied()
                        .ok_or_else(|| {
                            MoverError::Archive(format!("layer {} missing from tarball", name))
                        })?;
                    Descriptor::new(DOCKER_LAYER_MEDIA_TYPE, size as i64, digest)
                }
            };
            descriptors.push(descriptor);
        }

        let config_media_type = if descriptors
            .iter()
            .any(|d| d.media_type.starts_with("application/vnd.oci."))
        {
            OCI_CONFIG_MEDIA_TYPE
        } else {
            DOCKER_CONFIG_MEDIA_TYPE
        };
        let config = Descriptor::new(
            config_media_type,
            raw_config.len() as i64,
            sha256_digest(&raw_config),
        );
        let manifest = ImageManifest::for_content(config, descriptors.clone());
        let raw_manifest = CanonicalSerializer::default().serialize(&manifest)?;
        let digest = sha256_digest(&raw_manifest);

        let layers = descriptors
            .into_iter()
            .zip(&entry.layers)
            .enumerate()
            .map(|(index, (descriptor, name))| {
                let diff_id = crate::oci::image::diff_id_at(&diff_ids, index, &descriptor);
                Arc::new(TarballLayer {
                    tarball: tarball.path.clone(),
                    name: name.clone(),
                    descriptor,
                    diff_id,
                }) as Arc<dyn Layer>
            })
            .collect();

        Ok(Self {
            manifest,
            raw_manifest,
            digest,
            raw_config,
            layers,
        })
    }
}

impl Image for TarballImage {
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

struct TarballLayer {
    tarball: Arc<PathBuf>,
    name: String,
    descriptor: Descriptor,
    diff_id: String,
}

#[async_trait]
impl Layer for TarballLayer {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn diff_id(&self) -> &str {
        &self.diff_id
    }

    async fn compressed(&self) -> Result<LayerReader> {
        let tarball = self.tarball.clone();
        let name = self.name.clone();
        let data = tokio::task::spawn_blocking(move || read_entry(&tarball, &name))
            .await
            .map_err(|e| MoverError::Other(format!("tarball read task failed: {}", e)))??
            .ok_or_else(|| {
                MoverError::Archive(format!("layer {} missing from tarball", self.name))
            })?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Read one named entry from a tar file.
pub(crate) fn read_entry(path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let file = File::open(path)
        .map_err(|e| MoverError::Archive(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == name {
            let mut data = Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
            entry.read_to_end(&mut data)?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}

fn entry_sizes(path: &Path) -> Result<HashMap<String, u64>> {
    let file = File::open(path)
        .map_err(|e| MoverError::Archive(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut archive = tar::Archive::new(file);
    let mut sizes = HashMap::new();
    for entry in archive.entries()? {
        let entry = entry?;
        sizes.insert(entry.path()?.to_string_lossy().into_owned(), entry.header().size()?);
    }
    Ok(sizes)
}
