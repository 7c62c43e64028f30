//! In-memory images and a fake registry for tests.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relok_core::error::{MoverError, Result};

use crate::oci::manifest::{
    sha256_digest, CanonicalSerializer, Descriptor, ImageManifest, ManifestSerializer,
    DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE,
};
use crate::oci::registry::read_all;
use crate::oci::{ContainerRegistry, Image, ImageReference, Layer, LayerReader};

pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub(crate) struct MemoryLayer {
    descriptor: Descriptor,
    diff_id: String,
    data: Vec<u8>,
    opens: AtomicUsize,
}

impl MemoryLayer {
    pub(crate) fn gzip(compressed: Vec<u8>, uncompressed: &[u8]) -> Self {
        Self {
            descriptor: Descriptor::new(
                DOCKER_LAYER_MEDIA_TYPE,
                compressed.len() as i64,
                sha256_digest(&compressed),
            ),
            diff_id: sha256_digest(uncompressed),
            data: compressed,
            opens: AtomicUsize::new(0),
        }
    }

    /// Same layer as it looks when the image config lists no diff id.
    pub(crate) fn without_diff_id(mut self) -> Self {
        self.diff_id.clear();
        self
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Layer for MemoryLayer {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn diff_id(&self) -> &str {
        &self.diff_id
    }

    async fn compressed(&self) -> Result<LayerReader> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

pub(crate) struct MemoryImage {
    manifest: ImageManifest,
    raw_manifest: Vec<u8>,
    digest: String,
    raw_config: Vec<u8>,
    layers: Vec<Arc<MemoryLayer>>,
}

impl MemoryImage {
    /// Single-layer image whose content is derived from `seed`.
    pub(crate) fn new(seed: &str) -> Arc<Self> {
        let uncompressed = format!("layer contents for {}", seed).into_bytes();
        let layer = Arc::new(MemoryLayer::gzip(gzip(&uncompressed), &uncompressed));

        let raw_config = format!(
            r#"{{"architecture":"amd64","os":"linux","rootfs":{{"type":"layers","diff_ids":["{}"]}}}}"#,
            layer.diff_id
        )
        .into_bytes();
        let manifest = ImageManifest::for_content(
            Descriptor::new(
                DOCKER_CONFIG_MEDIA_TYPE,
                raw_config.len() as i64,
                sha256_digest(&raw_config),
            ),
            vec![layer.descriptor.clone()],
        );
        let raw_manifest = CanonicalSerializer::default().serialize(&manifest).unwrap();
        let digest = sha256_digest(&raw_manifest);

        Arc::new(Self {
            manifest,
            raw_manifest,
            digest,
            raw_config,
            layers: vec![layer],
        })
    }

    pub(crate) fn memory_layers(&self) -> &[Arc<MemoryLayer>] {
        &self.layers
    }
}

impl Image for MemoryImage {
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
        self.layers
            .iter()
            .map(|l| l.clone() as Arc<dyn Layer>)
            .collect()
    }
}

/// Registry keeping images in memory, keyed by full reference.
#[derive(Default)]
pub(crate) struct FakeRegistry {
    images: Mutex<HashMap<String, Arc<dyn Image>>>,
    pulls: AtomicUsize,
    push_attempts: AtomicUsize,
    failing_pushes: AtomicUsize,
}

impl FakeRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn insert(&self, reference: &ImageReference, image: Arc<dyn Image>) {
        let mut images = self.images.lock().unwrap();
        images.insert(
            reference.with_digest(image.digest()).full_reference(),
            image.clone(),
        );
        images.insert(reference.full_reference(), image);
    }

    pub(crate) fn get(&self, reference: &str) -> Option<Arc<dyn Image>> {
        let reference = ImageReference::parse(reference).unwrap();
        self.images
            .lock()
            .unwrap()
            .get(&reference.full_reference())
            .cloned()
    }

    pub(crate) fn fail_next_pushes(&self, count: usize) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    pub(crate) fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub(crate) fn push_attempts(&self) -> usize {
        self.push_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRegistry for FakeRegistry {
    async fn pull(&self, reference: &ImageReference) -> Result<(Arc<dyn Image>, String)> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let image = self
            .images
            .lock()
            .unwrap()
            .get(&reference.full_reference())
            .cloned()
            .ok_or_else(|| MoverError::Registry {
                registry: reference.registry.clone(),
                message: format!("{} not found", reference),
            })?;
        let digest = image.digest().to_string();
        Ok((image, digest))
    }

    async fn push(&self, image: Arc<dyn Image>, reference: &ImageReference) -> Result<()> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_pushes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_pushes.store(failing - 1, Ordering::SeqCst);
            return Err(MoverError::Registry {
                registry: reference.registry.clone(),
                message: "503 Service Unavailable".to_string(),
            });
        }
        for layer in image.layers() {
            read_all(layer.compressed().await?).await?;
        }
        self.insert(reference, image);
        Ok(())
    }

    async fn remote_digest(&self, reference: &ImageReference) -> Result<String> {
        self.images
            .lock()
            .unwrap()
            .get(&reference.full_reference())
            .map(|image| image.digest().to_string())
            .ok_or_else(|| MoverError::Registry {
                registry: reference.registry.clone(),
                message: "404 Not Found".to_string(),
            })
    }
}
