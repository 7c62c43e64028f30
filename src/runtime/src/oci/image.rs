//! Image and layer abstraction.
//!
//! An [`Image`] exposes its manifest, config and layers regardless of where
//! the content lives (a registry, an image tarball, or a layer cache in
//! front of either). Layer bytes are opened lazily and streamed.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use relok_core::error::Result;

use super::manifest::{Descriptor, ImageManifest};

/// Streaming reader over layer bytes.
pub type LayerReader = Box<dyn Read + Send>;

/// A single image layer.
#[async_trait]
pub trait Layer: Send + Sync {
    /// Descriptor of the compressed blob.
    fn descriptor(&self) -> &Descriptor;

    /// Digest of the uncompressed tar stream, empty when the image config
    /// does not list one for a compressed layer.
    fn diff_id(&self) -> &str;

    /// Open the blob as stored in the registry.
    async fn compressed(&self) -> Result<LayerReader>;

    /// Open the decompressed tar stream.
    async fn uncompressed(&self) -> Result<LayerReader> {
        let compressed = self.compressed().await?;
        if is_gzip_media_type(&self.descriptor().media_type) {
            Ok(Box::new(MultiGzDecoder::new(compressed)))
        } else {
            Ok(compressed)
        }
    }

    fn digest(&self) -> &str {
        &self.descriptor().digest
    }

    /// Whether this layer already serves its bytes from the local cache.
    fn is_cached(&self) -> bool {
        false
    }
}

/// A single-platform container image.
pub trait Image: Send + Sync {
    fn manifest(&self) -> &ImageManifest;

    /// Manifest bytes exactly as hashed into [`Image::digest`].
    fn raw_manifest(&self) -> &[u8];

    /// Manifest digest (`sha256:...`).
    fn digest(&self) -> &str;

    fn raw_config(&self) -> &[u8];

    fn layers(&self) -> Vec<Arc<dyn Layer>>;

    /// Whether layer access already goes through the local cache.
    fn is_cached(&self) -> bool {
        false
    }
}

/// Whether a layer media type is gzip compressed.
pub fn is_gzip_media_type(media_type: &str) -> bool {
    media_type.ends_with("gzip") || media_type.ends_with("+gzip")
}

/// Diff id for the layer at `index`. An uncompressed blob is its own diff id
/// when the config does not list one; a compressed blob gets an empty one.
pub(crate) fn diff_id_at(diff_ids: &[String], index: usize, descriptor: &Descriptor) -> String {
    match diff_ids.get(index) {
        Some(diff_id) => diff_id.clone(),
        None if is_gzip_media_type(&descriptor.media_type) => String::new(),
        None => descriptor.digest.clone(),
    }
}
