//! Content-addressed disk cache for image layer streams.
//!
//! [`LayerCache::wrap`] decorates an image so that every layer stream is
//! served from `cache_dir/<algorithm>-<hex>[.gz]` when present. On a miss
//! the real layer is streamed to the caller while a temporary file in the
//! cache directory is filled; at end of stream the bytes are verified and
//! the file is renamed into place, so readers never observe partial entries.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use relok_core::error::{MoverError, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::oci::image::{is_gzip_media_type, Image, Layer, LayerReader};
use crate::oci::manifest::{split_digest, Descriptor, ImageManifest};

/// Handle to a layer cache directory.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Root directory for cached layer streams
    cache_dir: PathBuf,
}

impl LayerCache {
    /// Open a layer cache, creating the directory when needed.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            MoverError::Cache(format!(
                "Failed to create layer cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Decorate an image so its layers are served through the cache.
    ///
    /// Images that are already cached are returned unchanged.
    pub fn wrap(&self, image: Arc<dyn Image>) -> Arc<dyn Image> {
        if image.is_cached() {
            return image;
        }
        let layers = image
            .layers()
            .into_iter()
            .map(|layer| self.wrap_layer(layer))
            .collect();
        Arc::new(CachedImage {
            inner: image,
            layers,
        })
    }

    /// Decorate a single layer; already cached layers are returned unchanged.
    pub fn wrap_layer(&self, layer: Arc<dyn Layer>) -> Arc<dyn Layer> {
        if layer.is_cached() {
            return layer;
        }
        Arc::new(CachedLayer {
            inner: layer,
            cache: self.clone(),
        })
    }

    /// Cache file for a digest: `<algorithm>-<hex>`, plus `.gz` for
    /// compressed streams.
    pub fn path_for(&self, digest: &str, compressed: bool) -> Result<PathBuf> {
        let (algorithm, hex) = split_digest(digest)?;
        let safe = |s: &str| s.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '_');
        if !safe(algorithm) || !safe(hex) {
            return Err(MoverError::Cache(format!(
                "Refusing to cache unsafe digest '{}'",
                digest
            )));
        }
        let mut name = format!("{}-{}", algorithm, hex);
        if compressed {
            name.push_str(".gz");
        }
        Ok(self.cache_dir.join(name))
    }

    /// Open a cache entry, `None` on a miss.
    fn open(&self, path: &Path) -> Result<Option<LayerReader>> {
        match File::open(path) {
            Ok(file) => {
                tracing::debug!(path = %path.display(), "Layer cache hit");
                Ok(Some(Box::new(BufReader::new(file))))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MoverError::Cache(format!(
                "Failed to open cached layer {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Stream `source` to the caller while filling the cache entry at `path`.
    fn fill(&self, source: LayerReader, path: PathBuf, expected: &str) -> Result<LayerReader> {
        let tmp = NamedTempFile::new_in(&self.cache_dir).map_err(|e| {
            MoverError::Cache(format!(
                "Failed to create temporary file in {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;
        tracing::debug!(path = %path.display(), "Layer cache miss");
        Ok(Box::new(CacheFiller {
            source,
            tmp: Some(tmp),
            target: path,
            hasher: expected.starts_with("sha256:").then(Sha256::new),
            expected: expected.to_string(),
        }))
    }
}

/// Image whose layers go through a [`LayerCache`].
struct CachedImage {
    inner: Arc<dyn Image>,
    layers: Vec<Arc<dyn Layer>>,
}

impl Image for CachedImage {
    fn manifest(&self) -> &ImageManifest {
        self.inner.manifest()
    }

    fn raw_manifest(&self) -> &[u8] {
        self.inner.raw_manifest()
    }

    fn digest(&self) -> &str {
        self.inner.digest()
    }

    fn raw_config(&self) -> &[u8] {
        self.inner.raw_config()
    }

    fn layers(&self) -> Vec<Arc<dyn Layer>> {
        self.layers.clone()
    }

    fn is_cached(&self) -> bool {
        true
    }
}

struct CachedLayer {
    inner: Arc<dyn Layer>,
    cache: LayerCache,
}

#[async_trait]
impl Layer for CachedLayer {
    fn descriptor(&self) -> &Descriptor {
        self.inner.descriptor()
    }

    fn diff_id(&self) -> &str {
        self.inner.diff_id()
    }

    async fn compressed(&self) -> Result<LayerReader> {
        let path = self.cache.path_for(self.digest(), true)?;
        if let Some(reader) = self.cache.open(&path)? {
            return Ok(reader);
        }
        let source = self.inner.compressed().await?;
        self.cache.fill(source, path, self.digest())
    }

    async fn uncompressed(&self) -> Result<LayerReader> {
        // Without a diff id there is nothing to key or verify the entry by
        let path = match self.diff_id() {
            "" => None,
            diff_id => Some(self.cache.path_for(diff_id, false)?),
        };
        if let Some(path) = &path {
            if let Some(reader) = self.cache.open(path)? {
                return Ok(reader);
            }
        }

        // Decompress from the (cached) compressed stream. The multi-member
        // decoder reads its input to EOF so the compressed entry persists.
        let compressed = self.compressed().await?;
        let source: LayerReader = if is_gzip_media_type(&self.descriptor().media_type) {
            Box::new(MultiGzDecoder::new(compressed))
        } else {
            compressed
        };
        match path {
            Some(path) => self.cache.fill(source, path, self.diff_id()),
            None => Ok(source),
        }
    }

    fn is_cached(&self) -> bool {
        true
    }
}

/// Tee reader that persists what it serves once the source is exhausted.
struct CacheFiller {
    source: LayerReader,
    tmp: Option<NamedTempFile>,
    target: PathBuf,
    hasher: Option<Sha256>,
    expected: String,
}

impl CacheFiller {
    fn finish(&mut self) -> io::Result<()> {
        let Some(mut tmp) = self.tmp.take() else {
            return Ok(());
        };
        tmp.flush()?;

        if let Some(hasher) = self.hasher.take() {
            let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
            if actual != self.expected {
                // Dropping the temporary file removes it
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "layer content digest {} does not match {}",
                        actual, self.expected
                    ),
                ));
            }
        }

        tmp.persist(&self.target).map_err(|e| {
            io::Error::new(
                e.error.kind(),
                format!("Failed to persist cache entry {}: {}", self.target.display(), e.error),
            )
        })?;
        tracing::debug!(path = %self.target.display(), "Cached layer stream");
        Ok(())
    }
}

impl Read for CacheFiller {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read(buf)?;
        if n == 0 {
            self.finish()?;
            return Ok(0);
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        if let Some(tmp) = self.tmp.as_mut() {
            tmp.write_all(&buf[..n]).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to write cache entry for {}: {}", self.target.display(), e),
                )
            })?;
        }
        Ok(n)
    }
}
