//! Image hints loading.
//!
//! Hints are a YAML list of image reference templates. They come from one
//! of: an explicit file, the bundle's `hints.yaml`, or a file shipped inside
//! the chart.

use std::path::Path;

use relok_core::error::{MoverError, Result};

use crate::bundle::IntermediateBundle;
use crate::chart::Chart;
use crate::template::ImageTemplate;

/// Hints file looked up at the chart root.
pub const EMBEDDED_HINTS_FILE: &str = ".relok-images.yaml";

/// Raw hints bytes plus where they were found.
#[derive(Debug, Clone)]
pub struct Hints {
    pub raw: Vec<u8>,
    pub origin: String,
}

impl Hints {
    /// Parse the hint list into templates.
    pub fn templates(&self) -> Result<Vec<ImageTemplate>> {
        parse_hints(&self.raw)?
            .iter()
            .map(|hint| ImageTemplate::parse(hint))
            .collect()
    }
}

/// Locate the hints for a move.
pub fn load_hints(
    explicit: Option<&Path>,
    chart: &Chart,
    bundle: Option<&IntermediateBundle>,
) -> Result<Hints> {
    if explicit.is_some() && bundle.is_some() {
        return Err(MoverError::InvalidRequest(
            "an image hints file cannot be combined with an intermediate bundle source, the bundle already embeds its hints".to_string(),
        ));
    }

    if let Some(path) = explicit {
        let raw = std::fs::read(path).map_err(|e| {
            MoverError::Other(format!("Failed to read hints file {}: {}", path.display(), e))
        })?;
        if has_hints(&raw)? {
            return Ok(Hints {
                raw,
                origin: path.display().to_string(),
            });
        }
    }

    if let Some(bundle) = bundle {
        if let Some(raw) = bundle.read_hints()? {
            if has_hints(&raw)? {
                return Ok(Hints {
                    raw,
                    origin: format!("{}:{}", bundle.path().display(), crate::bundle::HINTS_ENTRY),
                });
            }
        }
    }

    if let Some(raw) = chart.file(EMBEDDED_HINTS_FILE) {
        if has_hints(raw)? {
            return Ok(Hints {
                raw: raw.to_vec(),
                origin: format!("{}/{}", chart.name(), EMBEDDED_HINTS_FILE),
            });
        }
    }

    Err(MoverError::HintsMissing {
        embedded: EMBEDDED_HINTS_FILE.to_string(),
    })
}

/// Parse a hints document. An empty document is an empty list.
pub fn parse_hints(raw: &[u8]) -> Result<Vec<String>> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let hints: Option<Vec<String>> = serde_yaml::from_slice(raw)
        .map_err(|e| MoverError::Serialization(format!("invalid image hints: {}", e)))?;
    Ok(hints.unwrap_or_default())
}

fn has_hints(raw: &[u8]) -> Result<bool> {
    Ok(!parse_hints(raw)?.is_empty())
}
