//! Relok runtime: the relocation engine.
//!
//! Loads a chart, resolves its image hints against the chart values, pulls
//! the images, computes where they move to, and either pushes them and
//! repackages the rewritten chart or archives everything into an
//! intermediate bundle for an offline hop.

#![allow(clippy::result_large_err)]

pub mod bundle;
pub mod cache;
pub mod chart;
pub mod hints;
pub mod mover;
pub mod oci;
pub mod patch;
pub mod rewrite;
pub mod template;

#[cfg(test)]
mod testutil;

// Re-export common types
pub use bundle::{ImageTarball, IntermediateBundle};
pub use cache::LayerCache;
pub use chart::{Chart, ValuesTree};
pub use hints::{load_hints, Hints, EMBEDDED_HINTS_FILE};
pub use mover::{ChartChange, ChartMover, ImageChange, MoverState};
pub use oci::{push_with_retry, ContainerRegistry, Image, ImageReference, RegistryAuth, RegistryClient};
pub use patch::{find_chart_destination, Destination};
pub use rewrite::{compute_rewrites, RewriteAction};
pub use template::ImageTemplate;

/// Relok runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
