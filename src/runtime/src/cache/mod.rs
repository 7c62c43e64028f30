//! Local caching of image content.
//!
//! `LayerCache` keeps compressed and uncompressed layer streams on disk,
//! keyed by digest, so repeated moves of the same images skip the network.

pub mod layer_cache;

pub use layer_cache::LayerCache;
