//! OCI image support for chart relocation.
//!
//! Provides the pieces needed to move images between registries:
//!
//! - Image reference parsing and normalization
//! - Docker and OCI manifest models with a canonical serializer
//! - Lazily streamed images and layers
//! - A registry client with digest checks and retrying pushes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   pull    ┌──────────────┐   wrap   ┌──────────────┐
//! │ ContainerRegistry│ ────────▶ │ dyn Image    │ ───────▶ │ LayerCache   │
//! │ (source)         │           │ manifest     │          │ sha256-<hex> │
//! └──────────────────┘           │ config       │          └──────┬───────┘
//!                                │ layers (lazy)│                 │
//!                                └──────────────┘                 ▼
//!                                                 push_with_retry (target)
//! ```

pub mod credentials;
pub mod image;
pub mod manifest;
pub mod reference;
pub mod registry;

pub use credentials::CredentialStore;
pub use image::{Image, Layer, LayerReader};
pub use manifest::{CanonicalSerializer, Descriptor, ImageManifest, ManifestSerializer};
pub use reference::ImageReference;
pub use registry::{push_with_retry, ContainerRegistry, RegistryAuth, RegistryClient};
