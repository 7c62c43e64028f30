//! Relok Core - Foundational Types
//!
//! Request shapes, configuration and the error taxonomy shared by the
//! relocation engine and the command-line front end.

pub mod config;
pub mod error;
pub mod request;

// Re-export commonly used types
pub use config::{MoverConfig, RetryPolicy};
pub use error::{MoverError, Result};
pub use request::{
    ChartMoveRequest, ChartSpec, ContainersAuth, OciImageLocation, Source, Target,
};

/// Relok version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
