//! Relok CLI - relocate charts and their container images.

pub mod commands;
pub mod output;
