//! Move request types.
//!
//! A [`ChartMoveRequest`] names where a chart comes from (a local chart or an
//! intermediate bundle) and where it goes (a repackaged chart with rewritten
//! image locations, or an intermediate bundle).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MoverError, Result};

/// Where a chart lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartSpec {
    /// Chart directory or packaged `.tgz`. On the target side this is the
    /// output path template.
    Local { path: PathBuf },
    /// Intermediate bundle archive.
    IntermediateBundle { path: PathBuf },
}

impl ChartSpec {
    /// Build a spec from two optional paths, exactly one of which must be set.
    pub fn from_parts(local: Option<PathBuf>, bundle: Option<PathBuf>) -> Result<Self> {
        match (local, bundle) {
            (Some(path), None) => Ok(ChartSpec::Local { path }),
            (None, Some(path)) => Ok(ChartSpec::IntermediateBundle { path }),
            (Some(_), Some(_)) => Err(MoverError::InvalidRequest(
                "either a local chart or an intermediate bundle must be set, not both"
                    .to_string(),
            )),
            (None, None) => Err(MoverError::InvalidRequest(
                "either a local chart or an intermediate bundle must be set".to_string(),
            )),
        }
    }

    /// Path regardless of the variant.
    pub fn path(&self) -> &Path {
        match self {
            ChartSpec::Local { path } | ChartSpec::IntermediateBundle { path } => path,
        }
    }

    pub fn is_bundle(&self) -> bool {
        matches!(self, ChartSpec::IntermediateBundle { .. })
    }
}

/// Registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainersAuth {
    /// Use the local default credential store (Docker config), falling back to
    /// anonymous access.
    #[default]
    DefaultKeychain,
    /// Explicit credentials for a single registry server.
    Credentials {
        server: String,
        username: String,
        password: String,
    },
}

impl ContainersAuth {
    /// Validate explicit credentials.
    ///
    /// The server must be a bare `host[:port]` authority: no scheme, no path.
    pub fn validate(&self) -> Result<()> {
        let server = match self {
            ContainersAuth::DefaultKeychain => return Ok(()),
            ContainersAuth::Credentials { server, .. } => server,
        };

        if server.is_empty() {
            return Err(MoverError::InvalidCredentials(
                "server must not be empty".to_string(),
            ));
        }
        if server.contains("://") {
            return Err(MoverError::InvalidCredentials(format!(
                "server '{}' must not include a scheme",
                server
            )));
        }
        if server.contains('/') {
            return Err(MoverError::InvalidCredentials(format!(
                "server '{}' must not include a path",
                server
            )));
        }

        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (server.as_str(), None),
        };
        if host.is_empty() {
            return Err(MoverError::InvalidCredentials(format!(
                "server '{}' has an empty host",
                server
            )));
        }
        if let Some(port) = port {
            if port.is_empty() || port.parse::<u16>().is_err() {
                return Err(MoverError::InvalidCredentials(format!(
                    "server '{}' has an invalid port",
                    server
                )));
            }
        }

        Ok(())
    }
}

/// Target location rules for relocated images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciImageLocation {
    /// Registry that replaces the original one
    pub registry: Option<String>,
    /// Registry used when the original registry becomes a repository prefix
    pub prefix_registry: Option<String>,
    /// Repository prefix that replaces the original repository path
    pub repository_prefix: Option<String>,
    /// Push even when the target already holds a different digest
    pub force_push: bool,
}

impl OciImageLocation {
    /// Whether a target registry or a repository prefix is set. A prefix
    /// registry alone does not count.
    pub fn has_rules(&self) -> bool {
        non_empty(&self.registry).is_some() || non_empty(&self.repository_prefix).is_some()
    }

    pub fn registry(&self) -> Option<&str> {
        non_empty(&self.registry)
    }

    pub fn prefix_registry(&self) -> Option<&str> {
        non_empty(&self.prefix_registry)
    }

    pub fn repository_prefix(&self) -> Option<&str> {
        non_empty(&self.repository_prefix).map(|p| p.trim_end_matches('/'))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Source side of a move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub chart: ChartSpec,
    /// Explicit hints file; must be unset for bundle sources
    pub image_hints_file: Option<PathBuf>,
    pub containers_auth: ContainersAuth,
}

/// Target side of a move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub chart: ChartSpec,
    pub rules: OciImageLocation,
    pub containers_auth: ContainersAuth,
}

/// A complete move request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartMoveRequest {
    pub source: Source,
    pub target: Target,
}

impl ChartMoveRequest {
    /// Construction-time validation, run before anything is loaded.
    pub fn validate(&self) -> Result<()> {
        if !self.target.chart.is_bundle() && !self.target.rules.has_rules() {
            return Err(MoverError::MissingRewriteRules);
        }
        self.source.containers_auth.validate()?;
        self.target.containers_auth.validate()?;
        Ok(())
    }
}
