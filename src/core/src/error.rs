use std::path::PathBuf;

use thiserror::Error;

/// Relok error types
#[derive(Error, Debug)]
pub enum MoverError {
    /// The chart could not be loaded from its source path
    #[error("failed to load chart at {path}: {message}")]
    ChartLoad { path: PathBuf, message: String },

    /// No image hints were supplied or found
    #[error(
        "image hints missing: pass a hints file explicitly or embed one as {embedded} in the chart"
    )]
    HintsMissing { embedded: String },

    /// A non-archive target without any rewrite rule
    #[error("no rewrite rules: set a target registry and/or a repository prefix")]
    MissingRewriteRules,

    /// Bundle sniff failed
    #[error("{path} is not an intermediate bundle")]
    NotIntermediateBundle { path: PathBuf },

    /// Image template syntax error
    #[error("Template parse error: {0}")]
    TemplateParse(String),

    /// Image template could not be rendered against chart values
    #[error("Template render error: {0}")]
    TemplateRender(String),

    /// Malformed move request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid explicit credentials
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Target already holds different content
    #[error("{reference} already exists with digest {actual}, expected {expected}")]
    DigestMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    /// Every push attempt failed
    #[error("failed to push {reference} after {} attempts: {}", errors.len(), errors.join("; "))]
    PushFailed {
        reference: String,
        errors: Vec<String>,
    },

    /// Archive read/write error
    #[error("Archive error: {0}")]
    Archive(String),

    /// Layer cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MoverError {
    fn from(err: serde_json::Error) -> Self {
        MoverError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MoverError {
    fn from(err: serde_yaml::Error) -> Self {
        MoverError::Serialization(err.to_string())
    }
}

/// Result type alias for relok operations
pub type Result<T> = std::result::Result<T, MoverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_load_error_display() {
        let error = MoverError::ChartLoad {
            path: PathBuf::from("/tmp/wordpress"),
            message: "Chart.yaml missing".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "failed to load chart at /tmp/wordpress: Chart.yaml missing"
        );
    }

    #[test]
    fn test_hints_missing_mentions_both_alternatives() {
        let error = MoverError::HintsMissing {
            embedded: ".relok-images.yaml".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("hints file"));
        assert!(msg.contains(".relok-images.yaml"));
    }

    #[test]
    fn test_not_intermediate_bundle_display() {
        let error = MoverError::NotIntermediateBundle {
            path: PathBuf::from("chart.tgz"),
        };
        assert_eq!(error.to_string(), "chart.tgz is not an intermediate bundle");
    }

    #[test]
    fn test_push_failed_lists_every_attempt() {
        let error = MoverError::PushFailed {
            reference: "harbor.io/lib/nginx:1.25".to_string(),
            errors: vec!["timeout".to_string(), "502".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "failed to push harbor.io/lib/nginx:1.25 after 2 attempts: timeout; 502"
        );
    }

    #[test]
    fn test_digest_mismatch_display() {
        let error = MoverError::DigestMismatch {
            reference: "harbor.io/lib/nginx:1.25".to_string(),
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert!(error.to_string().contains("sha256:bbb"));
        assert!(error.to_string().contains("expected sha256:aaa"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: MoverError = io_error.into();
        assert!(matches!(error, MoverError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<Vec<String>>("{").unwrap_err();
        let error: MoverError = yaml_error.into();
        assert!(matches!(error, MoverError::Serialization(_)));
    }
}
