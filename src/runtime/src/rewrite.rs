//! Rewrite rule engine.
//!
//! Computes the minimal set of value rewrites that make a template render
//! the relocated image reference.

use relok_core::request::OciImageLocation;
use serde_yaml::{Mapping, Value};

use crate::oci::reference::normalize_registry;
use crate::oci::ImageReference;
use crate::template::{path_keys, ImageTemplate};

/// Set one dotted value path to a literal string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteAction {
    pub path: String,
    pub value: String,
}

impl RewriteAction {
    pub fn new(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Keys of the path, outermost first.
    pub fn keys(&self) -> Vec<&str> {
        path_keys(&self.path)
    }

    /// Nested mapping holding only this value.
    pub fn to_map(&self) -> Value {
        self.keys()
            .iter()
            .rev()
            .fold(Value::String(self.value.clone()), |inner, key| {
                let mut map = Mapping::new();
                map.insert(Value::String((*key).to_string()), inner);
                Value::Mapping(map)
            })
    }

    /// Same value, with the first key of the path dropped.
    pub fn strip_first_key(&self) -> Self {
        let keys = self.keys();
        let rest = keys.get(1..).unwrap_or_default().join(".");
        Self {
            path: format!(".{}", rest),
            value: self.value.clone(),
        }
    }
}

impl std::fmt::Display for RewriteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.value)
    }
}

/// Compute the rewrites needed to relocate `original` according to `rules`.
///
/// Only values that actually change are emitted. When the template carries
/// neither a tag nor a digest placeholder the repository is pinned to
/// `digest`.
pub fn compute_rewrites(
    template: &ImageTemplate,
    original: &ImageReference,
    digest: &str,
    rules: &OciImageLocation,
) -> Vec<RewriteAction> {
    let registry = rules
        .prefix_registry()
        .or(rules.registry())
        .map(str::to_string)
        .unwrap_or_else(|| original.registry.clone());

    let mut repository = match rules.repository_prefix() {
        Some(prefix) => {
            let base = original
                .repository
                .rsplit('/')
                .next()
                .unwrap_or(&original.repository);
            format!("{}/{}", prefix, base)
        }
        None => original.repository.clone(),
    };

    if rules.prefix_registry().is_some() {
        let path_prefix = rules.registry().unwrap_or(&original.registry);
        repository = format!("{}/{}", path_prefix, repository);
    }

    if template.tag_path().is_none() && template.digest_path().is_none() {
        repository = format!("{}@{}", repository, digest);
    }

    let mut actions = Vec::new();
    if let Some(path) = template.combined_path() {
        let value = format!("{}/{}", registry, repository);
        if value != original.context() {
            actions.push(RewriteAction::new(path, value));
        }
    }
    if let Some(path) = template.registry_path() {
        if normalize_registry(&registry) != original.registry {
            actions.push(RewriteAction::new(path, registry.clone()));
        }
    }
    if let Some(path) = template.repository_path() {
        if repository != original.repository {
            actions.push(RewriteAction::new(path, repository));
        }
    }
    actions
}
