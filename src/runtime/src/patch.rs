//! Apply rewrite actions to chart values files.
//!
//! Each action is routed to the chart that owns its path, then written into
//! that chart's `values.yaml` touching only the target key. Comments, key
//! order and unrelated values are preserved.

use nondestructive::yaml::{self, MappingMut, Separator};
use relok_core::error::{MoverError, Result};
use serde_yaml::{Mapping, Value};

use crate::chart::{parse_values, ValuesTree};
use crate::rewrite::RewriteAction;

/// Chart that owns an action, as a chain of dependency names from the root,
/// and the action path relative to that chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub charts: Vec<String>,
    pub action: RewriteAction,
}

/// Resolve which chart an action applies to.
///
/// A path whose first key names a dependency descends into it, unless the
/// current chart's own values already define that key.
pub fn find_chart_destination<C: ValuesTree>(chart: &C, action: &RewriteAction) -> Result<Destination> {
    let mut current = chart;
    let mut charts = Vec::new();
    let mut action = action.clone();

    loop {
        let keys = action.keys();
        if keys.len() < 2 {
            break;
        }
        let first = keys[0].to_string();
        if current.has_value_key(&first)? {
            break;
        }
        match current.dependency(&first) {
            Some(dep) => {
                current = dep;
                charts.push(first);
                action = action.strip_first_key();
            }
            None => break,
        }
    }

    Ok(Destination { charts, action })
}

/// Apply every action, then strip dependency locks from the whole tree.
pub fn apply<C: ValuesTree>(chart: &mut C, actions: &[RewriteAction]) -> Result<()> {
    for action in actions {
        let destination = find_chart_destination(chart, action)?;
        let mut target = &mut *chart;
        for name in &destination.charts {
            target = target.dependency_mut(name).ok_or_else(|| {
                MoverError::Other(format!("dependency '{}' disappeared while patching", name))
            })?;
        }
        let patched = patch_values(target.values_bytes(), &destination.action)?;
        tracing::debug!(
            chart = target.name(),
            path = %destination.action.path,
            value = %destination.action.value,
            "Patched chart value"
        );
        target.replace_values(patched);
    }
    chart.clear_dependency_locks();
    Ok(())
}

/// Set one value in a YAML document, preserving everything else.
pub fn patch_values(data: &[u8], action: &RewriteAction) -> Result<Vec<u8>> {
    let keys = action.keys();
    if keys.is_empty() {
        return Err(MoverError::InvalidRequest(format!(
            "empty value path in rewrite of '{}'",
            action.value
        )));
    }

    let current = parse_values(data)?;
    if current.is_empty() {
        // Nothing to preserve; generate the document
        let mut values = Value::Mapping(current);
        crate::template::overlay(&mut values, action.to_map());
        return Ok(serde_yaml::to_string(&values)?.into_bytes());
    }

    let mut doc = yaml::from_slice(data)
        .map_err(|e| MoverError::Serialization(format!("failed to parse values: {}", e)))?;
    let root = doc
        .as_mut()
        .into_mapping_mut()
        .ok_or_else(|| MoverError::Serialization("values file is not a mapping".to_string()))?;
    set_in(root, Some(&current), &keys, &action.value)
        .map_err(|e| MoverError::Other(format!("cannot set {}: {}", action.path, e)))?;
    Ok(doc.to_string().into_bytes())
}

fn set_in(
    mut mapping: MappingMut<'_>,
    existing: Option<&Mapping>,
    keys: &[&str],
    value: &str,
) -> std::result::Result<(), String> {
    let Some((&first, rest)) = keys.split_first() else {
        return Ok(());
    };
    let child = existing.and_then(|m| m.get(first));

    if rest.is_empty() {
        match child {
            Some(Value::Mapping(_)) | Some(Value::Sequence(_)) => {
                return Err(format!("'{}' holds a collection, not a scalar", first))
            }
            Some(_) => {
                let mut slot = mapping
                    .get_mut(first)
                    .ok_or_else(|| format!("key '{}' not found", first))?;
                slot.set_string(value);
            }
            None => mapping.insert_str(first, value),
        }
        return Ok(());
    }

    match child {
        Some(Value::Mapping(inner)) => {
            let nested = mapping
                .get_mut(first)
                .and_then(|v| v.into_mapping_mut())
                .ok_or_else(|| format!("key '{}' is not a mapping", first))?;
            set_in(nested, Some(inner), rest, value)
        }
        Some(Value::Null) | None => {
            let nested = mapping.insert(first, Separator::Auto).make_mapping();
            set_in(nested, None, rest, value)
        }
        Some(_) => Err(format!("key '{}' is not a mapping", first)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::testing::wordpress_files;
    use crate::chart::Chart;
    use std::path::Path;

    fn wordpress() -> Chart {
        Chart::from_files(Path::new("wordpress"), wordpress_files()).unwrap()
    }

    #[test]
    fn test_destination_descends_into_dependency() {
        let chart = wordpress();
        let action = RewriteAction::new(".mariadb.image.registry", "example.com");
        let dest = find_chart_destination(&chart, &action).unwrap();
        assert_eq!(dest.charts, vec!["mariadb".to_string()]);
        assert_eq!(dest.action.path, ".image.registry");
    }

    #[test]
    fn test_destination_parent_value_shadows_dependency() {
        let mut files = wordpress_files();
        files[1] = crate::chart::ChartFile::new(
            "values.yaml",
            "mariadb:\n  image:\n    registry: docker.io\n",
        );
        let chart = Chart::from_files(Path::new("wordpress"), files).unwrap();
        let action = RewriteAction::new(".mariadb.image.registry", "example.com");
        let dest = find_chart_destination(&chart, &action).unwrap();
        assert!(dest.charts.is_empty());
        assert_eq!(dest.action.path, ".mariadb.image.registry");
    }

    #[test]
    fn test_destination_root_value() {
        let chart = wordpress();
        let action = RewriteAction::new(".image.registry", "example.com");
        let dest = find_chart_destination(&chart, &action).unwrap();
        assert!(dest.charts.is_empty());
    }

    #[test]
    fn test_patch_preserves_comments_and_order() {
        let original = b"# registry settings\nimage:\n  registry: docker.io\n  repository: bitnami/wordpress\nreplicas: 2\n";
        let action = RewriteAction::new(".image.registry", "registry.vmware.com");
        let patched = String::from_utf8(patch_values(original, &action).unwrap()).unwrap();
        assert!(patched.starts_with("# registry settings\n"));
        assert!(patched.contains("registry.vmware.com"));
        assert!(!patched.contains("registry: docker.io"));
        assert!(patched.contains("replicas: 2"));

        let parsed: Value = serde_yaml::from_str(&patched).unwrap();
        assert_eq!(parsed["image"]["registry"], Value::from("registry.vmware.com"));
        assert_eq!(parsed["image"]["repository"], Value::from("bitnami/wordpress"));
    }

    #[test]
    fn test_patch_creates_missing_keys() {
        let original = b"replicas: 1\n";
        let action = RewriteAction::new(".image.registry", "example.com");
        let patched = patch_values(original, &action).unwrap();
        let parsed: Value = serde_yaml::from_slice(&patched).unwrap();
        assert_eq!(parsed["image"]["registry"], Value::from("example.com"));
        assert_eq!(parsed["replicas"], Value::from(1));
    }

    #[test]
    fn test_patch_empty_values() {
        let action = RewriteAction::new(".image", "example.com/nginx@sha256:abc");
        let patched = patch_values(b"", &action).unwrap();
        let parsed: Value = serde_yaml::from_slice(&patched).unwrap();
        assert_eq!(parsed["image"], Value::from("example.com/nginx@sha256:abc"));
    }

    #[test]
    fn test_patch_rejects_collection_leaf() {
        let action = RewriteAction::new(".image", "x");
        assert!(patch_values(b"image:\n  tag: 1\n", &action).is_err());
    }

    #[test]
    fn test_apply_patches_dependency_and_strips_locks() {
        let mut chart = wordpress();
        let actions = vec![
            RewriteAction::new(".image.registry", "harbor.local"),
            RewriteAction::new(".mariadb.image.registry", "harbor.local"),
        ];
        apply(&mut chart, &actions).unwrap();

        let root: Value = serde_yaml::from_slice(chart.values_bytes()).unwrap();
        assert_eq!(root["image"]["registry"], Value::from("harbor.local"));
        assert!(root.get("mariadb").is_none());

        let mariadb = chart.dependency("mariadb").unwrap();
        let dep: Value = serde_yaml::from_slice(mariadb.values_bytes()).unwrap();
        assert_eq!(dep["image"]["registry"], Value::from("harbor.local"));

        assert!(chart.lock_files().is_empty());
        assert!(chart.metadata().get("dependencies").is_none());
    }
}
