//! Image reference templates.
//!
//! A hint such as `{{ .image.registry }}/{{ .image.repository }}:{{ .image.tag }}`
//! names the chart values that together form an image reference. Parsing
//! splits the template into its registry / repository (or combined) / tag /
//! digest fragments; rendering substitutes the values and parses the result
//! as an [`ImageReference`].

use std::sync::OnceLock;

use regex::Regex;
use relok_core::error::{MoverError, Result};
use serde_yaml::{Mapping, Value};

use crate::oci::ImageReference;
use crate::rewrite::RewriteAction;

const PATH_PATTERN: &str = r"\{\{\s*((?:\.[A-Za-z0-9_-]+)+)\s*\}\}";

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PATH_PATTERN).expect("valid placeholder pattern"))
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(":{}", PATH_PATTERN)).expect("valid tag pattern"))
}

fn digest_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!("@{}", PATH_PATTERN)).expect("valid digest pattern"))
}

/// Piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(String),
}

/// Parsed image reference template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTemplate {
    raw: String,
    registry: Option<String>,
    repository: Option<String>,
    combined: Option<String>,
    tag: Option<String>,
    digest: Option<String>,
    segments: Vec<Segment>,
}

impl ImageTemplate {
    /// Parse a template string.
    pub fn parse(raw: &str) -> Result<Self> {
        let tag = single_match(tag_regex(), raw, "tag")?;
        let digest = single_match(digest_regex(), raw, "digest")?;

        let stripped = digest_regex().replace_all(&tag_regex().replace_all(raw, ""), "").into_owned();
        let fragments: Vec<String> = placeholder_regex()
            .captures_iter(&stripped)
            .map(|c| c[1].to_string())
            .collect();

        let (registry, repository, combined) = match fragments.as_slice() {
            [] => {
                return Err(MoverError::TemplateParse(format!(
                    "missing repo or registry fragment in '{}'",
                    raw
                )))
            }
            [combined] => (None, None, Some(combined.clone())),
            [registry, repository] => (Some(registry.clone()), Some(repository.clone()), None),
            _ => {
                return Err(MoverError::TemplateParse(format!(
                    "too many repo or registry fragments in '{}'",
                    raw
                )))
            }
        };

        Ok(Self {
            raw: raw.to_string(),
            registry,
            repository,
            combined,
            tag,
            digest,
            segments: split_segments(raw),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Value path of the registry fragment, when registry and repository are separate.
    pub fn registry_path(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository_path(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    /// Value path holding `registry/repository` in one string.
    pub fn combined_path(&self) -> Option<&str> {
        self.combined.as_deref()
    }

    pub fn tag_path(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest_path(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Substitute placeholders from `values` with `actions` overlaid.
    pub fn render_string(&self, values: &Value, actions: &[RewriteAction]) -> Result<String> {
        let overlaid;
        let values = if actions.is_empty() {
            values
        } else {
            let mut merged = values.clone();
            for action in actions {
                overlay(&mut merged, action.to_map());
            }
            overlaid = merged;
            &overlaid
        };

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Value(path) => out.push_str(&lookup_string(values, path).map_err(
                    |e| MoverError::TemplateRender(format!("{} (template '{}')", e, self.raw)),
                )?),
            }
        }
        Ok(out)
    }

    /// Render the template and parse it as an image reference.
    pub fn render(&self, values: &Value, actions: &[RewriteAction]) -> Result<ImageReference> {
        let rendered = self.render_string(values, actions)?;
        ImageReference::parse(&rendered).map_err(|e| {
            MoverError::TemplateRender(format!(
                "template '{}' rendered an invalid reference '{}': {}",
                self.raw, rendered, e
            ))
        })
    }
}

impl std::fmt::Display for ImageTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn single_match(re: &Regex, raw: &str, kind: &str) -> Result<Option<String>> {
    let matches: Vec<String> = re.captures_iter(raw).map(|c| c[1].to_string()).collect();
    if matches.len() > 1 {
        return Err(MoverError::TemplateParse(format!(
            "too many {} matches in '{}'",
            kind, raw
        )));
    }
    Ok(matches.into_iter().next())
}

fn split_segments(raw: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut last = 0;
    for captures in placeholder_regex().captures_iter(raw) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if whole.start() > last {
            segments.push(Segment::Literal(raw[last..whole.start()].to_string()));
        }
        segments.push(Segment::Value(captures[1].to_string()));
        last = whole.end();
    }
    if last < raw.len() {
        segments.push(Segment::Literal(raw[last..].to_string()));
    }
    segments
}

/// Split a dotted value path (`.a.b`) into its keys.
pub fn path_keys(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

fn lookup_string(values: &Value, path: &str) -> std::result::Result<String, String> {
    let mut node = values;
    for key in path_keys(path) {
        node = node
            .as_mapping()
            .and_then(|m| m.get(key))
            .ok_or_else(|| format!("no value at '{}'", path))?;
    }
    match node {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(format!("value at '{}' is not a scalar", path)),
    }
}

/// Deep merge where `src` wins.
pub(crate) fn overlay(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Mapping(dst), Value::Mapping(src)) => {
            for (key, value) in src {
                match dst.get_mut(&key) {
                    Some(existing) if existing.is_mapping() && value.is_mapping() => {
                        overlay(existing, value)
                    }
                    _ => {
                        dst.insert(key, value);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Deep merge where keys already in `dst` win.
pub(crate) fn coalesce(dst: &mut Mapping, src: Mapping) {
    for (key, value) in src {
        match dst.get_mut(&key) {
            Some(Value::Mapping(existing)) => {
                if let Value::Mapping(value) = value {
                    coalesce(existing, value);
                }
            }
            Some(_) => {}
            None => {
                dst.insert(key, value);
            }
        }
    }
}
