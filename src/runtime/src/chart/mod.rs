//! In-memory chart model.
//!
//! A chart is a tree of named file buffers plus its dependency charts
//! (everything found under `charts/`, as directories or `.tgz` packages).
//! The buffers are kept verbatim so a chart can be archived exactly as it
//! was loaded, while values and metadata are edited in place for a move.

mod loader;
mod package;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use relok_core::error::{MoverError, Result};
use serde_yaml::{Mapping, Value};

use crate::template::coalesce;

pub use loader::load;
pub use package::{output_path, save_package};

pub const CHART_FILE: &str = "Chart.yaml";
pub const VALUES_FILE: &str = "values.yaml";
pub const CHARTS_DIR: &str = "charts";

/// Files recording resolved or requested dependencies.
const LOCK_FILES: &[&str] = &["Chart.lock", "requirements.lock", "requirements.yaml"];

/// A named file buffer, path relative to the chart root with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl ChartFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A loaded chart and its dependencies.
#[derive(Debug, Clone)]
pub struct Chart {
    metadata: Mapping,
    values: Vec<u8>,
    lock_files: Vec<ChartFile>,
    files: Vec<ChartFile>,
    raw: Vec<ChartFile>,
    dependencies: Vec<Chart>,
}

impl Chart {
    /// Build a chart from its file list. `origin` is only used in errors.
    pub fn from_files(origin: &Path, files: Vec<ChartFile>) -> Result<Self> {
        let mut metadata = None;
        let mut values = Vec::new();
        let mut lock_files = Vec::new();
        let mut other = Vec::new();
        let mut unpacked: BTreeMap<String, Vec<ChartFile>> = BTreeMap::new();
        let mut packaged = Vec::new();

        for file in &files {
            let name = file.name.as_str();
            if name == CHART_FILE {
                let parsed: Value = serde_yaml::from_slice(&file.data)
                    .map_err(|e| chart_error(origin, format!("invalid {}: {}", CHART_FILE, e)))?;
                match parsed {
                    Value::Mapping(m) => metadata = Some(m),
                    _ => return Err(chart_error(origin, format!("{} is not a mapping", CHART_FILE))),
                }
            } else if name == VALUES_FILE {
                values = file.data.clone();
            } else if LOCK_FILES.contains(&name) {
                lock_files.push(file.clone());
            } else if let Some(rest) = name.strip_prefix("charts/") {
                match rest.split_once('/') {
                    Some((dep, inner)) => unpacked
                        .entry(dep.to_string())
                        .or_default()
                        .push(ChartFile::new(inner, file.data.clone())),
                    None if rest.ends_with(".tgz") => packaged.push(file),
                    None => other.push(file.clone()),
                }
            } else {
                other.push(file.clone());
            }
        }

        let metadata =
            metadata.ok_or_else(|| chart_error(origin, format!("missing {}", CHART_FILE)))?;
        if metadata.get("name").and_then(Value::as_str).unwrap_or("").is_empty() {
            return Err(chart_error(origin, "chart metadata has no name".to_string()));
        }

        let mut dependencies = Vec::new();
        for (dep, dep_files) in unpacked {
            dependencies.push(Chart::from_files(&origin.join(CHARTS_DIR).join(&dep), dep_files)?);
        }
        for file in packaged {
            let dep_origin = origin.join(&file.name);
            let dep_files = files_from_package(&file.data)
                .map_err(|e| chart_error(&dep_origin, e.to_string()))?;
            dependencies.push(Chart::from_files(&dep_origin, dep_files)?);
        }

        let mut chart = Self {
            metadata,
            values,
            lock_files,
            files: other,
            raw: files,
            dependencies,
        };
        chart.files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(chart)
    }

    pub fn name(&self) -> &str {
        self.metadata.get("name").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn version(&self) -> String {
        match self.metadata.get("version") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }

    pub fn metadata(&self) -> &Mapping {
        &self.metadata
    }

    /// Every file exactly as loaded, including dependency files.
    pub fn raw_files(&self) -> &[ChartFile] {
        &self.raw
    }

    /// A non-special file of this chart (templates, hints, docs, ...).
    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.data.as_slice())
    }

    pub fn lock_files(&self) -> &[ChartFile] {
        &self.lock_files
    }

    pub fn dependencies(&self) -> &[Chart] {
        &self.dependencies
    }

    /// Parsed values of this chart only. An empty file yields an empty mapping.
    pub fn values(&self) -> Result<Mapping> {
        parse_values(&self.values)
    }

    /// Values of this chart with each dependency's values merged in under
    /// the dependency name. Keys set by the parent win.
    pub fn merged_values(&self) -> Result<Value> {
        let mut values = self.values()?;
        for dep in &self.dependencies {
            let Value::Mapping(dep_values) = dep.merged_values()? else {
                continue;
            };
            let key = Value::String(dep.name().to_string());
            match values.get_mut(&key) {
                Some(Value::Mapping(existing)) => coalesce(existing, dep_values),
                Some(_) => {}
                None => {
                    values.insert(key, Value::Mapping(dep_values));
                }
            }
        }
        Ok(Value::Mapping(values))
    }

    /// Files to write when packaging, paths relative to the chart root.
    pub(crate) fn package_files(&self) -> Result<Vec<ChartFile>> {
        let mut out = vec![
            ChartFile::new(CHART_FILE, serde_yaml::to_string(&self.metadata)?),
            ChartFile::new(VALUES_FILE, self.values.clone()),
        ];
        out.extend(self.lock_files.iter().cloned());
        out.extend(self.files.iter().cloned());
        for dep in &self.dependencies {
            let prefix = format!("{}/{}", CHARTS_DIR, dep.name());
            for file in dep.package_files()? {
                out.push(ChartFile::new(format!("{}/{}", prefix, file.name), file.data));
            }
        }
        Ok(out)
    }
}

/// What the patcher needs from a chart.
pub trait ValuesTree {
    fn name(&self) -> &str;

    /// Whether this chart's own values define a top-level `key`.
    fn has_value_key(&self, key: &str) -> Result<bool>;

    fn values_bytes(&self) -> &[u8];

    fn replace_values(&mut self, data: Vec<u8>);

    fn dependency(&self, name: &str) -> Option<&Self>;

    fn dependency_mut(&mut self, name: &str) -> Option<&mut Self>;

    /// Drop recorded dependency metadata and lock files, recursively.
    fn clear_dependency_locks(&mut self);
}

impl ValuesTree for Chart {
    fn name(&self) -> &str {
        Chart::name(self)
    }

    fn has_value_key(&self, key: &str) -> Result<bool> {
        Ok(self.values()?.contains_key(key))
    }

    fn values_bytes(&self) -> &[u8] {
        &self.values
    }

    fn replace_values(&mut self, data: Vec<u8>) {
        self.values = data;
    }

    fn dependency(&self, name: &str) -> Option<&Self> {
        self.dependencies.iter().find(|d| d.name() == name)
    }

    fn dependency_mut(&mut self, name: &str) -> Option<&mut Self> {
        self.dependencies.iter_mut().find(|d| d.name() == name)
    }

    fn clear_dependency_locks(&mut self) {
        self.metadata.remove("dependencies");
        self.lock_files.clear();
        for dep in &mut self.dependencies {
            dep.clear_dependency_locks();
        }
    }
}

pub(crate) fn parse_values(data: &[u8]) -> Result<Mapping> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_slice::<Value>(data)? {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(Mapping::new()),
        _ => Err(MoverError::Serialization(
            "values file is not a mapping".to_string(),
        )),
    }
}

fn chart_error(path: &Path, message: String) -> MoverError {
    MoverError::ChartLoad {
        path: path.to_path_buf(),
        message,
    }
}

/// Expand a packaged (`.tgz`) chart in memory, dropping the top directory.
fn files_from_package(data: &[u8]) -> Result<Vec<ChartFile>> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let Some(name) = relative_name(&path, 1) else {
            return Err(MoverError::Archive(format!(
                "unsafe path '{}' in chart package",
                path.display()
            )));
        };
        if name.is_empty() {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.push(ChartFile::new(name, data));
    }
    Ok(files)
}

/// Join the normal components of `path` after skipping `skip` of them.
/// Returns `None` for absolute paths or paths containing `..`.
pub(crate) fn relative_name(path: &Path, skip: usize) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.into_iter().skip(skip).collect::<Vec<_>>().join("/"))
}

/// Location of `name` under `root`, for a `/`-separated relative name.
pub(crate) fn native_path(root: &Path, name: &str) -> PathBuf {
    name.split('/').fold(root.to_path_buf(), |p, part| p.join(part))
}
