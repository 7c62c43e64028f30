//! Load charts from a directory or a packaged `.tgz`.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use relok_core::error::{MoverError, Result};
use tar::Archive;
use tempfile::TempDir;
use walkdir::WalkDir;

use super::{Chart, ChartFile, CHART_FILE};

/// Load a chart from a directory or a packaged chart file.
///
/// Packages are always expanded to a temporary directory first and loaded
/// from there.
pub fn load(path: &Path) -> Result<Chart> {
    if path.is_dir() {
        return load_dir(path);
    }
    if !path.is_file() {
        return Err(MoverError::ChartLoad {
            path: path.to_path_buf(),
            message: "no such file or directory".to_string(),
        });
    }

    let expanded = TempDir::new()?;
    expand_package(path, expanded.path())?;
    let root = find_chart_root(path, expanded.path())?;
    tracing::debug!(package = %path.display(), root = %root.display(), "Expanded chart package");

    load_dir(&root).map_err(|e| match e {
        MoverError::ChartLoad { message, .. } => MoverError::ChartLoad {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })
}

/// Load every file under `dir` into a chart.
fn load_dir(dir: &Path) -> Result<Chart> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| chart_error(dir, e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| chart_error(dir, e.to_string()))?;
        let name = super::relative_name(relative, 0)
            .ok_or_else(|| chart_error(dir, format!("unexpected path {}", relative.display())))?;
        let data = std::fs::read(entry.path())
            .map_err(|e| chart_error(entry.path(), e.to_string()))?;
        files.push(ChartFile::new(name, data));
    }

    let chart = Chart::from_files(dir, files)?;
    tracing::debug!(
        chart = chart.name(),
        version = %chart.version(),
        dependencies = chart.dependencies().len(),
        "Loaded chart"
    );
    Ok(chart)
}

fn expand_package(package: &Path, target: &Path) -> Result<()> {
    let file = File::open(package).map_err(|e| chart_error(package, e.to_string()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(target)
        .map_err(|e| chart_error(package, format!("failed to expand package: {}", e)))
}

/// The expanded package's single top-level directory holding `Chart.yaml`.
fn find_chart_root(package: &Path, expanded: &Path) -> Result<PathBuf> {
    if expanded.join(CHART_FILE).is_file() {
        return Ok(expanded.to_path_buf());
    }
    let mut roots = Vec::new();
    for entry in std::fs::read_dir(expanded)? {
        let path = entry?.path();
        if path.join(CHART_FILE).is_file() {
            roots.push(path);
        }
    }
    match roots.len() {
        1 => Ok(roots.remove(0)),
        0 => Err(chart_error(package, format!("no {} found in package", CHART_FILE))),
        _ => Err(chart_error(package, "package holds more than one chart".to_string())),
    }
}

fn chart_error(path: &Path, message: String) -> MoverError {
    MoverError::ChartLoad {
        path: path.to_path_buf(),
        message,
    }
}
