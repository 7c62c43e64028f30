//! Package a chart into a `.tgz`.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use relok_core::error::{MoverError, Result};
use tempfile::NamedTempFile;

use super::Chart;

pub const PACKAGE_EXTENSION: &str = ".tgz";

/// Resolve an output template (`%s` for the chart name, then `%s` for its
/// version) into a package path.
pub fn output_path(template: &str, chart: &Chart) -> Result<PathBuf> {
    if template.matches("%s").count() != 2 {
        return Err(MoverError::InvalidRequest(format!(
            "output template '{}' must contain two %s placeholders (name, version)",
            template
        )));
    }
    if !template.ends_with(PACKAGE_EXTENSION) {
        return Err(MoverError::InvalidRequest(format!(
            "output template '{}' must end in {}",
            template, PACKAGE_EXTENSION
        )));
    }
    Ok(PathBuf::from(
        template
            .replacen("%s", chart.name(), 1)
            .replacen("%s", &chart.version(), 1),
    ))
}

/// Write `chart` as a gzip tar with every entry under `<name>/`.
pub fn save_package(chart: &Chart, dest: &Path) -> Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let tmp = NamedTempFile::new_in(&parent)?;
    let mut builder = tar::Builder::new(GzEncoder::new(tmp, Compression::default()));
    for file in chart.package_files()? {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(
            &mut header,
            format!("{}/{}", chart.name(), file.name),
            file.data.as_slice(),
        )?;
    }
    let mut tmp = builder.into_inner()?.finish()?;
    tmp.flush()?;
    tmp.persist(dest).map_err(|e| {
        MoverError::Archive(format!("Failed to write {}: {}", dest.display(), e.error))
    })?;

    tracing::info!(chart = chart.name(), path = %dest.display(), "Packaged chart");
    Ok(())
}
