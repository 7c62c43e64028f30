//! Intermediate bundle codec.
//!
//! A bundle is an uncompressed tar holding everything needed to replay a
//! move offline, in this order:
//!
//! ```text
//! hints.yaml               image hints, first for cheap access
//! original-chart/...       every chart file, original relative paths
//! images.tar               multi-reference image tarball
//! ```

pub mod tarball;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use relok_core::error::{MoverError, Result};
use tar::EntryType;
use tempfile::{NamedTempFile, TempDir};

use crate::chart::{native_path, Chart, CHART_FILE, VALUES_FILE};
use crate::oci::{Image, ImageReference};

pub use tarball::{write_tarball, ImageTarball, TarballEntry};

pub const HINTS_ENTRY: &str = "hints.yaml";
pub const CHART_DIR: &str = "original-chart";
pub const IMAGES_ENTRY: &str = "images.tar";

/// Link hops followed before giving up.
const MAX_LINK_DEPTH: usize = 16;

/// Handle to a bundle file. Nothing is kept open between calls.
#[derive(Debug, Clone)]
pub struct IntermediateBundle {
    path: PathBuf,
}

impl IntermediateBundle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file has the bundle shape: hints, chart metadata, chart
    /// values and an image tarball. Contents are not validated.
    pub fn is_intermediate_bundle(&self) -> bool {
        if !self.path.is_file() {
            return false;
        }
        let chart_file = format!("{}/{}", CHART_DIR, CHART_FILE);
        let values_file = format!("{}/{}", CHART_DIR, VALUES_FILE);
        [HINTS_ENTRY, chart_file.as_str(), values_file.as_str(), IMAGES_ENTRY]
            .iter()
            .all(|name| matches!(self.resolve(name), Ok(Some(_))))
    }

    /// Fail with `NotIntermediateBundle` unless the file has the bundle shape.
    pub fn ensure(&self) -> Result<()> {
        if self.is_intermediate_bundle() {
            Ok(())
        } else {
            Err(MoverError::NotIntermediateBundle {
                path: self.path.clone(),
            })
        }
    }

    pub fn read_hints(&self) -> Result<Option<Vec<u8>>> {
        self.read_file(HINTS_ENTRY)
    }

    /// Read a single entry, following links.
    pub fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.resolve(name)? {
            Some(resolved) => tarball::read_entry(&self.path, &resolved),
            None => Ok(None),
        }
    }

    /// Stream one entry into `dest`, following links.
    pub fn extract_file(&self, name: &str, dest: &Path) -> Result<()> {
        let resolved = self.resolve(name)?.ok_or_else(|| {
            MoverError::Archive(format!("{} has no entry {}", self.path.display(), name))
        })?;
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry_name(&entry)? == resolved {
                let mut out = File::create(dest)?;
                io::copy(&mut entry, &mut out)?;
                out.flush()?;
                return Ok(());
            }
        }
        Err(MoverError::Archive(format!(
            "{} has no entry {}",
            self.path.display(),
            resolved
        )))
    }

    /// Extract every entry under `prefix/` into `dest`, links materialized
    /// as regular files.
    pub fn extract_dir(&self, prefix: &str, dest: &Path) -> Result<()> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut links = Vec::new();
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry_name(&entry)?;
            let Some(relative) = name.strip_prefix(&prefix) else {
                continue;
            };
            if relative.is_empty() {
                continue;
            }
            if normalize(relative).is_none() {
                return Err(MoverError::Archive(format!(
                    "unsafe entry '{}' in {}",
                    name,
                    self.path.display()
                )));
            }
            let target = native_path(dest, relative);
            match entry.header().entry_type() {
                EntryType::Directory => std::fs::create_dir_all(&target)?,
                EntryType::Symlink | EntryType::Link => links.push((name.clone(), target)),
                t if t.is_file() => {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut out = File::create(&target)?;
                    io::copy(&mut entry, &mut out)?;
                }
                _ => {}
            }
        }

        for (name, target) in links {
            let data = self.read_file(&name)?.ok_or_else(|| {
                MoverError::Archive(format!("dangling link {} in {}", name, self.path.display()))
            })?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, data)?;
        }
        Ok(())
    }

    /// Write a bundle for `chart`, its raw `hints` and `images`.
    ///
    /// The file is assembled next to its destination and renamed into place.
    pub async fn write(
        &self,
        hints: &[u8],
        chart: &Chart,
        images: &[(ImageReference, Arc<dyn Image>)],
    ) -> Result<()> {
        let scratch = TempDir::new()?;
        let images_tar = scratch.path().join(IMAGES_ENTRY);
        write_tarball(&images_tar, images).await?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;
        let tmp = NamedTempFile::new_in(&parent)?;
        let mut builder = tar::Builder::new(tmp);

        append_bytes(&mut builder, HINTS_ENTRY, hints)?;
        for file in chart.raw_files() {
            append_bytes(&mut builder, &format!("{}/{}", CHART_DIR, file.name), &file.data)?;
        }
        builder
            .append_path_with_name(&images_tar, IMAGES_ENTRY)
            .map_err(|e| MoverError::Archive(format!("Failed to add {}: {}", IMAGES_ENTRY, e)))?;

        let mut tmp = builder.into_inner()?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| {
            MoverError::Archive(format!("Failed to write {}: {}", self.path.display(), e.error))
        })?;

        tracing::info!(
            path = %self.path.display(),
            chart = chart.name(),
            images = images.len(),
            "Wrote intermediate bundle"
        );
        Ok(())
    }

    fn archive(&self) -> Result<tar::Archive<File>> {
        let file = File::open(&self.path).map_err(|e| {
            MoverError::Archive(format!("Failed to open {}: {}", self.path.display(), e))
        })?;
        Ok(tar::Archive::new(file))
    }

    /// Name of the regular entry `name` resolves to, following links
    /// relative to the link's directory.
    fn resolve(&self, name: &str) -> Result<Option<String>> {
        let mut wanted = normalize(name).ok_or_else(|| {
            MoverError::Archive(format!("unsafe entry name '{}'", name))
        })?;

        for _ in 0..MAX_LINK_DEPTH {
            let mut link = None;
            let mut found = false;
            let mut archive = self.archive()?;
            for entry in archive.entries()? {
                let entry = entry?;
                if entry_name(&entry)? != wanted {
                    continue;
                }
                found = true;
                let kind = entry.header().entry_type();
                if kind == EntryType::Symlink || kind == EntryType::Link {
                    let target = entry.link_name()?.ok_or_else(|| {
                        MoverError::Archive(format!("link {} has no target", wanted))
                    })?;
                    link = Some(target.to_string_lossy().into_owned());
                }
                break;
            }

            match (found, link) {
                (false, _) => return Ok(None),
                (true, None) => return Ok(Some(wanted)),
                (true, Some(target)) => {
                    let base = match wanted.rsplit_once('/') {
                        Some((dir, _)) => format!("{}/{}", dir, target),
                        None => target,
                    };
                    wanted = normalize(&base).ok_or_else(|| {
                        MoverError::Archive(format!(
                            "link {} points outside the bundle",
                            name
                        ))
                    })?;
                }
            }
        }
        Err(MoverError::Archive(format!("too many link hops resolving {}", name)))
    }
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| MoverError::Archive(format!("Failed to add {}: {}", name, e)))
}

fn entry_name<R: io::Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path()?;
    normalize(&path.to_string_lossy()).ok_or_else(|| {
        MoverError::Archive(format!("unsafe entry name '{}'", path.display()))
    })
}

/// Collapse `.` and `..` in a relative `/`-separated name. `None` when the
/// name is absolute or climbs above the root.
fn normalize(name: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}
