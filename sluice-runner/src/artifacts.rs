//! Artifact collection from a finished working tree
//!
//! Files matching a rule's source glob are packed into
//! `<artifact_dir>/<run id>/<archive>`. The archive name picks the format:
//! `.zip`, `.tar.gz`/`.tgz` and `.tar` become archive files, any other name
//! becomes a directory holding the files at their workdir-relative paths.

use flate2::Compression;
use flate2::write::GzEncoder;
use sluice_core::domain::pipeline::ArtifactRule;
use sluice_core::domain::run::CollectedArtifact;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;

/// On-disk format of an archive, taken from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
    Directory,
}

impl ArchiveFormat {
    pub fn from_name(name: &str) -> Self {
        if name.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if name.ends_with(".tar") {
            ArchiveFormat::Tar
        } else {
            ArchiveFormat::Directory
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    artifact_dir: PathBuf,
}

impl ArtifactCollector {
    pub fn new(artifact_dir: PathBuf) -> Self {
        Self { artifact_dir }
    }

    /// Where an archive of a run is written
    pub fn archive_path(&self, run_id: Uuid, archive: &str) -> PathBuf {
        self.artifact_dir.join(run_id.to_string()).join(archive)
    }

    /// Packs every file matched by `rules` out of `workdir`
    ///
    /// Blocking; run it on a blocking thread. Rules that match nothing and
    /// files that cannot be read are skipped. An archive that cannot be
    /// written is dropped as a whole.
    pub fn collect(
        &self,
        run_id: Uuid,
        workdir: &Path,
        rules: &[ArtifactRule],
    ) -> Vec<CollectedArtifact> {
        let mut groups: Vec<(String, Vec<PathBuf>)> = Vec::new();

        for rule in rules {
            let files = matching_files(workdir, &rule.source);
            if files.is_empty() {
                debug!("Artifact rule '{}' matched no files", rule);
                continue;
            }

            match groups.iter_mut().find(|(archive, _)| *archive == rule.archive) {
                Some((_, existing)) => {
                    for file in files {
                        if !existing.contains(&file) {
                            existing.push(file);
                        }
                    }
                }
                None => groups.push((rule.archive.clone(), files)),
            }
        }

        let mut collected = Vec::with_capacity(groups.len());
        for (archive, files) in groups {
            let path = self.archive_path(run_id, &archive);
            let format = ArchiveFormat::from_name(&archive);

            match pack(format, workdir, &files, &path) {
                Ok(files) if !files.is_empty() => {
                    debug!(archive = %archive, ?format, files = files.len(), "Packed artifact archive");
                    collected.push(CollectedArtifact {
                        archive,
                        path,
                        files,
                    });
                }
                Ok(_) => debug!("Archive '{}' ended up empty", archive),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to write artifact archive");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        info!(
            "Collected {} file(s) into {} archive(s) for run {}",
            collected.iter().map(|a| a.files.len()).sum::<usize>(),
            collected.len(),
            run_id
        );
        collected
    }
}

/// Regular files under `workdir` matched by `source`, relative to `workdir`
///
/// A trailing `**` selects everything below its directory, and a matched
/// directory contributes all files beneath it.
fn matching_files(workdir: &Path, source: &str) -> Vec<PathBuf> {
    let root = glob::Pattern::escape(&workdir.to_string_lossy());
    let source = if source == "**" || source.ends_with("/**") {
        format!("{}/*", source)
    } else {
        source.to_string()
    };
    let pattern = format!("{}/{}", root, source);

    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Failed to glob artifacts");
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    for entry in entries.flatten() {
        if entry.is_dir() {
            let nested = format!("{}/**/*", glob::Pattern::escape(&entry.to_string_lossy()));
            if let Ok(nested) = glob::glob(&nested) {
                for file in nested.flatten().filter(|p| p.is_file()) {
                    push_relative(&mut files, workdir, &file);
                }
            }
        } else if entry.is_file() {
            push_relative(&mut files, workdir, &entry);
        }
    }
    files
}

fn push_relative(files: &mut Vec<PathBuf>, workdir: &Path, file: &Path) {
    let relative = file.strip_prefix(workdir).unwrap_or(file).to_path_buf();
    if !files.contains(&relative) {
        files.push(relative);
    }
}

/// Writes `files` to `dest` in `format`, returning the files that made it in
fn pack(
    format: ArchiveFormat,
    workdir: &Path,
    files: &[PathBuf],
    dest: &Path,
) -> io::Result<Vec<PathBuf>> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match format {
        ArchiveFormat::Directory => Ok(copy_into(workdir, files, dest)),
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipWriter::new(File::create(dest)?);
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);

            let mut packed = Vec::new();
            for relative in files {
                let Some(mut source) = open_source(workdir, relative) else {
                    continue;
                };
                zip.start_file(entry_name(relative), options)
                    .map_err(io::Error::other)?;
                io::copy(&mut source, &mut zip)?;
                packed.push(relative.clone());
            }
            zip.finish().map_err(io::Error::other)?.flush()?;
            Ok(packed)
        }
        ArchiveFormat::TarGz => {
            let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let packed = append_all(&mut builder, workdir, files)?;
            builder.into_inner()?.finish()?.flush()?;
            Ok(packed)
        }
        ArchiveFormat::Tar => {
            let mut builder = tar::Builder::new(File::create(dest)?);
            let packed = append_all(&mut builder, workdir, files)?;
            builder.into_inner()?.flush()?;
            Ok(packed)
        }
    }
}

fn append_all<W: Write>(
    builder: &mut tar::Builder<W>,
    workdir: &Path,
    files: &[PathBuf],
) -> io::Result<Vec<PathBuf>> {
    let mut packed = Vec::new();
    for relative in files {
        let Some(mut source) = open_source(workdir, relative) else {
            continue;
        };
        builder.append_file(relative, &mut source)?;
        packed.push(relative.clone());
    }
    Ok(packed)
}

fn copy_into(workdir: &Path, files: &[PathBuf], dest: &Path) -> Vec<PathBuf> {
    let mut copied = Vec::new();
    for relative in files {
        let target = dest.join(relative);
        let result = target
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::copy(workdir.join(relative), &target));
        match result {
            Ok(_) => copied.push(relative.clone()),
            Err(e) => warn!(path = ?relative, error = %e, "Failed to copy artifact"),
        }
    }
    copied
}

fn open_source(workdir: &Path, relative: &Path) -> Option<File> {
    match File::open(workdir.join(relative)) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = ?relative, error = %e, "Failed to read artifact");
            None
        }
    }
}

/// Zip entry names always use `/`
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
