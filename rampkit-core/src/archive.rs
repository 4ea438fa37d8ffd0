//! Writing the package container.
//!
//! [`PackageWriter`] is the seam between the pipeline and the archive format.
//! Entries are collected first and written in one pass by
//! [`PackageWriter::save`], which announces each entry before it is written so
//! the caller can report progress or stop between entries.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::CompressionMethod;
use zip::write::FileOptions;

use crate::error::{PackageError, PackageResult};

/// Announced to the save callback before each entry is written.
#[derive(Clone, Copy, Debug)]
pub struct EntryProgress<'a> {
    /// Name of the entry inside the archive.
    pub name: &'a str,
    /// Entries fully written so far.
    pub entries_saved: usize,
    pub entries_total: usize,
}

/// How a save ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Every entry was written.
    Saved { entries: usize },
    /// The callback stopped the save before `entries_saved` + 1.
    Stopped { entries_saved: usize },
}

/// A container that packaged files are written into.
pub trait PackageWriter {
    /// Queues `path` under its own file name.
    fn add_file(&mut self, path: &Path) -> PackageResult<()>;

    /// Queues `path` under `name`.
    fn add_file_as(&mut self, path: &Path, name: &str);

    /// Writes every queued entry to `dest`.
    ///
    /// `on_entry` is called before each entry; returning [`ControlFlow::Break`]
    /// stops the save without starting that entry. A stopped save still leaves
    /// a readable archive of the entries already written at `dest`; removing it
    /// is the caller's decision.
    fn save(
        &mut self,
        dest: &Path,
        on_entry: &mut dyn FnMut(EntryProgress<'_>) -> ControlFlow<()>,
    ) -> PackageResult<SaveOutcome>;
}

/// Writes a zip archive whose entries are all stored without compression.
#[derive(Debug)]
pub struct StoredZipWriter {
    entries: Vec<(PathBuf, String)>,
    buffer_size: usize,
}

impl StoredZipWriter {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PackageWriter for StoredZipWriter {
    fn add_file(&mut self, path: &Path) -> PackageResult<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PackageError::invalid_input(
                    "archive entry",
                    "path has no file name",
                    Some(path.display().to_string()),
                )
            })?;
        self.add_file_as(path, &name);
        Ok(())
    }

    fn add_file_as(&mut self, path: &Path, name: &str) {
        self.entries.push((path.to_path_buf(), name.to_string()));
    }

    fn save(
        &mut self,
        dest: &Path,
        on_entry: &mut dyn FnMut(EntryProgress<'_>) -> ControlFlow<()>,
    ) -> PackageResult<SaveOutcome> {
        let file = File::create(dest).map_err(|e| PackageError::io("archive.create", dest, e))?;
        let mut zip = zip::ZipWriter::new(BufWriter::new(file));
        let mut buffer = vec![0u8; self.buffer_size];
        let total = self.entries.len();
        let mut saved = 0;

        for (path, name) in &self.entries {
            let progress = EntryProgress {
                name,
                entries_saved: saved,
                entries_total: total,
            };
            if on_entry(progress).is_break() {
                finish(zip, dest)?;
                return Ok(SaveOutcome::Stopped {
                    entries_saved: saved,
                });
            }

            let mut input =
                File::open(path).map_err(|e| PackageError::io("archive.open_entry", path, e))?;
            let len = input
                .metadata()
                .map_err(|e| PackageError::io("archive.stat_entry", path, e))?
                .len();
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .large_file(len >= u64::from(u32::MAX));

            zip.start_file(name.as_str(), options)
                .map_err(|e| PackageError::zip("archive.start_entry", dest, e))?;
            loop {
                let n = input
                    .read(&mut buffer)
                    .map_err(|e| PackageError::io("archive.read_entry", path, e))?;
                if n == 0 {
                    break;
                }
                zip.write_all(&buffer[..n])
                    .map_err(|e| PackageError::io("archive.write_entry", dest, e))?;
            }

            saved += 1;
            debug!(entry = %name, saved, total, "archive entry written");
        }

        finish(zip, dest)?;
        Ok(SaveOutcome::Saved { entries: saved })
    }
}

fn finish(mut zip: zip::ZipWriter<BufWriter<File>>, dest: &Path) -> PackageResult<()> {
    let mut writer = zip
        .finish()
        .map_err(|e| PackageError::zip("archive.finish", dest, e))?;
    writer
        .flush()
        .map_err(|e| PackageError::io("archive.flush", dest, e))
}

/// Lists entry names and compression methods of a zip archive.
pub fn list_entries(path: &Path) -> PackageResult<Vec<(String, CompressionMethod)>> {
    let file = File::open(path).map_err(|e| PackageError::io("archive.open", path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| PackageError::zip("archive.read", path, e))?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| PackageError::zip("archive.read_entry", path, e))?;
        entries.push((entry.name().to_string(), entry.compression()));
    }
    Ok(entries)
}

/// Reads one entry of a zip archive into memory.
pub fn read_entry(path: &Path, name: &str) -> PackageResult<Vec<u8>> {
    let file = File::open(path).map_err(|e| PackageError::io("archive.open", path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| PackageError::zip("archive.read", path, e))?;
    let mut entry = archive
        .by_name(name)
        .map_err(|e| PackageError::zip("archive.find_entry", path, e))?;
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|e| PackageError::io("archive.read_entry", path, e))?;
    Ok(data)
}
