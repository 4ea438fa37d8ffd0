//! More robust versions of a few filesystem operations.
//!
//! Each call goes through a [`RetryPolicy`] so that a file briefly held by an
//! anti-virus scanner or indexer does not fail the whole operation. Genuine
//! errors (missing paths, permissions, malformed content) still fail on the
//! first attempt.

use std::fs;
use std::io;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::DeleteDirectoryError;
use crate::retry::RetryPolicy;

/// Removes an empty directory.
pub fn delete_dir(path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    policy.run(|| fs::remove_dir(path))
}

/// Removes a directory tree.
///
/// A plain retried removal is tried first. If that still fails, every entry in
/// the remaining tree is made writable and the removal is retried once more
/// under the same policy. A directory that is already gone counts as removed.
/// If the tree cannot be removed the returned error carries a
/// [`DeleteDirectoryError`] naming `path`, with the kind of the last failure.
pub fn delete_dir_all(path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    let first = match remove_tree(path, policy) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    debug!(path = %path.display(), error = %first, "plain removal failed; clearing read-only entries");

    clear_readonly(path);
    match remove_tree(path, policy) {
        Ok(()) => Ok(()),
        Err(last) => {
            warn!(path = %path.display(), error = %last, "could not delete directory");
            Err(io::Error::new(
                last.kind(),
                DeleteDirectoryError {
                    path: path.to_path_buf(),
                    source: last,
                },
            ))
        }
    }
}

fn remove_tree(path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    match policy.run(|| fs::remove_dir_all(path)) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn clear_readonly(path: &Path) {
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut permissions = metadata.permissions();
        if permissions.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            let _ = fs::set_permissions(entry.path(), permissions);
        }
    }
}

/// Moves (renames) a directory.
///
/// Fails with [`io::ErrorKind::NotFound`] when `source` does not exist and with
/// [`io::ErrorKind::AlreadyExists`] when `dest` does, whatever the platform's
/// rename would otherwise do.
pub fn move_dir(source: &Path, dest: &Path, policy: &RetryPolicy) -> io::Result<()> {
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source directory {} does not exist", source.display()),
        ));
    }
    if dest.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("destination {} already exists", dest.display()),
        ));
    }
    policy.run(|| fs::rename(source, dest))
}

/// Removes a single file, treating an already missing file as removed.
pub fn delete_file(path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    match policy.run(|| fs::remove_file(path)) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// A well-formed XML document held as text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlDocument {
    root: String,
    text: String,
}

impl XmlDocument {
    /// Checks that `text` is well formed and wraps it.
    ///
    /// Malformed input fails with [`io::ErrorKind::InvalidData`].
    pub fn parse(text: impl Into<String>) -> io::Result<Self> {
        let text = text.into();
        let root = root_element(&text)?;
        Ok(Self { root, text })
    }

    /// Qualified name of the root element.
    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn malformed(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

fn root_element(text: &str) -> io::Result<String> {
    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut root = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| malformed(format!("malformed xml at byte {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(start) => {
                if depth == 0 {
                    if root.is_some() {
                        return Err(malformed("xml has more than one root element"));
                    }
                    root = Some(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                }
                depth += 1;
            }
            Event::Empty(empty) => {
                if depth == 0 {
                    if root.is_some() {
                        return Err(malformed("xml has more than one root element"));
                    }
                    root = Some(String::from_utf8_lossy(empty.name().as_ref()).into_owned());
                }
            }
            Event::End(_) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| malformed("unexpected closing tag"))?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(malformed("xml ends inside an open element"));
    }
    root.ok_or_else(|| malformed("xml has no root element"))
}

/// Reads and validates an XML document.
pub fn load_xml(path: &Path, policy: &RetryPolicy) -> io::Result<XmlDocument> {
    policy.run(|| XmlDocument::parse(fs::read_to_string(path)?))
}

/// Writes an XML document, replacing any existing file.
pub fn save_xml(document: &XmlDocument, path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    policy.run(|| fs::write(path, document.as_str()))
}
