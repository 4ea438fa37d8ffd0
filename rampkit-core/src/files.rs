//! Grouped input files.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Files belonging to one group. The empty key is the session itself; any other
/// key names a sub-group such as a contributor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileGroup {
    pub key: String,
    pub files: Vec<PathBuf>,
}

impl FileGroup {
    pub fn is_session(&self) -> bool {
        self.key.is_empty()
    }
}

/// An ordered mapping from group key to the files in that group.
///
/// Groups keep the order they were first added in, and files keep the order
/// they were added within their group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileLists {
    groups: Vec<FileGroup>,
}

impl FileLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `file` to the group `key`, creating the group if needed.
    pub fn add(&mut self, key: impl Into<String>, file: impl Into<PathBuf>) -> &mut Self {
        let key = key.into();
        let file = file.into();
        match self.groups.iter_mut().find(|g| g.key == key) {
            Some(group) => group.files.push(file),
            None => self.groups.push(FileGroup {
                key,
                files: vec![file],
            }),
        }
        self
    }

    /// Appends every file in `files` to the group `key`.
    pub fn extend<I, P>(&mut self, key: impl Into<String>, files: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let key = key.into();
        for file in files {
            self.add(key.clone(), file);
        }
        self
    }

    pub fn groups(&self) -> &[FileGroup] {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn file_count(&self) -> usize {
        self.groups.iter().map(|g| g.files.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Every `(group key, file)` pair, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.groups
            .iter()
            .flat_map(|g| g.files.iter().map(move |f| (g.key.as_str(), f.as_path())))
    }

    /// Progress units for a job over these files: one per group analyzed, one
    /// per file copied, one per file written into the package, and one for the
    /// metadata file.
    pub fn total_units(&self) -> u64 {
        (self.group_count() + 2 * self.file_count() + 1) as u64
    }

    /// A human-readable listing of what will be archived.
    pub fn summary(&self, title: &str) -> String {
        let mut out = String::new();
        if self.groups.len() > 1 {
            out.push_str("The following session and contributor files will be added to your archive.\n");
        } else {
            out.push_str("Warning: There are no contributors for this session.\n\n");
            out.push_str("The following session files will be added to your archive.\n");
        }

        for group in &self.groups {
            let (element, name) = if group.is_session() {
                ("Session", title)
            } else {
                ("Contributor", group.key.as_str())
            };
            let _ = writeln!(out, "\n     {element}: {name}");
            for file in &group.files {
                let file_name = file
                    .file_name()
                    .map(|n| n.to_string_lossy())
                    .unwrap_or_else(|| file.to_string_lossy());
                let _ = writeln!(out, "          \u{00B7} {file_name}");
            }
        }
        out
    }
}
