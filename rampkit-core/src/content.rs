//! Classifies input files into the content modes recorded in the descriptor.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

const AUDIO: &[&str] = &["wav", "mp3", "ogg", "oga", "wma", "flac", "aif", "aiff", "m4a", "aac"];
const VIDEO: &[&str] = &[
    "mp4", "m4v", "mpg", "mpeg", "avi", "wmv", "mov", "mts", "m2ts", "mkv", "webm", "flv", "3gp",
];
const TEXT: &[&str] = &[
    "txt", "doc", "docx", "odt", "rtf", "pdf", "htm", "html", "xml", "eaf", "csv",
];
const IMAGE: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff"];

/// The kind of material a file holds, as named in the `dc.type.mode` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentMode {
    Photograph,
    Speech,
    Text,
    Video,
}

impl ContentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentMode::Photograph => "Photograph",
            ContentMode::Speech => "Speech",
            ContentMode::Text => "Text",
            ContentMode::Video => "Video",
        }
    }

    /// Classifies a file by its extension, ignoring case.
    pub fn of(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        if AUDIO.contains(&ext.as_str()) {
            Some(ContentMode::Speech)
        } else if VIDEO.contains(&ext.as_str()) {
            Some(ContentMode::Video)
        } else if TEXT.contains(&ext.as_str()) {
            Some(ContentMode::Text)
        } else if IMAGE.contains(&ext.as_str()) {
            Some(ContentMode::Photograph)
        } else {
            None
        }
    }
}

impl fmt::Display for ContentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The distinct modes found among `files`, in a stable order.
pub fn content_modes<'a, I>(files: I) -> BTreeSet<ContentMode>
where
    I: IntoIterator<Item = &'a Path>,
{
    files.into_iter().filter_map(ContentMode::of).collect()
}
