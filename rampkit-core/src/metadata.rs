//! The METS descriptor written alongside the packaged files.
//!
//! The descriptor is a fixed METS skeleton whose `<binData>` element carries a
//! base64-encoded JSON object:
//!
//! ```json
//! {
//!   "dc.title": "Morning story",
//!   "dc.type.mode": ["Speech", "Text"],
//!   "files": {
//!     "0": { " ": "a.wav", "description": "Recording", "relationship": "source" }
//!   }
//! }
//! ```
//!
//! Application-specific pairs are inserted after the title, in the order given.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::escape::escape;
use serde_json::{Map, Value, json};

use crate::content::content_modes;
use crate::error::{PackageError, PackageResult};
use crate::robust_io::XmlDocument;

/// Relationship recorded for every packaged input file.
pub const SOURCE_RELATIONSHIP: &str = "source";

const BIN_DATA_TAG: &str = "<binData>";

const METS_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<mets xmlns="http://www.loc.gov/METS/" xmlns:xlink="http://www.w3.org/1999/xlink" OBJID="{OBJID}" TYPE="RAMP">
  <metsHdr RECORDSTATUS="draft"/>
  <dmdSec ID="dmd1">
    <mdWrap MDTYPE="OTHER" OTHERMDTYPE="RAMP" MIMETYPE="text/json">
      <binData></binData>
    </mdWrap>
  </dmdSec>
  <structMap>
    <div TYPE="session"/>
  </structMap>
</mets>
"#;

/// An application-specific key/value pair for the descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct MetadataPair {
    pub key: String,
    pub value: Value,
}

impl MetadataPair {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One packaged file as listed in the manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Group the file came from.
    pub group: String,
    /// Original location of the file.
    pub source: PathBuf,
    /// Normalized name of the entry inside the package.
    pub name: String,
    pub description: String,
    pub relationship: &'static str,
}

/// Title, identifier, caller pairs and manifest for one package.
#[derive(Clone, Debug, PartialEq)]
pub struct PackageDescriptor {
    pub title: String,
    pub id: String,
    pub app_pairs: Vec<MetadataPair>,
    pub files: Vec<ManifestEntry>,
}

impl PackageDescriptor {
    /// The JSON payload embedded in the METS file.
    pub fn payload(&self) -> Value {
        let mut object = Map::new();
        object.insert("dc.title".to_string(), Value::String(self.title.clone()));

        for pair in &self.app_pairs {
            object.insert(pair.key.clone(), pair.value.clone());
        }

        let modes = content_modes(self.files.iter().map(|f| f.source.as_path()));
        if !modes.is_empty() {
            let modes: Vec<Value> = modes.iter().map(|m| Value::from(m.as_str())).collect();
            object.insert("dc.type.mode".to_string(), Value::Array(modes));
        }

        let files: Map<String, Value> = self
            .files
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                (
                    i.to_string(),
                    json!({
                        " ": entry.name,
                        "description": entry.description,
                        "relationship": entry.relationship,
                    }),
                )
            })
            .collect();
        object.insert("files".to_string(), Value::Object(files));

        Value::Object(object)
    }

    /// Renders the METS document with the encoded payload in place.
    pub fn to_mets(&self) -> PackageResult<XmlDocument> {
        let json = serde_json::to_string(&self.payload())
            .map_err(|e| PackageError::json("descriptor.encode", e))?;
        let encoded = STANDARD.encode(json.as_bytes());

        let mets = METS_TEMPLATE
            .replace("{OBJID}", &escape(self.id.as_str()))
            .replacen(BIN_DATA_TAG, &format!("{BIN_DATA_TAG}{encoded}"), 1);

        XmlDocument::parse(mets).map_err(|e| PackageError::io("descriptor.render", "mets.xml", e))
    }

    /// A copy of this descriptor without the manifest entries at the given
    /// positions. Later entries move up, so the payload stays densely keyed.
    pub fn without(&self, dropped: &HashSet<usize>) -> Self {
        Self {
            files: self
                .files
                .iter()
                .enumerate()
                .filter(|(i, _)| !dropped.contains(i))
                .map(|(_, f)| f.clone())
                .collect(),
            ..self.clone()
        }
    }

    /// The first manifest entry staged from `source`.
    pub fn entry_for(&self, source: &Path) -> Option<&ManifestEntry> {
        self.files.iter().find(|f| f.source == source)
    }
}

/// Pulls the JSON payload back out of a rendered METS document.
pub fn decode_payload(mets: &XmlDocument) -> Option<Value> {
    let text = mets.as_str();
    let start = text.find(BIN_DATA_TAG)? + BIN_DATA_TAG.len();
    let end = start + text[start..].find("</binData>")?;
    let bytes = STANDARD.decode(text[start..end].trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}
