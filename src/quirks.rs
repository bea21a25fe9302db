//! Per-GUID quirk annotations for vendor extension units.
//!
//! A quirks directory holds one JSON document per Extension-Unit GUID. The
//! registry is loaded once, is immutable afterwards, and is consulted during
//! control enumeration to attach human-readable names and type hints to XU
//! selectors. Quirk data never overrides what the device actually reports;
//! `get_info_expect` mismatches are logged and otherwise ignored.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::Deserialize;

use crate::descriptors::Guid;

/// One quirks document, covering a single extension unit.
#[derive(Debug, Clone, Deserialize)]
pub struct QuirkFile {
    pub schema_version: u32,
    /// Canonical hyphenated GUID of the extension unit.
    pub guid: String,
    /// Marketing or chipset name of the unit.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub controls: Vec<QuirkControl>,
}

/// Value-type hint for a quirk-annotated control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuirkType {
    Bool,
    Range,
    Enum,
    Raw,
}

/// Annotation for one selector of an extension unit.
#[derive(Debug, Clone, Deserialize)]
pub struct QuirkControl {
    /// Selector the annotation applies to. Entries without a selector are
    /// informational and never matched.
    pub selector: Option<u8>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: QuirkType,
    #[serde(default)]
    pub notes: Option<String>,
    /// Expected GET_INFO capability byte, for validation only.
    #[serde(default)]
    pub get_info_expect: Option<u8>,
    /// Expected control payload length, for validation only.
    #[serde(default)]
    pub payload_len: Option<u16>,
}

/// Immutable lookup table of quirk annotations keyed by (GUID, selector).
#[derive(Debug, Default)]
pub struct QuirkRegistry {
    files: HashMap<Guid, QuirkFile>,
}

impl QuirkRegistry {
    /// An empty registry; lookups always miss.
    pub fn empty() -> QuirkRegistry {
        QuirkRegistry::default()
    }

    /// Load every `*.json` document in a directory. Files that fail to parse
    /// or carry an unparsable GUID are skipped with a warning; a missing
    /// directory yields an empty registry.
    pub fn load_dir(dir: &Path) -> QuirkRegistry {
        let mut files = HashMap::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("quirks directory {dir:?} not readable: {e}");
                return QuirkRegistry::default();
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let data = match fs::read_to_string(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!("failed to read quirks file {path:?}: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<QuirkFile>(&data) {
                Ok(file) => {
                    let Some(guid) = Guid::parse(&file.guid) else {
                        warn!("quirks file {path:?} has malformed GUID {:?}", file.guid);
                        continue;
                    };
                    debug!(
                        "loaded quirks for {} ({} controls) from {path:?}",
                        file.guid,
                        file.controls.len()
                    );
                    files.insert(guid, file);
                }
                Err(e) => warn!("failed to parse quirks file {path:?}: {e}"),
            }
        }
        QuirkRegistry { files }
    }

    /// The document covering `guid`, if any.
    pub fn unit(&self, guid: &Guid) -> Option<&QuirkFile> {
        self.files.get(guid)
    }

    /// The annotation for one selector of `guid`, if any.
    pub fn control(&self, guid: &Guid, selector: u8) -> Option<&QuirkControl> {
        self.files
            .get(guid)?
            .controls
            .iter()
            .find(|c| c.selector == Some(selector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "schema_version": 1,
        "guid": "28f03370-6311-4a2e-ba2c-6890eb334016",
        "name": "ISP vendor unit",
        "controls": [
            {"selector": 1, "name": "IR Torch", "type": "bool", "get_info_expect": 3},
            {"selector": 2, "name": "Sensor Gain", "type": "range", "payload_len": 2,
             "notes": "applies after next frame"},
            {"selector": null, "name": "reserved", "type": "raw"}
        ]
    }"#;

    #[test]
    fn parses_schema() {
        let file: QuirkFile = serde_json::from_str(DOC).unwrap();
        assert_eq!(file.schema_version, 1);
        assert_eq!(file.name.as_deref(), Some("ISP vendor unit"));
        assert_eq!(file.controls.len(), 3);
        assert_eq!(file.controls[0].kind, QuirkType::Bool);
        assert_eq!(file.controls[0].get_info_expect, Some(3));
        assert_eq!(file.controls[1].payload_len, Some(2));
        assert_eq!(file.controls[2].selector, None);
    }

    #[test]
    fn registry_lookup_by_guid_and_selector() {
        let file: QuirkFile = serde_json::from_str(DOC).unwrap();
        let guid = Guid::parse(&file.guid).unwrap();
        let mut files = HashMap::new();
        files.insert(guid, file);
        let registry = QuirkRegistry { files };

        assert_eq!(registry.control(&guid, 1).unwrap().name, "IR Torch");
        assert_eq!(registry.control(&guid, 2).unwrap().kind, QuirkType::Range);
        // Selector-less entries never match a concrete selector.
        assert!(registry.control(&guid, 3).is_none());
        assert!(registry
            .control(&Guid([0u8; 16]), 1)
            .is_none());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let doc = r#"{
            "schema_version": 2,
            "guid": "28f03370-6311-4a2e-ba2c-6890eb334016",
            "vendor_notes": "ignored",
            "controls": []
        }"#;
        let file: QuirkFile = serde_json::from_str(doc).unwrap();
        assert!(file.controls.is_empty());
    }
}
