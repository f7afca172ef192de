//! The optional user-supplied metadata file at the root of the raw files
//! (`quarry.yaml` / `quarry.json`), also accepted in subdirectories with
//! downward inheritance.

use std::collections::HashMap;

use quarry_files::StagingUploadFiles;
use quarry_protocol::{EntryMetadata, RawPath};
use serde::Deserialize;
use tracing::warn;

pub const METADATA_FILE_BASENAMES: &[&str] = &["quarry.yaml", "quarry.yml", "quarry.json"];

/// The recognized keys: the editable subset of upload metadata, a per-entry
/// metadata map keyed by mainfile path, and the matching switch.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawMetadataFile {
    #[serde(default)]
    pub upload_name: Option<String>,
    #[serde(default)]
    pub embargo_length: Option<u32>,
    #[serde(default)]
    pub coauthors: Option<Vec<String>>,
    #[serde(default)]
    pub reviewers: Option<Vec<String>>,
    #[serde(default)]
    pub license: Option<String>,
    /// Restrict matching to the mainfiles listed under `entries`.
    #[serde(default)]
    pub skip_matching: bool,
    /// Mainfile path -> per-entry metadata.
    #[serde(default)]
    pub entries: HashMap<String, EntryMetadata>,
}

impl RawMetadataFile {
    fn merge_from(&mut self, other: RawMetadataFile, prefix: &RawPath) {
        if other.upload_name.is_some() {
            self.upload_name = other.upload_name;
        }
        if other.embargo_length.is_some() {
            self.embargo_length = other.embargo_length;
        }
        if other.coauthors.is_some() {
            self.coauthors = other.coauthors;
        }
        if other.reviewers.is_some() {
            self.reviewers = other.reviewers;
        }
        if other.license.is_some() {
            self.license = other.license;
        }
        self.skip_matching |= other.skip_matching;
        for (mainfile, metadata) in other.entries {
            // Entries in a subdirectory file are relative to that directory.
            let key = if prefix.is_root() {
                mainfile
            } else {
                format!("{}/{}", prefix.as_str(), mainfile)
            };
            self.entries.insert(key, metadata);
        }
    }
}

fn load_one(staging: &StagingUploadFiles, path: &RawPath) -> Option<RawMetadataFile> {
    let os_path = staging.raw_os_path(path);
    if !os_path.is_file() {
        return None;
    }
    let content = std::fs::read_to_string(&os_path).ok()?;
    let parsed = if path.as_str().ends_with(".json") {
        serde_json::from_str::<RawMetadataFile>(&content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str::<RawMetadataFile>(&content).map_err(|e| e.to_string())
    };
    match parsed {
        Ok(file) => Some(file),
        Err(error) => {
            warn!(path = %path, %error, "ignoring invalid metadata file");
            None
        }
    }
}

/// Load the metadata file from a directory, trying the known basenames.
pub fn load_dir(staging: &StagingUploadFiles, dir: &RawPath) -> Option<RawMetadataFile> {
    for basename in METADATA_FILE_BASENAMES {
        let path = if dir.is_root() {
            RawPath::new(*basename).ok()?
        } else {
            dir.join(basename).ok()?
        };
        if let Some(file) = load_one(staging, &path) {
            return Some(file);
        }
    }
    None
}

/// The effective metadata for an upload: the root file only.
pub fn load_root(staging: &StagingUploadFiles) -> RawMetadataFile {
    load_dir(staging, &RawPath::root()).unwrap_or_default()
}

/// The effective metadata seen by a mainfile: every metadata file on the
/// directory chain from the root down, nearer files overriding.
pub fn load_for_mainfile(staging: &StagingUploadFiles, mainfile: &RawPath) -> RawMetadataFile {
    let mut merged = RawMetadataFile::default();
    let mut chain = vec![RawPath::root()];
    let mut current = RawPath::root();
    if !mainfile.parent().is_root() {
        for element in mainfile.parent().as_str().split('/') {
            current = match current.join(element) {
                Ok(next) => next,
                Err(_) => break,
            };
            chain.push(current.clone());
        }
    }
    for dir in chain {
        if let Some(file) = load_dir(staging, &dir) {
            merged.merge_from(file, &dir);
        }
    }
    merged
}

/// Per-entry metadata for a mainfile, if any file on its chain declares it.
pub fn entry_metadata_for(
    staging: &StagingUploadFiles,
    mainfile: &RawPath,
) -> Option<EntryMetadata> {
    let merged = load_for_mainfile(staging, mainfile);
    merged.entries.get(mainfile.as_str()).cloned()
}
