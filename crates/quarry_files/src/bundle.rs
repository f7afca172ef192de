//! The portable upload bundle.
//!
//! A bundle is a zip file or directory holding `bundle_info.json` plus the
//! upload's files: the packed `raw-*.plain.zip` / `archive-*.msg.msg` pair
//! for published uploads, or `raw/**` + `archive/**` for staging uploads.
//! This module is the codec; the transactional import against the state
//! store lives with the upload controller.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use quarry_protocol::{EntryRecord, QuarryError, Result, UploadId, UploadRecord};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::ZipArchive;

pub const BUNDLE_INFO_FILENAME: &str = "bundle_info.json";

/// Provenance of the exporting deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSource {
    pub version: String,
    #[serde(default)]
    pub commit: String,
    pub deployment: String,
    pub deployment_id: String,
}

/// What the exporter put into the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleExportOptions {
    pub include_raw_files: bool,
    pub include_archive_files: bool,
    pub include_datasets: bool,
}

impl Default for BundleExportOptions {
    fn default() -> Self {
        Self {
            include_raw_files: true,
            include_archive_files: true,
            include_datasets: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDataset {
    pub dataset_id: String,
    pub dataset_name: String,
    pub user_id: String,
}

/// The self-describing manifest at the root of every bundle.
///
/// `n_entries`/`n_calcs` are aliases kept in sync until external consumers
/// migrate; readers accept either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub upload_id: UploadId,
    pub source: BundleSource,
    pub export_options: BundleExportOptions,
    pub upload: UploadRecord,
    pub entries: Vec<EntryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Vec<BundleDataset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_entries: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_calcs: Option<usize>,
}

impl BundleInfo {
    pub fn new(
        source: BundleSource,
        export_options: BundleExportOptions,
        upload: UploadRecord,
        entries: Vec<EntryRecord>,
        datasets: Option<Vec<BundleDataset>>,
    ) -> Self {
        let count = entries.len();
        Self {
            upload_id: upload.upload_id.clone(),
            source,
            export_options,
            upload,
            entries,
            datasets,
            n_entries: Some(count),
            n_calcs: Some(count),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.n_entries
            .or(self.n_calcs)
            .unwrap_or(self.entries.len())
    }
}

/// Numeric comparison of dotted version strings; non-numeric segments
/// compare as zero.
pub fn version_at_least(version: &str, required: &str) -> bool {
    let parse = |raw: &str| -> Vec<u64> {
        raw.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let version = parse(version);
    let required = parse(required);
    for i in 0..version.len().max(required.len()) {
        let have = version.get(i).copied().unwrap_or(0);
        let want = required.get(i).copied().unwrap_or(0);
        if have != want {
            return have > want;
        }
    }
    true
}

fn bundle_err(message: impl Into<String>) -> QuarryError {
    QuarryError::BundleImportFailure(message.into())
}

// ============================================================================
// Writer
// ============================================================================

/// Assembles a bundle from a manifest and file members.
#[derive(Debug)]
pub struct BundleWriter {
    info: BundleInfo,
    members: Vec<(String, PathBuf)>,
}

impl BundleWriter {
    pub fn new(info: BundleInfo) -> Self {
        Self {
            info,
            members: Vec::new(),
        }
    }

    /// Add a file member under the given bundle-relative name.
    pub fn add_file(&mut self, name: impl Into<String>, source: PathBuf) {
        self.members.push((name.into(), source));
    }

    pub fn info(&self) -> &BundleInfo {
        &self.info
    }

    fn info_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.info)
            .map_err(|e| QuarryError::Storage(format!("could not serialize bundle info: {e}")))
    }

    /// Write the bundle as a zip file; `bundle_info.json` goes in first.
    pub fn write_zip(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        self.write_zip_to(file)?;
        debug!(upload_id = %self.info.upload_id, path = %path.display(), "wrote bundle zip");
        Ok(())
    }

    fn write_zip_to<W: Write + std::io::Seek>(&self, target: W) -> Result<()> {
        let mut writer = zip::ZipWriter::new(target);
        let zip_options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

        writer
            .start_file(BUNDLE_INFO_FILENAME, zip_options)
            .map_err(|e| QuarryError::Storage(e.to_string()))?;
        writer.write_all(&self.info_bytes()?)?;

        for (name, source) in &self.members {
            writer
                .start_file(name, zip_options)
                .map_err(|e| QuarryError::Storage(e.to_string()))?;
            let mut file = File::open(source)?;
            std::io::copy(&mut file, &mut writer)?;
        }
        writer
            .finish()
            .map_err(|e| QuarryError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Stream the bundle zip into an arbitrary writer (a response body).
    pub fn write_stream(&self, target: &mut (dyn Write + Send)) -> Result<()> {
        // Zip needs a seekable sink; assemble in memory and copy out.
        let mut buffer = std::io::Cursor::new(Vec::new());
        self.write_zip_to(&mut buffer)?;
        target.write_all(buffer.get_ref())?;
        Ok(())
    }

    /// Write the bundle as an uncompressed directory; optionally move the
    /// member files instead of copying them.
    pub fn write_dir(&self, path: &Path, move_files: bool) -> Result<()> {
        fs::create_dir_all(path)?;
        fs::write(path.join(BUNDLE_INFO_FILENAME), self.info_bytes()?)?;
        for (name, source) in &self.members {
            let target = path.join(name);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if move_files {
                if fs::rename(source, &target).is_err() {
                    fs::copy(source, &target)?;
                    fs::remove_file(source)?;
                }
            } else {
                fs::copy(source, &target)?;
            }
        }
        debug!(upload_id = %self.info.upload_id, path = %path.display(), "wrote bundle directory");
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug)]
enum BundleShape {
    Dir(PathBuf),
    Zip(PathBuf),
}

/// Read access to a bundle directory or zip file.
#[derive(Debug)]
pub struct BundleReader {
    shape: BundleShape,
}

impl BundleReader {
    pub fn open(path: &Path) -> Result<Self> {
        if path.is_dir() {
            if !path.join(BUNDLE_INFO_FILENAME).is_file() {
                return Err(bundle_err(format!(
                    "bundle directory has no {BUNDLE_INFO_FILENAME}"
                )));
            }
            return Ok(Self {
                shape: BundleShape::Dir(path.to_path_buf()),
            });
        }
        if path.is_file() {
            return Ok(Self {
                shape: BundleShape::Zip(path.to_path_buf()),
            });
        }
        Err(QuarryError::not_found(path.to_string_lossy().to_string()))
    }

    fn open_zip(path: &Path) -> Result<ZipArchive<File>> {
        let file = File::open(path)?;
        ZipArchive::new(file).map_err(|e| bundle_err(format!("not a valid bundle zip: {e}")))
    }

    pub fn bundle_info(&self) -> Result<BundleInfo> {
        let bytes = self.read_member(BUNDLE_INFO_FILENAME)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| bundle_err(format!("invalid {BUNDLE_INFO_FILENAME}: {e}")))
    }

    pub fn member_names(&self) -> Result<Vec<String>> {
        match &self.shape {
            BundleShape::Dir(dir) => {
                let mut names = Vec::new();
                for entry in walkdir::WalkDir::new(dir).min_depth(1) {
                    let entry = entry.map_err(|e| QuarryError::Storage(e.to_string()))?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if let Ok(rel) = entry.path().strip_prefix(dir) {
                        names.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
                names.sort();
                Ok(names)
            }
            BundleShape::Zip(path) => {
                let zip = Self::open_zip(path)?;
                let mut names: Vec<String> =
                    zip.file_names().map(|name| name.to_string()).collect();
                names.sort();
                Ok(names)
            }
        }
    }

    pub fn has_member(&self, name: &str) -> bool {
        match &self.shape {
            BundleShape::Dir(dir) => dir.join(name).is_file(),
            BundleShape::Zip(path) => Self::open_zip(path)
                .map(|mut zip| zip.by_name(name).is_ok())
                .unwrap_or(false),
        }
    }

    pub fn read_member(&self, name: &str) -> Result<Vec<u8>> {
        match &self.shape {
            BundleShape::Dir(dir) => {
                let path = dir.join(name);
                fs::read(&path).map_err(|_| bundle_err(format!("bundle member missing: {name}")))
            }
            BundleShape::Zip(path) => {
                let mut zip = Self::open_zip(path)?;
                let mut member = zip
                    .by_name(name)
                    .map_err(|_| bundle_err(format!("bundle member missing: {name}")))?;
                let mut bytes = Vec::with_capacity(member.size() as usize);
                member.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
        }
    }

    /// Copy a member to a target path on disk.
    pub fn extract_member(&self, name: &str, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = self.read_member(name)?;
        fs::write(target, bytes)?;
        Ok(())
    }
}
