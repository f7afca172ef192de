//! The immutable public shape of a published upload.
//!
//! Two raw zips and two packed msg archives, segregated by access class.
//! Files are immutable once written except through the atomic
//! repack-and-rename path.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use quarry_protocol::{EntryId, QuarryError, RawPath, Result, UploadId};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::ZipArchive;

use crate::archive::{MsgArchiveReader, MsgArchiveWriter};
use crate::layout::{AccessClass, RawPathInfo, StoreLayout};
use crate::staging::{compute_public_set, PackEntry, StagingUploadFiles};
use crate::stream::{detect_compression, Compression};

/// The public shape of an upload's files.
#[derive(Debug, Clone)]
pub struct PublicUploadFiles {
    upload_id: UploadId,
    layout: StoreLayout,
    base: PathBuf,
}

impl PublicUploadFiles {
    pub fn open(layout: &StoreLayout, upload_id: &UploadId) -> Result<Self> {
        let files = Self::shape(layout, upload_id);
        if !files.exists_on_disk() {
            return Err(QuarryError::not_found(format!(
                "public files for {upload_id}"
            )));
        }
        Ok(files)
    }

    pub fn exists(layout: &StoreLayout, upload_id: &UploadId) -> bool {
        Self::shape(layout, upload_id).exists_on_disk()
    }

    fn shape(layout: &StoreLayout, upload_id: &UploadId) -> Self {
        let base = layout.public_dir(upload_id);
        Self {
            upload_id: upload_id.clone(),
            layout: layout.clone(),
            base,
        }
    }

    fn exists_on_disk(&self) -> bool {
        self.raw_zip_path(AccessClass::Public).is_file()
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn raw_zip_path(&self, access: AccessClass) -> PathBuf {
        self.base.join(self.layout.raw_zip_name(access))
    }

    pub fn msg_archive_path(&self, access: AccessClass) -> PathBuf {
        self.base.join(self.layout.msg_archive_name(access))
    }

    fn open_zip(&self, access: AccessClass) -> Result<ZipArchive<File>> {
        let path = self.raw_zip_path(access);
        let file = File::open(&path)
            .map_err(|_| QuarryError::not_found(path.to_string_lossy().to_string()))?;
        ZipArchive::new(file).map_err(|e| QuarryError::Storage(e.to_string()))
    }

    // ========================================================================
    // Raw reads
    // ========================================================================

    /// Locate a raw file member: which archive holds it.
    pub fn raw_file_access(&self, path: &RawPath) -> Result<AccessClass> {
        for access in AccessClass::ALL {
            let mut zip = self.open_zip(*access)?;
            if zip.by_name(path.as_str()).is_ok() {
                return Ok(*access);
            }
        }
        Err(QuarryError::not_found(path.to_string()))
    }

    pub fn raw_path_is_file(&self, path: &RawPath) -> bool {
        self.raw_file_access(path).is_ok()
    }

    pub fn raw_path_exists(&self, path: &RawPath) -> bool {
        if path.is_root() {
            return true;
        }
        if self.raw_path_is_file(path) {
            return true;
        }
        self.member_paths()
            .map(|members| {
                members
                    .iter()
                    .any(|(member, _, _)| member.starts_with(path))
            })
            .unwrap_or(false)
    }

    fn member_paths(&self) -> Result<Vec<(RawPath, u64, AccessClass)>> {
        let mut members = Vec::new();
        for access in AccessClass::ALL {
            let mut zip = self.open_zip(*access)?;
            for index in 0..zip.len() {
                let member = zip
                    .by_index(index)
                    .map_err(|e| QuarryError::Storage(e.to_string()))?;
                if member.is_dir() {
                    continue;
                }
                match RawPath::new(member.name().to_string()) {
                    Ok(path) => members.push((path, member.size(), *access)),
                    Err(_) => warn!(member = member.name(), "unsafe member path in raw zip"),
                }
            }
        }
        Ok(members)
    }

    /// List raw files (and implicit directories) under a path.
    pub fn raw_directory_list(
        &self,
        path: &RawPath,
        recursive: bool,
        files_only: bool,
        path_prefix: Option<&str>,
    ) -> Result<Vec<RawPathInfo>> {
        let members = self.member_paths()?;
        let mut infos: BTreeMap<RawPath, RawPathInfo> = BTreeMap::new();

        for (member, size, access) in members {
            if !member.starts_with(path) || member == *path {
                continue;
            }
            if !files_only {
                // Materialize implicit parent directories below `path`.
                let mut parent = member.parent();
                while parent.starts_with(path) && parent != *path {
                    infos.entry(parent.clone()).or_insert(RawPathInfo {
                        path: parent.clone(),
                        is_file: false,
                        size: 0,
                        access: AccessClass::Public,
                    });
                    parent = parent.parent();
                    if parent.is_root() {
                        break;
                    }
                }
            }
            if !recursive && member.parent() != *path {
                continue;
            }
            infos.insert(
                member.clone(),
                RawPathInfo {
                    path: member,
                    is_file: true,
                    size,
                    access,
                },
            );
        }

        let mut infos: Vec<RawPathInfo> = infos
            .into_values()
            .filter(|info| {
                if !recursive && !(info.path.parent() == *path) {
                    return false;
                }
                match path_prefix {
                    Some(prefix) => info.path.as_str().starts_with(prefix),
                    None => true,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    fn read_member(&self, path: &RawPath) -> Result<(Vec<u8>, AccessClass)> {
        for access in AccessClass::ALL {
            let mut zip = self.open_zip(*access)?;
            match zip.by_name(path.as_str()) {
                Ok(mut member) => {
                    let mut buffer = Vec::with_capacity(member.size() as usize);
                    member.read_to_end(&mut buffer)?;
                    return Ok((buffer, *access));
                }
                Err(_) => {}
            };
        }
        Err(QuarryError::not_found(path.to_string()))
    }

    /// Open a window into a packed raw file; also reports its access class
    /// so callers can enforce the embargo-aware read path.
    pub fn open_raw_file(
        &self,
        path: &RawPath,
        offset: i64,
        length: i64,
        decompress: bool,
    ) -> Result<(Box<dyn Read + Send>, AccessClass)> {
        if offset < 0 {
            return Err(QuarryError::bad_request(format!(
                "invalid offset: {offset}"
            )));
        }
        if length != -1 && length <= 0 {
            return Err(QuarryError::bad_request(format!(
                "invalid length: {length}"
            )));
        }

        let (bytes, access) = self.read_member(path)?;
        let bytes = if decompress {
            match detect_compression(&bytes[..bytes.len().min(3)]) {
                Some(Compression::Gzip) => {
                    let mut decoded = Vec::new();
                    flate2::read::MultiGzDecoder::new(Cursor::new(bytes))
                        .read_to_end(&mut decoded)?;
                    decoded
                }
                Some(Compression::Bzip2) => {
                    let mut decoded = Vec::new();
                    bzip2::read::BzDecoder::new(Cursor::new(bytes)).read_to_end(&mut decoded)?;
                    decoded
                }
                Some(Compression::Xz) => {
                    let mut decoded = Vec::new();
                    xz2::read::XzDecoder::new(Cursor::new(bytes)).read_to_end(&mut decoded)?;
                    decoded
                }
                None => bytes,
            }
        } else {
            bytes
        };

        let size = bytes.len() as u64;
        let offset = offset as u64;
        if offset > size {
            return Err(QuarryError::bad_request(format!(
                "offset {offset} is beyond the file size {size}"
            )));
        }
        let end = match length {
            -1 => size,
            length => (offset + length as u64).min(size),
        };
        let window = bytes[offset as usize..end as usize].to_vec();
        Ok((Box::new(Cursor::new(window)), access))
    }

    // ========================================================================
    // Archive reads
    // ========================================================================

    /// Read one entry archive from the packed msg archives, reporting the
    /// access class it was found under.
    pub fn read_archive(&self, entry_id: &EntryId) -> Result<(serde_json::Value, AccessClass)> {
        for access in AccessClass::ALL {
            let path = self.msg_archive_path(*access);
            if !path.is_file() {
                continue;
            }
            let mut reader = MsgArchiveReader::open(&path)?;
            if reader.contains(entry_id) {
                return Ok((reader.read(entry_id)?, *access));
            }
        }
        Err(QuarryError::not_found(entry_id.to_string()))
    }

    // ========================================================================
    // Extraction back to staging
    // ========================================================================

    /// Materialize a staging tree from the packed files, the inverse of
    /// packing; enables reprocessing of published uploads.
    pub fn to_staging(&self) -> Result<StagingUploadFiles> {
        let staging = StagingUploadFiles::create(&self.layout, &self.upload_id)?;
        let raw_dir = staging.raw_dir();

        for access in AccessClass::ALL {
            let mut zip = self.open_zip(*access)?;
            for index in 0..zip.len() {
                let mut member = zip
                    .by_index(index)
                    .map_err(|e| QuarryError::Storage(e.to_string()))?;
                let Some(member_path) = member.enclosed_name() else {
                    warn!(member = member.name(), "skipping unsafe zip member");
                    continue;
                };
                let target = raw_dir.join(member_path);
                if member.is_dir() {
                    fs::create_dir_all(&target)?;
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                std::io::copy(&mut member, &mut out)?;
            }
        }

        // Re-materialize the per-entry archive files.
        for access in AccessClass::ALL {
            let path = self.msg_archive_path(*access);
            if !path.is_file() {
                continue;
            }
            let mut reader = MsgArchiveReader::open(&path)?;
            let entry_ids: Vec<EntryId> = reader
                .entry_ids()
                .map(EntryId::parse)
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| QuarryError::Storage(e.to_string()))?;
            for entry_id in entry_ids {
                let archive = reader.read(&entry_id)?;
                staging.write_archive(&entry_id, &archive)?;
            }
        }

        debug!(upload_id = %self.upload_id, "extracted public files to staging");
        Ok(staging)
    }

    // ========================================================================
    // Repack
    // ========================================================================

    /// Redistribute packed files between access classes after an embargo
    /// change, without going through staging. Writes `*.repacked` siblings,
    /// then renames them over the originals.
    pub fn repack(&self, entries: &[PackEntry], auxfile_cutoff: usize) -> Result<()> {
        let names: Vec<String> = vec![
            self.layout.raw_zip_name(AccessClass::Public),
            self.layout.raw_zip_name(AccessClass::Restricted),
            self.layout.msg_archive_name(AccessClass::Public),
            self.layout.msg_archive_name(AccessClass::Restricted),
        ];
        for name in &names {
            let repacked = self.base.join(StoreLayout::repacked_name(name));
            if repacked.exists() {
                return Err(QuarryError::PackFailure(format!(
                    "repacked file already exists: {}",
                    repacked.display()
                )));
            }
        }

        let members = self.member_paths()?;
        let all_files: Vec<RawPath> = members.iter().map(|(path, _, _)| path.clone()).collect();
        let public_set = compute_public_set(&all_files, entries, auxfile_cutoff);

        // Raw zips
        for target_access in AccessClass::ALL {
            let name = self.layout.raw_zip_name(*target_access);
            let path = self.base.join(StoreLayout::repacked_name(&name));
            let file = File::create(&path)?;
            let mut writer = zip::ZipWriter::new(file);
            let zip_options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (member, _, _) in &members {
                let public = public_set.contains(member);
                let belongs = match target_access {
                    AccessClass::Public => public,
                    AccessClass::Restricted => !public,
                };
                if !belongs {
                    continue;
                }
                let (bytes, _) = self.read_member(member)?;
                writer
                    .start_file(member.as_str(), zip_options)
                    .map_err(|e| QuarryError::PackFailure(e.to_string()))?;
                std::io::copy(&mut Cursor::new(bytes), &mut writer)?;
            }
            writer
                .finish()
                .map_err(|e| QuarryError::PackFailure(e.to_string()))?;
        }

        // Msg archives: entries in the list move per their new flag, other
        // records keep their current access class.
        let targets: BTreeMap<&str, AccessClass> = entries
            .iter()
            .map(|entry| {
                (
                    entry.entry_id.as_str(),
                    AccessClass::for_embargo(entry.with_embargo),
                )
            })
            .collect();

        let mut writers = BTreeMap::new();
        writers.insert(AccessClass::Public, MsgArchiveWriter::new());
        writers.insert(AccessClass::Restricted, MsgArchiveWriter::new());
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for access in AccessClass::ALL {
            let path = self.msg_archive_path(*access);
            if !path.is_file() {
                continue;
            }
            let mut reader = MsgArchiveReader::open(&path)?;
            let entry_ids: Vec<EntryId> = reader
                .entry_ids()
                .map(EntryId::parse)
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| QuarryError::Storage(e.to_string()))?;
            for entry_id in entry_ids {
                if !seen.insert(entry_id.to_string()) {
                    continue;
                }
                let value = reader.read(&entry_id)?;
                let target = targets.get(entry_id.as_str()).copied().unwrap_or(*access);
                writers
                    .get_mut(&target)
                    .expect("writer for access class")
                    .add(&entry_id, &value)?;
            }
        }
        for (access, writer) in &writers {
            let name = self.layout.msg_archive_name(*access);
            let path = self.base.join(StoreLayout::repacked_name(&name));
            writer.write_to(&path)?;
        }

        for name in &names {
            let repacked = self.base.join(StoreLayout::repacked_name(name));
            let target = self.base.join(name);
            fs::rename(&repacked, &target).map_err(|e| {
                QuarryError::PackFailure(format!(
                    "could not move {} over {}: {e}",
                    repacked.display(),
                    target.display()
                ))
            })?;
        }

        debug!(upload_id = %self.upload_id, "repacked public files");
        Ok(())
    }

    /// Remove the whole public tree.
    pub fn delete(&self) -> Result<()> {
        if self.base.exists() {
            fs::remove_dir_all(&self.base)?;
        }
        Ok(())
    }
}
