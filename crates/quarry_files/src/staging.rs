//! The mutable staging area of an upload.
//!
//! Layout: `{staging_root}/[{prefix}/]{upload_id}/raw/**` for raw files,
//! `…/archive/{entry_id}.msg` for per-entry archives, and a `.frozen`
//! sentinel once packing has begun.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use quarry_protocol::{relativize, EntryId, QuarryError, RawPath, Result, UploadId};
use sha2::{Digest, Sha224, Sha512};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::archive::{read_entry_archive, write_entry_archive, MsgArchiveWriter};
use crate::layout::{
    always_restricted, AccessClass, RawPathInfo, StoreLayout, FROZEN_FILE, STRIPPED_SUFFIX,
};
use crate::mime::raw_file_mime;
use crate::stream::open_raw_file;

/// Input to packing: one entry with its embargo flag resolved at pack time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub entry_id: EntryId,
    pub mainfile: RawPath,
    pub with_embargo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    /// First pack: freezes staging and truncates the target files.
    Pack,
    /// Writes `*.repacked` siblings first, then renames over the originals.
    Repack,
}

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub mode: PackMode,
    pub auxfile_cutoff: usize,
    /// The public directory of the upload.
    pub target_dir: PathBuf,
}

/// The staging shape of an upload's files.
#[derive(Debug, Clone)]
pub struct StagingUploadFiles {
    upload_id: UploadId,
    layout: StoreLayout,
    base: PathBuf,
}

impl StagingUploadFiles {
    pub fn create(layout: &StoreLayout, upload_id: &UploadId) -> Result<Self> {
        let files = Self::shape(layout, upload_id);
        fs::create_dir_all(files.raw_dir())?;
        fs::create_dir_all(files.archive_dir())?;
        Ok(files)
    }

    pub fn open(layout: &StoreLayout, upload_id: &UploadId) -> Result<Self> {
        let files = Self::shape(layout, upload_id);
        if !files.raw_dir().is_dir() {
            return Err(QuarryError::not_found(format!(
                "staging files for {upload_id}"
            )));
        }
        Ok(files)
    }

    pub fn exists(layout: &StoreLayout, upload_id: &UploadId) -> bool {
        Self::shape(layout, upload_id).raw_dir().is_dir()
    }

    fn shape(layout: &StoreLayout, upload_id: &UploadId) -> Self {
        let base = layout.staging_dir(upload_id);
        Self {
            upload_id: upload_id.clone(),
            layout: layout.clone(),
            base,
        }
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.base.join("raw")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.base.join("archive")
    }

    pub fn raw_os_path(&self, path: &RawPath) -> PathBuf {
        path.to_os_path(&self.raw_dir())
    }

    pub fn is_frozen(&self) -> bool {
        self.base.join(FROZEN_FILE).exists()
    }

    fn freeze(&self) -> Result<()> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.base.join(FROZEN_FILE))
            .map_err(|_| {
                QuarryError::PackFailure(format!(
                    "staging files for {} are already frozen",
                    self.upload_id
                ))
            })?;
        Ok(())
    }

    fn check_mutable(&self) -> Result<()> {
        if self.is_frozen() {
            return Err(QuarryError::bad_request(format!(
                "upload {} is frozen for packing",
                self.upload_id
            )));
        }
        Ok(())
    }

    /// Total size of all raw files in bytes.
    pub fn size(&self) -> u64 {
        WalkDir::new(self.raw_dir())
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn raw_path_exists(&self, path: &RawPath) -> bool {
        self.raw_os_path(path).exists()
    }

    pub fn raw_path_is_file(&self, path: &RawPath) -> bool {
        self.raw_os_path(path).is_file()
    }

    pub fn raw_file_size(&self, path: &RawPath) -> Result<u64> {
        let meta = fs::metadata(self.raw_os_path(path))
            .map_err(|_| QuarryError::not_found(path.to_string()))?;
        Ok(meta.len())
    }

    /// List a raw directory.
    ///
    /// `path_prefix` filters results to paths starting with the given string;
    /// results are sorted by path.
    pub fn raw_directory_list(
        &self,
        path: &RawPath,
        recursive: bool,
        files_only: bool,
        path_prefix: Option<&str>,
    ) -> Result<Vec<RawPathInfo>> {
        let dir = self.raw_os_path(path);
        if !dir.is_dir() {
            return Err(QuarryError::not_found(path.to_string()));
        }

        let raw_root = self.raw_dir();
        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut infos = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(max_depth) {
            let entry = entry.map_err(|e| QuarryError::Storage(e.to_string()))?;
            if entry.path_is_symlink() {
                continue;
            }
            let is_file = entry.file_type().is_file();
            if files_only && !is_file {
                continue;
            }
            let rel = match relativize(&raw_root, entry.path()) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if let Some(prefix) = path_prefix {
                if !rel.as_str().starts_with(prefix) {
                    continue;
                }
            }
            let size = if is_file {
                entry.metadata().map(|meta| meta.len()).unwrap_or(0)
            } else {
                0
            };
            let access = if always_restricted(&rel) {
                AccessClass::Restricted
            } else {
                AccessClass::Public
            };
            infos.push(RawPathInfo {
                path: rel,
                is_file,
                size,
                access,
            });
        }
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    pub fn open_raw_file(
        &self,
        path: &RawPath,
        offset: i64,
        length: i64,
        decompress: bool,
    ) -> Result<Box<dyn Read + Send>> {
        open_raw_file(&self.raw_os_path(path), offset, length, decompress)
    }

    pub fn raw_file_mime(&self, path: &RawPath) -> Result<String> {
        let os_path = self.raw_os_path(path);
        if !os_path.is_file() {
            return Err(QuarryError::not_found(path.to_string()));
        }
        raw_file_mime(&os_path)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Merge raw files into the staging tree.
    ///
    /// Zip and tar sources are extracted to a scratch directory first and
    /// their contents merged; plain files and directories are merged as one
    /// element. Existing targets are overridden (directories recursed, files
    /// replaced); symlinks are skipped. With `cleanup`, the source and its
    /// parent directory are removed afterwards; the scratch directory always
    /// is, even on failure.
    pub fn add_rawfiles(&self, source: &Path, target_dir: &RawPath, cleanup: bool) -> Result<()> {
        self.check_mutable()?;
        if !source.exists() {
            return Err(QuarryError::not_found(source.to_string_lossy().to_string()));
        }

        let extract_dir = match detect_archive(source)? {
            Some(kind) => {
                let dir = self.layout.tmp_dir("extract")?;
                let extracted = extract_archive(source, kind, &dir);
                if let Err(err) = extracted {
                    let _ = fs::remove_dir_all(&dir);
                    self.cleanup_source(source, cleanup);
                    return Err(err);
                }
                Some(dir)
            }
            None => None,
        };

        let target = self.prepare_target_dir(target_dir);
        let merged = match target {
            Ok(target) => match &extract_dir {
                Some(dir) => merge_children(dir, &target),
                None => merge_element(source, &target.join(basename_of(source))),
            },
            Err(err) => Err(err),
        };

        if let Some(dir) = extract_dir {
            let _ = fs::remove_dir_all(dir);
        }
        self.cleanup_source(source, cleanup);
        merged
    }

    fn cleanup_source(&self, source: &Path, cleanup: bool) {
        if !cleanup {
            return;
        }
        let removed = if source.is_dir() {
            fs::remove_dir_all(source)
        } else {
            fs::remove_file(source)
        };
        if let Err(err) = removed {
            warn!(source = %source.display(), error = %err, "could not clean up source");
            return;
        }
        if let Some(parent) = source.parent() {
            // Upload sources arrive in their own scratch directory.
            let _ = fs::remove_dir(parent);
        }
    }

    /// Ensure every prefix of `target_dir` is a directory; files along the
    /// way are replaced.
    fn prepare_target_dir(&self, target_dir: &RawPath) -> Result<PathBuf> {
        let mut current = self.raw_dir();
        fs::create_dir_all(&current)?;
        if target_dir.is_root() {
            return Ok(current);
        }
        for element in target_dir.as_str().split('/') {
            current = current.join(element);
            if current.is_file() {
                fs::remove_file(&current)?;
            }
            if !current.exists() {
                fs::create_dir(&current)?;
            }
        }
        Ok(current)
    }

    /// Remove a raw path. The empty path empties the whole raw directory
    /// without removing the upload.
    pub fn delete_rawfiles(&self, path: &RawPath) -> Result<()> {
        self.check_mutable()?;
        let os_path = self.raw_os_path(path);
        if path.is_root() {
            if os_path.is_dir() {
                fs::remove_dir_all(&os_path)?;
            }
            fs::create_dir_all(&os_path)?;
            return Ok(());
        }
        if os_path.is_dir() {
            fs::remove_dir_all(&os_path)?;
        } else if os_path.is_file() {
            fs::remove_file(&os_path)?;
        } else {
            return Err(QuarryError::not_found(path.to_string()));
        }
        Ok(())
    }

    /// Create the `.stripped` counterpart for an always-restricted file,
    /// recording a checksum of the original.
    pub fn preprocess_potcar(&self, path: &RawPath) -> Result<Option<RawPath>> {
        if !always_restricted(path) {
            return Ok(None);
        }
        let stripped = RawPath::new(format!("{}{}", path.as_str(), STRIPPED_SUFFIX))?;
        if self.raw_path_is_file(&stripped) {
            return Ok(Some(stripped));
        }

        let mut hasher = Sha224::new();
        let mut file = File::open(self.raw_os_path(path))?;
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let checksum = hasher.finalize();

        let mut out = File::create(self.raw_os_path(&stripped))?;
        writeln!(
            out,
            "Stripped POTCAR file. Checksum of original file (sha224): {:x}",
            checksum
        )?;
        debug!(path = %path, "created stripped POTCAR counterpart");
        Ok(Some(stripped))
    }

    // ========================================================================
    // Entry archives
    // ========================================================================

    pub fn archive_path(&self, entry_id: &EntryId) -> PathBuf {
        self.archive_dir().join(format!("{entry_id}.msg"))
    }

    pub fn write_archive(&self, entry_id: &EntryId, archive: &serde_json::Value) -> Result<()> {
        fs::create_dir_all(self.archive_dir())?;
        write_entry_archive(&self.archive_path(entry_id), archive)
    }

    pub fn read_archive(&self, entry_id: &EntryId) -> Result<serde_json::Value> {
        let path = self.archive_path(entry_id);
        if !path.is_file() {
            return Err(QuarryError::not_found(entry_id.to_string()));
        }
        read_entry_archive(&path)
    }

    // ========================================================================
    // Entry file sets
    // ========================================================================

    /// The files of an entry: its mainfile plus up to `cutoff` aux files
    /// from the same directory, sorted ascending.
    pub fn entry_files(&self, mainfile: &RawPath, cutoff: usize) -> Result<Vec<RawPath>> {
        let listing = self.raw_directory_list(&mainfile.parent(), false, true, None)?;
        let all: Vec<RawPath> = listing.into_iter().map(|info| info.path).collect();
        Ok(entry_files_from(mainfile, &all, cutoff))
    }

    /// Content hash over an entry's files.
    pub fn entry_hash(&self, files: &[RawPath]) -> Result<String> {
        let mut hasher = Sha512::new();
        for path in files {
            hasher.update(path.as_str().as_bytes());
            let mut file = File::open(self.raw_os_path(path))?;
            let mut buffer = [0u8; 64 * 1024];
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
        }
        let digest = hasher.finalize();
        Ok(URL_SAFE_NO_PAD.encode(digest)[..28].to_string())
    }

    // ========================================================================
    // Packing
    // ========================================================================

    /// Transform this staging tree into the immutable public layout.
    pub fn pack(&self, entries: &[PackEntry], options: &PackOptions) -> Result<()> {
        if options.mode == PackMode::Pack {
            self.freeze()?;
        }
        fs::create_dir_all(&options.target_dir)?;

        let all_files: Vec<RawPath> = self
            .raw_directory_list(&RawPath::root(), true, true, None)?
            .into_iter()
            .map(|info| info.path)
            .collect();
        let public_set = compute_public_set(&all_files, entries, options.auxfile_cutoff);

        let pack_err = |e: QuarryError| match e {
            QuarryError::PackFailure(_) => e,
            other => QuarryError::PackFailure(other.to_string()),
        };

        let mut targets: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut final_path = |name: String| -> Result<PathBuf> {
            let target = options.target_dir.join(&name);
            match options.mode {
                PackMode::Pack => Ok(target),
                PackMode::Repack => {
                    let repacked = options.target_dir.join(StoreLayout::repacked_name(&name));
                    if repacked.exists() {
                        return Err(QuarryError::PackFailure(format!(
                            "repacked file already exists: {}",
                            repacked.display()
                        )));
                    }
                    targets.push((repacked.clone(), target));
                    Ok(repacked)
                }
            }
        };

        // Raw zips
        for access in AccessClass::ALL {
            let path = final_path(self.layout.raw_zip_name(*access))?;
            let members = all_files.iter().filter(|file| {
                let public = public_set.contains(*file);
                match access {
                    AccessClass::Public => public,
                    AccessClass::Restricted => !public,
                }
            });
            self.write_raw_zip(&path, members).map_err(pack_err)?;
        }

        // Msg archives
        let mut writers = BTreeMap::new();
        writers.insert(AccessClass::Public, MsgArchiveWriter::new());
        writers.insert(AccessClass::Restricted, MsgArchiveWriter::new());
        for entry in entries {
            let writer = writers
                .get_mut(&AccessClass::for_embargo(entry.with_embargo))
                .expect("writer for access class");
            match self.read_archive(&entry.entry_id) {
                Ok(archive) => writer.add(&entry.entry_id, &archive).map_err(pack_err)?,
                // The entry failed but we still reserve a slot.
                Err(QuarryError::NotFound(_)) => {
                    writer.add_empty(&entry.entry_id).map_err(pack_err)?
                }
                Err(err) => return Err(pack_err(err)),
            }
        }
        for (access, writer) in &writers {
            let path = final_path(self.layout.msg_archive_name(*access))?;
            writer.write_to(&path).map_err(pack_err)?;
        }

        // Atomically move repacked files over the originals.
        for (repacked, target) in targets {
            fs::rename(&repacked, &target).map_err(|e| {
                QuarryError::PackFailure(format!(
                    "could not move {} over {}: {e}",
                    repacked.display(),
                    target.display()
                ))
            })?;
        }

        debug!(upload_id = %self.upload_id, files = all_files.len(), "packed upload");
        Ok(())
    }

    fn write_raw_zip<'a>(
        &self,
        path: &Path,
        members: impl Iterator<Item = &'a RawPath>,
    ) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = zip::ZipWriter::new(file);
        // Members are stored, not deflated.
        let zip_options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for member in members {
            writer
                .start_file(member.as_str(), zip_options)
                .map_err(|e| QuarryError::PackFailure(e.to_string()))?;
            let mut source = File::open(self.raw_os_path(member))?;
            std::io::copy(&mut source, &mut writer)?;
        }
        writer
            .finish()
            .map_err(|e| QuarryError::PackFailure(e.to_string()))?;
        Ok(())
    }

    /// Remove the whole staging tree.
    pub fn delete(&self) -> Result<()> {
        if self.base.exists() {
            fs::remove_dir_all(&self.base)?;
        }
        Ok(())
    }
}

/// Compute the entry file set from a flat directory listing.
pub fn entry_files_from(mainfile: &RawPath, dir_files: &[RawPath], cutoff: usize) -> Vec<RawPath> {
    let mut aux: Vec<&RawPath> = dir_files
        .iter()
        .filter(|file| *file != mainfile && !always_restricted(file))
        .collect();
    aux.sort();
    let mut files = vec![mainfile.clone()];
    files.extend(aux.into_iter().take(cutoff).cloned());
    files
}

/// Compute the public file set for packing.
///
/// Seeded with the file sets of all unembargoed entries (always-restricted
/// files excluded, aux files cut off per directory), then reduced by every
/// file that is itself the mainfile of an embargoed entry.
pub fn compute_public_set(
    all_files: &[RawPath],
    entries: &[PackEntry],
    cutoff: usize,
) -> BTreeSet<RawPath> {
    let mut by_dir: BTreeMap<RawPath, Vec<RawPath>> = BTreeMap::new();
    for file in all_files {
        by_dir.entry(file.parent()).or_default().push(file.clone());
    }

    let mut public: BTreeSet<RawPath> = BTreeSet::new();
    for entry in entries.iter().filter(|entry| !entry.with_embargo) {
        let empty = Vec::new();
        let dir_files = by_dir.get(&entry.mainfile.parent()).unwrap_or(&empty);
        public.extend(entry_files_from(&entry.mainfile, dir_files, cutoff));
    }

    for entry in entries.iter().filter(|entry| entry.with_embargo) {
        public.remove(&entry.mainfile);
    }

    public
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

/// Detect zip/tar sources by extension first, then magic bytes.
fn detect_archive(source: &Path) -> Result<Option<ArchiveKind>> {
    if source.is_dir() {
        return Ok(None);
    }
    let name = basename_of(source).to_lowercase();
    let by_name = if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        Some(ArchiveKind::TarBz2)
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        Some(ArchiveKind::TarXz)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    };
    if by_name.is_some() {
        return Ok(by_name);
    }

    let mut head = [0u8; 262];
    let mut file = File::open(source)?;
    let read = file.read(&mut head)?;
    if read >= 4 && head.starts_with(&[0x50, 0x4b, 0x03, 0x04]) {
        return Ok(Some(ArchiveKind::Zip));
    }
    if read >= 262 && &head[257..262] == b"ustar" {
        return Ok(Some(ArchiveKind::Tar));
    }
    Ok(None)
}

fn extract_archive(source: &Path, kind: ArchiveKind, dest: &Path) -> Result<()> {
    match kind {
        ArchiveKind::Zip => {
            let file = File::open(source)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| QuarryError::bad_request(format!("not a valid zip file: {e}")))?;
            for index in 0..archive.len() {
                let mut member = archive
                    .by_index(index)
                    .map_err(|e| QuarryError::bad_request(format!("corrupt zip member: {e}")))?;
                // Members with unsafe paths are skipped, not errors.
                let Some(member_path) = member.enclosed_name() else {
                    warn!(member = member.name(), "skipping unsafe zip member");
                    continue;
                };
                let target = dest.join(member_path);
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
            Ok(())
        }
        ArchiveKind::Tar => unpack_tar(File::open(source)?, dest),
        ArchiveKind::TarGz => unpack_tar(
            flate2::read::MultiGzDecoder::new(File::open(source)?),
            dest,
        ),
        ArchiveKind::TarBz2 => unpack_tar(bzip2::read::BzDecoder::new(File::open(source)?), dest),
        ArchiveKind::TarXz => unpack_tar(xz2::read::XzDecoder::new(File::open(source)?), dest),
    }
}

fn unpack_tar(reader: impl Read, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive
        .entries()
        .map_err(|e| QuarryError::bad_request(format!("not a valid tar file: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| QuarryError::bad_request(format!("corrupt tar member: {e}")))?;
        if entry.header().entry_type().is_symlink() {
            continue;
        }
        // unpack_in refuses members that would escape dest
        entry
            .unpack_in(dest)
            .map_err(|e| QuarryError::bad_request(format!("could not unpack tar member: {e}")))?;
    }
    Ok(())
}

fn basename_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Merge the children of `source_dir` into `target`.
fn merge_children(source_dir: &Path, target: &Path) -> Result<()> {
    for child in fs::read_dir(source_dir)? {
        let child = child?;
        let dest = target.join(child.file_name());
        merge_element(&child.path(), &dest)?;
    }
    Ok(())
}

/// Merge one element; the new element overrides existing targets.
fn merge_element(source: &Path, target: &Path) -> Result<()> {
    if source.is_symlink() {
        return Ok(());
    }
    if source.is_dir() {
        if target.is_file() {
            fs::remove_file(target)?;
        }
        fs::create_dir_all(target)?;
        merge_children(source, target)
    } else {
        if target.is_dir() {
            fs::remove_dir_all(target)?;
        } else if target.is_file() {
            fs::remove_file(target)?;
        }
        fs::copy(source, target)?;
        Ok(())
    }
}
