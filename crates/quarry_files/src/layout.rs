//! On-disk layout of the two storage areas.

use quarry_protocol::{FsConfig, RawPath, UploadId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Sentinel written into a staging tree when packing begins; a frozen tree
/// accepts no further raw file writes.
pub const FROZEN_FILE: &str = ".frozen";

/// Raw file suffix of the stripped replacement for always-restricted files.
pub const STRIPPED_SUFFIX: &str = ".stripped";

/// Which physical archive a raw file or entry archive lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessClass {
    Public,
    Restricted,
}

impl AccessClass {
    pub const ALL: &'static [AccessClass] = &[AccessClass::Public, AccessClass::Restricted];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessClass::Public => "public",
            AccessClass::Restricted => "restricted",
        }
    }

    pub fn for_embargo(with_embargo: bool) -> Self {
        if with_embargo {
            AccessClass::Restricted
        } else {
            AccessClass::Public
        }
    }
}

impl fmt::Display for AccessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccessClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(AccessClass::Public),
            "restricted" => Ok(AccessClass::Restricted),
            _ => Err(format!("Invalid access class: '{}'", s)),
        }
    }
}

/// Directory listing element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPathInfo {
    pub path: RawPath,
    pub is_file: bool,
    pub size: u64,
    pub access: AccessClass,
}

/// True for raw files that carry third-party-licensed content and must never
/// appear in the public raw archive or be returned through a public read.
/// The `.stripped` counterpart generated during preprocessing is exempt.
pub fn always_restricted(path: &RawPath) -> bool {
    let basename = path.basename();
    basename.starts_with("POTCAR") && !basename.ends_with(STRIPPED_SUFFIX)
}

/// Resolves upload directories and packed file names.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub staging_root: PathBuf,
    pub public_root: PathBuf,
    pub tmp_root: PathBuf,
    pub prefix_size: usize,
    pub archive_version_suffix: Option<String>,
}

impl StoreLayout {
    pub fn new(config: &FsConfig) -> Self {
        Self {
            staging_root: config.staging_root.clone(),
            public_root: config.public_root.clone(),
            tmp_root: config.tmp_root.clone(),
            prefix_size: config.prefix_size,
            archive_version_suffix: config.archive_version_suffix.clone(),
        }
    }

    fn shard(&self, root: &PathBuf, upload_id: &UploadId) -> PathBuf {
        if self.prefix_size > 0 {
            root.join(upload_id.prefix(self.prefix_size))
                .join(upload_id.as_str())
        } else {
            root.join(upload_id.as_str())
        }
    }

    pub fn staging_dir(&self, upload_id: &UploadId) -> PathBuf {
        self.shard(&self.staging_root, upload_id)
    }

    pub fn public_dir(&self, upload_id: &UploadId) -> PathBuf {
        self.shard(&self.public_root, upload_id)
    }

    /// A fresh scratch directory; callers must clean it up.
    pub fn tmp_dir(&self, purpose: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.tmp_root)?;
        let dir = self
            .tmp_root
            .join(format!("{purpose}-{}", UploadId::generate()));
        std::fs::create_dir(&dir)?;
        Ok(dir)
    }

    pub fn raw_zip_name(&self, access: AccessClass) -> String {
        format!("raw-{access}.plain.zip")
    }

    pub fn msg_archive_name(&self, access: AccessClass) -> String {
        match &self.archive_version_suffix {
            Some(suffix) => format!("archive-{access}-{suffix}.msg.msg"),
            None => format!("archive-{access}.msg.msg"),
        }
    }

    /// Sibling name used while repacking, renamed over the original last.
    pub fn repacked_name(name: &str) -> String {
        format!("{name}.repacked")
    }
}
