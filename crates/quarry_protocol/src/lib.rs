//! Canonical types shared by all Quarry crates: identifiers, process status,
//! safe relative paths, upload/entry records, users, configuration and the
//! error enum used at component boundaries.

pub mod config;
pub mod error;
pub mod ids;
pub mod paths;
pub mod records;
pub mod status;
pub mod users;

pub use config::{BundleImportConfig, FsConfig, ProcessConfig, QuarryConfig, ReprocessConfig};
pub use error::{QuarryError, Result};
pub use ids::{generate_entry_id, EntryId, UploadId};
pub use paths::{is_safe_relative_path, relativize, PathError, RawPath};
pub use records::{EntryMetadata, EntryRecord, SystemMetadata, UploadRecord, MAX_EMBARGO_MONTHS};
pub use status::{ProcessStatus, UploadProcess};
pub use users::{MemoryUserDirectory, User, UserDirectory};

/// Version string recorded into processed entries and bundle manifests.
pub const QUARRY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commit recorded into processed entries; empty when built outside git.
pub const QUARRY_COMMIT: &str = match option_env!("QUARRY_COMMIT") {
    Some(commit) => commit,
    None => "",
};
