//! The upload file store.
//!
//! Uploads live in one of two areas: a mutable *staging* tree of raw files
//! plus per-entry archive files, and an immutable *public* layout of packed
//! zip/msg archives segregated by access class. Packing transforms the
//! former into the latter; extraction inverts it so published uploads can be
//! reprocessed. Bundles are the portable export of either shape.

pub mod archive;
pub mod bundle;
pub mod layout;
pub mod mime;
pub mod public;
pub mod staging;
pub mod stream;

pub use archive::{MsgArchiveReader, MsgArchiveWriter};
pub use bundle::{
    version_at_least, BundleDataset, BundleExportOptions, BundleInfo, BundleReader, BundleSource,
    BundleWriter, BUNDLE_INFO_FILENAME,
};
pub use layout::{always_restricted, AccessClass, RawPathInfo, StoreLayout};
pub use public::PublicUploadFiles;
pub use staging::{PackEntry, PackMode, PackOptions, StagingUploadFiles};
