//! Durable records of uploads and entries.
//!
//! The store keeps two collections, `uploads` and `entries`, plus the pruned
//! per-entry projections used by the search indexer and the dataset registry
//! referenced by bundles. Every status-changing write is a conditional
//! update, so concurrent operations on the same upload resolve to exactly
//! one winner.

mod row;
mod store;

pub use store::{DatasetRecord, StateStore, UploadOrder, UploadPage, UploadQuery};
