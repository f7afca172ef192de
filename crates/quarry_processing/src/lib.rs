//! The upload lifecycle: a worker pool with a durable per-entry job queue,
//! the per-entry processing pipeline, the join barrier between entry work
//! and upload-level finalization, and the public controller operations.

pub mod bundle_ops;
pub mod context;
pub mod entry;
pub mod metadata_file;
pub mod notify;
pub mod scheduler;
pub mod upload;

pub use bundle_ops::ExportTarget;
pub use context::{CentralDeployment, NoCentralDeployment, ProcessingContext};
pub use notify::{Notifier, NoopNotifier, RecordingNotifier};
pub use scheduler::{resurrect_pending, FileOperation, Job, JobQueue, WorkerPool};
pub use upload::{UploadController, UploadMetadataUpdate};
