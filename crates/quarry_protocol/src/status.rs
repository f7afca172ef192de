//! Process status state machine shared by uploads and entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a processing state machine (upload- or entry-level).
///
/// At most one process per upload may be in a processing status at a time;
/// every transition into or out of the processing statuses happens through a
/// compare-and-set in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    /// No process has run yet
    #[default]
    Ready,
    /// Process scheduled but not yet picked up by a worker
    Pending,
    /// Process is executing
    Running,
    /// Upload-level process is blocked on its entry results (the join)
    WaitingForResult,
    /// Last process completed successfully
    Success,
    /// Last process failed
    Failure,
    /// The record is being deleted
    Deleted,
}

impl ProcessStatus {
    pub const ALL: &'static [ProcessStatus] = &[
        ProcessStatus::Ready,
        ProcessStatus::Pending,
        ProcessStatus::Running,
        ProcessStatus::WaitingForResult,
        ProcessStatus::Success,
        ProcessStatus::Failure,
        ProcessStatus::Deleted,
    ];

    /// The statuses in which a process owns the record.
    pub const PROCESSING: &'static [ProcessStatus] = &[
        ProcessStatus::Pending,
        ProcessStatus::Running,
        ProcessStatus::WaitingForResult,
    ];

    /// The statuses from which a new process may be started.
    pub const NOT_PROCESSING: &'static [ProcessStatus] = &[
        ProcessStatus::Ready,
        ProcessStatus::Success,
        ProcessStatus::Failure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Ready => "READY",
            ProcessStatus::Pending => "PENDING",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::WaitingForResult => "WAITING_FOR_RESULT",
            ProcessStatus::Success => "SUCCESS",
            ProcessStatus::Failure => "FAILURE",
            ProcessStatus::Deleted => "DELETED",
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Pending | ProcessStatus::Running | ProcessStatus::WaitingForResult
        )
    }

    pub fn is_not_processing(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Ready | ProcessStatus::Success | ProcessStatus::Failure
        )
    }

    /// Entry results that count towards the join condition.
    pub fn is_processed(&self) -> bool {
        matches!(self, ProcessStatus::Success | ProcessStatus::Failure)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READY" => Ok(ProcessStatus::Ready),
            "PENDING" => Ok(ProcessStatus::Pending),
            "RUNNING" => Ok(ProcessStatus::Running),
            "WAITING_FOR_RESULT" => Ok(ProcessStatus::WaitingForResult),
            "SUCCESS" => Ok(ProcessStatus::Success),
            "FAILURE" => Ok(ProcessStatus::Failure),
            "DELETED" => Ok(ProcessStatus::Deleted),
            _ => Err(format!("Invalid process status: '{}'", s)),
        }
    }
}

/// The upload-level operations that run as a process.
///
/// Stored as `current_process` so operators can see what owns the state
/// machine, and so cancellation can find the running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadProcess {
    ProcessUpload,
    Publish,
    PublishExternally,
    DeleteUpload,
    EditMetadata,
    LiftEmbargo,
    ImportBundle,
}

impl UploadProcess {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadProcess::ProcessUpload => "process_upload",
            UploadProcess::Publish => "publish",
            UploadProcess::PublishExternally => "publish_externally",
            UploadProcess::DeleteUpload => "delete_upload",
            UploadProcess::EditMetadata => "edit_upload_metadata",
            UploadProcess::LiftEmbargo => "lift_embargo",
            UploadProcess::ImportBundle => "import_bundle",
        }
    }
}

impl fmt::Display for UploadProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UploadProcess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process_upload" => Ok(UploadProcess::ProcessUpload),
            "publish" => Ok(UploadProcess::Publish),
            "publish_externally" => Ok(UploadProcess::PublishExternally),
            "delete_upload" => Ok(UploadProcess::DeleteUpload),
            "edit_upload_metadata" => Ok(UploadProcess::EditMetadata),
            "lift_embargo" => Ok(UploadProcess::LiftEmbargo),
            "import_bundle" => Ok(UploadProcess::ImportBundle),
            _ => Err(format!("Invalid upload process: '{}'", s)),
        }
    }
}
