//! Durable upload and entry records.
//!
//! These records are the ground truth; the search index is a projection and
//! may be rebuilt from them. The metadata fields shared with bundles and the
//! raw-directory metadata file are grouped into embedded structs rather than
//! an inheritance hierarchy.

use crate::ids::{EntryId, UploadId};
use crate::paths::RawPath;
use crate::status::{ProcessStatus, UploadProcess};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

/// Maximum embargo length in months.
pub const MAX_EMBARGO_MONTHS: u32 = 36;

/// System-generated provenance recorded on processed entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SystemMetadata {
    pub quarry_version: Option<String>,
    pub quarry_commit: Option<String>,
}

/// User-editable entry metadata (also accepted from the raw metadata file
/// and from bundles).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntryMetadata {
    #[serde(default)]
    pub entry_coauthors: Vec<String>,
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
}

impl EntryMetadata {
    pub fn is_empty(&self) -> bool {
        self.entry_coauthors.is_empty()
            && self.datasets.is_empty()
            && self.references.is_empty()
            && self.comment.is_none()
            && self.external_id.is_none()
    }
}

/// One durable upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub upload_id: UploadId,
    pub upload_name: Option<String>,
    pub main_author: String,
    #[serde(default)]
    pub coauthors: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    pub upload_create_time: DateTime<Utc>,
    pub publish_time: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    /// Embargo period in months, 0..=36; 0 means no embargo.
    #[serde(default)]
    pub embargo_length: u32,
    pub license: String,
    #[serde(default)]
    pub from_oasis: bool,
    pub oasis_deployment_id: Option<String>,
    #[serde(default)]
    pub published_to: Vec<String>,
    /// Publish as soon as the initial processing succeeds.
    #[serde(default)]
    pub publish_directly: bool,
    pub process_status: ProcessStatus,
    pub current_process: Option<UploadProcess>,
    pub last_status_message: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Join barrier flag; true implies no entry of this upload is processing.
    #[serde(default)]
    pub joined: bool,
}

impl UploadRecord {
    pub fn new(upload_id: UploadId, main_author: impl Into<String>) -> Self {
        Self {
            upload_id,
            upload_name: None,
            main_author: main_author.into(),
            coauthors: Vec::new(),
            reviewers: Vec::new(),
            upload_create_time: Utc::now(),
            publish_time: None,
            last_update: None,
            embargo_length: 0,
            license: "CC BY 4.0".to_string(),
            from_oasis: false,
            oasis_deployment_id: None,
            published_to: Vec::new(),
            publish_directly: false,
            process_status: ProcessStatus::Ready,
            current_process: None,
            last_status_message: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            joined: false,
        }
    }

    pub fn published(&self) -> bool {
        self.publish_time.is_some()
    }

    /// Published with an embargo period that has not yet expired.
    pub fn with_embargo(&self) -> bool {
        match self.publish_time {
            Some(publish_time) if self.embargo_length > 0 => publish_time
                .checked_add_months(Months::new(self.embargo_length))
                .map(|end| end > Utc::now())
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Writers of this upload: main author and coauthors.
    pub fn is_writer(&self, user_id: &str) -> bool {
        self.main_author == user_id || self.coauthors.iter().any(|c| c == user_id)
    }

    /// Readers: writers plus reviewers.
    pub fn is_reader(&self, user_id: &str) -> bool {
        self.is_writer(user_id) || self.reviewers.iter().any(|r| r == user_id)
    }
}

/// One parsed computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entry_id: EntryId,
    pub upload_id: UploadId,
    pub mainfile: RawPath,
    pub parser_name: String,
    pub entry_create_time: DateTime<Utc>,
    pub last_processing_time: Option<DateTime<Utc>>,
    /// Content hash over the mainfile and selected aux files.
    pub entry_hash: Option<String>,
    pub process_status: ProcessStatus,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(flatten)]
    pub metadata: EntryMetadata,
    #[serde(flatten)]
    pub system: SystemMetadata,
}

impl EntryRecord {
    pub fn new(
        entry_id: EntryId,
        upload_id: UploadId,
        mainfile: RawPath,
        parser_name: impl Into<String>,
    ) -> Self {
        Self {
            entry_id,
            upload_id,
            mainfile,
            parser_name: parser_name.into(),
            entry_create_time: Utc::now(),
            last_processing_time: None,
            entry_hash: None,
            process_status: ProcessStatus::Pending,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: EntryMetadata::default(),
            system: SystemMetadata::default(),
        }
    }

    pub fn processed(&self) -> bool {
        self.process_status == ProcessStatus::Success
    }
}
