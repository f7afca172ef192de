//! The upload controller and the upload-level worker job.
//!
//! Controller operations are idempotent with respect to their inputs and all
//! go through the state machine's compare-and-set, so at most one process
//! per upload runs at a time. Matching and entry dispatch happen on the
//! worker pool; the join barrier runs upload-level cleanup exactly once.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use quarry_files::{
    AccessClass, PackEntry, PackMode, PackOptions, PublicUploadFiles, StagingUploadFiles,
};
use quarry_protocol::{
    generate_entry_id, EntryId, EntryRecord, ProcessStatus, QuarryError, RawPath, Result,
    UploadId, UploadProcess, UploadRecord, User, MAX_EMBARGO_MONTHS,
};
use quarry_search::SearchDocument;
use tracing::{error, info, warn};

use crate::bundle_ops;
use crate::context::ProcessingContext;
use crate::entry;
use crate::metadata_file;
use crate::scheduler::{FileOperation, Job};

/// Partial update for `set_upload_metadata`.
#[derive(Debug, Clone, Default)]
pub struct UploadMetadataUpdate {
    pub upload_name: Option<String>,
    pub embargo_length: Option<u32>,
    pub main_author: Option<String>,
    pub upload_create_time: Option<DateTime<Utc>>,
}

impl UploadMetadataUpdate {
    fn is_empty(&self) -> bool {
        self.upload_name.is_none()
            && self.embargo_length.is_none()
            && self.main_author.is_none()
            && self.upload_create_time.is_none()
    }
}

/// Public operations on uploads.
pub struct UploadController {
    ctx: Arc<ProcessingContext>,
}

impl UploadController {
    pub fn new(ctx: Arc<ProcessingContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ProcessingContext> {
        &self.ctx
    }

    fn user(&self, user_id: &str) -> Result<User> {
        self.ctx
            .users
            .lookup(user_id)
            .ok_or_else(|| QuarryError::unauthorized(format!("unknown user: {user_id}")))
    }

    fn check_writer(&self, upload: &UploadRecord, user: &User) -> Result<()> {
        if user.is_admin || upload.is_writer(&user.user_id) {
            Ok(())
        } else {
            Err(QuarryError::unauthorized(format!(
                "user {} may not modify upload {}",
                user.user_id, upload.upload_id
            )))
        }
    }

    fn check_reader(&self, upload: &UploadRecord, user: &User) -> Result<()> {
        if user.is_admin || upload.is_reader(&user.user_id) {
            Ok(())
        } else {
            Err(QuarryError::unauthorized(format!(
                "user {} may not read upload {}",
                user.user_id, upload.upload_id
            )))
        }
    }

    // ========================================================================
    // Create / files / processing
    // ========================================================================

    pub fn create(
        &self,
        user_id: &str,
        upload_name: Option<String>,
        publish_directly: bool,
        embargo_length: Option<u32>,
    ) -> Result<UploadRecord> {
        let user = self.user(user_id)?;
        if !user.is_admin {
            let unpublished = self.ctx.store.count_unpublished_by_author(user_id)?;
            if unpublished >= self.ctx.config.process.upload_limit {
                return Err(QuarryError::bad_request(format!(
                    "limit of unpublished uploads exceeded for user {user_id}"
                )));
            }
        }
        let embargo_length = embargo_length.unwrap_or(0);
        validate_embargo(embargo_length)?;

        let mut record = UploadRecord::new(UploadId::generate(), user_id);
        record.upload_name = upload_name;
        record.publish_directly = publish_directly;
        record.embargo_length = embargo_length;

        StagingUploadFiles::create(&self.ctx.layout, &record.upload_id)?;
        self.ctx.store.create_upload(&record)?;
        info!(upload_id = %record.upload_id, user = user_id, "created upload");
        Ok(record)
    }

    /// Add raw files from `source` (plain file, directory, zip or tar) and
    /// trigger processing.
    pub fn add_files(
        &self,
        upload_id: &UploadId,
        user_id: &str,
        source: &Path,
        target_dir: RawPath,
        temporary: bool,
    ) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        self.check_writer(&upload, &user)?;
        if upload.published() && !user.is_admin {
            return Err(QuarryError::bad_request(
                "cannot add files to a published upload",
            ));
        }
        self.begin_process_upload(
            upload_id,
            Some(FileOperation::Add {
                path: source.to_path_buf(),
                target_dir,
                temporary,
            }),
        )
    }

    /// Delete a raw path (the empty path empties the raw directory) and
    /// trigger processing.
    pub fn delete_files(&self, upload_id: &UploadId, user_id: &str, path: RawPath) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        self.check_writer(&upload, &user)?;
        if upload.published() {
            return Err(QuarryError::bad_request(
                "cannot delete files from a published upload",
            ));
        }
        self.begin_process_upload(upload_id, Some(FileOperation::Delete { path }))
    }

    /// Match, parse and normalize everything again. Published uploads are
    /// extracted back to staging first; admins only.
    pub fn reprocess(&self, upload_id: &UploadId, user_id: &str) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        self.check_writer(&upload, &user)?;
        if upload.published() && !user.is_admin {
            return Err(QuarryError::unauthorized(
                "only admins may reprocess published uploads",
            ));
        }
        self.begin_process_upload(upload_id, None)
    }

    fn begin_process_upload(
        &self,
        upload_id: &UploadId,
        file_operation: Option<FileOperation>,
    ) -> Result<()> {
        self.ctx
            .store
            .try_begin_process(upload_id, UploadProcess::ProcessUpload)?;
        self.ctx.queue.push(Job::ProcessUpload {
            upload_id: upload_id.clone(),
            file_operation,
        });
        Ok(())
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    pub fn publish(
        &self,
        upload_id: &UploadId,
        user_id: &str,
        embargo_length: Option<u32>,
    ) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        self.check_writer(&upload, &user)?;
        if upload.published() {
            return Err(QuarryError::bad_request("upload is already published"));
        }
        if let Some(embargo_length) = embargo_length {
            validate_embargo(embargo_length)?;
        }
        if self
            .ctx
            .store
            .count_entries(upload_id, Some(ProcessStatus::Success))?
            == 0
        {
            return Err(QuarryError::bad_request(
                "cannot publish an upload without processed entries",
            ));
        }

        self.ctx
            .store
            .try_begin_process(upload_id, UploadProcess::Publish)?;
        let result = self.publish_inner(upload_id, embargo_length);
        self.finish(upload_id, result)
    }

    fn publish_inner(&self, upload_id: &UploadId, embargo_length: Option<u32>) -> Result<()> {
        let mut upload = self.ctx.store.get_upload(upload_id)?;
        if let Some(embargo_length) = embargo_length {
            upload.embargo_length = embargo_length;
        }

        let staging = StagingUploadFiles::open(&self.ctx.layout, upload_id)?;
        let entries = pack_entries(&self.ctx, &upload)?;
        // A failed earlier pack leaves the frozen sentinel; retries go
        // through repack and recreate the half-written archives.
        let mode = if staging.is_frozen() {
            PackMode::Repack
        } else {
            PackMode::Pack
        };
        staging.pack(
            &entries,
            &PackOptions {
                mode,
                auxfile_cutoff: self.ctx.config.process.auxfile_cutoff,
                target_dir: self.ctx.layout.public_dir(upload_id),
            },
        )?;

        let now = Utc::now();
        upload.publish_time = Some(now);
        upload.last_update = Some(now);
        self.ctx.store.save_upload(&upload)?;
        staging.delete()?;
        self.reindex(&upload);
        info!(upload_id = %upload_id, embargo = upload.embargo_length, "published upload");
        Ok(())
    }

    /// Push an already-published upload to the central deployment as a
    /// bundle, recording it in `published_to`.
    pub fn publish_externally(
        &self,
        upload_id: &UploadId,
        user_id: &str,
        embargo_length: Option<u32>,
    ) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        self.check_writer(&upload, &user)?;
        if !upload.published() {
            return Err(QuarryError::bad_request(
                "only published uploads can be published externally",
            ));
        }
        let central_id = self.ctx.central.deployment_id().to_string();
        if central_id.is_empty() {
            return Err(QuarryError::bad_request(
                "no central deployment is configured",
            ));
        }
        if upload.published_to.iter().any(|d| d == &central_id) {
            return Err(QuarryError::bad_request(format!(
                "upload is already published to {central_id}"
            )));
        }
        if let Some(embargo_length) = embargo_length {
            validate_embargo(embargo_length)?;
        }

        self.ctx
            .store
            .try_begin_process(upload_id, UploadProcess::PublishExternally)?;
        let result = (|| -> Result<()> {
            let tmp = self.ctx.layout.tmp_dir("bundle-export")?;
            let bundle_path = tmp.join(format!("{upload_id}.zip"));
            let export = bundle_ops::export_bundle(
                &self.ctx,
                upload_id,
                Default::default(),
                bundle_ops::ExportTarget::Zip(bundle_path.clone()),
            );
            let pushed = export.and_then(|_| self.ctx.central.receive_bundle(&bundle_path));
            let _ = std::fs::remove_dir_all(&tmp);
            pushed?;

            let mut upload = self.ctx.store.get_upload(upload_id)?;
            upload.published_to.push(central_id.clone());
            upload.last_update = Some(Utc::now());
            self.ctx.store.save_upload(&upload)?;
            info!(upload_id = %upload_id, central = %central_id, "published upload externally");
            Ok(())
        })();
        self.finish(upload_id, result)
    }

    /// Lift the embargo of a published upload: move everything restricted
    /// into the public archives.
    pub fn lift_embargo(&self, upload_id: &UploadId, user_id: &str) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        if !user.is_admin && upload.main_author != user.user_id {
            return Err(QuarryError::unauthorized(
                "only admins or the main author may lift an embargo",
            ));
        }
        if !upload.published() {
            return Err(QuarryError::bad_request("upload is not published"));
        }
        if !upload.with_embargo() {
            return Err(QuarryError::bad_request("upload is not under embargo"));
        }

        self.ctx
            .store
            .try_begin_process(upload_id, UploadProcess::LiftEmbargo)?;
        let result = (|| -> Result<()> {
            let mut upload = self.ctx.store.get_upload(upload_id)?;
            upload.embargo_length = 0;

            let public = PublicUploadFiles::open(&self.ctx.layout, upload_id)?;
            let entries = pack_entries(&self.ctx, &upload)?;
            public.repack(&entries, self.ctx.config.process.auxfile_cutoff)?;

            upload.last_update = Some(Utc::now());
            self.ctx.store.save_upload(&upload)?;
            self.reindex(&upload);
            info!(upload_id = %upload_id, "lifted embargo");
            Ok(())
        })();
        self.finish(upload_id, result)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub fn set_upload_metadata(
        &self,
        upload_id: &UploadId,
        user_id: &str,
        update: UploadMetadataUpdate,
    ) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        self.check_writer(&upload, &user)?;

        if let Some(embargo_length) = update.embargo_length {
            validate_embargo(embargo_length)?;
        }

        // Identical changes are a no-op, without touching the state machine.
        let name_unchanged = update
            .upload_name
            .as_deref()
            .map_or(true, |name| upload.upload_name.as_deref() == Some(name));
        let embargo_unchanged = update
            .embargo_length
            .map_or(true, |embargo| embargo == upload.embargo_length);
        let author_unchanged = update
            .main_author
            .as_deref()
            .map_or(true, |author| upload.main_author == author);
        let time_unchanged = update
            .upload_create_time
            .map_or(true, |time| upload.upload_create_time == time);
        if update.is_empty()
            || (name_unchanged && embargo_unchanged && author_unchanged && time_unchanged)
        {
            return Ok(());
        }

        if !user.is_admin {
            if update.main_author.is_some() || update.upload_create_time.is_some() {
                return Err(QuarryError::bad_request(
                    "only admins may change authorship or timestamps",
                ));
            }
            if !name_unchanged && upload.published() {
                return Err(QuarryError::bad_request(
                    "the upload name can only be changed while unpublished",
                ));
            }
            if let Some(new_embargo) = update.embargo_length {
                if upload.published() && new_embargo > upload.embargo_length {
                    return Err(QuarryError::bad_request(
                        "embargoes of published uploads can only be shortened",
                    ));
                }
            }
        }
        if let Some(main_author) = &update.main_author {
            if !self.ctx.users.exists(main_author) {
                return Err(QuarryError::bad_request(format!(
                    "unknown user: {main_author}"
                )));
            }
        }

        self.ctx
            .store
            .try_begin_process(upload_id, UploadProcess::EditMetadata)?;
        let result = (|| -> Result<()> {
            let mut upload = self.ctx.store.get_upload(upload_id)?;
            let embargo_flag_flips = update
                .embargo_length
                .map(|new| (new > 0) != (upload.embargo_length > 0))
                .unwrap_or(false);

            if let Some(upload_name) = update.upload_name.clone() {
                upload.upload_name = Some(upload_name);
            }
            if let Some(embargo_length) = update.embargo_length {
                upload.embargo_length = embargo_length;
            }
            if let Some(main_author) = update.main_author.clone() {
                upload.main_author = main_author;
            }
            if let Some(create_time) = update.upload_create_time {
                upload.upload_create_time = create_time;
            }
            upload.last_update = Some(Utc::now());

            if upload.published() && embargo_flag_flips {
                let public = PublicUploadFiles::open(&self.ctx.layout, upload_id)?;
                let entries = pack_entries(&self.ctx, &upload)?;
                public.repack(&entries, self.ctx.config.process.auxfile_cutoff)?;
            }

            self.ctx.store.save_upload(&upload)?;
            self.reindex(&upload);
            Ok(())
        })();
        self.finish(upload_id, result)
    }

    // ========================================================================
    // Delete
    // ========================================================================

    pub fn delete(&self, upload_id: &UploadId, user_id: &str) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        self.check_writer(&upload, &user)?;
        if upload.published() && !user.is_admin {
            return Err(QuarryError::unauthorized(
                "only admins may delete published uploads",
            ));
        }

        self.ctx
            .store
            .try_begin_process(upload_id, UploadProcess::DeleteUpload)?;
        let result = (|| -> Result<()> {
            // Search first, then archives, then files, then the records.
            if let Err(err) = self
                .ctx
                .search
                .delete_upload(upload_id)
                .and_then(|_| self.ctx.search.refresh())
            {
                warn!(upload_id = %upload_id, error = %err, "could not delete upload from search index");
            }
            self.ctx.store.delete_partial_archives(upload_id)?;
            if StagingUploadFiles::exists(&self.ctx.layout, upload_id) {
                StagingUploadFiles::open(&self.ctx.layout, upload_id)?.delete()?;
            }
            let public_dir = self.ctx.layout.public_dir(upload_id);
            if public_dir.exists() {
                std::fs::remove_dir_all(&public_dir)?;
            }
            self.ctx.store.delete_upload(upload_id)?;
            info!(upload_id = %upload_id, "deleted upload");
            Ok(())
        })();
        match result {
            Ok(()) => Ok(()),
            // The upload row may be gone; only report if it still exists.
            Err(err) => {
                if self.ctx.store.try_get_upload(upload_id)?.is_some() {
                    self.ctx.store.finish_process(
                        upload_id,
                        ProcessStatus::Failure,
                        &[err.to_string()],
                    )?;
                }
                Err(err)
            }
        }
    }

    /// Force-fail a wedged process. Still-processing entries are failed
    /// with a fixed message and the join fires, so the upload cannot wedge.
    pub fn force_fail(&self, upload_id: &UploadId, user_id: &str) -> Result<()> {
        const KILL_MESSAGE: &str = "process was killed by an operator";

        let user = self.user(user_id)?;
        if !user.is_admin {
            return Err(QuarryError::unauthorized(
                "only admins may kill running processes",
            ));
        }
        let upload = self.ctx.store.get_upload(upload_id)?;
        if !upload.process_status.is_processing() {
            return Err(QuarryError::bad_request("upload is not processing"));
        }

        for mut entry in self.ctx.store.get_entries(upload_id)? {
            if entry.process_status.is_processing() {
                entry.process_status = ProcessStatus::Failure;
                entry.errors.push(KILL_MESSAGE.to_string());
                self.ctx.store.save_entry(&entry)?;
            }
        }
        if upload.process_status == ProcessStatus::WaitingForResult {
            check_join(&self.ctx, upload_id)
        } else {
            self.ctx.store.finish_process(
                upload_id,
                ProcessStatus::Failure,
                &[KILL_MESSAGE.to_string()],
            )
        }
    }

    // ========================================================================
    // Bundles
    // ========================================================================

    pub fn export_bundle(
        &self,
        upload_id: &UploadId,
        user_id: &str,
        options: quarry_files::BundleExportOptions,
        target: bundle_ops::ExportTarget,
    ) -> Result<()> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        self.check_reader(&upload, &user)?;
        bundle_ops::export_bundle(&self.ctx, upload_id, options, target)
    }

    pub fn import_bundle(&self, bundle_path: &Path, user_id: &str) -> Result<UploadRecord> {
        let user = self.user(user_id)?;
        if !user.is_admin {
            return Err(QuarryError::unauthorized(
                "only admins may import upload bundles",
            ));
        }
        bundle_ops::import_bundle(&self.ctx, bundle_path)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_upload(&self, upload_id: &UploadId) -> Result<UploadRecord> {
        self.ctx.store.get_upload(upload_id)
    }

    pub fn get_entries(&self, upload_id: &UploadId) -> Result<Vec<EntryRecord>> {
        self.ctx.store.get_entries(upload_id)
    }

    /// The embargo-aware read path for raw files.
    pub fn open_raw_file(
        &self,
        upload_id: &UploadId,
        user_id: &str,
        path: &RawPath,
        offset: i64,
        length: i64,
        decompress: bool,
    ) -> Result<Box<dyn Read + Send>> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        if !upload.published() {
            self.check_reader(&upload, &user)?;
            let staging = StagingUploadFiles::open(&self.ctx.layout, upload_id)?;
            return staging.open_raw_file(path, offset, length, decompress);
        }
        let public = PublicUploadFiles::open(&self.ctx.layout, upload_id)?;
        let (stream, access) = public.open_raw_file(path, offset, length, decompress)?;
        if access == AccessClass::Restricted {
            self.check_reader(&upload, &user)?;
        }
        Ok(stream)
    }

    /// Read one entry archive; authorization is checked up front.
    pub fn read_archive(
        &self,
        upload_id: &UploadId,
        user_id: &str,
        entry_id: &EntryId,
    ) -> Result<serde_json::Value> {
        let user = self.user(user_id)?;
        let upload = self.ctx.store.get_upload(upload_id)?;
        if !upload.published() {
            self.check_reader(&upload, &user)?;
            let staging = StagingUploadFiles::open(&self.ctx.layout, upload_id)?;
            return staging.read_archive(entry_id);
        }
        let public = PublicUploadFiles::open(&self.ctx.layout, upload_id)?;
        let (archive, access) = public.read_archive(entry_id)?;
        if access == AccessClass::Restricted {
            self.check_reader(&upload, &user)?;
        }
        Ok(archive)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Block until the upload leaves the processing statuses.
    pub fn wait_for(&self, upload_id: &UploadId, timeout: Duration) -> Result<UploadRecord> {
        let start = Instant::now();
        loop {
            let upload = self.ctx.store.get_upload(upload_id)?;
            if upload.process_status.is_not_processing() {
                return Ok(upload);
            }
            if start.elapsed() > timeout {
                return Err(QuarryError::Storage(format!(
                    "timed out waiting for upload {upload_id} ({})",
                    upload.process_status
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn finish(&self, upload_id: &UploadId, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.ctx
                    .store
                    .finish_process(upload_id, ProcessStatus::Success, &[])?;
                Ok(())
            }
            Err(err) => {
                self.ctx.store.finish_process(
                    upload_id,
                    ProcessStatus::Failure,
                    &[err.to_string()],
                )?;
                Err(err)
            }
        }
    }

    /// Refresh the search projection of every entry of the upload.
    fn reindex(&self, upload: &UploadRecord) {
        let result = (|| -> Result<()> {
            let entries = self.ctx.store.get_entries(&upload.upload_id)?;
            for entry in entries {
                let Some(mut payload) = self.ctx.store.read_partial_archive(&entry.entry_id)?
                else {
                    continue;
                };
                payload["published"] = serde_json::json!(upload.published());
                payload["with_embargo"] = serde_json::json!(upload.with_embargo());
                self.ctx.search.index_entry(
                    SearchDocument {
                        entry_id: entry.entry_id.clone(),
                        upload_id: upload.upload_id.clone(),
                        payload,
                    },
                    false,
                )?;
            }
            self.ctx.search.refresh()
        })();
        if let Err(err) = result {
            // Index failures are never fatal; the next refresh barrier retries.
            warn!(upload_id = %upload.upload_id, error = %err, "could not reindex upload");
        }
    }
}

fn validate_embargo(embargo_length: u32) -> Result<()> {
    if embargo_length > MAX_EMBARGO_MONTHS {
        return Err(QuarryError::bad_request(format!(
            "embargo length must be between 0 and {MAX_EMBARGO_MONTHS} months"
        )));
    }
    Ok(())
}

/// The pack input: every entry with its embargo flag resolved from the
/// upload's embargo length at this moment.
fn pack_entries(ctx: &Arc<ProcessingContext>, upload: &UploadRecord) -> Result<Vec<PackEntry>> {
    let with_embargo = upload.embargo_length > 0;
    Ok(ctx
        .store
        .get_entries(&upload.upload_id)?
        .into_iter()
        .map(|entry| PackEntry {
            entry_id: entry.entry_id,
            mainfile: entry.mainfile,
            with_embargo,
        })
        .collect())
}

// ============================================================================
// Worker jobs
// ============================================================================

/// Worker body for an upload job: file operations, matching, entry dispatch.
pub(crate) fn run_upload_job(
    ctx: &Arc<ProcessingContext>,
    upload_id: &UploadId,
    file_operation: Option<FileOperation>,
) -> Result<()> {
    let result = process_upload_inner(ctx, upload_id, file_operation);
    if let Err(err) = &result {
        error!(upload_id = %upload_id, error = %err, "processing failed");
        // Remove the staging copy of published uploads so the public files
        // stay canonical.
        if let Ok(upload) = ctx.store.get_upload(upload_id) {
            if upload.published() && StagingUploadFiles::exists(&ctx.layout, upload_id) {
                if let Ok(staging) = StagingUploadFiles::open(&ctx.layout, upload_id) {
                    let _ = staging.delete();
                }
            }
        }
        ctx.store
            .finish_process(upload_id, ProcessStatus::Failure, &[err.to_string()])?;
    }
    result
}

fn process_upload_inner(
    ctx: &Arc<ProcessingContext>,
    upload_id: &UploadId,
    file_operation: Option<FileOperation>,
) -> Result<()> {
    ctx.store.set_upload_status(
        upload_id,
        ProcessStatus::Running,
        Some("starting to process"),
    )?;
    let upload = ctx.store.get_upload(upload_id)?;
    update_files(ctx, &upload, file_operation)?;
    parse_all(ctx, &upload)?;
    // Uploads without any entry join immediately.
    check_join(ctx, upload_id)
}

/// Execute the pending file operation; published uploads are extracted back
/// to staging first.
fn update_files(
    ctx: &Arc<ProcessingContext>,
    upload: &UploadRecord,
    file_operation: Option<FileOperation>,
) -> Result<()> {
    let upload_id = &upload.upload_id;
    if upload.published() && PublicUploadFiles::exists(&ctx.layout, upload_id) {
        ctx.store.set_upload_status(
            upload_id,
            ProcessStatus::Running,
            Some("refreshing staging files"),
        )?;
        if StagingUploadFiles::exists(&ctx.layout, upload_id) {
            StagingUploadFiles::open(&ctx.layout, upload_id)?.delete()?;
        }
        let public = PublicUploadFiles::open(&ctx.layout, upload_id)?;
        public.to_staging()?;
    } else if !StagingUploadFiles::exists(&ctx.layout, upload_id) {
        StagingUploadFiles::create(&ctx.layout, upload_id)?;
    }

    let staging = StagingUploadFiles::open(&ctx.layout, upload_id)?;
    match file_operation {
        Some(FileOperation::Add {
            path,
            target_dir,
            temporary,
        }) => {
            ctx.store
                .set_upload_status(upload_id, ProcessStatus::Running, Some("adding files"))?;
            staging.add_rawfiles(&path, &target_dir, temporary)
        }
        Some(FileOperation::Delete { path }) => {
            ctx.store
                .set_upload_status(upload_id, ProcessStatus::Running, Some("deleting files"))?;
            staging.delete_rawfiles(&path)
        }
        None => Ok(()),
    }
}

/// Identify mainfile/parser combinations, reconcile the entry set and
/// dispatch per-entry jobs.
fn parse_all(ctx: &Arc<ProcessingContext>, upload: &UploadRecord) -> Result<()> {
    let upload_id = &upload.upload_id;
    ctx.store
        .set_upload_status(upload_id, ProcessStatus::Running, Some("parsing all files"))?;

    let staging = StagingUploadFiles::open(&ctx.layout, upload_id)?;
    let metadata = metadata_file::load_root(&staging);
    let settings = &ctx.config.reprocess;
    let published = upload.published();

    if !published {
        apply_upload_metadata_file(ctx, upload_id, &metadata)?;
    }

    // Match all raw files.
    let mut matched: Vec<(RawPath, &'static str)> = Vec::new();
    for info in staging.raw_directory_list(&RawPath::root(), true, true, None)? {
        if let Err(err) = staging.preprocess_potcar(&info.path) {
            warn!(path = %info.path, error = %err, "could not preprocess file");
        }
        if metadata.skip_matching && !metadata.entries.contains_key(info.path.as_str()) {
            continue;
        }
        let os_path = staging.raw_os_path(&info.path);
        match ctx.matcher.match_parser(info.path.as_str(), &os_path, true) {
            Ok(Some(parser_name)) => matched.push((info.path, parser_name)),
            Ok(None) => {}
            Err(err) => {
                warn!(mainfile = %info.path, error = %err, "exception while matching potential mainfile");
            }
        }
    }

    // Reconcile with the existing entry set.
    let old_entries: HashMap<EntryId, EntryRecord> = ctx
        .store
        .get_entries(upload_id)?
        .into_iter()
        .map(|entry| (entry.entry_id.clone(), entry))
        .collect();
    let mut matched_ids: HashSet<EntryId> = HashSet::new();

    for (mainfile, parser_name) in matched {
        let entry_id = generate_entry_id(upload_id, mainfile.as_str());
        match old_entries.get(&entry_id) {
            Some(existing) => {
                if !published && existing.parser_name != parser_name {
                    ctx.store.update_entry_parser(&entry_id, parser_name)?;
                }
                matched_ids.insert(entry_id);
            }
            None => {
                if !published || settings.add_newfound_entries_to_published {
                    let record = EntryRecord::new(
                        entry_id.clone(),
                        upload_id.clone(),
                        mainfile,
                        parser_name,
                    );
                    ctx.store.insert_entry(&record)?;
                    matched_ids.insert(entry_id);
                }
            }
        }
    }

    // Entries whose mainfile vanished or no longer parses.
    let mut deleted = 0usize;
    for (entry_id, _) in old_entries.iter() {
        if matched_ids.contains(entry_id) {
            continue;
        }
        if !published || settings.delete_unmatched_published_entries {
            if let Err(err) = ctx.search.delete_entry(entry_id) {
                warn!(entry_id = %entry_id, error = %err, "could not delete entry from search index");
            }
            ctx.store.delete_entry(entry_id)?;
            deleted += 1;
        }
    }
    if deleted > 0 {
        warn!(upload_id = %upload_id, count = deleted, "some entries are disappearing");
    }

    // Reset everything that remains and dispatch.
    ctx.store.reset_entries(upload_id)?;
    ctx.store.set_upload_status(
        upload_id,
        ProcessStatus::WaitingForResult,
        Some("waiting for entry results"),
    )?;
    for entry_id in ctx.store.pending_entries(upload_id)? {
        ctx.queue.push(Job::ProcessEntry {
            upload_id: upload_id.clone(),
            entry_id,
        });
    }
    Ok(())
}

/// Apply the editable upload keys of the raw metadata file to the record.
fn apply_upload_metadata_file(
    ctx: &Arc<ProcessingContext>,
    upload_id: &UploadId,
    metadata: &metadata_file::RawMetadataFile,
) -> Result<()> {
    if metadata.upload_name.is_none()
        && metadata.embargo_length.is_none()
        && metadata.coauthors.is_none()
        && metadata.reviewers.is_none()
        && metadata.license.is_none()
    {
        return Ok(());
    }

    let mut upload = ctx.store.get_upload(upload_id)?;
    if let Some(upload_name) = &metadata.upload_name {
        upload.upload_name = Some(upload_name.clone());
    }
    if let Some(embargo_length) = metadata.embargo_length {
        if embargo_length <= MAX_EMBARGO_MONTHS {
            upload.embargo_length = embargo_length;
        } else {
            warn!(upload_id = %upload_id, embargo_length, "ignoring invalid embargo in metadata file");
        }
    }
    if let Some(license) = &metadata.license {
        upload.license = license.clone();
    }
    for (field, values) in [
        (&mut upload.coauthors, &metadata.coauthors),
        (&mut upload.reviewers, &metadata.reviewers),
    ] {
        if let Some(values) = values {
            let (known, unknown): (Vec<String>, Vec<String>) = values
                .iter()
                .cloned()
                .partition(|user_id| ctx.users.exists(user_id));
            if !unknown.is_empty() {
                warn!(upload_id = %upload_id, ?unknown, "ignoring unknown users in metadata file");
            }
            *field = known;
        }
    }
    ctx.store.save_upload(&upload)
}

/// Evaluate the join condition; the CAS winner runs the upload-level
/// cleanup exactly once and finishes the process.
pub(crate) fn check_join(ctx: &Arc<ProcessingContext>, upload_id: &UploadId) -> Result<()> {
    let upload = ctx.store.get_upload(upload_id)?;
    if upload.process_status != ProcessStatus::WaitingForResult {
        return Ok(());
    }
    let total = ctx.store.total_entries(upload_id)?;
    let processed = ctx.store.processed_entries(upload_id)?;
    if processed < total {
        return Ok(());
    }
    if !ctx.store.try_join(upload_id)? {
        // The join was already done due to a prior call.
        return Ok(());
    }
    info!(upload_id = %upload_id, total, "join");

    // Phonon entries are enriched before cleanup, from the entries they
    // reference.
    for entry in ctx.store.get_entries(upload_id)? {
        if ctx
            .registry
            .same_parser(&entry.parser_name, "parsers/phonopy")
        {
            entry::process_phonon(ctx, upload_id, &entry.entry_id);
        }
    }

    match cleanup(ctx, upload_id) {
        Ok(()) => ctx
            .store
            .finish_process(upload_id, ProcessStatus::Success, &[]),
        Err(err) => {
            error!(upload_id = %upload_id, error = %err, "cleanup failed");
            ctx.store
                .finish_process(upload_id, ProcessStatus::Failure, &[err.to_string()])
        }
    }
}

/// Upload-level cleanup: refresh the index, notify, and pack or repack.
fn cleanup(ctx: &Arc<ProcessingContext>, upload_id: &UploadId) -> Result<()> {
    let mut upload = ctx.store.get_upload(upload_id)?;
    ctx.store
        .set_upload_status(upload_id, ProcessStatus::WaitingForResult, Some("cleanup"))?;

    if let Err(err) = ctx.search.refresh() {
        warn!(upload_id = %upload_id, error = %err, "could not refresh search index");
    }
    if !upload.publish_directly {
        ctx.notifier.processing_completed(&upload);
    }

    if upload.published() {
        // A reprocessed published upload: move the new packed files over the
        // old ones, then drop the staging copy.
        info!(upload_id = %upload_id, "started to repack re-processed upload");
        let staging = StagingUploadFiles::open(&ctx.layout, upload_id)?;
        let entries = pack_entries(ctx, &upload)?;
        staging.pack(
            &entries,
            &PackOptions {
                mode: PackMode::Repack,
                auxfile_cutoff: ctx.config.process.auxfile_cutoff,
                target_dir: ctx.layout.public_dir(upload_id),
            },
        )?;
        staging.delete()?;
        upload.last_update = Some(Utc::now());
        ctx.store.save_upload(&upload)?;
    } else if upload.publish_directly
        && ctx
            .store
            .count_entries(upload_id, Some(ProcessStatus::Success))?
            > 0
    {
        info!(upload_id = %upload_id, "started to publish upload directly");
        let staging = StagingUploadFiles::open(&ctx.layout, upload_id)?;
        let entries = pack_entries(ctx, &upload)?;
        let mode = if staging.is_frozen() {
            PackMode::Repack
        } else {
            PackMode::Pack
        };
        staging.pack(
            &entries,
            &PackOptions {
                mode,
                auxfile_cutoff: ctx.config.process.auxfile_cutoff,
                target_dir: ctx.layout.public_dir(upload_id),
            },
        )?;
        staging.delete()?;
        let now = Utc::now();
        upload.publish_time = Some(now);
        upload.last_update = Some(now);
        ctx.store.save_upload(&upload)?;
    }
    Ok(())
}
