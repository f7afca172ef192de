//! Export and import of upload bundles.
//!
//! Export collects the upload's records and files into the portable bundle
//! shape. Import is transactional with respect to the target upload: every
//! sanity check runs before anything is created, and any later failure rolls
//! back everything created (or, when rollback is disabled, keeps the upload
//! but removes it from the search index).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use quarry_files::{
    version_at_least, AccessClass, BundleDataset, BundleExportOptions, BundleInfo, BundleReader,
    BundleSource, BundleWriter, PublicUploadFiles, StagingUploadFiles,
};
use quarry_protocol::{
    generate_entry_id, ProcessStatus, QuarryError, RawPath, Result, UploadId, UploadProcess,
    UploadRecord, QUARRY_COMMIT, QUARRY_VERSION,
};
use quarry_search::SearchDocument;
use quarry_state::DatasetRecord;
use tracing::{info, warn};

use crate::context::ProcessingContext;

/// Where an exported bundle goes.
#[derive(Debug)]
pub enum ExportTarget {
    /// A zip file on disk.
    Zip(PathBuf),
    /// An uncompressed directory; `move_files` moves instead of copying.
    Dir { path: PathBuf, move_files: bool },
}

fn import_err(message: impl Into<String>) -> QuarryError {
    QuarryError::BundleImportFailure(message.into())
}

// ============================================================================
// Export
// ============================================================================

pub fn export_bundle(
    ctx: &Arc<ProcessingContext>,
    upload_id: &UploadId,
    options: BundleExportOptions,
    target: ExportTarget,
) -> Result<()> {
    let upload = ctx.store.get_upload(upload_id)?;
    if upload.process_status.is_processing() {
        return Err(QuarryError::ProcessAlreadyRunning);
    }
    let entries = ctx.store.get_entries(upload_id)?;

    let datasets = if options.include_datasets {
        let mut names: HashSet<&str> = HashSet::new();
        for entry in &entries {
            names.extend(entry.metadata.datasets.iter().map(|name| name.as_str()));
        }
        let mut datasets = Vec::new();
        for name in names {
            if let Some(dataset) = ctx.store.get_dataset_by_name(name)? {
                datasets.push(BundleDataset {
                    dataset_id: dataset.dataset_id,
                    dataset_name: dataset.dataset_name,
                    user_id: dataset.user_id,
                });
            }
        }
        datasets.sort_by(|a, b| a.dataset_name.cmp(&b.dataset_name));
        Some(datasets)
    } else {
        None
    };

    let info = BundleInfo::new(
        BundleSource {
            version: QUARRY_VERSION.to_string(),
            commit: QUARRY_COMMIT.to_string(),
            deployment: "quarry".to_string(),
            deployment_id: ctx.config.deployment_id.clone(),
        },
        options,
        upload.clone(),
        entries.clone(),
        datasets,
    );
    let mut writer = BundleWriter::new(info);

    if upload.published() {
        let public = PublicUploadFiles::open(&ctx.layout, upload_id)?;
        if options.include_raw_files {
            // No partial export: the restricted raw files travel with the
            // public ones or not at all.
            for access in AccessClass::ALL {
                let name = ctx.layout.raw_zip_name(*access);
                let path = public.raw_zip_path(*access);
                if !path.is_file() {
                    return Err(QuarryError::bad_request(format!(
                        "refusing partial export, missing {name}"
                    )));
                }
                writer.add_file(name, path);
            }
        }
        if options.include_archive_files {
            for access in AccessClass::ALL {
                let path = public.msg_archive_path(*access);
                if path.is_file() {
                    writer.add_file(ctx.layout.msg_archive_name(*access), path);
                }
            }
        }
    } else {
        let staging = StagingUploadFiles::open(&ctx.layout, upload_id)?;
        if options.include_raw_files {
            for file in staging.raw_directory_list(&RawPath::root(), true, true, None)? {
                writer.add_file(format!("raw/{}", file.path), staging.raw_os_path(&file.path));
            }
        }
        if options.include_archive_files {
            for entry in &entries {
                let path = staging.archive_path(&entry.entry_id);
                if path.is_file() {
                    writer.add_file(format!("archive/{}.msg", entry.entry_id), path);
                }
            }
        }
    }

    match target {
        ExportTarget::Zip(path) => writer.write_zip(&path),
        ExportTarget::Dir { path, move_files } => writer.write_dir(&path, move_files),
    }
}

// ============================================================================
// Import
// ============================================================================

pub fn import_bundle(ctx: &Arc<ProcessingContext>, bundle_path: &Path) -> Result<UploadRecord> {
    let reader = BundleReader::open(bundle_path)?;
    // Missing required keys surface here.
    let info = reader.bundle_info()?;

    check_bundle(ctx, &reader, &info)?;

    let upload_id = info.upload_id.clone();
    if ctx.store.try_get_upload(&upload_id)?.is_some() {
        return Err(import_err(format!("upload {upload_id} already exists")));
    }

    // Datasets by the same name are reused iff their owner matches.
    let mut created_datasets: Vec<String> = Vec::new();
    for dataset in info.datasets.iter().flatten() {
        match ctx.store.get_dataset_by_name(&dataset.dataset_name)? {
            Some(existing) => {
                if existing.user_id != dataset.user_id {
                    rollback_datasets(ctx, &created_datasets);
                    return Err(import_err(format!(
                        "dataset '{}' exists with a different owner",
                        dataset.dataset_name
                    )));
                }
            }
            None => {
                ctx.store.create_dataset(&DatasetRecord {
                    dataset_id: dataset.dataset_id.clone(),
                    dataset_name: dataset.dataset_name.clone(),
                    user_id: dataset.user_id.clone(),
                })?;
                created_datasets.push(dataset.dataset_id.clone());
            }
        }
    }

    let result = materialize(ctx, &reader, &info);
    match result {
        Ok(record) => {
            info!(upload_id = %upload_id, entries = info.entries.len(), "imported bundle");
            Ok(record)
        }
        Err(err) => {
            if ctx.config.bundle_import.delete_upload_on_fail {
                rollback(ctx, &upload_id, &created_datasets);
            } else {
                // Keep the upload but make it invisible to search.
                let _ = ctx
                    .search
                    .delete_upload(&upload_id)
                    .and_then(|_| ctx.search.refresh());
                let _ = ctx.store.finish_process(
                    &upload_id,
                    ProcessStatus::Failure,
                    &[err.to_string()],
                );
            }
            Err(err)
        }
    }
}

/// All sanity checks; nothing is created while these run.
fn check_bundle(
    ctx: &Arc<ProcessingContext>,
    reader: &BundleReader,
    info: &BundleInfo,
) -> Result<()> {
    let settings = &ctx.config.bundle_import;

    if !version_at_least(&info.source.version, &settings.required_quarry_version) {
        return Err(import_err(format!(
            "bundle source version {} is older than the required {}",
            info.source.version, settings.required_quarry_version
        )));
    }

    let from_oasis = info.source.deployment_id != ctx.config.deployment_id;
    if from_oasis {
        if !settings.allow_bundles_from_oasis {
            return Err(import_err("bundles from oasis deployments are not allowed"));
        }
        if !info.upload.published() && !settings.allow_unpublished_bundles_from_oasis {
            return Err(import_err(
                "unpublished bundles from oasis deployments are not allowed",
            ));
        }
    }

    // The requested include flags must be satisfied by the bundle contents.
    if info.upload.published() {
        if info.export_options.include_raw_files {
            for access in AccessClass::ALL {
                let name = ctx.layout.raw_zip_name(*access);
                if !reader.has_member(&name) {
                    return Err(import_err(format!("bundle is missing {name}")));
                }
            }
        }
        if info.export_options.include_archive_files
            && !reader.has_member(&ctx.layout.msg_archive_name(AccessClass::Public))
            && !reader.has_member(&ctx.layout.msg_archive_name(AccessClass::Restricted))
        {
            return Err(import_err("bundle is missing its msg archives"));
        }
    }

    // Every referenced user must resolve.
    let mut user_ids: HashSet<&str> = HashSet::new();
    user_ids.insert(info.upload.main_author.as_str());
    user_ids.extend(info.upload.coauthors.iter().map(|id| id.as_str()));
    user_ids.extend(info.upload.reviewers.iter().map(|id| id.as_str()));
    for entry in &info.entries {
        user_ids.extend(entry.metadata.entry_coauthors.iter().map(|id| id.as_str()));
    }
    for dataset in info.datasets.iter().flatten() {
        user_ids.insert(dataset.user_id.as_str());
    }
    for user_id in user_ids {
        if !ctx.users.exists(user_id) {
            return Err(import_err(format!("unknown user referenced: {user_id}")));
        }
    }

    // Timestamps must not lie in the future (2 minutes tolerance).
    let horizon = Utc::now() + Duration::minutes(2);
    let check_time = |label: &str, time: Option<DateTime<Utc>>| -> Result<()> {
        match time {
            Some(time) if time > horizon => Err(import_err(format!(
                "{label} lies in the future: {time}"
            ))),
            _ => Ok(()),
        }
    };
    check_time("upload_create_time", Some(info.upload.upload_create_time))?;
    check_time("publish_time", info.upload.publish_time)?;
    check_time("last_update", info.upload.last_update)?;

    if info.entry_count() != info.entries.len() {
        return Err(import_err(format!(
            "bundle claims {} entries but carries {}",
            info.entry_count(),
            info.entries.len()
        )));
    }
    for entry in &info.entries {
        check_time("entry_create_time", Some(entry.entry_create_time))?;
        check_time("last_processing_time", entry.last_processing_time)?;
        if entry.upload_id != info.upload_id {
            return Err(import_err(format!(
                "entry {} belongs to a different upload",
                entry.entry_id
            )));
        }
        let expected = generate_entry_id(&info.upload_id, entry.mainfile.as_str());
        if entry.entry_id != expected {
            return Err(import_err(format!(
                "entry id {} does not match its mainfile {}",
                entry.entry_id, entry.mainfile
            )));
        }
        if !entry.process_status.is_not_processing() {
            return Err(import_err(format!(
                "entry {} is in processing status {}",
                entry.entry_id, entry.process_status
            )));
        }
    }

    Ok(())
}

/// Create the records and files. Anything this creates is undone by
/// `rollback` if a later step fails.
fn materialize(
    ctx: &Arc<ProcessingContext>,
    reader: &BundleReader,
    info: &BundleInfo,
) -> Result<UploadRecord> {
    let upload_id = &info.upload_id;
    let mut upload = info.upload.clone();
    upload.process_status = ProcessStatus::Running;
    upload.current_process = Some(UploadProcess::ImportBundle);
    upload.joined = false;
    upload.from_oasis = info.source.deployment_id != ctx.config.deployment_id;
    if upload.from_oasis {
        upload.oasis_deployment_id = Some(info.source.deployment_id.clone());
    }
    if !ctx.config.bundle_import.keep_original_timestamps && upload.published() {
        upload.publish_time = Some(Utc::now());
    }
    ctx.store.create_upload(&upload)?;

    for entry in &info.entries {
        ctx.store.insert_entry(entry)?;
    }

    // Files.
    if upload.published() {
        let public_dir = ctx.layout.public_dir(upload_id);
        for access in AccessClass::ALL {
            for name in [
                ctx.layout.raw_zip_name(*access),
                ctx.layout.msg_archive_name(*access),
            ] {
                if reader.has_member(&name) {
                    reader.extract_member(&name, &public_dir.join(&name))?;
                }
            }
        }
    } else {
        let staging = StagingUploadFiles::create(&ctx.layout, upload_id)?;
        for member in reader.member_names()? {
            if let Some(raw_name) = member.strip_prefix("raw/") {
                let path = RawPath::new(raw_name)
                    .map_err(|_| import_err(format!("unsafe raw path in bundle: {member}")))?;
                reader.extract_member(&member, &staging.raw_os_path(&path))?;
            } else if member.starts_with("archive/") {
                reader.extract_member(&member, &staging.base_dir().join(&member))?;
            }
        }
    }

    // Index the imported entries.
    for entry in &info.entries {
        let payload = serde_json::json!({
            "entry_id": entry.entry_id,
            "upload_id": entry.upload_id,
            "mainfile": entry.mainfile,
            "parser_name": entry.parser_name,
            "processed": entry.processed(),
            "published": upload.published(),
            "with_embargo": upload.with_embargo(),
        });
        ctx.store
            .write_partial_archive(&entry.entry_id, upload_id, &payload)?;
        if let Err(err) = ctx.search.index_entry(
            SearchDocument {
                entry_id: entry.entry_id.clone(),
                upload_id: upload_id.clone(),
                payload,
            },
            true,
        ) {
            warn!(entry_id = %entry.entry_id, error = %err, "could not index imported entry");
        }
    }
    if let Err(err) = ctx.search.refresh() {
        warn!(upload_id = %upload_id, error = %err, "could not refresh search index");
    }

    ctx.store
        .finish_process(upload_id, ProcessStatus::Success, &[])?;
    ctx.store.get_upload(upload_id)
}

fn rollback(ctx: &Arc<ProcessingContext>, upload_id: &UploadId, created_datasets: &[String]) {
    warn!(upload_id = %upload_id, "rolling back failed bundle import");
    let _ = ctx
        .search
        .delete_upload(upload_id)
        .and_then(|_| ctx.search.refresh());
    if StagingUploadFiles::exists(&ctx.layout, upload_id) {
        if let Ok(staging) = StagingUploadFiles::open(&ctx.layout, upload_id) {
            let _ = staging.delete();
        }
    }
    let public_dir = ctx.layout.public_dir(upload_id);
    if public_dir.exists() {
        let _ = std::fs::remove_dir_all(&public_dir);
    }
    let _ = ctx.store.delete_upload(upload_id);
    rollback_datasets(ctx, created_datasets);
}

fn rollback_datasets(ctx: &Arc<ProcessingContext>, created_datasets: &[String]) {
    for dataset_id in created_datasets {
        let _ = ctx.store.delete_dataset(dataset_id);
    }
}
