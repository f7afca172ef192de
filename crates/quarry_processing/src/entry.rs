//! Per-entry processing: parse, normalize, archive, index.

use chrono::Utc;
use quarry_files::{PublicUploadFiles, StagingUploadFiles};
use quarry_match::{LogLevel, LogRecord, ParseLogger, RecordingLogger};
use quarry_protocol::{
    generate_entry_id, EntryRecord, ProcessStatus, QuarryError, RawPath, Result, SystemMetadata,
    UploadId, UploadRecord, QUARRY_COMMIT, QUARRY_VERSION,
};
use quarry_search::SearchDocument;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::ProcessingContext;
use crate::metadata_file;

/// Processing log lists longer than this drop their debug records.
const MAX_UNFILTERED_LOGS: usize = 100;

/// Worker body for one entry job.
pub fn run_entry_job(
    ctx: &Arc<ProcessingContext>,
    upload_id: &UploadId,
    entry_id: &quarry_protocol::EntryId,
) -> Result<()> {
    // The claim is the PENDING -> RUNNING CAS; losing it means the entry was
    // already taken or deleted meanwhile.
    if !ctx.store.try_claim_entry(entry_id)? {
        return Ok(());
    }
    let upload = ctx.store.get_upload(upload_id)?;
    let mut entry = ctx.store.get_entry(entry_id)?;
    entry.process_status = ProcessStatus::Running;

    match process_entry(ctx, &upload, &mut entry) {
        Ok(()) => {
            entry.process_status = ProcessStatus::Success;
        }
        Err(err) => {
            warn!(entry_id = %entry_id, error = %err, "entry processing failed");
            entry.process_status = ProcessStatus::Failure;
            entry.errors.push(err.to_string());
        }
    }
    entry.last_processing_time = Some(Utc::now());
    ctx.store.save_entry(&entry)?;

    crate::upload::check_join(ctx, upload_id)
}

/// The per-entry pipeline. On error the entry fails; whatever archive data
/// was produced is still written for forensics.
pub fn process_entry(
    ctx: &Arc<ProcessingContext>,
    upload: &UploadRecord,
    entry: &mut EntryRecord,
) -> Result<()> {
    let staging = StagingUploadFiles::open(&ctx.layout, &upload.upload_id)?;
    let mut logger = RecordingLogger::new();

    // 1. Determine whether to parse or preserve.
    logger.set_step("determining action");
    let initial_processing = entry.system.quarry_version.is_none();
    let mut should_parse = !upload.published() || initial_processing;
    if !should_parse {
        let settings = &ctx.config.reprocess;
        if settings.reparse_if_parser_unchanged || settings.reparse_if_parser_changed {
            let os_path = staging.raw_os_path(&entry.mainfile);
            match ctx
                .matcher
                .match_parser(entry.mainfile.as_str(), &os_path, false)?
            {
                None => {
                    // Only possible when unmatched published entries are kept.
                    logger.warning("no parser matches during re-process, not updating the entry");
                    entry
                        .warnings
                        .push("no matching parser found during processing".to_string());
                }
                Some(parser_name) => {
                    let parser_changed =
                        !ctx.registry.same_parser(&entry.parser_name, parser_name);
                    if (settings.reparse_if_parser_unchanged && !parser_changed)
                        || (settings.reparse_if_parser_changed && parser_changed)
                    {
                        should_parse = true;
                        if entry.parser_name != parser_name {
                            info!(parser = parser_name, "parser changed or renamed during re-process");
                            entry.parser_name = parser_name.to_string();
                        }
                    }
                }
            }
        }
    }

    if !should_parse {
        // 2b. Keep the published entry verbatim: copy the old archive record
        // from the public msg archive into staging unchanged.
        logger.set_step("preserving entry data");
        let public = PublicUploadFiles::open(&ctx.layout, &upload.upload_id)?;
        let (archive, _) = public.read_archive(&entry.entry_id)?;
        staging.write_archive(&entry.entry_id, &archive)?;
        return Ok(());
    }

    // 2a. Initialize metadata.
    logger.set_step("initializing metadata");
    let cutoff = ctx.config.process.auxfile_cutoff;
    let files = staging.entry_files(&entry.mainfile, cutoff)?;
    let dir_file_count = staging
        .raw_directory_list(&entry.mainfile.parent(), false, true, None)?
        .len();
    if dir_file_count > cutoff {
        logger.warning("this entry has many aux files in its directory");
        entry
            .warnings
            .push("this entry has many aux files in its directory".to_string());
    }
    entry.entry_hash = Some(staging.entry_hash(&files)?);
    entry.system = SystemMetadata {
        quarry_version: Some(QUARRY_VERSION.to_string()),
        quarry_commit: Some(QUARRY_COMMIT.to_string()),
    };
    if initial_processing {
        if let Some(metadata) = metadata_file::entry_metadata_for(&staging, &entry.mainfile) {
            entry.metadata = metadata;
        }
    }

    let mut archive = serde_json::json!({});
    let mut failure: Option<QuarryError> = None;

    // 3. Parse.
    logger.set_step("parsing");
    let registered = ctx.registry.get(&entry.parser_name).ok_or_else(|| {
        QuarryError::bad_request(format!("unknown parser: {}", entry.parser_name))
    })?;
    let os_path = staging.raw_os_path(&entry.mainfile);
    if let Err(err) = registered.parser.parse(&os_path, &mut archive, &mut logger) {
        logger.error(&format!("parser failed with exception: {err}"));
        failure = Some(match err {
            err @ QuarryError::ParserFailure { .. } => err,
            other => QuarryError::ParserFailure {
                parser: entry.parser_name.clone(),
                message: other.to_string(),
            },
        });
    } else if !archive.is_object() {
        logger.error("parser produced a non-object archive");
        failure = Some(QuarryError::ParserFailure {
            parser: entry.parser_name.clone(),
            message: "parser produced a non-object archive".to_string(),
        });
        archive = serde_json::json!({});
    }

    // 4. Normalize.
    if failure.is_none() {
        logger.set_step("normalizing");
        for normalizer in &ctx.normalizers {
            if let Some(domain) = normalizer.domain() {
                if domain != registered.spec.domain {
                    continue;
                }
            }
            if let Err(err) = normalizer.normalize(&mut archive, &mut logger) {
                logger.error(&format!("normalizer failed with exception: {err}"));
                failure = Some(QuarryError::NormalizerFailure {
                    normalizer: normalizer.name().to_string(),
                    message: err.to_string(),
                });
                break;
            }
        }
    }

    // 5. Archive write; a minimal archive is still written when it fails.
    logger.set_step("archiving");
    let processed = failure.is_none();
    archive["metadata"] = entry_metadata_json(upload, entry, &files, processed);
    copy_errors(&logger, entry);
    archive["processing_logs"] = logs_json(logger.records());

    if let Err(err) = staging.write_archive(&entry.entry_id, &archive) {
        let minimal = serde_json::json!({
            "metadata": entry_metadata_json(upload, entry, &files, false),
            "processing_logs": logs_json(logger.records()),
        });
        let _ = staging.write_archive(&entry.entry_id, &minimal);
        failure.get_or_insert(QuarryError::ArchiveWriteFailure(err.to_string()));
    }

    // The pruned projection the search indexer consumes.
    let partial = serde_json::json!({
        "entry_id": entry.entry_id,
        "upload_id": entry.upload_id,
        "mainfile": entry.mainfile,
        "parser_name": entry.parser_name,
        "processed": processed,
        "results": archive.get("results").cloned().unwrap_or(serde_json::json!({})),
    });
    if let Err(err) = ctx
        .store
        .write_partial_archive(&entry.entry_id, &upload.upload_id, &partial)
    {
        warn!(entry_id = %entry.entry_id, error = %err, "could not write partial archive");
    }

    // 6. Index; failure fails the entry but the archive write is preserved.
    let document = SearchDocument {
        entry_id: entry.entry_id.clone(),
        upload_id: upload.upload_id.clone(),
        payload: partial,
    };
    if let Err(err) = ctx.search.index_entry(document, true) {
        warn!(entry_id = %entry.entry_id, error = %err, "could not index entry");
        failure.get_or_insert(QuarryError::SearchIndexFailure(err.to_string()));
    }

    match failure {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// The post-join step for phonon entries: re-open the archive and merge
/// method information from the entry it references. Errors downgrade the
/// entry but never fail it.
pub fn process_phonon(ctx: &Arc<ProcessingContext>, upload_id: &UploadId, entry_id: &quarry_protocol::EntryId) {
    let result = (|| -> Result<()> {
        let staging = StagingUploadFiles::open(&ctx.layout, upload_id)?;
        let mut archive = staging.read_archive(entry_id)?;

        let reference = archive
            .get("references")
            .and_then(|refs| refs.get(0))
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .ok_or_else(|| {
                QuarryError::bad_request("no calculation reference found in phonon archive")
            })?;
        let reference = RawPath::new(reference)?;
        let ref_id = generate_entry_id(upload_id, reference.as_str());

        let ref_archive = staging.read_archive(&ref_id)?;
        let method = ref_archive
            .get("results")
            .and_then(|results| results.get("method"))
            .cloned()
            .ok_or_else(|| {
                QuarryError::bad_request("no method information available in referenced entry")
            })?;

        archive["results"]["method"] = method;
        archive["metadata"]["last_processing_time"] = serde_json::json!(Utc::now());
        staging.write_archive(entry_id, &archive)?;
        Ok(())
    })();

    if let Err(err) = result {
        warn!(entry_id = %entry_id, error = %err, "could not enrich phonon entry");
        if let Ok(mut entry) = ctx.store.get_entry(entry_id) {
            entry.warnings.push(format!(
                "could not retrieve method information for phonon calculation: {err}"
            ));
            let _ = ctx.store.save_entry(&entry);
        }
    }
}

fn entry_metadata_json(
    upload: &UploadRecord,
    entry: &EntryRecord,
    files: &[RawPath],
    processed: bool,
) -> serde_json::Value {
    serde_json::json!({
        "entry_id": entry.entry_id,
        "upload_id": entry.upload_id,
        "mainfile": entry.mainfile,
        "parser_name": entry.parser_name,
        "entry_hash": entry.entry_hash,
        "files": files,
        "with_embargo": upload.embargo_length > 0,
        "quarry_version": entry.system.quarry_version,
        "quarry_commit": entry.system.quarry_commit,
        "entry_coauthors": entry.metadata.entry_coauthors,
        "datasets": entry.metadata.datasets,
        "references": entry.metadata.references,
        "comment": entry.metadata.comment,
        "external_id": entry.metadata.external_id,
        "processed": processed,
    })
}

fn copy_errors(logger: &RecordingLogger, entry: &mut EntryRecord) {
    for record in logger.records() {
        if record.level == LogLevel::Error {
            entry.errors.push(record.event.clone());
        }
    }
}

/// Serialize captured logs; long lists drop their debug records.
fn logs_json(records: &[LogRecord]) -> serde_json::Value {
    if records.len() > MAX_UNFILTERED_LOGS {
        let filtered: Vec<&LogRecord> = records
            .iter()
            .filter(|record| record.level != LogLevel::Debug)
            .collect();
        serde_json::json!(filtered)
    } else {
        serde_json::json!(records)
    }
}
