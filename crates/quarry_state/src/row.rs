//! Row <-> record mapping.

use chrono::{DateTime, Utc};
use quarry_protocol::{
    EntryId, EntryMetadata, EntryRecord, ProcessStatus, QuarryError, RawPath, Result,
    SystemMetadata, UploadId, UploadProcess, UploadRecord,
};
use rusqlite::Row;

pub const UPLOAD_COLUMNS: &str = "upload_id, upload_name, main_author, coauthors, reviewers, \
     upload_create_time, publish_time, last_update, embargo_length, license, from_oasis, \
     oasis_deployment_id, published_to, publish_directly, process_status, current_process, \
     last_status_message, errors, warnings, joined";

pub const ENTRY_COLUMNS: &str = "entry_id, upload_id, mainfile, parser_name, entry_create_time, \
     last_processing_time, entry_hash, process_status, errors, warnings, entry_coauthors, \
     datasets, refs, comment, external_id, quarry_version, quarry_commit";

pub fn storage_err(err: impl std::fmt::Display) -> QuarryError {
    QuarryError::Storage(err.to_string())
}

pub fn to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub fn from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub fn time_to_sql(time: &DateTime<Utc>) -> String {
    time.to_rfc3339()
}

pub fn opt_time_to_sql(time: &Option<DateTime<Utc>>) -> Option<String> {
    time.as_ref().map(time_to_sql)
}

pub fn time_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(storage_err)
}

pub fn opt_time_from_sql(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| time_from_sql(&value)).transpose()
}

pub fn upload_from_row(row: &Row<'_>) -> Result<UploadRecord> {
    let upload_id: String = row.get("upload_id").map_err(storage_err)?;
    let coauthors: String = row.get("coauthors").map_err(storage_err)?;
    let reviewers: String = row.get("reviewers").map_err(storage_err)?;
    let published_to: String = row.get("published_to").map_err(storage_err)?;
    let errors: String = row.get("errors").map_err(storage_err)?;
    let warnings: String = row.get("warnings").map_err(storage_err)?;
    let create_time: String = row.get("upload_create_time").map_err(storage_err)?;
    let publish_time: Option<String> = row.get("publish_time").map_err(storage_err)?;
    let last_update: Option<String> = row.get("last_update").map_err(storage_err)?;
    let process_status: String = row.get("process_status").map_err(storage_err)?;
    let current_process: Option<String> = row.get("current_process").map_err(storage_err)?;

    Ok(UploadRecord {
        upload_id: UploadId::parse(&upload_id)?,
        upload_name: row.get("upload_name").map_err(storage_err)?,
        main_author: row.get("main_author").map_err(storage_err)?,
        coauthors: from_json(&coauthors),
        reviewers: from_json(&reviewers),
        upload_create_time: time_from_sql(&create_time)?,
        publish_time: opt_time_from_sql(publish_time)?,
        last_update: opt_time_from_sql(last_update)?,
        embargo_length: row.get::<_, i64>("embargo_length").map_err(storage_err)? as u32,
        license: row.get("license").map_err(storage_err)?,
        from_oasis: row.get("from_oasis").map_err(storage_err)?,
        oasis_deployment_id: row.get("oasis_deployment_id").map_err(storage_err)?,
        published_to: from_json(&published_to),
        publish_directly: row.get("publish_directly").map_err(storage_err)?,
        process_status: process_status.parse::<ProcessStatus>().map_err(storage_err)?,
        current_process: current_process
            .map(|p| p.parse::<UploadProcess>().map_err(storage_err))
            .transpose()?,
        last_status_message: row.get("last_status_message").map_err(storage_err)?,
        errors: from_json(&errors),
        warnings: from_json(&warnings),
        joined: row.get("joined").map_err(storage_err)?,
    })
}

pub fn entry_from_row(row: &Row<'_>) -> Result<EntryRecord> {
    let entry_id: String = row.get("entry_id").map_err(storage_err)?;
    let upload_id: String = row.get("upload_id").map_err(storage_err)?;
    let mainfile: String = row.get("mainfile").map_err(storage_err)?;
    let create_time: String = row.get("entry_create_time").map_err(storage_err)?;
    let processing_time: Option<String> = row.get("last_processing_time").map_err(storage_err)?;
    let process_status: String = row.get("process_status").map_err(storage_err)?;
    let errors: String = row.get("errors").map_err(storage_err)?;
    let warnings: String = row.get("warnings").map_err(storage_err)?;
    let entry_coauthors: String = row.get("entry_coauthors").map_err(storage_err)?;
    let datasets: String = row.get("datasets").map_err(storage_err)?;
    let refs: String = row.get("refs").map_err(storage_err)?;

    Ok(EntryRecord {
        entry_id: EntryId::parse(&entry_id)?,
        upload_id: UploadId::parse(&upload_id)?,
        mainfile: RawPath::new(mainfile)?,
        parser_name: row.get("parser_name").map_err(storage_err)?,
        entry_create_time: time_from_sql(&create_time)?,
        last_processing_time: opt_time_from_sql(processing_time)?,
        entry_hash: row.get("entry_hash").map_err(storage_err)?,
        process_status: process_status.parse::<ProcessStatus>().map_err(storage_err)?,
        errors: from_json(&errors),
        warnings: from_json(&warnings),
        metadata: EntryMetadata {
            entry_coauthors: from_json(&entry_coauthors),
            datasets: from_json(&datasets),
            references: from_json(&refs),
            comment: row.get("comment").map_err(storage_err)?,
            external_id: row.get("external_id").map_err(storage_err)?,
        },
        system: SystemMetadata {
            quarry_version: row.get("quarry_version").map_err(storage_err)?,
            quarry_commit: row.get("quarry_commit").map_err(storage_err)?,
        },
    })
}
