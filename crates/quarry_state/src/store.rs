//! SQLite-backed state store.
//!
//! Connections are opened per operation with a busy timeout, so the store
//! value itself is cheap to clone and safe to share across worker threads.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use quarry_protocol::{
    EntryId, EntryRecord, ProcessStatus, QuarryError, Result, UploadId, UploadProcess,
    UploadRecord,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::row::{
    entry_from_row, opt_time_to_sql, storage_err, time_to_sql, to_json, upload_from_row,
    ENTRY_COLUMNS, UPLOAD_COLUMNS,
};

type SqlParams = Vec<Box<dyn rusqlite::types::ToSql>>;

fn as_params(args: &SqlParams) -> Vec<&dyn rusqlite::types::ToSql> {
    args.iter().map(|arg| arg.as_ref()).collect()
}

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Ordering for upload listings; each is broken by upload_id for stability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadOrder {
    #[default]
    CreateTime,
    PublishTime,
}

/// Filter + pagination for upload listings.
#[derive(Debug, Clone, Default)]
pub struct UploadQuery {
    pub main_author: Option<String>,
    pub process_status: Option<ProcessStatus>,
    pub published: Option<bool>,
    pub order: UploadOrder,
    /// Tuple page-after key: (order value, upload_id) of the last seen row.
    pub page_after: Option<(String, String)>,
    pub page_size: usize,
}

#[derive(Debug, Clone)]
pub struct UploadPage {
    pub uploads: Vec<UploadRecord>,
    /// Page-after key for the next page, if the page was full.
    pub next_page_after: Option<(String, String)>,
}

/// A named dataset owned by a user; referenced by entries and bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRecord {
    pub dataset_id: String,
    pub dataset_name: String,
    pub user_id: String,
}

/// Semantic store over the `uploads` and `entries` collections.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    busy_timeout_ms: u64,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    pub fn with_busy_timeout(path: impl Into<PathBuf>, busy_timeout_ms: u64) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms,
        }
    }

    fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.path).map_err(storage_err)?;
        conn.busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .map_err(storage_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(storage_err)?;
        op(&conn)
    }

    /// Create the collections and required indices.
    pub fn init(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS uploads (
                    upload_id TEXT PRIMARY KEY,
                    upload_name TEXT,
                    main_author TEXT NOT NULL,
                    coauthors TEXT NOT NULL DEFAULT '[]',
                    reviewers TEXT NOT NULL DEFAULT '[]',
                    upload_create_time TEXT NOT NULL,
                    publish_time TEXT,
                    last_update TEXT,
                    embargo_length INTEGER NOT NULL DEFAULT 0,
                    license TEXT NOT NULL,
                    from_oasis INTEGER NOT NULL DEFAULT 0,
                    oasis_deployment_id TEXT,
                    published_to TEXT NOT NULL DEFAULT '[]',
                    publish_directly INTEGER NOT NULL DEFAULT 0,
                    process_status TEXT NOT NULL,
                    current_process TEXT,
                    last_status_message TEXT,
                    errors TEXT NOT NULL DEFAULT '[]',
                    warnings TEXT NOT NULL DEFAULT '[]',
                    joined INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS uploads_main_author ON uploads(main_author);
                CREATE INDEX IF NOT EXISTS uploads_process_status ON uploads(process_status);
                CREATE INDEX IF NOT EXISTS uploads_create_time ON uploads(upload_create_time);
                CREATE INDEX IF NOT EXISTS uploads_publish_time ON uploads(publish_time);

                CREATE TABLE IF NOT EXISTS entries (
                    entry_id TEXT PRIMARY KEY,
                    upload_id TEXT NOT NULL,
                    mainfile TEXT NOT NULL,
                    parser_name TEXT NOT NULL,
                    entry_create_time TEXT NOT NULL,
                    last_processing_time TEXT,
                    entry_hash TEXT,
                    process_status TEXT NOT NULL,
                    errors TEXT NOT NULL DEFAULT '[]',
                    warnings TEXT NOT NULL DEFAULT '[]',
                    entry_coauthors TEXT NOT NULL DEFAULT '[]',
                    datasets TEXT NOT NULL DEFAULT '[]',
                    refs TEXT NOT NULL DEFAULT '[]',
                    comment TEXT,
                    external_id TEXT,
                    quarry_version TEXT,
                    quarry_commit TEXT
                );
                CREATE INDEX IF NOT EXISTS entries_upload ON entries(upload_id);
                CREATE UNIQUE INDEX IF NOT EXISTS entries_upload_mainfile
                    ON entries(upload_id, mainfile);
                CREATE INDEX IF NOT EXISTS entries_upload_status
                    ON entries(upload_id, process_status);
                CREATE INDEX IF NOT EXISTS entries_status ON entries(process_status);

                CREATE TABLE IF NOT EXISTS partial_archives (
                    entry_id TEXT PRIMARY KEY,
                    upload_id TEXT NOT NULL,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS partial_archives_upload
                    ON partial_archives(upload_id);

                CREATE TABLE IF NOT EXISTS datasets (
                    dataset_id TEXT PRIMARY KEY,
                    dataset_name TEXT NOT NULL,
                    user_id TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS datasets_name ON datasets(dataset_name);
                "#,
            )
            .map_err(storage_err)
        })
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    pub fn create_upload(&self, record: &UploadRecord) -> Result<()> {
        self.with_conn(|conn| {
            let args = upload_params(record);
            conn.execute(
                &format!(
                    "INSERT INTO uploads ({UPLOAD_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                             ?16, ?17, ?18, ?19, ?20)"
                ),
                as_params(&args).as_slice(),
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    pub fn save_upload(&self, record: &UploadRecord) -> Result<()> {
        self.with_conn(|conn| {
            let args = upload_params(record);
            let changed = conn
                .execute(
                    "UPDATE uploads SET upload_name = ?2, main_author = ?3, coauthors = ?4, \
                     reviewers = ?5, upload_create_time = ?6, publish_time = ?7, last_update = ?8, \
                     embargo_length = ?9, license = ?10, from_oasis = ?11, \
                     oasis_deployment_id = ?12, published_to = ?13, publish_directly = ?14, \
                     process_status = ?15, current_process = ?16, last_status_message = ?17, \
                     errors = ?18, warnings = ?19, joined = ?20 \
                     WHERE upload_id = ?1",
                    as_params(&args).as_slice(),
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(QuarryError::not_found(record.upload_id.to_string()));
            }
            Ok(())
        })
    }

    pub fn get_upload(&self, upload_id: &UploadId) -> Result<UploadRecord> {
        self.try_get_upload(upload_id)?
            .ok_or_else(|| QuarryError::not_found(upload_id.to_string()))
    }

    pub fn try_get_upload(&self, upload_id: &UploadId) -> Result<Option<UploadRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE upload_id = ?1"
                ))
                .map_err(storage_err)?;
            let mut rows = stmt.query(params![upload_id.as_str()]).map_err(storage_err)?;
            match rows.next().map_err(storage_err)? {
                Some(row) => Ok(Some(upload_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn delete_upload(&self, upload_id: &UploadId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM partial_archives WHERE upload_id = ?1",
                params![upload_id.as_str()],
            )
            .map_err(storage_err)?;
            conn.execute(
                "DELETE FROM entries WHERE upload_id = ?1",
                params![upload_id.as_str()],
            )
            .map_err(storage_err)?;
            conn.execute(
                "DELETE FROM uploads WHERE upload_id = ?1",
                params![upload_id.as_str()],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    pub fn count_unpublished_by_author(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM uploads \
                     WHERE main_author = ?1 AND publish_time IS NULL",
                    params![user_id],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as usize)
        })
    }

    /// Paginated upload listing with tuple page-after keys.
    pub fn list_uploads(&self, query: &UploadQuery) -> Result<UploadPage> {
        let order_column = match query.order {
            UploadOrder::CreateTime => "upload_create_time",
            UploadOrder::PublishTime => "publish_time",
        };

        let mut sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE 1=1");
        let mut args: SqlParams = Vec::new();

        if let Some(author) = &query.main_author {
            args.push(Box::new(author.clone()));
            sql.push_str(&format!(" AND main_author = ?{}", args.len()));
        }
        if let Some(status) = query.process_status {
            args.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND process_status = ?{}", args.len()));
        }
        match query.published {
            Some(true) => sql.push_str(" AND publish_time IS NOT NULL"),
            Some(false) => sql.push_str(" AND publish_time IS NULL"),
            None => {}
        }
        if let Some((after_value, after_id)) = &query.page_after {
            args.push(Box::new(after_value.clone()));
            let value_idx = args.len();
            args.push(Box::new(after_id.clone()));
            let id_idx = args.len();
            sql.push_str(&format!(
                " AND ({order_column} > ?{value_idx} \
                 OR ({order_column} = ?{value_idx} AND upload_id > ?{id_idx}))"
            ));
        }

        let page_size = query.page_size.max(1);
        sql.push_str(&format!(
            " ORDER BY {order_column} ASC, upload_id ASC LIMIT {page_size}"
        ));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let mut rows = stmt
                .query(as_params(&args).as_slice())
                .map_err(storage_err)?;

            let mut uploads = Vec::new();
            while let Some(row) = rows.next().map_err(storage_err)? {
                uploads.push(upload_from_row(row)?);
            }

            let next_page_after = if uploads.len() == page_size {
                uploads.last().map(|upload| {
                    let value = match query.order {
                        UploadOrder::CreateTime => time_to_sql(&upload.upload_create_time),
                        UploadOrder::PublishTime => opt_time_to_sql(&upload.publish_time)
                            .unwrap_or_default(),
                    };
                    (value, upload.upload_id.to_string())
                })
            } else {
                None
            };

            Ok(UploadPage {
                uploads,
                next_page_after,
            })
        })
    }

    // ========================================================================
    // Process discipline
    // ========================================================================

    /// Claim the upload state machine for `process`.
    ///
    /// Compare-and-set against the not-processing statuses; a concurrent
    /// second attempt fails with `ProcessAlreadyRunning`.
    pub fn try_begin_process(&self, upload_id: &UploadId, process: UploadProcess) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE uploads SET process_status = ?3, current_process = ?4, \
                     last_status_message = NULL, errors = '[]', warnings = '[]', joined = 0 \
                     WHERE upload_id = ?1 AND process_status IN (?2, ?5, ?6)",
                    params![
                        upload_id.as_str(),
                        ProcessStatus::Ready.as_str(),
                        ProcessStatus::Running.as_str(),
                        process.as_str(),
                        ProcessStatus::Success.as_str(),
                        ProcessStatus::Failure.as_str(),
                    ],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                // Distinguish a busy state machine from a missing upload.
                let exists: bool = conn
                    .query_row(
                        "SELECT COUNT(*) FROM uploads WHERE upload_id = ?1",
                        params![upload_id.as_str()],
                        |row| row.get::<_, i64>(0).map(|count| count > 0),
                    )
                    .map_err(storage_err)?;
                if !exists {
                    return Err(QuarryError::not_found(upload_id.to_string()));
                }
                return Err(QuarryError::ProcessAlreadyRunning);
            }
            debug!(upload_id = %upload_id, process = %process, "process started");
            Ok(())
        })
    }

    /// Move the owning process to a new status with a status message.
    pub fn set_upload_status(
        &self,
        upload_id: &UploadId,
        status: ProcessStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE uploads SET process_status = ?2, last_status_message = ?3 \
                     WHERE upload_id = ?1",
                    params![upload_id.as_str(), status.as_str(), message],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(QuarryError::not_found(upload_id.to_string()));
            }
            Ok(())
        })
    }

    /// Terminate the owning process.
    pub fn finish_process(
        &self,
        upload_id: &UploadId,
        status: ProcessStatus,
        errors: &[String],
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE uploads SET process_status = ?2, current_process = NULL, \
                     errors = ?3, last_update = ?4 WHERE upload_id = ?1",
                    params![
                        upload_id.as_str(),
                        status.as_str(),
                        to_json(errors),
                        time_to_sql(&Utc::now()),
                    ],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(QuarryError::not_found(upload_id.to_string()));
            }
            Ok(())
        })
    }

    /// The join CAS: flips `joined` false -> true; whichever caller wins runs
    /// the upload-level cleanup exactly once.
    pub fn try_join(&self, upload_id: &UploadId) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE uploads SET joined = 1 WHERE upload_id = ?1 AND joined = 0",
                    params![upload_id.as_str()],
                )
                .map_err(storage_err)?;
            Ok(changed == 1)
        })
    }

    // ========================================================================
    // Entries
    // ========================================================================

    pub fn insert_entry(&self, record: &EntryRecord) -> Result<()> {
        self.with_conn(|conn| {
            let args = entry_params(record);
            conn.execute(
                &format!(
                    "INSERT INTO entries ({ENTRY_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                             ?16, ?17)"
                ),
                as_params(&args).as_slice(),
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    pub fn save_entry(&self, record: &EntryRecord) -> Result<()> {
        self.with_conn(|conn| {
            let args = entry_params(record);
            let changed = conn
                .execute(
                    "UPDATE entries SET upload_id = ?2, mainfile = ?3, parser_name = ?4, \
                     entry_create_time = ?5, last_processing_time = ?6, entry_hash = ?7, \
                     process_status = ?8, errors = ?9, warnings = ?10, entry_coauthors = ?11, \
                     datasets = ?12, refs = ?13, comment = ?14, external_id = ?15, \
                     quarry_version = ?16, quarry_commit = ?17 \
                     WHERE entry_id = ?1",
                    as_params(&args).as_slice(),
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(QuarryError::not_found(record.entry_id.to_string()));
            }
            Ok(())
        })
    }

    pub fn get_entry(&self, entry_id: &EntryId) -> Result<EntryRecord> {
        self.try_get_entry(entry_id)?
            .ok_or_else(|| QuarryError::not_found(entry_id.to_string()))
    }

    pub fn try_get_entry(&self, entry_id: &EntryId) -> Result<Option<EntryRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries WHERE entry_id = ?1"
                ))
                .map_err(storage_err)?;
            let mut rows = stmt.query(params![entry_id.as_str()]).map_err(storage_err)?;
            match rows.next().map_err(storage_err)? {
                Some(row) => Ok(Some(entry_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn get_entries(&self, upload_id: &UploadId) -> Result<Vec<EntryRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries WHERE upload_id = ?1 ORDER BY mainfile"
                ))
                .map_err(storage_err)?;
            let mut rows = stmt.query(params![upload_id.as_str()]).map_err(storage_err)?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next().map_err(storage_err)? {
                entries.push(entry_from_row(row)?);
            }
            Ok(entries)
        })
    }

    pub fn delete_entry(&self, entry_id: &EntryId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM partial_archives WHERE entry_id = ?1",
                params![entry_id.as_str()],
            )
            .map_err(storage_err)?;
            conn.execute(
                "DELETE FROM entries WHERE entry_id = ?1",
                params![entry_id.as_str()],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    pub fn update_entry_parser(&self, entry_id: &EntryId, parser_name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE entries SET parser_name = ?2 WHERE entry_id = ?1",
                params![entry_id.as_str(), parser_name],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    /// Reset all entries of an upload to PENDING before re-dispatch.
    pub fn reset_entries(&self, upload_id: &UploadId) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE entries SET process_status = ?2, errors = '[]', warnings = '[]' \
                     WHERE upload_id = ?1",
                    params![upload_id.as_str(), ProcessStatus::Pending.as_str()],
                )
                .map_err(storage_err)?;
            Ok(changed)
        })
    }

    /// Claim a PENDING entry for a worker; false if someone else won.
    pub fn try_claim_entry(&self, entry_id: &EntryId) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE entries SET process_status = ?2 \
                     WHERE entry_id = ?1 AND process_status = ?3",
                    params![
                        entry_id.as_str(),
                        ProcessStatus::Running.as_str(),
                        ProcessStatus::Pending.as_str(),
                    ],
                )
                .map_err(storage_err)?;
            Ok(changed == 1)
        })
    }

    /// Entry ids still PENDING; used to resurrect jobs after a worker died.
    pub fn pending_entries(&self, upload_id: &UploadId) -> Result<Vec<EntryId>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT entry_id FROM entries \
                     WHERE upload_id = ?1 AND process_status = ?2 ORDER BY mainfile",
                )
                .map_err(storage_err)?;
            let mut rows = stmt
                .query(params![
                    upload_id.as_str(),
                    ProcessStatus::Pending.as_str()
                ])
                .map_err(storage_err)?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next().map_err(storage_err)? {
                let raw: String = row.get(0).map_err(storage_err)?;
                ids.push(EntryId::parse(&raw)?);
            }
            Ok(ids)
        })
    }

    pub fn total_entries(&self, upload_id: &UploadId) -> Result<usize> {
        self.count_entries(upload_id, None)
    }

    /// Entries that finished processing, successfully or not.
    pub fn processed_entries(&self, upload_id: &UploadId) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM entries \
                     WHERE upload_id = ?1 AND process_status IN (?2, ?3)",
                    params![
                        upload_id.as_str(),
                        ProcessStatus::Success.as_str(),
                        ProcessStatus::Failure.as_str(),
                    ],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as usize)
        })
    }

    pub fn count_entries(
        &self,
        upload_id: &UploadId,
        status: Option<ProcessStatus>,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = match status {
                Some(status) => conn
                    .query_row(
                        "SELECT COUNT(*) FROM entries \
                         WHERE upload_id = ?1 AND process_status = ?2",
                        params![upload_id.as_str(), status.as_str()],
                        |row| row.get(0),
                    )
                    .map_err(storage_err)?,
                None => conn
                    .query_row(
                        "SELECT COUNT(*) FROM entries WHERE upload_id = ?1",
                        params![upload_id.as_str()],
                        |row| row.get(0),
                    )
                    .map_err(storage_err)?,
            };
            Ok(count as usize)
        })
    }

    // ========================================================================
    // Partial archives (search projection)
    // ========================================================================

    pub fn write_partial_archive(
        &self,
        entry_id: &EntryId,
        upload_id: &UploadId,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO partial_archives (entry_id, upload_id, payload) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(entry_id) DO UPDATE SET payload = ?3",
                params![
                    entry_id.as_str(),
                    upload_id.as_str(),
                    payload.to_string()
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    pub fn read_partial_archive(&self, entry_id: &EntryId) -> Result<Option<serde_json::Value>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM partial_archives WHERE entry_id = ?1",
                    params![entry_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            payload
                .map(|raw| serde_json::from_str(&raw).map_err(storage_err))
                .transpose()
        })
    }

    pub fn delete_partial_archives(&self, upload_id: &UploadId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM partial_archives WHERE upload_id = ?1",
                params![upload_id.as_str()],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    // ========================================================================
    // Datasets
    // ========================================================================

    pub fn get_dataset_by_name(&self, dataset_name: &str) -> Result<Option<DatasetRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT dataset_id, dataset_name, user_id FROM datasets \
                 WHERE dataset_name = ?1",
                params![dataset_name],
                |row| {
                    Ok(DatasetRecord {
                        dataset_id: row.get(0)?,
                        dataset_name: row.get(1)?,
                        user_id: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(storage_err)
        })
    }

    pub fn create_dataset(&self, record: &DatasetRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO datasets (dataset_id, dataset_name, user_id) VALUES (?1, ?2, ?3)",
                params![record.dataset_id, record.dataset_name, record.user_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    pub fn delete_dataset(&self, dataset_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM datasets WHERE dataset_id = ?1",
                params![dataset_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }
}

fn upload_params(record: &UploadRecord) -> SqlParams {
    vec![
        Box::new(record.upload_id.to_string()) as Box<dyn rusqlite::types::ToSql>,
        Box::new(record.upload_name.clone()),
        Box::new(record.main_author.clone()),
        Box::new(to_json(&record.coauthors)),
        Box::new(to_json(&record.reviewers)),
        Box::new(time_to_sql(&record.upload_create_time)),
        Box::new(opt_time_to_sql(&record.publish_time)),
        Box::new(opt_time_to_sql(&record.last_update)),
        Box::new(record.embargo_length as i64),
        Box::new(record.license.clone()),
        Box::new(record.from_oasis),
        Box::new(record.oasis_deployment_id.clone()),
        Box::new(to_json(&record.published_to)),
        Box::new(record.publish_directly),
        Box::new(record.process_status.as_str()),
        Box::new(record.current_process.map(|p| p.as_str())),
        Box::new(record.last_status_message.clone()),
        Box::new(to_json(&record.errors)),
        Box::new(to_json(&record.warnings)),
        Box::new(record.joined),
    ]
}

fn entry_params(record: &EntryRecord) -> SqlParams {
    vec![
        Box::new(record.entry_id.to_string()) as Box<dyn rusqlite::types::ToSql>,
        Box::new(record.upload_id.to_string()),
        Box::new(record.mainfile.to_string()),
        Box::new(record.parser_name.clone()),
        Box::new(time_to_sql(&record.entry_create_time)),
        Box::new(opt_time_to_sql(&record.last_processing_time)),
        Box::new(record.entry_hash.clone()),
        Box::new(record.process_status.as_str()),
        Box::new(to_json(&record.errors)),
        Box::new(to_json(&record.warnings)),
        Box::new(to_json(&record.metadata.entry_coauthors)),
        Box::new(to_json(&record.metadata.datasets)),
        Box::new(to_json(&record.metadata.references)),
        Box::new(record.metadata.comment.clone()),
        Box::new(record.metadata.external_id.clone()),
        Box::new(record.system.quarry_version.clone()),
        Box::new(record.system.quarry_commit.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_protocol::{generate_entry_id, RawPath};
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path().join("state.sqlite"));
        store.init().unwrap();
        (temp, store)
    }

    fn upload(store: &StateStore) -> UploadRecord {
        let record = UploadRecord::new(UploadId::generate(), "u1");
        store.create_upload(&record).unwrap();
        record
    }

    #[test]
    fn test_upload_round_trip() {
        let (_temp, store) = store();
        let mut record = upload(&store);
        record.upload_name = Some("test upload".to_string());
        record.coauthors = vec!["u2".to_string()];
        store.save_upload(&record).unwrap();

        let loaded = store.get_upload(&record.upload_id).unwrap();
        assert_eq!(loaded.upload_name.as_deref(), Some("test upload"));
        assert_eq!(loaded.coauthors, vec!["u2".to_string()]);
        assert_eq!(loaded.process_status, ProcessStatus::Ready);
    }

    #[test]
    fn test_get_missing_upload_is_not_found() {
        let (_temp, store) = store();
        let err = store.get_upload(&UploadId::generate()).unwrap_err();
        assert!(matches!(err, QuarryError::NotFound(_)));
    }

    #[test]
    fn test_begin_process_cas() {
        let (_temp, store) = store();
        let record = upload(&store);

        store
            .try_begin_process(&record.upload_id, UploadProcess::ProcessUpload)
            .unwrap();

        // Second attempt must fail while the first holds the state machine.
        let err = store
            .try_begin_process(&record.upload_id, UploadProcess::Publish)
            .unwrap_err();
        assert!(matches!(err, QuarryError::ProcessAlreadyRunning));

        store
            .finish_process(&record.upload_id, ProcessStatus::Success, &[])
            .unwrap();
        store
            .try_begin_process(&record.upload_id, UploadProcess::Publish)
            .unwrap();
    }

    #[test]
    fn test_join_cas_single_winner() {
        let (_temp, store) = store();
        let record = upload(&store);

        assert!(store.try_join(&record.upload_id).unwrap());
        assert!(!store.try_join(&record.upload_id).unwrap());

        // Starting a new process resets the barrier.
        store
            .finish_process(&record.upload_id, ProcessStatus::Success, &[])
            .unwrap();
        store
            .try_begin_process(&record.upload_id, UploadProcess::ProcessUpload)
            .unwrap();
        assert!(store.try_join(&record.upload_id).unwrap());
    }

    #[test]
    fn test_entry_lifecycle() {
        let (_temp, store) = store();
        let record = upload(&store);
        let mainfile = RawPath::new("a/template.json").unwrap();
        let entry_id = generate_entry_id(&record.upload_id, mainfile.as_str());
        let entry = EntryRecord::new(
            entry_id.clone(),
            record.upload_id.clone(),
            mainfile,
            "parsers/template",
        );
        store.insert_entry(&entry).unwrap();

        assert_eq!(store.total_entries(&record.upload_id).unwrap(), 1);
        assert_eq!(store.processed_entries(&record.upload_id).unwrap(), 0);

        assert!(store.try_claim_entry(&entry_id).unwrap());
        assert!(
            !store.try_claim_entry(&entry_id).unwrap(),
            "claims must be exclusive"
        );

        let mut entry = store.get_entry(&entry_id).unwrap();
        assert_eq!(entry.process_status, ProcessStatus::Running);
        entry.process_status = ProcessStatus::Success;
        store.save_entry(&entry).unwrap();
        assert_eq!(store.processed_entries(&record.upload_id).unwrap(), 1);
    }

    #[test]
    fn test_reset_entries() {
        let (_temp, store) = store();
        let record = upload(&store);
        let mainfile = RawPath::new("a/template.json").unwrap();
        let entry_id = generate_entry_id(&record.upload_id, mainfile.as_str());
        let mut entry = EntryRecord::new(
            entry_id.clone(),
            record.upload_id.clone(),
            mainfile,
            "parsers/template",
        );
        entry.process_status = ProcessStatus::Failure;
        entry.errors = vec!["parser failed".to_string()];
        store.insert_entry(&entry).unwrap();

        assert_eq!(store.reset_entries(&record.upload_id).unwrap(), 1);
        let entry = store.get_entry(&entry_id).unwrap();
        assert_eq!(entry.process_status, ProcessStatus::Pending);
        assert!(entry.errors.is_empty());
        assert_eq!(store.pending_entries(&record.upload_id).unwrap(), vec![entry_id]);
    }

    #[test]
    fn test_partial_archives() {
        let (_temp, store) = store();
        let record = upload(&store);
        let entry_id = generate_entry_id(&record.upload_id, "a/template.json");

        let payload = serde_json::json!({"entry_id": entry_id.as_str(), "processed": true});
        store
            .write_partial_archive(&entry_id, &record.upload_id, &payload)
            .unwrap();
        assert_eq!(
            store.read_partial_archive(&entry_id).unwrap().unwrap(),
            payload
        );

        store.delete_partial_archives(&record.upload_id).unwrap();
        assert!(store.read_partial_archive(&entry_id).unwrap().is_none());
    }

    #[test]
    fn test_upload_pagination() {
        let (_temp, store) = store();
        for _ in 0..5 {
            upload(&store);
        }

        let mut seen = Vec::new();
        let mut page_after = None;
        loop {
            let page = store
                .list_uploads(&UploadQuery {
                    page_after: page_after.clone(),
                    page_size: 2,
                    ..UploadQuery::default()
                })
                .unwrap();
            seen.extend(page.uploads.iter().map(|u| u.upload_id.clone()));
            match page.next_page_after {
                Some(key) => page_after = Some(key),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        let mut deduped = seen.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), 5, "pagination must not repeat uploads");
    }

    #[test]
    fn test_datasets() {
        let (_temp, store) = store();
        let dataset = DatasetRecord {
            dataset_id: "ds-1".to_string(),
            dataset_name: "reference set".to_string(),
            user_id: "u1".to_string(),
        };
        store.create_dataset(&dataset).unwrap();
        assert_eq!(
            store.get_dataset_by_name("reference set").unwrap().unwrap(),
            dataset
        );
        assert!(store.get_dataset_by_name("missing").unwrap().is_none());
    }
}
