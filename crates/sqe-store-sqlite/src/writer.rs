// crates/sqe-store-sqlite/src/writer.rs
// ============================================================================
// Module: Mutation Writer
// Description: Transaction and versioning engine for owner/owned table pairs.
// Purpose: Execute mutation batches in one permission-checked transaction,
//          never destroying content, auditing every physical change.
// Dependencies: sqe-core, rusqlite, serde, thiserror, crate::resilient
// ============================================================================

//! ## Overview
//! [`MutationWriter`] is the transactional core of the system. A batch of
//! [`MutationRequest`]s is applied inside one transaction: permissions are
//! re-checked first, one `main_action` row is written per batch, then each
//! request inserts or re-links owner rows in input order. Owned content rows
//! are content-addressed: inserting identical content twice always yields
//! the same row id, and an Update only moves the edition's owner link, so
//! the old content stays available to other editions and to the audit
//! history. Every physically altered row gets a `single_action` audit entry.
//!
//! All SQL identifiers come from the validated [`TableRegistry`]; request
//! payloads only ever reach statements as bound parameters.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Deserialize;
use serde::Serialize;
use sqe_core::AlteredRecord;
use sqe_core::ApiError;
use sqe_core::ColumnAssignments;
use sqe_core::ColumnKind;
use sqe_core::ColumnValue;
use sqe_core::EditionEditorId;
use sqe_core::EditionId;
use sqe_core::EditionPermissions;
use sqe_core::MutateAction;
use sqe_core::MutationRequest;
use sqe_core::PermissionGate;
use sqe_core::RecordId;
use sqe_core::TableRegistry;
use sqe_core::TableSpec;
use sqe_core::UserId;
use sqe_core::UserInfo;
use thiserror::Error;

use crate::resilient::CommError;
use crate::resilient::RetryConfig;
use crate::resilient::RetryError;
use crate::resilient::RetryExecutor;
use crate::resilient::RetryStatsSnapshot;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Schema version stamped into `schema_meta`.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Configuration for the mutation writer.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Retry and circuit-breaker policy for every round trip.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Returns the default busy timeout for SQLite connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Mutation writer errors.
#[derive(Debug, Error)]
pub enum WriterError {
    /// Domain-classified error (permission, validation, not-found, ...).
    #[error(transparent)]
    Api(#[from] ApiError),
    /// Unexpected database failure after retry classification.
    #[error("writer database error: {0}")]
    Db(String),
    /// Circuit breaker is open; the database was not contacted.
    #[error("circuit open after {consecutive_failures} consecutive failures")]
    CircuitOpen {
        /// Failure count at the time of the fast-fail.
        consecutive_failures: u32,
    },
    /// Retry loop was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<RetryError<CommError>> for WriterError {
    fn from(error: RetryError<CommError>) -> Self {
        match error {
            RetryError::Inner(inner) => Self::Db(inner.to_string()),
            RetryError::CircuitOpen {
                consecutive_failures,
            } => Self::CircuitOpen {
                consecutive_failures,
            },
            RetryError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<WriterError> for ApiError {
    fn from(error: WriterError) -> Self {
        match error {
            WriterError::Api(api) => api,
            WriterError::Db(message) => Self::ServerError {
                message,
            },
            WriterError::CircuitOpen {
                consecutive_failures,
            } => Self::ServerError {
                message: format!(
                    "database unavailable: circuit open after {consecutive_failures} failures"
                ),
            },
            WriterError::Cancelled => Self::ServerError {
                message: "operation cancelled".to_string(),
            },
        }
    }
}

// ============================================================================
// SECTION: Audit Records
// ============================================================================

/// Kind of a single audit entry.
///
/// # Invariants
/// - Labels match the `single_action.action` check constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleActionKind {
    /// A row was linked to the edition.
    Add,
    /// A row was unlinked from the edition.
    Delete,
}

impl SingleActionKind {
    /// Returns the stored label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
        }
    }

    /// Parses a stored label.
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "add" => Some(Self::Add),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One `single_action` audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleActionRecord {
    /// Audit row id.
    pub single_action_id: u64,
    /// Owned-table name the entry refers to.
    pub table: String,
    /// Affected owned-row id.
    pub id_in_table: RecordId,
    /// Whether the row was linked or unlinked.
    pub action: SingleActionKind,
}

/// One `main_action` audit row with its single entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainActionRecord {
    /// Audit batch id.
    pub main_action_id: u64,
    /// Unix timestamp (seconds) of the batch.
    pub time: i64,
    /// Whether the batch has been rewound.
    pub rewinded: bool,
    /// Single entries recorded under this batch, in insertion order.
    pub singles: Vec<SingleActionRecord>,
}

// ============================================================================
// SECTION: Editor Grants
// ============================================================================

/// Capability set granted to an editor, short of the provenance id which the
/// database assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorGrant {
    /// Grantee may read edition data.
    pub may_read: bool,
    /// Grantee may write edition data.
    pub may_write: bool,
    /// Grantee may lock or unlock the edition.
    pub may_lock: bool,
    /// Grantee administers the edition.
    pub is_admin: bool,
}

// ============================================================================
// SECTION: Stats
// ============================================================================

/// Internal writer counters.
#[derive(Debug, Default, Clone)]
struct WriterStats {
    /// Successfully committed batches.
    batches_committed: u64,
    /// Batches aborted before commit.
    batches_aborted: u64,
    /// Create mutations applied.
    creates: u64,
    /// Update mutations applied.
    updates: u64,
    /// Delete mutations applied.
    deletes: u64,
}

/// Snapshot of writer and retry-layer counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStatsSnapshot {
    /// Successfully committed batches.
    pub batches_committed: u64,
    /// Batches aborted before commit.
    pub batches_aborted: u64,
    /// Create mutations applied.
    pub creates: u64,
    /// Update mutations applied.
    pub updates: u64,
    /// Delete mutations applied.
    pub deletes: u64,
    /// Retry-layer counters.
    pub retry: RetryStatsSnapshot,
}

// ============================================================================
// SECTION: Writer
// ============================================================================

/// Transactional mutation engine over one SQLite database.
///
/// # Invariants
/// - Owned content rows are never updated or deleted in place.
/// - Every physical owner-link change is recorded in the audit log before
///   the batch commits.
/// - Connection access is serialized through a mutex; one batch holds the
///   connection for its whole transaction.
pub struct MutationWriter {
    /// Writer configuration.
    config: WriterConfig,
    /// Registered owner/owned table pairs.
    registry: TableRegistry,
    /// Shared connection guarded by a mutex.
    connection: Mutex<Connection>,
    /// Retry and circuit-breaker policy for every round trip.
    retry: RetryExecutor,
    /// Batch counters.
    stats: Mutex<WriterStats>,
}

impl MutationWriter {
    /// Opens (or creates) the database and bootstraps the schema for every
    /// registered table pair.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError`] when the configuration is invalid or the
    /// schema cannot be initialized.
    pub fn open(config: WriterConfig, registry: TableRegistry) -> Result<Self, WriterError> {
        validate_config(&config)?;
        let mut connection = open_connection(&config)?;
        initialize_schema(&mut connection, &registry)?;
        let retry = RetryExecutor::new(config.retry);
        Ok(Self {
            config,
            registry,
            connection: Mutex::new(connection),
            retry,
            stats: Mutex::new(WriterStats::default()),
        })
    }

    /// Returns the writer configuration.
    #[must_use]
    pub const fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Returns the table registry backing this writer.
    #[must_use]
    pub const fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Returns a snapshot of the batch and retry counters.
    #[must_use]
    pub fn stats(&self) -> WriterStatsSnapshot {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        WriterStatsSnapshot {
            batches_committed: stats.batches_committed,
            batches_aborted: stats.batches_aborted,
            creates: stats.creates,
            updates: stats.updates,
            deletes: stats.deletes,
            retry: self.retry.stats(),
        }
    }

    // ------------------------------------------------------------------
    // Mutation batches
    // ------------------------------------------------------------------

    /// Applies a mutation batch for one user on one edition.
    ///
    /// Opens one transaction, re-checks write permission inside it, writes
    /// one `main_action` row, then applies every request in input order.
    /// Commits only when all requests succeed; any failure rolls the whole
    /// batch back. The result list matches the input list positionally.
    ///
    /// An empty batch is legal: it returns an empty result and writes no
    /// audit rows.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError`] carrying the domain classification
    /// (`Forbidden`, `Locked`, `NotFound`, `BadInput`, `Conflict`) or the
    /// database failure that aborted the batch.
    pub fn write_mutations(
        &self,
        user: &UserInfo,
        requests: &[MutationRequest],
    ) -> Result<Vec<AlteredRecord>, WriterError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.lock_connection();
        let result = self.write_batch(&mut guard, user, requests);
        drop(guard);
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(applied) => {
                stats.batches_committed += 1;
                for record in applied {
                    match (record.old_id, record.new_id) {
                        (None, Some(_)) => stats.creates += 1,
                        (Some(_), Some(_)) => stats.updates += 1,
                        _ => stats.deletes += 1,
                    }
                }
            }
            Err(_) => stats.batches_aborted += 1,
        }
        result
    }

    /// Runs one batch inside a transaction on the held connection.
    fn write_batch(
        &self,
        connection: &mut Connection,
        user: &UserInfo,
        requests: &[MutationRequest],
    ) -> Result<Vec<AlteredRecord>, WriterError> {
        let tx = connection.transaction().map_err(comm_to_db)?;
        // Permission re-check inside the transaction, once for the batch:
        // all requests belong to the same edition and user.
        let editor_id = self.check_write_access(&tx, user)?;
        for request in requests {
            self.validate_request(request)?;
        }
        let main_action_id = self.insert_main_action(&tx, user.edition_id(), editor_id)?;
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let spec = self.spec_for(request.table())?;
            let altered = match request.action() {
                MutateAction::Create => {
                    let new_id = self.insert_or_find(&tx, spec, request)?;
                    self.insert_owner_link(&tx, spec, new_id, user.edition_id(), editor_id)?;
                    self.insert_single_action(
                        &tx,
                        main_action_id,
                        spec.name(),
                        new_id,
                        SingleActionKind::Add,
                    )?;
                    AlteredRecord::created(spec.name(), new_id)
                }
                MutateAction::Update => {
                    let old_id = request_pk(request)?;
                    self.delete_owner_link(&tx, spec, old_id, user.edition_id())?;
                    let new_id = self.insert_or_find(&tx, spec, request)?;
                    self.insert_owner_link(&tx, spec, new_id, user.edition_id(), editor_id)?;
                    self.insert_single_action(
                        &tx,
                        main_action_id,
                        spec.name(),
                        old_id,
                        SingleActionKind::Delete,
                    )?;
                    self.insert_single_action(
                        &tx,
                        main_action_id,
                        spec.name(),
                        new_id,
                        SingleActionKind::Add,
                    )?;
                    AlteredRecord::updated(spec.name(), old_id, new_id)
                }
                MutateAction::Delete => {
                    let old_id = request_pk(request)?;
                    self.delete_owner_link(&tx, spec, old_id, user.edition_id())?;
                    self.insert_single_action(
                        &tx,
                        main_action_id,
                        spec.name(),
                        old_id,
                        SingleActionKind::Delete,
                    )?;
                    AlteredRecord::deleted(spec.name(), old_id)
                }
            };
            results.push(altered);
        }
        tx.commit().map_err(comm_to_db)?;
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Edition administration
    // ------------------------------------------------------------------

    /// Creates a new edition owned by `owner`, who receives full rights.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError`] on database failure.
    pub fn create_edition(&self, owner: UserId) -> Result<EditionId, WriterError> {
        let mut guard = self.lock_connection();
        let tx = guard.transaction().map_err(comm_to_db)?;
        self.run(|| {
            tx.execute("INSERT INTO edition (locked) VALUES (0)", []).map_err(CommError::from)
        })?;
        let edition_id = id_from_rowid(tx.last_insert_rowid())
            .and_then(EditionId::from_raw)
            .ok_or_else(|| WriterError::Db("edition insert returned no rowid".to_string()))?;
        let owner_raw = to_db_id(owner.get())?;
        let edition_raw = to_db_id(edition_id.get())?;
        self.run(|| {
            tx.execute(
                "INSERT INTO edition_editor
                     (edition_id, user_id, may_read, may_write, may_lock, is_admin)
                 VALUES (?1, ?2, 1, 1, 1, 1)",
                params![edition_raw, owner_raw],
            )
            .map_err(CommError::from)
        })?;
        tx.commit().map_err(comm_to_db)?;
        Ok(edition_id)
    }

    /// Grants (or updates) an editor's rights on the admin's edition.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Forbidden`] when the acting user is not an admin
    /// of the edition, or the underlying database failure.
    pub fn grant_editor(
        &self,
        admin: &UserInfo,
        user: UserId,
        grant: EditorGrant,
    ) -> Result<EditionEditorId, WriterError> {
        let mut guard = self.lock_connection();
        let tx = guard.transaction().map_err(comm_to_db)?;
        let permissions = self.query_permissions(&tx, admin.user_id(), admin.edition_id())?;
        if !permissions.is_admin {
            return Err(ApiError::Forbidden {
                message: format!(
                    "user {} is not an admin of edition {}",
                    admin.user_id(),
                    admin.edition_id()
                ),
            }
            .into());
        }
        let edition_raw = to_db_id(admin.edition_id().get())?;
        let user_raw = to_db_id(user.get())?;
        self.run(|| {
            tx.execute(
                "INSERT INTO edition_editor
                     (edition_id, user_id, may_read, may_write, may_lock, is_admin)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (edition_id, user_id) DO UPDATE SET
                     may_read = excluded.may_read,
                     may_write = excluded.may_write,
                     may_lock = excluded.may_lock,
                     is_admin = excluded.is_admin",
                params![
                    edition_raw,
                    user_raw,
                    grant.may_read,
                    grant.may_write,
                    grant.may_lock,
                    grant.is_admin
                ],
            )
            .map_err(CommError::from)
        })?;
        let editor_raw: i64 = self.run(|| {
            tx.query_row(
                "SELECT edition_editor_id FROM edition_editor
                 WHERE edition_id = ?1 AND user_id = ?2",
                params![edition_raw, user_raw],
                |row| row.get(0),
            )
            .map_err(CommError::from)
        })?;
        tx.commit().map_err(comm_to_db)?;
        id_from_rowid(editor_raw)
            .and_then(EditionEditorId::from_raw)
            .ok_or_else(|| WriterError::Db("editor upsert returned no id".to_string()))
    }

    /// Admin-locks the edition against non-admin writers.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Forbidden`] when the acting user lacks the lock
    /// capability, or the underlying database failure.
    pub fn lock_edition(&self, user: &UserInfo) -> Result<(), WriterError> {
        self.set_edition_lock(user, true)
    }

    /// Releases the admin lock on the edition.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Forbidden`] when the acting user lacks the lock
    /// capability, or the underlying database failure.
    pub fn unlock_edition(&self, user: &UserInfo) -> Result<(), WriterError> {
        self.set_edition_lock(user, false)
    }

    /// Applies a lock-state change after checking the lock capability.
    fn set_edition_lock(&self, user: &UserInfo, locked: bool) -> Result<(), WriterError> {
        let guard = self.lock_connection();
        let permissions = self.query_permissions(&guard, user.user_id(), user.edition_id())?;
        if !permissions.may_lock {
            return Err(ApiError::Forbidden {
                message: format!(
                    "user {} may not lock edition {}",
                    user.user_id(),
                    user.edition_id()
                ),
            }
            .into());
        }
        let edition_raw = to_db_id(user.edition_id().get())?;
        let affected = self.run(|| {
            guard
                .execute(
                    "UPDATE edition SET locked = ?1 WHERE edition_id = ?2",
                    params![locked, edition_raw],
                )
                .map_err(CommError::from)
        })?;
        if affected == 0 {
            return Err(ApiError::NotFound {
                message: format!("edition {} does not exist", user.edition_id()),
            }
            .into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    /// Returns every owned row the user's edition currently links, with its
    /// content columns, ordered by row id.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Forbidden`] without read permission, or the
    /// underlying database failure.
    pub fn edition_records(
        &self,
        user: &UserInfo,
        table: &str,
    ) -> Result<Vec<(RecordId, ColumnAssignments)>, WriterError> {
        let spec = self.spec_for(table)?;
        let guard = self.lock_connection();
        self.check_read_access(&guard, user)?;
        let sql = select_edition_records_sql(spec, false);
        let edition_raw = to_db_id(user.edition_id().get())?;
        let rows = self.run(|| {
            let mut stmt = guard.prepare(&sql).map_err(CommError::from)?;
            let mapped = stmt
                .query_map(params![edition_raw], |row| map_record_row(spec, row))
                .map_err(CommError::from)?;
            mapped.collect::<Result<Vec<_>, _>>().map_err(CommError::from)
        })?;
        rows.into_iter().map(|raw| finish_record_row(spec, raw)).collect()
    }

    /// Returns one owned row the user's edition currently links.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] when the edition does not link the
    /// row, [`ApiError::Forbidden`] without read permission, or the
    /// underlying database failure.
    pub fn edition_record(
        &self,
        user: &UserInfo,
        table: &str,
        id: RecordId,
    ) -> Result<(RecordId, ColumnAssignments), WriterError> {
        let spec = self.spec_for(table)?;
        let guard = self.lock_connection();
        self.check_read_access(&guard, user)?;
        let sql = select_edition_records_sql(spec, true);
        let edition_raw = to_db_id(user.edition_id().get())?;
        let id_raw = to_db_id(id.get())?;
        let row = self.run(|| {
            guard
                .query_row(&sql, params![edition_raw, id_raw], |row| map_record_row(spec, row))
                .optional()
                .map_err(CommError::from)
        })?;
        match row {
            Some(raw) => finish_record_row(spec, raw),
            None => Err(ApiError::NotFound {
                message: format!(
                    "edition {} has no {table} row {id}",
                    user.edition_id()
                ),
            }
            .into()),
        }
    }

    /// Returns the edition's audit trail, oldest batch first.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Forbidden`] without read permission, or the
    /// underlying database failure.
    pub fn action_log(&self, user: &UserInfo) -> Result<Vec<MainActionRecord>, WriterError> {
        let guard = self.lock_connection();
        self.check_read_access(&guard, user)?;
        let edition_raw = to_db_id(user.edition_id().get())?;
        let mains: Vec<(i64, i64, bool)> = self.run(|| {
            let mut stmt = guard
                .prepare(
                    "SELECT main_action_id, time, rewinded FROM main_action
                     WHERE edition_id = ?1 ORDER BY main_action_id",
                )
                .map_err(CommError::from)?;
            let mapped = stmt
                .query_map(params![edition_raw], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(CommError::from)?;
            mapped.collect::<Result<Vec<_>, _>>().map_err(CommError::from)
        })?;
        let mut log = Vec::with_capacity(mains.len());
        for (main_id, time, rewinded) in mains {
            let singles: Vec<(i64, String, i64, String)> = self.run(|| {
                let mut stmt = guard
                    .prepare(
                        "SELECT single_action_id, table_name, id_in_table, action
                         FROM single_action WHERE main_action_id = ?1
                         ORDER BY single_action_id",
                    )
                    .map_err(CommError::from)?;
                let mapped = stmt
                    .query_map(params![main_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(CommError::from)?;
                mapped.collect::<Result<Vec<_>, _>>().map_err(CommError::from)
            })?;
            let mut records = Vec::with_capacity(singles.len());
            for (single_id, table, id_in_table, action) in singles {
                records.push(SingleActionRecord {
                    single_action_id: id_from_rowid(single_id)
                        .ok_or_else(|| WriterError::Db("invalid single_action id".to_string()))?,
                    table,
                    id_in_table: id_from_rowid(id_in_table)
                        .and_then(RecordId::from_raw)
                        .ok_or_else(|| WriterError::Db("invalid id_in_table".to_string()))?,
                    action: SingleActionKind::from_label(&action).ok_or_else(|| {
                        WriterError::Db(format!("unknown single_action label: {action}"))
                    })?,
                });
            }
            log.push(MainActionRecord {
                main_action_id: id_from_rowid(main_id)
                    .ok_or_else(|| WriterError::Db("invalid main_action id".to_string()))?,
                time,
                rewinded,
                singles: records,
            });
        }
        Ok(log)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Locks the shared connection, recovering from poisoning.
    fn lock_connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one statement closure through the retry and breaker policy.
    fn run<T, F>(&self, op: F) -> Result<T, WriterError>
    where
        F: FnMut() -> Result<T, CommError>,
    {
        self.retry.execute_retry_with_breaker(op).map_err(WriterError::from)
    }

    /// Looks up a registered table spec.
    fn spec_for(&self, table: &str) -> Result<&TableSpec, WriterError> {
        self.registry.get(table).ok_or_else(|| {
            ApiError::BadInput {
                message: format!("unknown table: {table}"),
            }
            .into()
        })
    }

    /// Validates one request against the registry: known table, known
    /// columns, matching value kinds, and (for Create/Update) a complete
    /// content assignment. Completeness keeps the content-addressed dedup
    /// sound, since the UNIQUE constraint spans all content columns.
    fn validate_request(&self, request: &MutationRequest) -> Result<(), WriterError> {
        let spec = self.spec_for(request.table())?;
        for (name, value) in request.content_assignments() {
            let Some(column) = spec.column(name) else {
                return Err(ApiError::BadInput {
                    message: format!("unknown column {name} for table {}", spec.name()),
                }
                .into());
            };
            if column.kind != value.kind() {
                return Err(ApiError::BadInput {
                    message: format!(
                        "column {name} of table {} expects a {:?} value",
                        spec.name(),
                        column.kind
                    ),
                }
                .into());
            }
        }
        if matches!(request.action(), MutateAction::Create | MutateAction::Update) {
            for column in spec.columns() {
                if request.assignments().get(&column.name).is_none() {
                    return Err(ApiError::BadInput {
                        message: format!(
                            "table {} requires a value for column {}",
                            spec.name(),
                            column.name
                        ),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Re-checks write access inside the transaction and returns the
    /// provenance id to stamp into owner links.
    fn check_write_access(
        &self,
        conn: &Connection,
        user: &UserInfo,
    ) -> Result<EditionEditorId, WriterError> {
        let locked = self.query_edition_locked(conn, user.edition_id())?;
        let permissions = self.query_permissions(conn, user.user_id(), user.edition_id())?;
        if locked && !permissions.is_admin {
            return Err(ApiError::Locked {
                message: format!("edition {} is locked", user.edition_id()),
            }
            .into());
        }
        if !permissions.may_write {
            return Err(ApiError::Forbidden {
                message: format!(
                    "user {} may not write edition {}",
                    user.user_id(),
                    user.edition_id()
                ),
            }
            .into());
        }
        permissions.edition_editor_id.ok_or_else(|| {
            ApiError::Forbidden {
                message: format!(
                    "user {} is not an editor of edition {}",
                    user.user_id(),
                    user.edition_id()
                ),
            }
            .into()
        })
    }

    /// Checks read access on the held connection, priming the request cache.
    fn check_read_access(&self, conn: &Connection, user: &UserInfo) -> Result<(), WriterError> {
        let gate = ConnectionGate {
            writer: self,
            conn,
        };
        if user.may_read(&gate)? {
            Ok(())
        } else {
            Err(ApiError::Forbidden {
                message: format!(
                    "user {} may not read edition {}",
                    user.user_id(),
                    user.edition_id()
                ),
            }
            .into())
        }
    }

    /// Queries the edition's admin-lock flag.
    fn query_edition_locked(
        &self,
        conn: &Connection,
        edition_id: EditionId,
    ) -> Result<bool, WriterError> {
        let edition_raw = to_db_id(edition_id.get())?;
        let locked: Option<bool> = self.run(|| {
            conn.query_row(
                "SELECT locked FROM edition WHERE edition_id = ?1",
                params![edition_raw],
                |row| row.get(0),
            )
            .optional()
            .map_err(CommError::from)
        })?;
        locked.ok_or_else(|| {
            ApiError::NotFound {
                message: format!("edition {edition_id} does not exist"),
            }
            .into()
        })
    }

    /// Queries current permissions for a (user, edition) pair. Unenrolled
    /// users resolve to no capabilities, not an error.
    fn query_permissions(
        &self,
        conn: &Connection,
        user_id: UserId,
        edition_id: EditionId,
    ) -> Result<EditionPermissions, WriterError> {
        let edition_raw = to_db_id(edition_id.get())?;
        let user_raw = to_db_id(user_id.get())?;
        let row: Option<(i64, bool, bool, bool, bool)> = self.run(|| {
            conn.query_row(
                "SELECT edition_editor_id, may_read, may_write, may_lock, is_admin
                 FROM edition_editor WHERE edition_id = ?1 AND user_id = ?2",
                params![edition_raw, user_raw],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()
            .map_err(CommError::from)
        })?;
        match row {
            Some((editor_raw, may_read, may_write, may_lock, is_admin)) => {
                let edition_editor_id = id_from_rowid(editor_raw)
                    .and_then(EditionEditorId::from_raw)
                    .ok_or_else(|| WriterError::Db("invalid edition_editor id".to_string()))?;
                Ok(EditionPermissions {
                    may_read,
                    may_write,
                    may_lock,
                    is_admin,
                    edition_editor_id: Some(edition_editor_id),
                })
            }
            None => Ok(EditionPermissions::NONE),
        }
    }

    /// Inserts the batch audit row; one per `write_mutations` call, before
    /// any single mutation.
    fn insert_main_action(
        &self,
        conn: &Connection,
        edition_id: EditionId,
        editor_id: EditionEditorId,
    ) -> Result<i64, WriterError> {
        let time = unix_time_secs()?;
        let edition_raw = to_db_id(edition_id.get())?;
        let editor_raw = to_db_id(editor_id.get())?;
        self.run(|| {
            conn.execute(
                "INSERT INTO main_action (time, rewinded, edition_id, edition_editor_id)
                 VALUES (?1, 0, ?2, ?3)",
                params![time, edition_raw, editor_raw],
            )
            .map_err(CommError::from)
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Appends one audit entry for a physically altered owner link.
    fn insert_single_action(
        &self,
        conn: &Connection,
        main_action_id: i64,
        table: &str,
        id: RecordId,
        kind: SingleActionKind,
    ) -> Result<(), WriterError> {
        let id_raw = to_db_id(id.get())?;
        self.run(|| {
            conn.execute(
                "INSERT INTO single_action (main_action_id, table_name, id_in_table, action)
                 VALUES (?1, ?2, ?3, ?4)",
                params![main_action_id, table, id_raw, kind.as_str()],
            )
            .map_err(CommError::from)
        })?;
        Ok(())
    }

    /// Content-addressed insert: inserts the content columns, or finds the
    /// pre-existing row with identical content. Calling this twice with the
    /// same content always yields the same id.
    fn insert_or_find(
        &self,
        conn: &Connection,
        spec: &TableSpec,
        request: &MutationRequest,
    ) -> Result<RecordId, WriterError> {
        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        for (name, value) in request.content_assignments() {
            columns.push(name);
            values.push(bind_value(value));
        }
        let placeholders: Vec<String> =
            (1..=columns.len()).map(|index| format!("?{index}")).collect();
        let insert_sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            spec.name(),
            columns.join(", "),
            placeholders.join(", ")
        );
        let affected = self.run(|| {
            conn.execute(&insert_sql, params_from_iter(values.iter().cloned()))
                .map_err(CommError::from)
        })?;
        let rowid = if affected == 1 {
            conn.last_insert_rowid()
        } else {
            // Identical content already exists; the UNIQUE constraint over
            // the content columns guarantees exactly one match.
            let predicate: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(index, column)| format!("{column} = ?{}", index + 1))
                .collect();
            let select_sql = format!(
                "SELECT {} FROM {} WHERE {}",
                spec.pk_column(),
                spec.name(),
                predicate.join(" AND ")
            );
            self.run(|| {
                conn.query_row(&select_sql, params_from_iter(values.iter().cloned()), |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(CommError::from)
            })?
        };
        id_from_rowid(rowid).and_then(RecordId::from_raw).ok_or_else(|| {
            WriterError::Db(format!("table {} produced an invalid rowid", spec.name()))
        })
    }

    /// Links an owned row to the edition, stamping provenance.
    fn insert_owner_link(
        &self,
        conn: &Connection,
        spec: &TableSpec,
        id: RecordId,
        edition_id: EditionId,
        editor_id: EditionEditorId,
    ) -> Result<(), WriterError> {
        let sql = format!(
            "INSERT INTO {} ({}, edition_id, edition_editor_id) VALUES (?1, ?2, ?3)",
            spec.owner_table(),
            spec.pk_column()
        );
        let id_raw = to_db_id(id.get())?;
        let edition_raw = to_db_id(edition_id.get())?;
        let editor_raw = to_db_id(editor_id.get())?;
        let result = self.retry.execute_retry_with_breaker(|| {
            conn.execute(&sql, params![id_raw, edition_raw, editor_raw])
                .map_err(CommError::from)
        });
        match result {
            Ok(_) => Ok(()),
            Err(RetryError::Inner(CommError::UniqueViolation(_))) => Err(ApiError::Conflict {
                message: format!(
                    "edition {edition_id} already owns {} row {id}",
                    spec.name()
                ),
            }
            .into()),
            Err(error) => Err(error.into()),
        }
    }

    /// Unlinks an owned row from the edition. Zero affected rows means the
    /// edition does not own the row (or a concurrent writer already removed
    /// the link) and raises `NotFound`, failing the batch instead of masking
    /// a lost update.
    fn delete_owner_link(
        &self,
        conn: &Connection,
        spec: &TableSpec,
        id: RecordId,
        edition_id: EditionId,
    ) -> Result<(), WriterError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1 AND edition_id = ?2",
            spec.owner_table(),
            spec.pk_column()
        );
        let id_raw = to_db_id(id.get())?;
        let edition_raw = to_db_id(edition_id.get())?;
        let affected = self.run(|| {
            conn.execute(&sql, params![id_raw, edition_raw]).map_err(CommError::from)
        })?;
        if affected == 0 {
            return Err(ApiError::NotFound {
                message: format!("edition {edition_id} does not own {} row {id}", spec.name()),
            }
            .into());
        }
        Ok(())
    }
}

impl PermissionGate for MutationWriter {
    fn resolve(
        &self,
        user_id: UserId,
        edition_id: EditionId,
    ) -> Result<EditionPermissions, ApiError> {
        let guard = self.lock_connection();
        self.query_permissions(&guard, user_id, edition_id).map_err(ApiError::from)
    }
}

/// Gate adapter resolving permissions on an already-held connection, so the
/// read path can prime the request cache without re-locking.
struct ConnectionGate<'a> {
    /// Writer owning the retry policy.
    writer: &'a MutationWriter,
    /// Held connection (or transaction).
    conn: &'a Connection,
}

impl PermissionGate for ConnectionGate<'_> {
    fn resolve(
        &self,
        user_id: UserId,
        edition_id: EditionId,
    ) -> Result<EditionPermissions, ApiError> {
        self.writer.query_permissions(self.conn, user_id, edition_id).map_err(ApiError::from)
    }
}

// ============================================================================
// SECTION: Schema Bootstrap
// ============================================================================

/// Validates the writer configuration.
fn validate_config(config: &WriterConfig) -> Result<(), WriterError> {
    if config.path.exists() && config.path.is_dir() {
        return Err(ApiError::BadInput {
            message: "writer path must be a file, not a directory".to_string(),
        }
        .into());
    }
    config.retry.validate().map_err(|message| {
        WriterError::Api(ApiError::BadInput {
            message,
        })
    })
}

/// Opens the SQLite connection with the writer's pragmas.
fn open_connection(config: &WriterConfig) -> Result<Connection, WriterError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags).map_err(comm_to_db)?;
    connection.execute_batch("PRAGMA foreign_keys = ON;").map_err(comm_to_db)?;
    // Relaxed isolation by design: batch correctness rests on the in-tx
    // permission check and the UNIQUE content constraints, not on snapshot
    // isolation. SQLite only honors this under shared cache.
    connection.execute_batch("PRAGMA read_uncommitted = ON;").map_err(comm_to_db)?;
    connection
        .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .map_err(comm_to_db)?;
    Ok(connection)
}

/// Initializes the schema or validates the existing version, then ensures
/// the owner/owned pair of every registered table exists.
fn initialize_schema(
    connection: &mut Connection,
    registry: &TableRegistry,
) -> Result<(), WriterError> {
    let tx = connection.transaction().map_err(comm_to_db)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL);")
        .map_err(comm_to_db)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM schema_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(comm_to_db)?;
    match version {
        None => {
            tx.execute("INSERT INTO schema_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(comm_to_db)?;
            tx.execute_batch(BASE_SCHEMA_DDL).map_err(comm_to_db)?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(found) => {
            return Err(WriterError::Db(format!(
                "schema version mismatch: found {found}, expected {SCHEMA_VERSION}"
            )));
        }
    }
    for spec in registry.iter() {
        tx.execute_batch(&owned_table_ddl(spec)).map_err(comm_to_db)?;
        tx.execute_batch(&owner_table_ddl(spec)).map_err(comm_to_db)?;
    }
    tx.commit().map_err(comm_to_db)
}

/// Base DDL: editions, editors, and the append-only audit tables.
const BASE_SCHEMA_DDL: &str = "CREATE TABLE IF NOT EXISTS edition (
    edition_id INTEGER PRIMARY KEY AUTOINCREMENT,
    locked INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS edition_editor (
    edition_editor_id INTEGER PRIMARY KEY AUTOINCREMENT,
    edition_id INTEGER NOT NULL REFERENCES edition(edition_id),
    user_id INTEGER NOT NULL,
    may_read INTEGER NOT NULL DEFAULT 1,
    may_write INTEGER NOT NULL DEFAULT 0,
    may_lock INTEGER NOT NULL DEFAULT 0,
    is_admin INTEGER NOT NULL DEFAULT 0,
    UNIQUE (edition_id, user_id)
);
CREATE TABLE IF NOT EXISTS main_action (
    main_action_id INTEGER PRIMARY KEY AUTOINCREMENT,
    time INTEGER NOT NULL,
    rewinded INTEGER NOT NULL DEFAULT 0,
    edition_id INTEGER NOT NULL REFERENCES edition(edition_id),
    edition_editor_id INTEGER NOT NULL REFERENCES edition_editor(edition_editor_id)
);
CREATE TABLE IF NOT EXISTS single_action (
    single_action_id INTEGER PRIMARY KEY AUTOINCREMENT,
    main_action_id INTEGER NOT NULL REFERENCES main_action(main_action_id),
    table_name TEXT NOT NULL,
    id_in_table INTEGER NOT NULL,
    action TEXT NOT NULL CHECK (action IN ('add', 'delete'))
);
CREATE INDEX IF NOT EXISTS idx_single_action_main
    ON single_action (main_action_id);
CREATE INDEX IF NOT EXISTS idx_main_action_edition
    ON main_action (edition_id);";

/// Builds the owned-table DDL: auto-increment pk, `NOT NULL` content
/// columns, and a UNIQUE constraint over all content columns so identical
/// content is never duplicated.
fn owned_table_ddl(spec: &TableSpec) -> String {
    let mut definitions = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        spec.pk_column()
    )];
    for column in spec.columns() {
        definitions.push(format!("{} {} NOT NULL", column.name, sql_type(column.kind)));
    }
    let content: Vec<&str> = spec.columns().iter().map(|column| column.name.as_str()).collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, UNIQUE ({}));",
        spec.name(),
        definitions.join(", "),
        content.join(", ")
    )
}

/// Builds the owner-table DDL: one link row per (owned row, edition), with
/// editor provenance.
fn owner_table_ddl(spec: &TableSpec) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {owner} (
            {pk} INTEGER NOT NULL REFERENCES {table}({pk}),
            edition_id INTEGER NOT NULL REFERENCES edition(edition_id),
            edition_editor_id INTEGER NOT NULL REFERENCES edition_editor(edition_editor_id),
            PRIMARY KEY ({pk}, edition_id)
        );",
        owner = spec.owner_table(),
        pk = spec.pk_column(),
        table = spec.name()
    )
}

/// Maps a column kind to its SQLite storage type.
const fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Integer | ColumnKind::Boolean => "INTEGER",
        ColumnKind::Real => "REAL",
        ColumnKind::Text | ColumnKind::Geometry => "TEXT",
    }
}

// ============================================================================
// SECTION: Value Binding
// ============================================================================

/// Converts a column value to its bound SQLite form. Geometry text is
/// normalized here so the insert and find paths always bind the identical
/// representation.
fn bind_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Integer(raw) => Value::Integer(*raw),
        ColumnValue::Real(raw) => Value::Real(*raw),
        ColumnValue::Text(raw) => Value::Text(raw.clone()),
        ColumnValue::Boolean(raw) => Value::Integer(i64::from(*raw)),
        ColumnValue::Geometry(raw) => Value::Text(normalize_wkt(raw)),
    }
}

/// Normalizes WKT text: trims, collapses whitespace runs to single spaces,
/// and drops spaces adjacent to structural characters. Both the insert and
/// the find predicate bind through this, which is what the dedup invariant
/// requires.
fn normalize_wkt(wkt: &str) -> String {
    let mut normalized = String::with_capacity(wkt.len());
    let mut pending_space = false;
    for ch in wkt.trim().chars() {
        if ch.is_whitespace() {
            pending_space = !normalized.is_empty();
            continue;
        }
        if pending_space {
            // Structural characters absorb adjacent whitespace on both
            // sides; only token-to-token gaps keep a single space.
            let after_structural = matches!(normalized.chars().last(), Some('(' | ','));
            if !after_structural && !matches!(ch, '(' | ')' | ',') {
                normalized.push(' ');
            }
            pending_space = false;
        }
        normalized.push(ch);
    }
    normalized
}

/// Raw row shape produced inside rusqlite's row mapper.
type RawRecordRow = (i64, Vec<Value>);

/// Maps one joined owned/owner row into its raw values.
fn map_record_row(spec: &TableSpec, row: &Row<'_>) -> rusqlite::Result<RawRecordRow> {
    let rowid: i64 = row.get(0)?;
    let mut values = Vec::with_capacity(spec.columns().len());
    for index in 0..spec.columns().len() {
        values.push(row.get::<_, Value>(index + 1)?);
    }
    Ok((rowid, values))
}

/// Converts a raw row into the typed record shape.
fn finish_record_row(
    spec: &TableSpec,
    raw: RawRecordRow,
) -> Result<(RecordId, ColumnAssignments), WriterError> {
    let (rowid, values) = raw;
    let id = id_from_rowid(rowid)
        .and_then(RecordId::from_raw)
        .ok_or_else(|| WriterError::Db(format!("table {} holds an invalid rowid", spec.name())))?;
    let mut assignments = ColumnAssignments::new();
    for (column, value) in spec.columns().iter().zip(values) {
        let typed = typed_value(column.kind, value).ok_or_else(|| {
            WriterError::Db(format!(
                "column {} of table {} holds an unexpected storage class",
                column.name,
                spec.name()
            ))
        })?;
        assignments.insert(column.name.clone(), typed).map_err(|error| {
            WriterError::Db(format!("row mapping failed: {error}"))
        })?;
    }
    Ok((id, assignments))
}

/// Converts a stored SQLite value back into the typed column value.
fn typed_value(kind: ColumnKind, value: Value) -> Option<ColumnValue> {
    match (kind, value) {
        (ColumnKind::Integer, Value::Integer(raw)) => Some(ColumnValue::Integer(raw)),
        (ColumnKind::Real, Value::Real(raw)) => Some(ColumnValue::Real(raw)),
        (ColumnKind::Real, Value::Integer(raw)) => {
            // SQLite stores integral reals as integers.
            #[allow(clippy::cast_precision_loss, reason = "Integral reals round-trip exactly.")]
            let real = raw as f64;
            Some(ColumnValue::Real(real))
        }
        (ColumnKind::Text, Value::Text(raw)) => Some(ColumnValue::Text(raw)),
        (ColumnKind::Boolean, Value::Integer(raw)) => Some(ColumnValue::Boolean(raw != 0)),
        (ColumnKind::Geometry, Value::Text(raw)) => Some(ColumnValue::Geometry(raw)),
        _ => None,
    }
}

/// Builds the read-path join over one owner/owned pair.
fn select_edition_records_sql(spec: &TableSpec, by_id: bool) -> String {
    let mut columns = vec![format!("o.{}", spec.pk_column())];
    for column in spec.columns() {
        columns.push(format!("o.{}", column.name));
    }
    let mut sql = format!(
        "SELECT {} FROM {} o JOIN {} w ON w.{pk} = o.{pk} WHERE w.edition_id = ?1",
        columns.join(", "),
        spec.name(),
        spec.owner_table(),
        pk = spec.pk_column()
    );
    if by_id {
        sql.push_str(&format!(" AND o.{} = ?2", spec.pk_column()));
    } else {
        sql.push_str(&format!(" ORDER BY o.{}", spec.pk_column()));
    }
    sql
}

// ============================================================================
// SECTION: Conversions
// ============================================================================

/// Maps a rusqlite error straight to a writer database error (used where the
/// retry layer does not apply, e.g. transaction begin/commit).
fn comm_to_db(error: rusqlite::Error) -> WriterError {
    WriterError::Db(CommError::from(error).to_string())
}

/// Converts a signed rowid into the unsigned id space.
fn id_from_rowid(rowid: i64) -> Option<u64> {
    u64::try_from(rowid).ok().filter(|raw| *raw > 0)
}

/// Converts an unsigned id into the signed parameter space.
fn to_db_id(raw: u64) -> Result<i64, WriterError> {
    i64::try_from(raw).map_err(|_| WriterError::Db(format!("id {raw} out of range")))
}

/// Extracts the primary key a validated Update/Delete request carries.
fn request_pk(request: &MutationRequest) -> Result<RecordId, WriterError> {
    request.pk().ok_or_else(|| {
        WriterError::Api(ApiError::BadInput {
            message: format!("{} mutation lost its primary key", request.action().as_str()),
        })
    })
}

/// Returns the current Unix timestamp in seconds.
fn unix_time_secs() -> Result<i64, WriterError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| WriterError::Db("system clock before Unix epoch".to_string()))?;
    i64::try_from(elapsed.as_secs())
        .map_err(|_| WriterError::Db("system clock out of range".to_string()))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
