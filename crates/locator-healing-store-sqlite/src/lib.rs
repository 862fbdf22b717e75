use std::path::Path;

use anyhow::{anyhow, Context, Result};
use locator_healing_core::{
    Healing, HealingError, HealingId, HealingQuery, HealingRepository, HealingResult,
    HealingResultId, HealingResultRepository, Locator, ReportRecord, ReportRecordId,
    ReportRepository, Selector, SelectorId, SelectorRepository,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS selectors (
  selector_id TEXT PRIMARY KEY,
  class_name TEXT NOT NULL,
  method_name TEXT NOT NULL,
  locator_strategy TEXT NOT NULL,
  locator_value TEXT NOT NULL,
  url TEXT NOT NULL,
  command TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS healings (
  healing_id TEXT PRIMARY KEY,
  selector_id TEXT NOT NULL,
  page_content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (selector_id) REFERENCES selectors(selector_id)
);

CREATE TABLE IF NOT EXISTS healing_results (
  healing_result_id TEXT PRIMARY KEY,
  healing_id TEXT NOT NULL,
  locator_strategy TEXT NOT NULL,
  locator_value TEXT NOT NULL CHECK (length(locator_value) > 0),
  score REAL NOT NULL,
  success INTEGER CHECK (success IN (0, 1)),
  superseded INTEGER NOT NULL DEFAULT 0 CHECK (superseded IN (0, 1)),
  created_at TEXT NOT NULL,
  FOREIGN KEY (healing_id) REFERENCES healings(healing_id)
);

CREATE TABLE IF NOT EXISTS report_records (
  report_record_id TEXT PRIMARY KEY,
  session_key TEXT,
  healing_id TEXT NOT NULL,
  healing_result_id TEXT NOT NULL,
  selector_id TEXT NOT NULL,
  screenshot TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (healing_id) REFERENCES healings(healing_id),
  FOREIGN KEY (healing_result_id) REFERENCES healing_results(healing_result_id),
  FOREIGN KEY (selector_id) REFERENCES selectors(selector_id)
);

CREATE INDEX IF NOT EXISTS idx_selectors_class_method ON selectors(class_name, method_name);
CREATE INDEX IF NOT EXISTS idx_healings_selector ON healings(selector_id);
CREATE INDEX IF NOT EXISTS idx_healing_results_healing ON healing_results(healing_id);
CREATE INDEX IF NOT EXISTS idx_report_records_result ON report_records(healing_result_id);
";

const SELECT_HEALING_COLUMNS: &str = "
SELECT
    h.healing_id, h.page_content, h.created_at,
    s.selector_id, s.class_name, s.method_name, s.locator_strategy, s.locator_value,
    s.url, s.command, s.created_at
FROM healings h
JOIN selectors s ON s.selector_id = h.selector_id";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// One unit of work. Dropping it without [`StoreTransaction::commit`] rolls back.
pub struct StoreTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl SqliteStore {
    /// Open a SQLite-backed healing store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v1 transaction")?;
            // Another connection may have migrated while this one waited for the lock.
            if current_schema_version(&tx)? < 1 {
                tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
                record_schema_version(&tx, 1)?;
                tracing::info!(version = 1, "applied schema migration");
            }
            tx.commit().context("failed to commit migration v1")?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Start a write unit of work holding the database write lock from its first statement.
    ///
    /// # Errors
    /// Returns an error when the lock cannot be acquired within the busy timeout.
    pub fn begin_write(&mut self) -> Result<StoreTransaction<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")?;
        Ok(StoreTransaction { tx })
    }

    /// Start a read-only unit of work over one consistent snapshot.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn begin_read(&mut self) -> Result<StoreTransaction<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .context("failed to start read transaction")?;
        Ok(StoreTransaction { tx })
    }

    /// Load every report record, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_report_records(&self) -> Result<Vec<ReportRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT report_record_id, session_key, healing_id, healing_result_id, selector_id,
                    screenshot, created_at
             FROM report_records
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let report_record_id_raw: String = row.get(0)?;
            let healing_result_id_raw: String = row.get(3)?;
            records.push(ReportRecord {
                report_record_id: ReportRecordId(parse_ulid(&report_record_id_raw)?),
                session_key: row.get(1)?,
                healing_id: HealingId(row.get(2)?),
                healing_result_id: HealingResultId(parse_ulid(&healing_result_id_raw)?),
                selector_id: SelectorId(row.get(4)?),
                screenshot: row.get(5)?,
                created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            });
        }

        Ok(records)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl StoreTransaction<'_> {
    /// # Errors
    /// Returns an error when `SQLite` rejects the commit.
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit transaction")
    }
}

impl SelectorRepository for StoreTransaction<'_> {
    fn find_selector(&self, selector_id: &SelectorId) -> Result<Option<Selector>, HealingError> {
        load_selector(&self.tx, selector_id).map_err(storage_error)
    }

    fn insert_selector(&mut self, selector: &Selector) -> Result<(), HealingError> {
        let created_at = rfc3339(selector.created_at).map_err(storage_error)?;
        self.tx
            .execute(
                "INSERT INTO selectors(
                    selector_id, class_name, method_name, locator_strategy, locator_value,
                    url, command, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    selector.selector_id.as_str(),
                    selector.class_name,
                    selector.method_name,
                    selector.locator.strategy,
                    selector.locator.value,
                    selector.url,
                    selector.command,
                    created_at,
                ],
            )
            .map_err(|err| insert_error(&err, "selector", selector.selector_id.as_str()))?;
        Ok(())
    }
}

impl HealingRepository for StoreTransaction<'_> {
    fn find_healing(&self, healing_id: &HealingId) -> Result<Option<Healing>, HealingError> {
        load_healing(&self.tx, healing_id).map_err(storage_error)
    }

    fn insert_healing(&mut self, healing: &Healing) -> Result<(), HealingError> {
        let created_at = rfc3339(healing.created_at).map_err(storage_error)?;
        self.tx
            .execute(
                "INSERT INTO healings(healing_id, selector_id, page_content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    healing.healing_id.as_str(),
                    healing.selector.selector_id.as_str(),
                    healing.page_content,
                    created_at,
                ],
            )
            .map_err(|err| insert_error(&err, "healing", healing.healing_id.as_str()))?;
        Ok(())
    }

    fn find_healings(&self, query: &HealingQuery) -> Result<Vec<Healing>, HealingError> {
        load_healings(&self.tx, query).map_err(storage_error)
    }
}

impl HealingResultRepository for StoreTransaction<'_> {
    fn insert_results(&mut self, results: &[HealingResult]) -> Result<(), HealingError> {
        let sp = self.tx.savepoint().map_err(|err| storage_error(err.into()))?;
        {
            let mut stmt = sp
                .prepare(
                    "INSERT INTO healing_results(
                        healing_result_id, healing_id, locator_strategy, locator_value, score,
                        success, superseded, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(|err| storage_error(err.into()))?;
            for result in results {
                let created_at = rfc3339(result.created_at).map_err(storage_error)?;
                stmt.execute(params![
                    result.healing_result_id.to_string(),
                    result.healing_id.as_str(),
                    result.locator.strategy,
                    result.locator.value,
                    result.score,
                    result.success,
                    result.superseded,
                    created_at,
                ])
                .map_err(|err| {
                    insert_error(&err, "healing result", &result.healing_result_id.to_string())
                })?;
            }
        }
        sp.commit().map_err(|err| storage_error(err.into()))
    }

    fn supersede_results(&mut self, healing_id: &HealingId) -> Result<usize, HealingError> {
        self.tx
            .execute(
                "UPDATE healing_results SET superseded = 1
                 WHERE healing_id = ?1 AND superseded = 0",
                params![healing_id.as_str()],
            )
            .map_err(|err| storage_error(err.into()))
    }

    fn find_result(
        &self,
        healing_result_id: HealingResultId,
    ) -> Result<Option<HealingResult>, HealingError> {
        load_result(&self.tx, healing_result_id).map_err(storage_error)
    }

    fn update_result_success(
        &mut self,
        healing_result_id: HealingResultId,
        success: bool,
    ) -> Result<(), HealingError> {
        let changed = self
            .tx
            .execute(
                "UPDATE healing_results SET success = ?2 WHERE healing_result_id = ?1",
                params![healing_result_id.to_string(), success],
            )
            .map_err(|err| storage_error(err.into()))?;
        if changed == 0 {
            return Err(HealingError::Storage(format!(
                "healing result not found: {healing_result_id}"
            )));
        }
        Ok(())
    }
}

impl ReportRepository for StoreTransaction<'_> {
    fn insert_report_record(&mut self, record: &ReportRecord) -> Result<(), HealingError> {
        let created_at = rfc3339(record.created_at).map_err(storage_error)?;
        self.tx
            .execute(
                "INSERT INTO report_records(
                    report_record_id, session_key, healing_id, healing_result_id, selector_id,
                    screenshot, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.report_record_id.to_string(),
                    record.session_key,
                    record.healing_id.as_str(),
                    record.healing_result_id.to_string(),
                    record.selector_id.as_str(),
                    record.screenshot,
                    created_at,
                ],
            )
            .map_err(|err| {
                insert_error(&err, "report record", &record.report_record_id.to_string())
            })?;
        Ok(())
    }
}

fn load_selector(conn: &Connection, selector_id: &SelectorId) -> Result<Option<Selector>> {
    let mut stmt = conn.prepare(
        "SELECT selector_id, class_name, method_name, locator_strategy, locator_value,
                url, command, created_at
         FROM selectors
         WHERE selector_id = ?1",
    )?;
    let raw = stmt
        .query_row(params![selector_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                Locator { strategy: row.get(3)?, value: row.get(4)? },
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })
        .optional()
        .context("failed to load selector")?;

    let Some((selector_id, class_name, method_name, locator, url, command, created_at)) = raw
    else {
        return Ok(None);
    };

    Ok(Some(Selector {
        selector_id: SelectorId(selector_id),
        class_name,
        method_name,
        locator,
        url,
        command,
        created_at: parse_rfc3339(&created_at)?,
    }))
}

fn load_healing(conn: &Connection, healing_id: &HealingId) -> Result<Option<Healing>> {
    let mut stmt = conn.prepare(&format!("{SELECT_HEALING_COLUMNS} WHERE h.healing_id = ?1"))?;
    let mut rows = stmt.query(params![healing_id.as_str()])?;

    match rows.next()? {
        Some(row) => {
            let mut healing = decode_healing(row)?;
            healing.results = load_results_for(conn, &healing.healing_id)?;
            Ok(Some(healing))
        }
        None => Ok(None),
    }
}

fn load_healings(conn: &Connection, query: &HealingQuery) -> Result<Vec<Healing>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_HEALING_COLUMNS}
         WHERE (?1 IS NULL OR s.selector_id = ?1)
           AND (?2 IS NULL OR s.class_name = ?2)
           AND (?3 IS NULL OR s.method_name = ?3)
           AND (?4 IS NULL OR s.locator_value = ?4)
           AND (?5 IS NULL OR s.url = ?5)
         ORDER BY h.created_at ASC, h.rowid ASC"
    ))?;
    let mut rows = stmt.query(params![
        query.selector_id.as_ref().map(SelectorId::as_str),
        query.class_name,
        query.method_name,
        query.locator_value,
        query.url,
    ])?;

    let mut healings = Vec::new();
    while let Some(row) = rows.next()? {
        healings.push(decode_healing(row)?);
    }

    for healing in &mut healings {
        healing.results = load_results_for(conn, &healing.healing_id)?;
    }

    Ok(healings)
}

fn decode_healing(row: &Row<'_>) -> Result<Healing> {
    Ok(Healing {
        healing_id: HealingId(row.get(0)?),
        page_content: row.get(1)?,
        created_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
        selector: Selector {
            selector_id: SelectorId(row.get(3)?),
            class_name: row.get(4)?,
            method_name: row.get(5)?,
            locator: Locator { strategy: row.get(6)?, value: row.get(7)? },
            url: row.get(8)?,
            command: row.get(9)?,
            created_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        },
        results: Vec::new(),
    })
}

const SELECT_RESULT_COLUMNS: &str = "
SELECT healing_result_id, healing_id, locator_strategy, locator_value, score,
       success, superseded, created_at
FROM healing_results";

fn load_results_for(conn: &Connection, healing_id: &HealingId) -> Result<Vec<HealingResult>> {
    let mut stmt =
        conn.prepare(&format!("{SELECT_RESULT_COLUMNS} WHERE healing_id = ?1 ORDER BY rowid ASC"))?;
    let mut rows = stmt.query(params![healing_id.as_str()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(decode_result(row)?);
    }
    Ok(results)
}

fn load_result(
    conn: &Connection,
    healing_result_id: HealingResultId,
) -> Result<Option<HealingResult>> {
    let mut stmt =
        conn.prepare(&format!("{SELECT_RESULT_COLUMNS} WHERE healing_result_id = ?1"))?;
    let mut rows = stmt.query(params![healing_result_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_result(row)?)),
        None => Ok(None),
    }
}

fn decode_result(row: &Row<'_>) -> Result<HealingResult> {
    let healing_result_id_raw: String = row.get(0)?;
    Ok(HealingResult {
        healing_result_id: HealingResultId(parse_ulid(&healing_result_id_raw)?),
        healing_id: HealingId(row.get(1)?),
        locator: Locator { strategy: row.get(2)?, value: row.get(3)? },
        score: row.get(4)?,
        success: row.get(5)?,
        superseded: row.get(6)?,
        created_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
    })
}

fn storage_error(err: anyhow::Error) -> HealingError {
    HealingError::Storage(format!("{err:#}"))
}

fn insert_error(err: &rusqlite::Error, entity: &str, id: &str) -> HealingError {
    if is_unique_violation(err) {
        return HealingError::DuplicateIdentity(format!("{entity} {id}"));
    }
    HealingError::Storage(format!("failed to insert {entity} {id}: {err}"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                )
        }
        _ => false,
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}
