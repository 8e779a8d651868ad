//! Forward-only schema migrations.
//!
//! A [`SchemaMigrator`] holds an ordered list of `(threshold, step)` pairs.
//! Upgrading from version `old` to `new` applies every step whose threshold
//! lies in `(old, new]`, in ascending threshold order. The whole plan runs
//! in one transaction with a savepoint per step, and the version in the
//! database header is written in that same transaction: either every step
//! and the version bump land, or nothing does.
//!
//! Steps must be idempotent. A step may be re-applied to a database that
//! already has its effect, e.g. after a crash between releases that both
//! carried the change.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use fieldsync_common::{Error, Result};

use crate::schema::{
    self, column_exists, columns, create_table_sql, keyed_table_columns, replaces_on_conflict,
    superseded_table_sql, table_exists, INDEXES_SQL, LEGACY_LANGUAGES_KEY, RESPONSE_KEY_INDEX_SQL,
    TABLE_PREFERENCES, TABLE_RECORD, TABLE_RESPONSE, TABLE_SURVEY_INSTANCE, TABLE_SYNC_TIME,
    TABLE_TRANSMISSION,
};
use crate::sql_err;

/// One schema change.
pub trait MigrationStep: Send + Sync {
    /// Name reported in logs and migration errors.
    fn name(&self) -> &str;

    /// Apply the change. Must be idempotent.
    fn apply(&self, conn: &Connection) -> Result<()>;
}

/// Outcome of a successful upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    /// Names of the applied steps, in application order.
    pub applied: Vec<String>,
}

/// Ordered registry of migration steps.
pub struct SchemaMigrator {
    steps: Vec<(u32, Box<dyn MigrationStep>)>,
    min_version: u32,
}

impl Default for SchemaMigrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaMigrator {
    /// Empty migrator accepting any source version.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            min_version: 0,
        }
    }

    /// The steps taking a launch-version database to the current layout.
    pub fn standard() -> Self {
        Self::new()
            .with_min_version(schema::VER_LAUNCH)
            .register(
                schema::VER_FORM_SUBMITTER,
                AddColumns::new(
                    "form_submitter",
                    TABLE_SURVEY_INSTANCE,
                    &[("submitter", "TEXT")],
                ),
            )
            .register(schema::VER_FORM_DEL_CHECK, TransmissionFormId)
            .register(
                schema::VER_FORM_VERSION,
                AddColumns::new("form_version", TABLE_SURVEY_INSTANCE, &[("version", "REAL")]),
            )
            .register(
                schema::VER_CADDISFLY_QN,
                AddColumns::new("response_filename", TABLE_RESPONSE, &[("filename", "TEXT")]),
            )
            .register(schema::VER_PREFERENCES, CreatePreferences)
            .register(schema::VER_LANGUAGES, Languages)
            .register(schema::VER_RESPONSE_ITERATION, ResponseIteration)
            .register(
                schema::VER_TRANSMISSION_FAILURES,
                AddColumns::new(
                    "transmission_failures",
                    TABLE_TRANSMISSION,
                    &[
                        ("failure_count", "INTEGER NOT NULL DEFAULT 0"),
                        ("last_error", "TEXT"),
                        ("retryable", "INTEGER NOT NULL DEFAULT 1"),
                    ],
                ),
            )
            .register(schema::VER_RECORD_STATUS, RecordStatus)
            .register(schema::VER_STRICT_KEYS, StrictKeys)
    }

    /// Reject upgrades from versions below `version`.
    pub fn with_min_version(mut self, version: u32) -> Self {
        self.min_version = version;
        self
    }

    /// Add a step that brings a database up to `threshold`.
    pub fn register(mut self, threshold: u32, step: impl MigrationStep + 'static) -> Self {
        self.steps.push((threshold, Box::new(step)));
        self
    }

    /// Steps that apply when moving from `from` to `to`, in application
    /// order. Steps sharing a threshold keep their registration order.
    pub fn plan(&self, from: u32, to: u32) -> Vec<(u32, &dyn MigrationStep)> {
        let mut plan: Vec<(u32, &dyn MigrationStep)> = self
            .steps
            .iter()
            .filter(|(threshold, _)| *threshold > from && *threshold <= to)
            .map(|(threshold, step)| (*threshold, step.as_ref()))
            .collect();
        plan.sort_by_key(|(threshold, _)| *threshold);
        plan
    }

    /// Upgrade the database from `from` to `to`.
    ///
    /// # Errors
    /// - `Error::Migration` on a downgrade, on a source version below the
    ///   supported minimum, or when any step fails. On failure the database
    ///   is left exactly as it was.
    pub fn upgrade(&self, conn: &mut Connection, from: u32, to: u32) -> Result<MigrationReport> {
        let fail = |step: &str, reason: String| Error::Migration {
            from,
            to,
            step: step.to_string(),
            reason,
        };

        if from > to {
            return Err(fail("version_check", "downgrade is not supported".to_string()));
        }
        if from < self.min_version {
            return Err(fail(
                "version_check",
                format!("versions below {} cannot be upgraded", self.min_version),
            ));
        }

        let plan = self.plan(from, to);
        info!("Upgrading schema {} -> {} ({} steps)", from, to, plan.len());

        let mut tx = conn
            .transaction()
            .map_err(|e| fail("begin", e.to_string()))?;
        let mut applied = Vec::with_capacity(plan.len());

        for (threshold, step) in plan {
            debug!("Applying migration {} ({})", step.name(), threshold);
            let savepoint = tx
                .savepoint()
                .map_err(|e| fail(step.name(), e.to_string()))?;
            if let Err(e) = step.apply(&savepoint) {
                warn!("Migration {} failed: {}", step.name(), e);
                return Err(fail(step.name(), e.to_string()));
            }
            savepoint
                .commit()
                .map_err(|e| fail(step.name(), e.to_string()))?;
            applied.push(step.name().to_string());
        }

        schema::set_user_version(&tx, to).map_err(|e| fail("set_version", e.to_string()))?;
        tx.commit().map_err(|e| fail("commit", e.to_string()))?;

        info!("Schema upgraded to {}", to);
        Ok(MigrationReport { from, to, applied })
    }
}

/// Adds columns that are missing from a table.
pub struct AddColumns {
    name: &'static str,
    table: &'static str,
    columns: &'static [(&'static str, &'static str)],
}

impl AddColumns {
    pub fn new(
        name: &'static str,
        table: &'static str,
        columns: &'static [(&'static str, &'static str)],
    ) -> Self {
        Self {
            name,
            table,
            columns,
        }
    }
}

impl MigrationStep for AddColumns {
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        for (column, definition) in self.columns {
            add_column_if_missing(conn, self.table, column, definition)?;
        }
        Ok(())
    }
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    if column_exists(conn, table, column).map_err(sql_err)? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {};",
        table, column, definition
    ))
    .map_err(sql_err)
}

/// Records the form id on transmissions so artifacts can be matched to
/// their form after the instance is gone.
struct TransmissionFormId;

impl MigrationStep for TransmissionFormId {
    fn name(&self) -> &str {
        "transmission_form_id"
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        add_column_if_missing(conn, TABLE_TRANSMISSION, "survey_id", "TEXT")?;
        conn.execute(
            "UPDATE transmission SET survey_id = (
                SELECT survey_id FROM survey_instance
                WHERE survey_instance._id = transmission.survey_instance_id
             ) WHERE survey_id IS NULL",
            [],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

struct CreatePreferences;

impl MigrationStep for CreatePreferences {
    fn name(&self) -> &str {
        "preferences"
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS preferences (key TEXT PRIMARY KEY, value TEXT);",
        )
        .map_err(sql_err)
    }
}

/// Moves the language selection from a single preference to per-group rows.
struct Languages;

impl MigrationStep for Languages {
    fn name(&self) -> &str {
        "languages"
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS languages (
                _id INTEGER PRIMARY KEY AUTOINCREMENT,
                survey_group_id INTEGER NOT NULL,
                language_code TEXT NOT NULL,
                UNIQUE (survey_group_id, language_code)
            );",
        )
        .map_err(sql_err)?;

        if !table_exists(conn, TABLE_PREFERENCES).map_err(sql_err)? {
            return Ok(());
        }
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                [LEGACY_LANGUAGES_KEY],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(sql_err)?;

        let codes: Vec<&str> = stored
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .collect();
        if codes.is_empty() {
            return Ok(());
        }

        let mut groups = conn
            .prepare("SELECT DISTINCT survey_group_id FROM record WHERE survey_group_id IS NOT NULL")
            .map_err(sql_err)?;
        let groups = groups
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;

        for group in groups {
            for code in &codes {
                conn.execute(
                    "INSERT OR IGNORE INTO languages (survey_group_id, language_code) VALUES (?1, ?2)",
                    params![group, code],
                )
                .map_err(sql_err)?;
            }
        }
        Ok(())
    }
}

/// Splits legacy `question|iteration` keys into two columns and enforces
/// one response per `(instance, question, iteration)`.
///
/// Rows that collide after the split are archived in `response_superseded`,
/// keeping the newest row live. Keys whose suffix is not an iteration number
/// are archived as well. Nothing is deleted outright.
struct ResponseIteration;

impl ResponseIteration {
    fn archive(conn: &Connection, response_id: i64, reason: &str, now: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO response_superseded
                (original_id, survey_instance_id, question_id, answer, type, include,
                 filename, iteration, reason, superseded_at)
             SELECT _id, survey_instance_id, question_id, answer, type, include,
                 filename, iteration, ?2, ?3
             FROM response WHERE _id = ?1",
            params![response_id, reason, now],
        )
        .map_err(sql_err)?;
        conn.execute("DELETE FROM response WHERE _id = ?1", [response_id])
            .map_err(sql_err)?;
        Ok(())
    }
}

impl MigrationStep for ResponseIteration {
    fn name(&self) -> &str {
        "response_iteration"
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        add_column_if_missing(conn, TABLE_RESPONSE, "filename", "TEXT")?;
        add_column_if_missing(conn, TABLE_RESPONSE, "iteration", "INTEGER NOT NULL DEFAULT -1")?;
        conn.execute_batch(&superseded_table_sql()).map_err(sql_err)?;
        let now = Utc::now().timestamp_millis();

        let mut stmt = conn
            .prepare("SELECT _id, question_id FROM response WHERE question_id LIKE '%|%'")
            .map_err(sql_err)?;
        let composite = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        drop(stmt);

        let mut split = 0usize;
        let mut unparseable = 0usize;
        for (id, key) in composite {
            let Some((question, suffix)) = key.split_once('|') else {
                continue;
            };
            match suffix.trim().parse::<u32>() {
                Ok(iteration) => {
                    conn.execute(
                        "UPDATE response SET question_id = ?2, iteration = ?3 WHERE _id = ?1",
                        params![id, question, iteration],
                    )
                    .map_err(sql_err)?;
                    split += 1;
                }
                Err(_) => {
                    Self::archive(conn, id, "unparseable_key", now)?;
                    unparseable += 1;
                }
            }
        }

        let mut stmt = conn
            .prepare(
                "SELECT r._id FROM response r
                 WHERE EXISTS (
                    SELECT 1 FROM response newer
                    WHERE newer.survey_instance_id = r.survey_instance_id
                      AND newer.question_id = r.question_id
                      AND newer.iteration = r.iteration
                      AND newer._id > r._id
                 )",
            )
            .map_err(sql_err)?;
        let duplicates = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        drop(stmt);

        for id in &duplicates {
            Self::archive(conn, *id, "duplicate", now)?;
        }

        conn.execute_batch(RESPONSE_KEY_INDEX_SQL).map_err(sql_err)?;

        if split + unparseable + duplicates.len() > 0 {
            info!(
                "Response keys migrated: {} split, {} duplicates archived, {} unparseable archived",
                split,
                duplicates.len(),
                unparseable
            );
        }
        Ok(())
    }
}

/// Adds the viewed flag and derived status to data points.
struct RecordStatus;

impl MigrationStep for RecordStatus {
    fn name(&self) -> &str {
        "record_status"
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        add_column_if_missing(conn, TABLE_RECORD, "viewed", "INTEGER NOT NULL DEFAULT 0")?;
        add_column_if_missing(conn, TABLE_RECORD, "status", "INTEGER NOT NULL DEFAULT 0")?;
        conn.execute(
            "UPDATE record SET status = COALESCE((
                SELECT MAX(status) FROM survey_instance
                WHERE survey_instance.record_id = record.record_id
             ), 0)",
            [],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

/// Rebuilds tables declared with `UNIQUE ... ON CONFLICT REPLACE`.
///
/// Under that clause a duplicate key silently deletes the existing row and
/// inserts a new one with a new `_id`, orphaning whatever referenced it.
/// After the rebuild a duplicate key is a constraint violation. Row ids are
/// kept. Key columns that older versions left NULL get a `legacy-<_id>`
/// placeholder instead of dropping the row.
struct StrictKeys;

impl StrictKeys {
    const TABLES: [&'static str; 4] = [
        TABLE_RECORD,
        TABLE_SURVEY_INSTANCE,
        TABLE_TRANSMISSION,
        TABLE_SYNC_TIME,
    ];

    /// Value copied in place of NULL where the current layout is NOT NULL.
    fn fill(table: &str, column: &str) -> Option<&'static str> {
        match (table, column) {
            (TABLE_RECORD, "record_id")
            | (TABLE_SURVEY_INSTANCE, "uuid")
            | (TABLE_TRANSMISSION, "filename") => Some("'legacy-' || _id"),
            (TABLE_SYNC_TIME, "survey_group_id") => Some("-_id"),
            (_, "status") => Some("0"),
            _ => None,
        }
    }

    fn rebuild(conn: &Connection, table: &str, definition: &str) -> Result<()> {
        let rebuilt = format!("{}_rebuilt", table);
        conn.execute_batch(&create_table_sql(&rebuilt, definition))
            .map_err(sql_err)?;

        let old = columns(conn, table).map_err(sql_err)?;
        let shared: Vec<String> = columns(conn, &rebuilt)
            .map_err(sql_err)?
            .into_iter()
            .filter(|c| old.contains(c))
            .collect();
        let select: Vec<String> = shared
            .iter()
            .map(|c| match Self::fill(table, c) {
                Some(fill) => format!("COALESCE({}, {})", c, fill),
                None => c.clone(),
            })
            .collect();

        conn.execute_batch(&format!(
            "INSERT INTO {rebuilt} ({cols}) SELECT {select} FROM {table} ORDER BY _id;
             DROP TABLE {table};
             ALTER TABLE {rebuilt} RENAME TO {table};",
            rebuilt = rebuilt,
            cols = shared.join(", "),
            select = select.join(", "),
            table = table,
        ))
        .map_err(sql_err)
    }
}

impl MigrationStep for StrictKeys {
    fn name(&self) -> &str {
        "strict_keys"
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        for table in Self::TABLES {
            if !table_exists(conn, table).map_err(sql_err)?
                || !replaces_on_conflict(conn, table).map_err(sql_err)?
            {
                continue;
            }
            let definition = keyed_table_columns(table)
                .ok_or_else(|| Error::Storage(format!("No current layout for {}", table)))?;
            Self::rebuild(conn, table, definition)?;
            info!("Rebuilt {} without ON CONFLICT REPLACE", table);
        }
        conn.execute_batch(INDEXES_SQL).map_err(sql_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::LAUNCH_LAYOUT;
    use crate::schema::{create_all, user_version, CURRENT_VERSION, TABLE_RESPONSE_SUPERSEDED};
    use rusqlite::types::Value;
    use std::collections::{BTreeMap, BTreeSet};

    fn launch_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LAUNCH_LAYOUT).unwrap();
        conn
    }

    /// Launch layout with rows touched by every standard step.
    fn seeded_launch_db() -> Connection {
        let conn = launch_db();
        conn.execute_batch(
            r#"
            INSERT INTO record (record_id, survey_group_id, name) VALUES
                ('dp-1', 10, 'Well'), ('dp-2', 20, 'Pump'), (NULL, 20, 'Unnamed');
            INSERT INTO survey_instance (_id, uuid, survey_id, record_id, status) VALUES
                (1, 'u-1', 'F1', 'dp-1', 1), (2, 'u-2', 'F1', 'dp-2', 3), (3, NULL, 'F2', 'dp-2', NULL);
            INSERT INTO response (survey_instance_id, question_id, answer, type) VALUES
                (1, 'Q1', 'plain', 'VALUE'),
                (1, 'Q2|0', 'first', 'VALUE'),
                (1, 'Q2|1', 'second', 'VALUE'),
                (1, 'Q3|2', 'old', 'VALUE'),
                (1, 'Q3|2', 'new', 'VALUE'),
                (1, 'Q4|x', 'lost key', 'VALUE'),
                (2, 'Q1', 'other', 'VALUE');
            INSERT INTO transmission (survey_instance_id, filename, status) VALUES
                (1, 'u-1.zip', 0), (2, 'u-2.zip', 2), (2, NULL, NULL);
            INSERT INTO sync_time (survey_group_id, time) VALUES (10, '1700000000'), (NULL, 'x');
            CREATE TABLE preferences (key TEXT PRIMARY KEY, value TEXT);
            INSERT INTO preferences VALUES ('survey.languages', 'en,fr');
            "#,
        )
        .unwrap();
        conn
    }

    type Snapshot = BTreeMap<String, (Vec<String>, Vec<String>)>;

    /// Layout and contents of every table, plus index names and the version.
    /// Archive timestamps are left out; they record when a step ran.
    fn snapshot(conn: &Connection) -> Snapshot {
        let strings = |sql: &str| -> Vec<String> {
            let mut stmt = conn.prepare(sql).unwrap();
            stmt.query_map([], |r| r.get::<_, String>(0))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };

        let mut snapshot = Snapshot::new();
        for table in strings(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        ) {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table)).unwrap();
            let layout: Vec<String> = stmt
                .query_map([], |r| {
                    Ok(format!(
                        "{} {} notnull={} default={:?} pk={}",
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, Value>(4)?,
                        r.get::<_, i64>(5)?
                    ))
                })
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap();

            let cols: Vec<String> = columns(conn, &table)
                .unwrap()
                .into_iter()
                .filter(|c| c != "superseded_at")
                .collect();
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM {} ORDER BY rowid", cols.join(", "), table))
                .unwrap();
            let rows: Vec<String> = stmt
                .query_map([], |r| {
                    (0..cols.len())
                        .map(|i| r.get::<_, Value>(i).map(|v| format!("{:?}", v)))
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map(|values| values.join(" | "))
                })
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap();
            snapshot.insert(table, (layout, rows));
        }

        snapshot.insert(
            "<indexes>".to_string(),
            (strings("SELECT name FROM sqlite_master WHERE type = 'index' ORDER BY name"), Vec::new()),
        );
        snapshot.insert(
            "<version>".to_string(),
            (vec![user_version(conn).unwrap().to_string()], Vec::new()),
        );
        snapshot
    }

    /// Appends its name to a log table when applied.
    struct Recorder(&'static str);

    impl MigrationStep for Recorder {
        fn name(&self) -> &str {
            self.0
        }

        fn apply(&self, conn: &Connection) -> Result<()> {
            conn.execute("INSERT INTO applied (name) VALUES (?1)", [self.0])
                .map_err(sql_err)?;
            Ok(())
        }
    }

    struct Failing;

    impl MigrationStep for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn apply(&self, _conn: &Connection) -> Result<()> {
            Err(Error::Storage("boom".to_string()))
        }
    }

    fn applied(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("SELECT name FROM applied ORDER BY rowid").unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn test_steps_apply_in_threshold_order() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE applied (name TEXT)").unwrap();

        let migrator = SchemaMigrator::new()
            .register(84, Recorder("c"))
            .register(80, Recorder("a"))
            .register(82, Recorder("b"))
            .register(86, Recorder("skipped"))
            .register(79, Recorder("too_old"));

        let report = migrator.upgrade(&mut conn, 79, 85).unwrap();
        assert_eq!(report.applied, vec!["a", "b", "c"]);
        assert_eq!(applied(&conn), vec!["a", "b", "c"]);
        assert_eq!(user_version(&conn).unwrap(), 85);
    }

    #[test]
    fn test_failed_step_rolls_back_everything() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE applied (name TEXT); PRAGMA user_version = 1;")
            .unwrap();

        let migrator = SchemaMigrator::new()
            .register(2, Recorder("first"))
            .register(3, Failing);

        let err = migrator.upgrade(&mut conn, 1, 3).unwrap_err();
        match err {
            Error::Migration { from, to, step, .. } => {
                assert_eq!((from, to), (1, 3));
                assert_eq!(step, "failing");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(applied(&conn).is_empty());
        assert_eq!(user_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_downgrade_and_unsupported_versions_rejected() {
        let mut conn = launch_db();
        let migrator = SchemaMigrator::standard();
        assert!(matches!(
            migrator.upgrade(&mut conn, CURRENT_VERSION, 80),
            Err(Error::Migration { .. })
        ));
        assert!(matches!(
            migrator.upgrade(&mut conn, 50, CURRENT_VERSION),
            Err(Error::Migration { .. })
        ));
    }

    #[test]
    fn test_launch_layout_reaches_current_layout() {
        let mut migrated = launch_db();
        SchemaMigrator::standard()
            .upgrade(&mut migrated, 78, CURRENT_VERSION)
            .unwrap();

        let fresh = Connection::open_in_memory().unwrap();
        create_all(&fresh).unwrap();

        for table in [
            TABLE_RECORD,
            TABLE_SURVEY_INSTANCE,
            TABLE_RESPONSE,
            TABLE_TRANSMISSION,
            TABLE_SYNC_TIME,
            TABLE_PREFERENCES,
            schema::TABLE_LANGUAGES,
            TABLE_RESPONSE_SUPERSEDED,
        ] {
            let a: BTreeSet<String> = columns(&migrated, table).unwrap().into_iter().collect();
            let b: BTreeSet<String> = columns(&fresh, table).unwrap().into_iter().collect();
            assert_eq!(a, b, "columns of {} differ", table);
        }
    }

    #[test]
    fn test_standard_steps_are_idempotent() {
        let mut conn = seeded_launch_db();
        let migrator = SchemaMigrator::standard();
        let report = migrator.upgrade(&mut conn, 78, CURRENT_VERSION).unwrap();
        assert_eq!(report.applied.len(), 10);
        let once = snapshot(&conn);

        for (_, step) in migrator.plan(78, CURRENT_VERSION) {
            step.apply(&conn).unwrap();
        }
        assert_eq!(snapshot(&conn), once);
    }

    #[test]
    fn test_direct_upgrade_matches_stepwise() {
        let migrator = SchemaMigrator::standard();

        let mut direct = seeded_launch_db();
        migrator.upgrade(&mut direct, 78, CURRENT_VERSION).unwrap();

        let mut stepwise = seeded_launch_db();
        let first = migrator.upgrade(&mut stepwise, 78, 82).unwrap();
        let second = migrator.upgrade(&mut stepwise, 82, CURRENT_VERSION).unwrap();
        assert_eq!(first.applied.len() + second.applied.len(), 10);

        assert_eq!(snapshot(&direct), snapshot(&stepwise));
    }

    #[test]
    fn test_legacy_replace_clauses_removed() {
        let mut conn = seeded_launch_db();
        assert!(replaces_on_conflict(&conn, TABLE_SURVEY_INSTANCE).unwrap());
        SchemaMigrator::standard()
            .upgrade(&mut conn, 78, CURRENT_VERSION)
            .unwrap();

        for table in [TABLE_RECORD, TABLE_SURVEY_INSTANCE, TABLE_TRANSMISSION, TABLE_SYNC_TIME] {
            assert!(!replaces_on_conflict(&conn, table).unwrap(), "{} still replaces", table);
        }

        // A duplicate key is now an error instead of a silent re-insert.
        let duplicate = conn.execute(
            "INSERT INTO survey_instance (uuid, survey_id) VALUES ('u-1', 'F9')",
            [],
        );
        assert!(duplicate.is_err());
        let (id, form): (i64, String) = conn
            .query_row(
                "SELECT _id, survey_id FROM survey_instance WHERE uuid = 'u-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((id, form.as_str()), (1, "F1"));

        let uuid: String = conn
            .query_row("SELECT uuid FROM survey_instance WHERE _id = 3", [], |r| r.get(0))
            .unwrap();
        assert_eq!(uuid, "legacy-3");
        let (filename, status): (String, i64) = conn
            .query_row(
                "SELECT filename, status FROM transmission WHERE _id = 3",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((filename.as_str(), status), ("legacy-3", 0));
        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'instance_status_idx'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }

    #[test]
    fn test_pipe_keys_split_and_duplicates_archived() {
        let mut conn = launch_db();
        conn.execute_batch(
            r#"
            INSERT INTO survey_instance (_id, uuid, survey_id, status) VALUES (1, 'u-1', 'F1', 1);
            INSERT INTO response (survey_instance_id, question_id, answer, type) VALUES
                (1, 'Q1', 'plain', 'VALUE'),
                (1, 'Q2|0', 'first', 'VALUE'),
                (1, 'Q2|1', 'second', 'VALUE'),
                (1, 'Q3|2', 'old', 'VALUE'),
                (1, 'Q3|2', 'new', 'VALUE'),
                (1, 'Q4|x', 'lost key', 'VALUE');
            "#,
        )
        .unwrap();

        SchemaMigrator::standard()
            .upgrade(&mut conn, 78, CURRENT_VERSION)
            .unwrap();

        let pipes: i64 = conn
            .query_row("SELECT COUNT(*) FROM response WHERE question_id LIKE '%|%'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pipes, 0);

        let rows: Vec<(String, i64, String)> = {
            let mut stmt = conn
                .prepare("SELECT question_id, iteration, answer FROM response ORDER BY question_id, iteration")
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        assert_eq!(
            rows,
            vec![
                ("Q1".to_string(), -1, "plain".to_string()),
                ("Q2".to_string(), 0, "first".to_string()),
                ("Q2".to_string(), 1, "second".to_string()),
                ("Q3".to_string(), 2, "new".to_string()),
            ]
        );

        let archived: Vec<(String, String)> = {
            let mut stmt = conn
                .prepare("SELECT answer, reason FROM response_superseded ORDER BY original_id")
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        assert_eq!(
            archived,
            vec![
                ("old".to_string(), "duplicate".to_string()),
                ("lost key".to_string(), "unparseable_key".to_string()),
            ]
        );
    }

    #[test]
    fn test_languages_backfilled_per_group() {
        let mut conn = launch_db();
        conn.execute_batch(
            r#"
            INSERT INTO record (record_id, survey_group_id) VALUES ('dp-1', 10), ('dp-2', 20);
            CREATE TABLE preferences (key TEXT PRIMARY KEY, value TEXT);
            INSERT INTO preferences VALUES ('survey.languages', 'en, fr');
            PRAGMA user_version = 83;
            "#,
        )
        .unwrap();

        SchemaMigrator::standard()
            .upgrade(&mut conn, 83, CURRENT_VERSION)
            .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM languages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_record_status_derived_from_instances() {
        let mut conn = launch_db();
        conn.execute_batch(
            r#"
            INSERT INTO record (record_id, survey_group_id) VALUES ('dp-1', 1), ('dp-2', 1);
            INSERT INTO survey_instance (uuid, survey_id, record_id, status) VALUES
                ('a', 'F', 'dp-1', 0), ('b', 'F', 'dp-1', 3);
            INSERT INTO transmission (survey_instance_id, filename, status) VALUES (2, 'b.zip', 2);
            "#,
        )
        .unwrap();

        SchemaMigrator::standard()
            .upgrade(&mut conn, 78, CURRENT_VERSION)
            .unwrap();

        let status: i64 = conn
            .query_row("SELECT status FROM record WHERE record_id = 'dp-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, 3);
        let form: String = conn
            .query_row("SELECT survey_id FROM transmission", [], |r| r.get(0))
            .unwrap();
        assert_eq!(form, "F");
    }
}
