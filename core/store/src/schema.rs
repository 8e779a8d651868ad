//! Table layout of the record store.
//!
//! [`create_all`] builds the layout of [`CURRENT_VERSION`] directly. Older
//! databases reach the same layout through [`crate::migration`].

use rusqlite::{Connection, OptionalExtension};

pub const TABLE_RECORD: &str = "record";
pub const TABLE_SURVEY_INSTANCE: &str = "survey_instance";
pub const TABLE_RESPONSE: &str = "response";
pub const TABLE_RESPONSE_SUPERSEDED: &str = "response_superseded";
pub const TABLE_TRANSMISSION: &str = "transmission";
pub const TABLE_SYNC_TIME: &str = "sync_time";
pub const TABLE_PREFERENCES: &str = "preferences";
pub const TABLE_LANGUAGES: &str = "languages";

/// First schema version shipped. Older databases cannot be upgraded.
pub const VER_LAUNCH: u32 = 78;
pub const VER_FORM_SUBMITTER: u32 = 79;
pub const VER_FORM_DEL_CHECK: u32 = 80;
pub const VER_FORM_VERSION: u32 = 81;
pub const VER_CADDISFLY_QN: u32 = 82;
pub const VER_PREFERENCES: u32 = 83;
pub const VER_LANGUAGES: u32 = 84;
pub const VER_RESPONSE_ITERATION: u32 = 85;
pub const VER_TRANSMISSION_FAILURES: u32 = 86;
pub const VER_RECORD_STATUS: u32 = 87;
pub const VER_STRICT_KEYS: u32 = 88;

pub const CURRENT_VERSION: u32 = VER_STRICT_KEYS;

/// Preference key under which older versions kept the selected languages.
pub const LEGACY_LANGUAGES_KEY: &str = "survey.languages";

const RESPONSE_COLUMNS: &str = r#"
    survey_instance_id INTEGER NOT NULL,
    question_id TEXT NOT NULL,
    answer TEXT NOT NULL,
    type TEXT NOT NULL,
    include INTEGER NOT NULL DEFAULT 1,
    filename TEXT,
    iteration INTEGER NOT NULL DEFAULT -1
"#;

/// SQL creating the archive table for responses displaced by migrations.
pub(crate) fn superseded_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            original_id INTEGER NOT NULL,
            {},
            reason TEXT NOT NULL,
            superseded_at INTEGER NOT NULL
        );",
        TABLE_RESPONSE_SUPERSEDED, RESPONSE_COLUMNS
    )
}

/// SQL creating the unique response key index.
pub(crate) const RESPONSE_KEY_INDEX_SQL: &str = "CREATE UNIQUE INDEX IF NOT EXISTS response_key_idx \
     ON response (survey_instance_id, question_id, iteration);";

const RECORD_COLUMNS: &str = r#"
    record_id TEXT NOT NULL UNIQUE,
    survey_group_id INTEGER,
    name TEXT,
    latitude REAL,
    longitude REAL,
    last_modified INTEGER NOT NULL DEFAULT 0,
    viewed INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 0
"#;

const SURVEY_INSTANCE_COLUMNS: &str = r#"
    uuid TEXT NOT NULL UNIQUE,
    survey_id TEXT NOT NULL,
    user_id INTEGER,
    start_date INTEGER,
    saved_date INTEGER,
    submitted_date INTEGER,
    record_id TEXT,
    status INTEGER NOT NULL DEFAULT 0,
    exported_date INTEGER,
    sync_date INTEGER,
    duration INTEGER NOT NULL DEFAULT 0,
    submitter TEXT,
    version REAL
"#;

const TRANSMISSION_COLUMNS: &str = r#"
    survey_instance_id INTEGER NOT NULL,
    survey_id TEXT,
    filename TEXT NOT NULL UNIQUE,
    status INTEGER NOT NULL DEFAULT 0,
    start_date INTEGER,
    end_date INTEGER,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    retryable INTEGER NOT NULL DEFAULT 1
"#;

const SYNC_TIME_COLUMNS: &str = r#"
    survey_group_id INTEGER NOT NULL UNIQUE,
    time TEXT
"#;

/// Secondary indexes. Dropping a table drops its indexes, so this is run
/// again after a table is rebuilt.
pub(crate) const INDEXES_SQL: &str = r#"
    CREATE INDEX IF NOT EXISTS record_name_idx ON record (name);
    CREATE INDEX IF NOT EXISTS record_group_idx ON record (survey_group_id);
    CREATE INDEX IF NOT EXISTS instance_status_idx ON survey_instance (status);
    CREATE INDEX IF NOT EXISTS instance_record_idx ON survey_instance (record_id);
    CREATE INDEX IF NOT EXISTS transmission_instance_idx ON transmission (survey_instance_id);
"#;

/// Current column definitions of the tables that older versions declared
/// with `UNIQUE ... ON CONFLICT REPLACE`.
pub(crate) fn keyed_table_columns(table: &str) -> Option<&'static str> {
    match table {
        TABLE_RECORD => Some(RECORD_COLUMNS),
        TABLE_SURVEY_INSTANCE => Some(SURVEY_INSTANCE_COLUMNS),
        TABLE_TRANSMISSION => Some(TRANSMISSION_COLUMNS),
        TABLE_SYNC_TIME => Some(SYNC_TIME_COLUMNS),
        _ => None,
    }
}

/// `CREATE TABLE` statement for `name` with an autoincrement `_id` key.
pub(crate) fn create_table_sql(name: &str, columns: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    _id INTEGER PRIMARY KEY AUTOINCREMENT,{}\n);",
        name, columns
    )
}

/// Create every table and index at [`CURRENT_VERSION`].
pub fn create_all(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        r#"
        {record}
        {survey_instance}
        {response}
        {superseded}
        {transmission}
        {sync_time}

        CREATE TABLE IF NOT EXISTS preferences (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS languages (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            survey_group_id INTEGER NOT NULL,
            language_code TEXT NOT NULL,
            UNIQUE (survey_group_id, language_code)
        );

        {indexes}
        {response_key_index}
        "#,
        record = create_table_sql(TABLE_RECORD, RECORD_COLUMNS),
        survey_instance = create_table_sql(TABLE_SURVEY_INSTANCE, SURVEY_INSTANCE_COLUMNS),
        response = create_table_sql(TABLE_RESPONSE, RESPONSE_COLUMNS),
        superseded = superseded_table_sql(),
        transmission = create_table_sql(TABLE_TRANSMISSION, TRANSMISSION_COLUMNS),
        sync_time = create_table_sql(TABLE_SYNC_TIME, SYNC_TIME_COLUMNS),
        indexes = INDEXES_SQL,
        response_key_index = RESPONSE_KEY_INDEX_SQL,
    ))
}

/// Whether the declaration of `table` still carries a legacy
/// `ON CONFLICT REPLACE` clause.
pub(crate) fn replaces_on_conflict(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(sql.is_some_and(|sql| sql.to_ascii_uppercase().contains("ON CONFLICT REPLACE")))
}

/// Whether `table` exists.
pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Whether `table` has a column named `column`.
pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    Ok(columns(conn, table)?.iter().any(|c| c == column))
}

/// Column names of `table`, in declaration order.
pub fn columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Schema version recorded in the database header.
pub fn user_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

pub(crate) fn set_user_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.pragma_update(None, "user_version", version)
}
