//! SQLite-backed record store.
//!
//! Holds data points, survey instances, responses, and transmissions for
//! one device. All writes go through a single connection guarded by a
//! mutex; multi-row operations run in a transaction.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fieldsync_codec::ResponseType;
use fieldsync_common::{Error, InstanceId, Result, TransmissionId};

use crate::migration::{MigrationReport, SchemaMigrator};
use crate::model::{
    DataPoint, DataPointFields, Response, ResponseFields, SurveyInstance, SurveyInstanceFields,
    SurveyInstanceStatus, Transmission, TransmissionStatus, NO_ITERATION,
};
use crate::schema::{self, CURRENT_VERSION};
use crate::{is_constraint_violation, sql_err};

const DATA_POINT_COLUMNS: &str =
    "record_id, survey_group_id, name, latitude, longitude, last_modified, viewed, status";

const INSTANCE_COLUMNS: &str = "_id, uuid, survey_id, version, record_id, status, user_id, \
     submitter, start_date, saved_date, submitted_date, exported_date, sync_date, duration";

const RESPONSE_COLUMNS: &str =
    "_id, survey_instance_id, question_id, iteration, type, answer, filename, include";

const TRANSMISSION_COLUMNS: &str = "_id, survey_instance_id, survey_id, filename, status, \
     start_date, end_date, failure_count, last_error, retryable";

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn require_id(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Precondition(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn conversion(idx: usize, e: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
}

fn iteration_to_sql(iteration: Option<u32>) -> i64 {
    iteration.map_or(NO_ITERATION, i64::from)
}

fn iteration_from_sql(value: i64) -> Option<u32> {
    u32::try_from(value).ok()
}

fn data_point_from_row(row: &Row<'_>) -> rusqlite::Result<DataPoint> {
    let status: Option<i64> = row.get(7)?;
    Ok(DataPoint {
        id: row.get(0)?,
        survey_group_id: row.get(1)?,
        name: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        last_modified: row.get(5)?,
        viewed: row.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
        status: SurveyInstanceStatus::from_code(status.unwrap_or(0)).map_err(|e| conversion(7, e))?,
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<SurveyInstance> {
    let status: Option<i64> = row.get(5)?;
    Ok(SurveyInstance {
        id: InstanceId(row.get(0)?),
        uuid: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        form_id: row.get(2)?,
        form_version: row.get(3)?,
        data_point_id: row.get(4)?,
        status: SurveyInstanceStatus::from_code(status.unwrap_or(0)).map_err(|e| conversion(5, e))?,
        user_id: row.get(6)?,
        submitter: row.get(7)?,
        start_date: row.get(8)?,
        saved_date: row.get(9)?,
        submitted_date: row.get(10)?,
        exported_date: row.get(11)?,
        sync_date: row.get(12)?,
        duration: row.get(13)?,
    })
}

fn response_from_row(row: &Row<'_>) -> rusqlite::Result<Response> {
    Ok(Response {
        id: row.get(0)?,
        instance_id: InstanceId(row.get(1)?),
        question_id: row.get(2)?,
        iteration: iteration_from_sql(row.get(3)?),
        response_type: ResponseType::from_tag(&row.get::<_, String>(4)?),
        value: row.get(5)?,
        filename: row.get(6)?,
        include: row.get::<_, i64>(7)? != 0,
    })
}

fn transmission_from_row(row: &Row<'_>) -> rusqlite::Result<Transmission> {
    let status: Option<i64> = row.get(4)?;
    Ok(Transmission {
        id: TransmissionId(row.get(0)?),
        instance_id: InstanceId(row.get(1)?),
        form_id: row.get(2)?,
        filename: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        status: TransmissionStatus::from_code(status.unwrap_or(0)).map_err(|e| conversion(4, e))?,
        start_date: row.get(5)?,
        end_date: row.get(6)?,
        failure_count: row.get::<_, i64>(7)?.max(0) as u32,
        last_error: row.get(8)?,
        retryable: row.get::<_, i64>(9)? != 0,
    })
}

/// Local store of everything collected on the device.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open or create a store at `path`, upgrading its schema if needed.
    ///
    /// # Errors
    /// - `Error::Storage` if the file cannot be opened
    /// - `Error::Migration` if the schema is too old, newer than this
    ///   version supports, or an upgrade step fails
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::open_with_report(path)?.0)
    }

    /// Like [`RecordStore::open`], also returning the upgrade that ran.
    pub fn open_with_report(path: impl AsRef<Path>) -> Result<(Self, Option<MigrationReport>)> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(sql_err)?;
        let (store, report) = Self::from_connection(conn, &SchemaMigrator::standard())?;
        if let Some(report) = &report {
            info!(
                "Record store at {} upgraded {} -> {}",
                path.display(),
                report.from,
                report.to
            );
        }
        Ok((store, report))
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Ok(Self::from_connection(conn, &SchemaMigrator::standard())?.0)
    }

    /// Wrap an open connection, creating or upgrading the schema.
    ///
    /// Returns the migration report when an upgrade ran.
    pub fn from_connection(
        mut conn: Connection,
        migrator: &SchemaMigrator,
    ) -> Result<(Self, Option<MigrationReport>)> {
        let version = schema::user_version(&conn).map_err(sql_err)?;
        let report = if version == 0 {
            let tx = conn.transaction().map_err(sql_err)?;
            schema::create_all(&tx).map_err(sql_err)?;
            schema::set_user_version(&tx, CURRENT_VERSION).map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
            debug!("Created record store schema at version {}", CURRENT_VERSION);
            None
        } else if version < CURRENT_VERSION {
            Some(migrator.upgrade(&mut conn, version, CURRENT_VERSION)?)
        } else if version > CURRENT_VERSION {
            return Err(Error::Migration {
                from: version,
                to: CURRENT_VERSION,
                step: "version_check".to_string(),
                reason: "database was written by a newer version".to_string(),
            });
        } else {
            None
        };
        Ok((
            Self {
                conn: Mutex::new(conn),
            },
            report,
        ))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Record store lock poisoned".to_string()))
    }

    /// Schema version of the open database.
    pub fn schema_version(&self) -> Result<u32> {
        schema::user_version(&*self.conn()?).map_err(sql_err)
    }

    // ---- data points ----

    /// Insert a data point, or merge `fields` into the existing one.
    ///
    /// A unique-key collision on insert is turned into an update.
    pub fn upsert_data_point(&self, id: &str, fields: &DataPointFields) -> Result<()> {
        require_id(id, "Data point id")?;
        let conn = self.conn()?;

        let exists = conn
            .query_row("SELECT 1 FROM record WHERE record_id = ?1", [id], |_| Ok(()))
            .optional()
            .map_err(sql_err)?
            .is_some();

        if !exists {
            let inserted = conn.execute(
                "INSERT INTO record (record_id, survey_group_id, name, latitude, longitude, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    fields.survey_group_id,
                    fields.name,
                    fields.latitude,
                    fields.longitude,
                    fields.last_modified.unwrap_or_else(now_millis),
                ],
            );
            match inserted {
                Ok(_) => {
                    debug!("Inserted data point {}", id);
                    return Ok(());
                }
                Err(e) if is_constraint_violation(&e) => {
                    debug!("Data point {} already present, updating", id);
                }
                Err(e) => return Err(sql_err(e)),
            }
        }

        conn.execute(
            "UPDATE record SET
                survey_group_id = COALESCE(?2, survey_group_id),
                name = COALESCE(?3, name),
                latitude = COALESCE(?4, latitude),
                longitude = COALESCE(?5, longitude),
                last_modified = COALESCE(?6, last_modified)
             WHERE record_id = ?1",
            params![
                id,
                fields.survey_group_id,
                fields.name,
                fields.latitude,
                fields.longitude,
                fields.last_modified,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn data_point(&self, id: &str) -> Result<Option<DataPoint>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM record WHERE record_id = ?1", DATA_POINT_COLUMNS),
            [id],
            data_point_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    /// Data points of a survey group, by name.
    pub fn data_points(&self, survey_group_id: i64) -> Result<Vec<DataPoint>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM record WHERE survey_group_id = ?1 ORDER BY name, record_id",
                DATA_POINT_COLUMNS
            ))
            .map_err(sql_err)?;
        let points = stmt
            .query_map([survey_group_id], data_point_from_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(points)
    }

    pub fn mark_data_point_viewed(&self, id: &str, viewed: bool) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE record SET viewed = ?2 WHERE record_id = ?1",
                params![id, viewed as i64],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("data point {}", id)));
        }
        Ok(())
    }

    /// Delete a data point with its draft instances.
    ///
    /// # Errors
    /// - `Error::Precondition` if any instance has been submitted
    pub fn delete_data_point(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let submitted: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM survey_instance WHERE record_id = ?1 AND status >= ?2",
                params![id, SurveyInstanceStatus::Submitted.code()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if submitted > 0 {
            return Err(Error::Precondition(format!(
                "Data point {} has {} submitted form(s)",
                id, submitted
            )));
        }

        delete_data_point_rows(&tx, id)?;
        let removed = tx
            .execute("DELETE FROM record WHERE record_id = ?1", [id])
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(removed > 0)
    }

    /// Remove data points of a survey group that hold no collected data.
    ///
    /// A data point survives if any of its instances was submitted or has
    /// at least one response. Returns the number of data points removed.
    pub fn clean_data_points(&self, survey_group_id: i64) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT r.record_id FROM record r
                     WHERE r.survey_group_id = ?1 AND NOT EXISTS (
                        SELECT 1 FROM survey_instance si
                        WHERE si.record_id = r.record_id AND (
                            si.status >= ?2
                            OR EXISTS (SELECT 1 FROM response resp WHERE resp.survey_instance_id = si._id)
                        )
                     )",
                )
                .map_err(sql_err)?;
            let ids = stmt
                .query_map(
                    params![survey_group_id, SurveyInstanceStatus::Submitted.code()],
                    |row| row.get(0),
                )
                .map_err(sql_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(sql_err)?;
            ids
        };

        for id in &ids {
            delete_data_point_rows(&tx, id)?;
            tx.execute("DELETE FROM record WHERE record_id = ?1", [id])
                .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;

        if !ids.is_empty() {
            info!("Removed {} empty data points from group {}", ids.len(), survey_group_id);
        }
        Ok(ids.len())
    }

    // ---- survey instances ----

    /// Start a new survey instance with a fresh uuid.
    pub fn create_survey_instance(&self, fields: &SurveyInstanceFields) -> Result<SurveyInstance> {
        let uuid = Uuid::new_v4().to_string();
        let mut fields = fields.clone();
        fields.start_date.get_or_insert_with(now_millis);
        let id = self.sync_survey_instance(&fields, &uuid)?;
        self.survey_instance(id)?
            .ok_or_else(|| Error::NotFound(format!("survey instance {}", id)))
    }

    /// Insert or update the instance identified by `uuid`.
    ///
    /// Status only moves forward here: a status that ranks below the stored
    /// one is ignored. Use [`RecordStore::reset_survey_status`] to go back.
    ///
    /// # Errors
    /// - `Error::Precondition` if `uuid` is empty, or the instance is new
    ///   and `fields.form_id` is missing
    pub fn sync_survey_instance(&self, fields: &SurveyInstanceFields, uuid: &str) -> Result<InstanceId> {
        require_id(uuid, "Survey instance uuid")?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let id = match find_instance(&tx, uuid)? {
            Some(existing) => {
                update_instance(&tx, existing, fields)?;
                existing.0
            }
            None => match insert_instance(&tx, uuid, fields)? {
                Some(id) => id,
                None => {
                    let existing = find_instance(&tx, uuid)?.ok_or_else(|| {
                        Error::DataIntegrity(format!("Instance {} vanished after conflict", uuid))
                    })?;
                    update_instance(&tx, existing, fields)?;
                    existing.0
                }
            },
        };

        refresh_data_point_status(&tx, id)?;
        tx.commit().map_err(sql_err)?;
        Ok(InstanceId(id))
    }

    pub fn survey_instance(&self, id: InstanceId) -> Result<Option<SurveyInstance>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM survey_instance WHERE _id = ?1", INSTANCE_COLUMNS),
            [id.0],
            instance_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    pub fn survey_instance_by_uuid(&self, uuid: &str) -> Result<Option<SurveyInstance>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM survey_instance WHERE uuid = ?1", INSTANCE_COLUMNS),
            [uuid],
            instance_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    pub fn survey_instances_by_status(&self, status: SurveyInstanceStatus) -> Result<Vec<SurveyInstance>> {
        self.query_instances(
            &format!(
                "SELECT {} FROM survey_instance WHERE status = ?1 ORDER BY _id",
                INSTANCE_COLUMNS
            ),
            params![status.code()],
        )
    }

    pub fn survey_instances_for_data_point(&self, data_point_id: &str) -> Result<Vec<SurveyInstance>> {
        self.query_instances(
            &format!(
                "SELECT {} FROM survey_instance WHERE record_id = ?1 ORDER BY start_date, _id",
                INSTANCE_COLUMNS
            ),
            params![data_point_id],
        )
    }

    /// Submitted instances that a sync pass should export and upload.
    ///
    /// Instances written as `Exported` by older versions are included.
    /// Instances with an artifact that failed permanently are left out until
    /// that transmission is reset.
    pub fn instances_ready_for_sync(&self) -> Result<Vec<SurveyInstance>> {
        self.query_instances(
            &format!(
                "SELECT {} FROM survey_instance si
                 WHERE si.status IN (?1, ?2) AND NOT EXISTS (
                    SELECT 1 FROM transmission t
                    WHERE t.survey_instance_id = si._id AND t.status = ?3 AND t.retryable = 0
                 )
                 ORDER BY si.submitted_date, si._id",
                INSTANCE_COLUMNS
            ),
            params![
                SurveyInstanceStatus::Submitted.code(),
                SurveyInstanceStatus::Exported.code(),
                TransmissionStatus::Failed.code(),
            ],
        )
    }

    fn query_instances(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SurveyInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let instances = stmt
            .query_map(params, instance_from_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(instances)
    }

    /// Move an instance forward in its lifecycle and stamp the matching date.
    ///
    /// # Errors
    /// - `Error::NotFound` if the instance does not exist
    /// - `Error::Precondition` if `status` ranks below the current status
    pub fn update_survey_status(&self, id: InstanceId, status: SurveyInstanceStatus) -> Result<()> {
        self.write_status(id, status, false)
    }

    /// Set an instance status unconditionally, e.g. to re-open a form.
    pub fn reset_survey_status(&self, id: InstanceId, status: SurveyInstanceStatus) -> Result<()> {
        self.write_status(id, status, true)
    }

    fn write_status(&self, id: InstanceId, status: SurveyInstanceStatus, force: bool) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let current: Option<i64> = tx
            .query_row("SELECT status FROM survey_instance WHERE _id = ?1", [id.0], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| Error::NotFound(format!("survey instance {}", id)))?;
        let current = SurveyInstanceStatus::from_code(current.unwrap_or(0))?;

        if !force && status.rank() < current.rank() {
            return Err(Error::Precondition(format!(
                "Survey instance {} cannot move from {:?} back to {:?}",
                id, current, status
            )));
        }
        if force && status.rank() < current.rank() {
            info!("Resetting survey instance {} from {:?} to {:?}", id, current, status);
        }

        let date_column = match status {
            SurveyInstanceStatus::Saved => "saved_date",
            SurveyInstanceStatus::Submitted => "submitted_date",
            SurveyInstanceStatus::Exported => "exported_date",
            SurveyInstanceStatus::Synced | SurveyInstanceStatus::Downloaded => "sync_date",
        };
        tx.execute(
            &format!(
                "UPDATE survey_instance SET status = ?2, {} = ?3 WHERE _id = ?1",
                date_column
            ),
            params![id.0, status.code(), now_millis()],
        )
        .map_err(sql_err)?;

        refresh_data_point_status(&tx, id.0)?;
        tx.commit().map_err(sql_err)?;
        debug!("Survey instance {} is now {:?}", id, status);
        Ok(())
    }

    /// Add fill time to an instance.
    pub fn add_survey_duration(&self, id: InstanceId, millis: i64) -> Result<()> {
        if millis < 0 {
            return Err(Error::Precondition(format!("Negative duration {}", millis)));
        }
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE survey_instance SET duration = duration + ?2 WHERE _id = ?1",
                params![id.0, millis],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("survey instance {}", id)));
        }
        Ok(())
    }

    /// Delete an instance with its responses and transmissions.
    pub fn delete_survey_instance(&self, id: InstanceId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        let data_point: Option<Option<String>> = tx
            .query_row("SELECT record_id FROM survey_instance WHERE _id = ?1", [id.0], |row| row.get(0))
            .optional()
            .map_err(sql_err)?;
        let Some(data_point) = data_point else {
            return Ok(false);
        };

        delete_instance_rows(&tx, id.0)?;
        if let Some(data_point) = data_point {
            tx.execute(
                "UPDATE record SET status = COALESCE((
                    SELECT MAX(status) FROM survey_instance WHERE record_id = ?1
                 ), 0) WHERE record_id = ?1",
                [&data_point],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(true)
    }

    /// Delete draft instances that never received a response.
    pub fn delete_empty_survey_instances(&self) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "DELETE FROM transmission WHERE survey_instance_id IN (
                SELECT _id FROM survey_instance si WHERE si.status = ?1
                AND NOT EXISTS (SELECT 1 FROM response r WHERE r.survey_instance_id = si._id)
             )",
            [SurveyInstanceStatus::Saved.code()],
        )
        .map_err(sql_err)?;
        let removed = tx
            .execute(
                "DELETE FROM survey_instance WHERE status = ?1
                 AND NOT EXISTS (SELECT 1 FROM response r WHERE r.survey_instance_id = survey_instance._id)",
                [SurveyInstanceStatus::Saved.code()],
            )
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(removed)
    }

    // ---- responses ----

    /// Insert or update the response keyed by
    /// `(instance, question_id, fields.iteration)`.
    ///
    /// # Errors
    /// - `Error::Precondition` if `question_id` is empty or contains `|`,
    ///   or the instance does not exist
    pub fn sync_response(&self, instance: InstanceId, fields: &ResponseFields, question_id: &str) -> Result<i64> {
        require_id(question_id, "Question id")?;
        if question_id.contains('|') {
            return Err(Error::Precondition(format!(
                "Question id {:?} must not carry an iteration suffix",
                question_id
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let known = tx
            .query_row("SELECT 1 FROM survey_instance WHERE _id = ?1", [instance.0], |_| Ok(()))
            .optional()
            .map_err(sql_err)?
            .is_some();
        if !known {
            return Err(Error::Precondition(format!("Unknown survey instance {}", instance)));
        }

        let iteration = iteration_to_sql(fields.iteration);
        let id = match find_response(&tx, instance.0, question_id, iteration)? {
            Some(id) => {
                update_response(&tx, id, fields)?;
                id
            }
            None => {
                let inserted = tx.execute(
                    "INSERT INTO response
                        (survey_instance_id, question_id, iteration, type, answer, filename, include)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        instance.0,
                        question_id,
                        iteration,
                        fields.response_type.as_tag(),
                        fields.value,
                        fields.filename,
                        fields.include as i64,
                    ],
                );
                match inserted {
                    Ok(_) => tx.last_insert_rowid(),
                    Err(e) if is_constraint_violation(&e) => {
                        let id = find_response(&tx, instance.0, question_id, iteration)?
                            .ok_or_else(|| Error::DataIntegrity(format!(
                                "Response {} of instance {} vanished after conflict",
                                question_id, instance
                            )))?;
                        update_response(&tx, id, fields)?;
                        id
                    }
                    Err(e) => return Err(sql_err(e)),
                }
            }
        };

        tx.commit().map_err(sql_err)?;
        Ok(id)
    }

    /// Responses of an instance, by question and iteration.
    pub fn responses(&self, instance: InstanceId) -> Result<Vec<Response>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM response WHERE survey_instance_id = ?1 ORDER BY question_id, iteration",
                RESPONSE_COLUMNS
            ))
            .map_err(sql_err)?;
        let responses = stmt
            .query_map([instance.0], response_from_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(responses)
    }

    pub fn response(&self, instance: InstanceId, question_id: &str, iteration: Option<u32>) -> Result<Option<Response>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM response
                 WHERE survey_instance_id = ?1 AND question_id = ?2 AND iteration = ?3",
                RESPONSE_COLUMNS
            ),
            params![instance.0, question_id, iteration_to_sql(iteration)],
            response_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    pub fn delete_response(&self, instance: InstanceId, question_id: &str, iteration: Option<u32>) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM response WHERE survey_instance_id = ?1 AND question_id = ?2 AND iteration = ?3",
                params![instance.0, question_id, iteration_to_sql(iteration)],
            )
            .map_err(sql_err)?;
        Ok(removed > 0)
    }

    // ---- transmissions ----

    /// Register an artifact for upload. Registering the same artifact again
    /// returns the existing transmission unchanged.
    ///
    /// # Errors
    /// - `Error::DataIntegrity` if `filename` already belongs to another instance
    pub fn create_transmission(&self, instance: InstanceId, form_id: Option<&str>, filename: &str) -> Result<TransmissionId> {
        require_id(filename, "Transmission filename")?;
        let conn = self.conn()?;

        let lookup = |conn: &Connection| -> Result<Option<(i64, i64)>> {
            conn.query_row(
                "SELECT _id, survey_instance_id FROM transmission WHERE filename = ?1",
                [filename],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_err)
        };
        let check_owner = |(id, owner): (i64, i64)| -> Result<TransmissionId> {
            if owner != instance.0 {
                return Err(Error::DataIntegrity(format!(
                    "Artifact {} belongs to instance {}, not {}",
                    filename, owner, instance
                )));
            }
            Ok(TransmissionId(id))
        };

        if let Some(existing) = lookup(&conn)? {
            return check_owner(existing);
        }
        let inserted = conn.execute(
            "INSERT INTO transmission (survey_instance_id, survey_id, filename, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![instance.0, form_id, filename, TransmissionStatus::Pending.code()],
        );
        match inserted {
            Ok(_) => Ok(TransmissionId(conn.last_insert_rowid())),
            Err(e) if is_constraint_violation(&e) => {
                let existing = lookup(&conn)?.ok_or_else(|| {
                    Error::DataIntegrity(format!("Transmission {} vanished after conflict", filename))
                })?;
                check_owner(existing)
            }
            Err(e) => Err(sql_err(e)),
        }
    }

    pub fn transmission(&self, id: TransmissionId) -> Result<Option<Transmission>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM transmission WHERE _id = ?1", TRANSMISSION_COLUMNS),
            [id.0],
            transmission_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    pub fn transmissions_for(&self, instance: InstanceId) -> Result<Vec<Transmission>> {
        self.query_transmissions(
            &format!(
                "SELECT {} FROM transmission WHERE survey_instance_id = ?1 ORDER BY _id",
                TRANSMISSION_COLUMNS
            ),
            params![instance.0],
        )
    }

    /// Transmissions not yet synced: pending, failed, and uploads left
    /// stalled in progress by an interrupted cycle.
    pub fn unsynced_transmissions(&self) -> Result<Vec<Transmission>> {
        self.query_transmissions(
            &format!(
                "SELECT {} FROM transmission WHERE status IS NULL OR status != ?1 ORDER BY _id",
                TRANSMISSION_COLUMNS
            ),
            params![TransmissionStatus::Synced.code()],
        )
    }

    fn query_transmissions(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Transmission>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let transmissions = stmt
            .query_map(params, transmission_from_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(transmissions)
    }

    /// Move a transmission along its state machine.
    ///
    /// # Errors
    /// - `Error::NotFound` if the transmission does not exist
    /// - `Error::Precondition` if the transition is not allowed
    pub fn update_transmission_status(&self, id: TransmissionId, status: TransmissionStatus) -> Result<()> {
        let conn = self.conn()?;
        let current = transmission_status(&conn, id)?;
        if !current.can_transition_to(status) {
            return Err(Error::Precondition(format!(
                "Transmission {} cannot move from {:?} to {:?}",
                id, current, status
            )));
        }

        let now = now_millis();
        let sql = match status {
            TransmissionStatus::InProgress => {
                "UPDATE transmission SET status = ?2, start_date = ?3, end_date = NULL WHERE _id = ?1"
            }
            TransmissionStatus::Synced => {
                "UPDATE transmission SET status = ?2, end_date = ?3, last_error = NULL, retryable = 1 WHERE _id = ?1"
            }
            _ => "UPDATE transmission SET status = ?2, end_date = ?3 WHERE _id = ?1",
        };
        conn.execute(sql, params![id.0, status.code(), now])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Record a failed upload attempt.
    ///
    /// A non-retryable failure blocks the owning instance from sync passes
    /// until [`RecordStore::reset_transmission`] is called.
    pub fn mark_transmission_failed(&self, id: TransmissionId, error: &str, retryable: bool) -> Result<()> {
        let conn = self.conn()?;
        let current = transmission_status(&conn, id)?;
        if !current.can_transition_to(TransmissionStatus::Failed) {
            return Err(Error::Precondition(format!(
                "Transmission {} cannot fail from {:?}",
                id, current
            )));
        }
        conn.execute(
            "UPDATE transmission SET status = ?2, end_date = ?3, failure_count = failure_count + 1,
                last_error = ?4, retryable = ?5
             WHERE _id = ?1",
            params![
                id.0,
                TransmissionStatus::Failed.code(),
                now_millis(),
                error,
                retryable as i64
            ],
        )
        .map_err(sql_err)?;
        if !retryable {
            warn!("Transmission {} failed permanently: {}", id, error);
        }
        Ok(())
    }

    /// Put a failed or stalled transmission back in the queue.
    pub fn reset_transmission(&self, id: TransmissionId) -> Result<()> {
        let conn = self.conn()?;
        if transmission_status(&conn, id)? == TransmissionStatus::Synced {
            return Err(Error::Precondition(format!(
                "Transmission {} is already synced",
                id
            )));
        }
        conn.execute(
            "UPDATE transmission SET status = ?2, retryable = 1 WHERE _id = ?1",
            params![id.0, TransmissionStatus::Pending.code()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ---- languages, sync times, preferences ----

    /// Replace the selected languages of a survey group.
    pub fn save_languages(&self, survey_group_id: i64, languages: &BTreeSet<String>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute("DELETE FROM languages WHERE survey_group_id = ?1", [survey_group_id])
            .map_err(sql_err)?;
        for code in languages.iter().filter(|code| !code.trim().is_empty()) {
            tx.execute(
                "INSERT INTO languages (survey_group_id, language_code) VALUES (?1, ?2)",
                params![survey_group_id, code],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    pub fn languages(&self, survey_group_id: i64) -> Result<BTreeSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT language_code FROM languages WHERE survey_group_id = ?1")
            .map_err(sql_err)?;
        let codes = stmt
            .query_map([survey_group_id], |row| row.get(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<BTreeSet<String>>>()
            .map_err(sql_err)?;
        Ok(codes)
    }

    /// Record the server timestamp of the last data point download.
    pub fn set_sync_time(&self, survey_group_id: i64, time: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_time (survey_group_id, time) VALUES (?1, ?2)
             ON CONFLICT (survey_group_id) DO UPDATE SET time = excluded.time",
            params![survey_group_id, time],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn sync_time(&self, survey_group_id: i64) -> Result<Option<String>> {
        let conn = self.conn()?;
        let time: Option<Option<String>> = conn
            .query_row(
                "SELECT time FROM sync_time WHERE survey_group_id = ?1",
                [survey_group_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        Ok(time.flatten())
    }

    pub fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        require_id(key, "Preference key")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO preferences (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn preference(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value: Option<Option<String>> = conn
            .query_row("SELECT value FROM preferences WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(sql_err)?;
        Ok(value.flatten())
    }
}

fn find_instance(tx: &Transaction<'_>, uuid: &str) -> Result<Option<(i64, SurveyInstanceStatus)>> {
    let row: Option<(i64, Option<i64>)> = tx
        .query_row(
            "SELECT _id, status FROM survey_instance WHERE uuid = ?1",
            [uuid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(sql_err)?;
    row.map(|(id, status)| Ok((id, SurveyInstanceStatus::from_code(status.unwrap_or(0))?)))
        .transpose()
}

/// Returns `None` when the insert hit a unique constraint.
fn insert_instance(tx: &Transaction<'_>, uuid: &str, fields: &SurveyInstanceFields) -> Result<Option<i64>> {
    let form_id = fields
        .form_id
        .as_deref()
        .filter(|form| !form.trim().is_empty())
        .ok_or_else(|| {
            Error::Precondition(format!("Form id required to create survey instance {}", uuid))
        })?;
    let status = fields.status.unwrap_or(SurveyInstanceStatus::Saved);

    let inserted = tx.execute(
        "INSERT INTO survey_instance
            (uuid, survey_id, version, record_id, status, user_id, submitter,
             start_date, saved_date, submitted_date, sync_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            uuid,
            form_id,
            fields.form_version,
            fields.data_point_id,
            status.code(),
            fields.user_id,
            fields.submitter,
            fields.start_date,
            now_millis(),
            fields.submitted_date,
            fields.sync_date,
        ],
    );
    match inserted {
        Ok(_) => {
            debug!("Created survey instance {} for form {}", uuid, form_id);
            Ok(Some(tx.last_insert_rowid()))
        }
        Err(e) if is_constraint_violation(&e) => Ok(None),
        Err(e) => Err(sql_err(e)),
    }
}

fn update_instance(
    tx: &Transaction<'_>,
    (id, current): (i64, SurveyInstanceStatus),
    fields: &SurveyInstanceFields,
) -> Result<()> {
    let status = match fields.status {
        Some(status) if status.rank() >= current.rank() => status,
        Some(status) => {
            debug!(
                "Keeping status {:?} of instance {}, ignoring {:?}",
                current, id, status
            );
            current
        }
        None => current,
    };

    tx.execute(
        "UPDATE survey_instance SET
            survey_id = COALESCE(?2, survey_id),
            version = COALESCE(?3, version),
            record_id = COALESCE(?4, record_id),
            status = ?5,
            user_id = COALESCE(?6, user_id),
            submitter = COALESCE(?7, submitter),
            start_date = COALESCE(?8, start_date),
            submitted_date = COALESCE(?9, submitted_date),
            sync_date = COALESCE(?10, sync_date)
         WHERE _id = ?1",
        params![
            id,
            fields.form_id.as_deref().filter(|form| !form.trim().is_empty()),
            fields.form_version,
            fields.data_point_id,
            status.code(),
            fields.user_id,
            fields.submitter,
            fields.start_date,
            fields.submitted_date,
            fields.sync_date,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn refresh_data_point_status(tx: &Transaction<'_>, instance_id: i64) -> Result<()> {
    tx.execute(
        "UPDATE record SET status = COALESCE((
            SELECT MAX(status) FROM survey_instance si WHERE si.record_id = record.record_id
         ), 0)
         WHERE record_id = (SELECT record_id FROM survey_instance WHERE _id = ?1)",
        [instance_id],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn delete_instance_rows(tx: &Transaction<'_>, instance_id: i64) -> Result<()> {
    tx.execute("DELETE FROM response WHERE survey_instance_id = ?1", [instance_id])
        .map_err(sql_err)?;
    tx.execute("DELETE FROM transmission WHERE survey_instance_id = ?1", [instance_id])
        .map_err(sql_err)?;
    tx.execute("DELETE FROM survey_instance WHERE _id = ?1", [instance_id])
        .map_err(sql_err)?;
    Ok(())
}

fn delete_data_point_rows(tx: &Transaction<'_>, data_point_id: &str) -> Result<()> {
    let ids: Vec<i64> = {
        let mut stmt = tx
            .prepare("SELECT _id FROM survey_instance WHERE record_id = ?1")
            .map_err(sql_err)?;
        let ids = stmt
            .query_map([data_point_id], |row| row.get(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        ids
    };
    for id in ids {
        delete_instance_rows(tx, id)?;
    }
    Ok(())
}

fn find_response(tx: &Transaction<'_>, instance: i64, question_id: &str, iteration: i64) -> Result<Option<i64>> {
    tx.query_row(
        "SELECT _id FROM response WHERE survey_instance_id = ?1 AND question_id = ?2 AND iteration = ?3",
        params![instance, question_id, iteration],
        |row| row.get(0),
    )
    .optional()
    .map_err(sql_err)
}

fn update_response(tx: &Transaction<'_>, id: i64, fields: &ResponseFields) -> Result<()> {
    tx.execute(
        "UPDATE response SET type = ?2, answer = ?3, filename = ?4, include = ?5 WHERE _id = ?1",
        params![
            id,
            fields.response_type.as_tag(),
            fields.value,
            fields.filename,
            fields.include as i64,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn transmission_status(conn: &Connection, id: TransmissionId) -> Result<TransmissionStatus> {
    let status: Option<i64> = conn
        .query_row("SELECT status FROM transmission WHERE _id = ?1", [id.0], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| Error::NotFound(format!("transmission {}", id)))?;
    TransmissionStatus::from_code(status.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::LAUNCH_LAYOUT;
    use fieldsync_codec::{AnswerValue, OptionAnswer};
    use tempfile::TempDir;

    fn form(form_id: &str, data_point: &str) -> SurveyInstanceFields {
        SurveyInstanceFields {
            form_id: Some(form_id.to_string()),
            data_point_id: Some(data_point.to_string()),
            ..Default::default()
        }
    }

    fn group_point(store: &RecordStore, id: &str, group: i64) {
        store
            .upsert_data_point(
                id,
                &DataPointFields {
                    survey_group_id: Some(group),
                    name: Some(id.to_uppercase()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn test_fresh_store_is_current() {
        let store = RecordStore::in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_reopen_persists_and_launch_file_upgrades() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(LAUNCH_LAYOUT).unwrap();
            conn.execute(
                "INSERT INTO survey_instance (uuid, survey_id, status) VALUES ('u-1', 'F1', 1)",
                [],
            )
            .unwrap();
        }

        let store = RecordStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), CURRENT_VERSION);
        let instance = store.survey_instance_by_uuid("u-1").unwrap().unwrap();
        assert_eq!(instance.status, SurveyInstanceStatus::Submitted);
        let synced = store
            .sync_survey_instance(
                &SurveyInstanceFields {
                    submitter: Some("ana".to_string()),
                    ..Default::default()
                },
                "u-1",
            )
            .unwrap();
        assert_eq!(synced, instance.id);
        drop(store);

        let store = RecordStore::open(&path).unwrap();
        assert!(store.survey_instance_by_uuid("u-1").unwrap().is_some());
    }

    #[test]
    fn test_newer_database_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1)
            .unwrap();
        let result = RecordStore::from_connection(conn, &SchemaMigrator::standard());
        assert!(matches!(result, Err(Error::Migration { .. })));
    }

    #[test]
    fn test_upsert_data_point_merges_fields() {
        let store = RecordStore::in_memory().unwrap();
        store
            .upsert_data_point(
                "dp-1",
                &DataPointFields {
                    survey_group_id: Some(7),
                    name: Some("Well".to_string()),
                    latitude: Some(1.5),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .upsert_data_point(
                "dp-1",
                &DataPointFields {
                    name: Some("Well 2".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let point = store.data_point("dp-1").unwrap().unwrap();
        assert_eq!(point.name.as_deref(), Some("Well 2"));
        assert_eq!(point.survey_group_id, Some(7));
        assert_eq!(point.latitude, Some(1.5));
        assert!(!point.viewed);

        store.mark_data_point_viewed("dp-1", true).unwrap();
        assert!(store.data_point("dp-1").unwrap().unwrap().viewed);
        assert!(store.upsert_data_point(" ", &DataPointFields::default()).is_err());
    }

    #[test]
    fn test_sync_survey_instance_requires_form_for_new_rows() {
        let store = RecordStore::in_memory().unwrap();
        let err = store
            .sync_survey_instance(&SurveyInstanceFields::default(), "u-1")
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let id = store.sync_survey_instance(&form("F1", "dp-1"), "u-1").unwrap();
        let again = store
            .sync_survey_instance(
                &SurveyInstanceFields {
                    submitter: Some("Ana".to_string()),
                    ..Default::default()
                },
                "u-1",
            )
            .unwrap();
        assert_eq!(id, again);

        let instance = store.survey_instance(id).unwrap().unwrap();
        assert_eq!(instance.form_id, "F1");
        assert_eq!(instance.submitter.as_deref(), Some("Ana"));
    }

    #[test]
    fn test_status_moves_forward_only() {
        let store = RecordStore::in_memory().unwrap();
        group_point(&store, "dp-1", 1);
        let instance = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        assert!(instance.start_date.is_some());

        store
            .update_survey_status(instance.id, SurveyInstanceStatus::Submitted)
            .unwrap();
        let err = store
            .update_survey_status(instance.id, SurveyInstanceStatus::Saved)
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let stored = store.survey_instance(instance.id).unwrap().unwrap();
        assert_eq!(stored.status, SurveyInstanceStatus::Submitted);
        assert!(stored.submitted_date.is_some());
        assert_eq!(
            store.data_point("dp-1").unwrap().unwrap().status,
            SurveyInstanceStatus::Submitted
        );

        store
            .reset_survey_status(instance.id, SurveyInstanceStatus::Saved)
            .unwrap();
        assert_eq!(
            store.survey_instance(instance.id).unwrap().unwrap().status,
            SurveyInstanceStatus::Saved
        );

        // Sync from the server never regresses a status either.
        store
            .update_survey_status(instance.id, SurveyInstanceStatus::Synced)
            .unwrap();
        store
            .sync_survey_instance(
                &SurveyInstanceFields {
                    status: Some(SurveyInstanceStatus::Submitted),
                    ..Default::default()
                },
                &instance.uuid,
            )
            .unwrap();
        assert_eq!(
            store.survey_instance(instance.id).unwrap().unwrap().status,
            SurveyInstanceStatus::Synced
        );
    }

    #[test]
    fn test_update_status_of_missing_instance() {
        let store = RecordStore::in_memory().unwrap();
        let err = store
            .update_survey_status(InstanceId(42), SurveyInstanceStatus::Submitted)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_sync_response_updates_by_key() {
        let store = RecordStore::in_memory().unwrap();
        let instance = store.create_survey_instance(&form("F1", "dp-1")).unwrap();

        let first = store
            .sync_response(instance.id, &ResponseFields::new(ResponseType::Value, "12"), "Q1")
            .unwrap();
        let second = store
            .sync_response(instance.id, &ResponseFields::new(ResponseType::Value, "13"), "Q1")
            .unwrap();
        assert_eq!(first, second);

        let repeated = store
            .sync_response(
                instance.id,
                &ResponseFields::new(ResponseType::Value, "x").with_iteration(1),
                "Q1",
            )
            .unwrap();
        assert_ne!(first, repeated);

        let answers = store.responses(instance.id).unwrap();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].value, "13");
        assert_eq!(answers[0].iteration, None);
        assert_eq!(answers[1].iteration, Some(1));

        assert!(store.delete_response(instance.id, "Q1", Some(1)).unwrap());
        assert!(store.response(instance.id, "Q1", Some(1)).unwrap().is_none());
    }

    #[test]
    fn test_sync_response_rejects_composite_keys() {
        let store = RecordStore::in_memory().unwrap();
        let instance = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        let err = store
            .sync_response(instance.id, &ResponseFields::new(ResponseType::Value, "1"), "Q1|2")
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let err = store
            .sync_response(InstanceId(999), &ResponseFields::new(ResponseType::Value, "1"), "Q1")
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_structured_answer_round_trips_through_store() {
        let store = RecordStore::in_memory().unwrap();
        let instance = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        let answer = AnswerValue::Options(vec![
            OptionAnswer::new("Yes").with_code("Y"),
            OptionAnswer::new("Maybe").other(),
        ]);
        store
            .sync_response(
                instance.id,
                &ResponseFields::from_answer(ResponseType::Option, &answer),
                "Q9",
            )
            .unwrap();
        let stored = store.response(instance.id, "Q9", None).unwrap().unwrap();
        assert_eq!(stored.answer(), answer);
    }

    #[test]
    fn test_clean_data_points_keeps_collected_data() {
        let store = RecordStore::in_memory().unwrap();
        for id in ["empty", "draft", "submitted", "bare", "other-group"] {
            group_point(&store, id, if id == "other-group" { 2 } else { 1 });
        }

        // Empty draft instance only: removed.
        store.create_survey_instance(&form("F1", "empty")).unwrap();

        // Draft with an answer: kept.
        let draft = store.create_survey_instance(&form("F1", "draft")).unwrap();
        store
            .sync_response(draft.id, &ResponseFields::new(ResponseType::Value, "1"), "Q1")
            .unwrap();

        // Submitted without answers: kept.
        let submitted = store.create_survey_instance(&form("F1", "submitted")).unwrap();
        store
            .update_survey_status(submitted.id, SurveyInstanceStatus::Submitted)
            .unwrap();

        let removed = store.clean_data_points(1).unwrap();
        assert_eq!(removed, 2);
        assert!(store.data_point("empty").unwrap().is_none());
        assert!(store.data_point("bare").unwrap().is_none());
        assert!(store.data_point("draft").unwrap().is_some());
        assert!(store.data_point("submitted").unwrap().is_some());
        assert!(store.data_point("other-group").unwrap().is_some());
        assert_eq!(store.survey_instances_for_data_point("empty").unwrap().len(), 0);
    }

    #[test]
    fn test_delete_data_point_refuses_submitted() {
        let store = RecordStore::in_memory().unwrap();
        group_point(&store, "dp-1", 1);
        let instance = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        store
            .update_survey_status(instance.id, SurveyInstanceStatus::Submitted)
            .unwrap();
        assert!(matches!(
            store.delete_data_point("dp-1"),
            Err(Error::Precondition(_))
        ));

        group_point(&store, "dp-2", 1);
        store.create_survey_instance(&form("F1", "dp-2")).unwrap();
        assert!(store.delete_data_point("dp-2").unwrap());
        assert!(store.survey_instances_for_data_point("dp-2").unwrap().is_empty());
    }

    #[test]
    fn test_delete_empty_survey_instances() {
        let store = RecordStore::in_memory().unwrap();
        let empty = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        let answered = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        store
            .sync_response(answered.id, &ResponseFields::new(ResponseType::Value, "1"), "Q1")
            .unwrap();
        store.add_survey_duration(answered.id, 1500).unwrap();

        assert_eq!(store.delete_empty_survey_instances().unwrap(), 1);
        assert!(store.survey_instance(empty.id).unwrap().is_none());
        assert_eq!(store.survey_instance(answered.id).unwrap().unwrap().duration, 1500);
    }

    #[test]
    fn test_transmission_lifecycle() {
        let store = RecordStore::in_memory().unwrap();
        let instance = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        let id = store
            .create_transmission(instance.id, Some("F1"), "u-1.zip")
            .unwrap();
        assert_eq!(
            store.create_transmission(instance.id, Some("F1"), "u-1.zip").unwrap(),
            id
        );

        assert!(matches!(
            store.update_transmission_status(id, TransmissionStatus::Synced),
            Err(Error::Precondition(_))
        ));

        store
            .update_transmission_status(id, TransmissionStatus::InProgress)
            .unwrap();
        store.mark_transmission_failed(id, "timeout", true).unwrap();
        let failed = store.transmission(id).unwrap().unwrap();
        assert_eq!(failed.status, TransmissionStatus::Failed);
        assert_eq!(failed.failure_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
        assert_eq!(store.unsynced_transmissions().unwrap().len(), 1);

        store
            .update_transmission_status(id, TransmissionStatus::InProgress)
            .unwrap();
        store
            .update_transmission_status(id, TransmissionStatus::Synced)
            .unwrap();
        let synced = store.transmission(id).unwrap().unwrap();
        assert!(synced.last_error.is_none());
        assert!(synced.end_date.is_some());
        assert!(store.unsynced_transmissions().unwrap().is_empty());
        assert!(store.reset_transmission(id).is_err());
    }

    #[test]
    fn test_artifact_belongs_to_one_instance() {
        let store = RecordStore::in_memory().unwrap();
        let a = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        let b = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        store.create_transmission(a.id, Some("F1"), "photo.jpg").unwrap();
        assert!(matches!(
            store.create_transmission(b.id, Some("F1"), "photo.jpg"),
            Err(Error::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_blocked_instances_not_ready_for_sync() {
        let store = RecordStore::in_memory().unwrap();
        let ready = store.create_survey_instance(&form("F1", "dp-1")).unwrap();
        let blocked = store.create_survey_instance(&form("F1", "dp-2")).unwrap();
        let draft = store.create_survey_instance(&form("F1", "dp-3")).unwrap();
        for id in [ready.id, blocked.id] {
            store
                .update_survey_status(id, SurveyInstanceStatus::Submitted)
                .unwrap();
        }

        let tx = store.create_transmission(blocked.id, Some("F1"), "gone.jpg").unwrap();
        store
            .update_transmission_status(tx, TransmissionStatus::InProgress)
            .unwrap();
        store.mark_transmission_failed(tx, "file missing", false).unwrap();

        let ids: Vec<InstanceId> = store
            .instances_ready_for_sync()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![ready.id]);
        assert!(!ids.contains(&draft.id));

        store.reset_transmission(tx).unwrap();
        assert_eq!(store.instances_ready_for_sync().unwrap().len(), 2);
    }

    #[test]
    fn test_languages_sync_time_and_preferences() {
        let store = RecordStore::in_memory().unwrap();
        let languages: BTreeSet<String> = ["en", "sw"].iter().map(|s| s.to_string()).collect();
        store.save_languages(3, &languages).unwrap();
        assert_eq!(store.languages(3).unwrap(), languages);
        assert!(store.languages(4).unwrap().is_empty());

        assert!(store.sync_time(3).unwrap().is_none());
        store.set_sync_time(3, "1700000000").unwrap();
        store.set_sync_time(3, "1700000500").unwrap();
        assert_eq!(store.sync_time(3).unwrap().as_deref(), Some("1700000500"));

        store.set_preference("device.id", "abc").unwrap();
        assert_eq!(store.preference("device.id").unwrap().as_deref(), Some("abc"));
        assert!(store.preference("missing").unwrap().is_none());
    }
}
