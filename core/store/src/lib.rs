//! Persistence for fieldsync.
//!
//! - [`RecordStore`]: data points, survey instances, responses, and
//!   transmissions in a local SQLite database
//! - [`SchemaMigrator`]: forward-only upgrades of older store files
//! - [`CascadeIndex`]: read-only lookups in cascade reference datasets

pub mod cascade;
pub mod migration;
pub mod model;
pub mod schema;
pub mod store;

pub use cascade::{CascadeDatasetProvider, CascadeIndex, CascadeNode, DirectoryDatasetProvider, ROOT_PARENT};
pub use migration::{MigrationReport, MigrationStep, SchemaMigrator};
pub use model::{
    DataPoint, DataPointFields, Response, ResponseFields, SurveyInstance, SurveyInstanceFields,
    SurveyInstanceStatus, Transmission, TransmissionStatus,
};
pub use schema::CURRENT_VERSION;
pub use store::RecordStore;

use fieldsync_common::Error;

pub(crate) fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
