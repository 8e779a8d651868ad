//! Record kinds held by the store.

use serde::{Deserialize, Serialize};

use fieldsync_codec::{AnswerValue, ResponseType};
use fieldsync_common::{Error, InstanceId, Result, TransmissionId};

/// Stored iteration value for responses outside a repeatable group.
pub(crate) const NO_ITERATION: i64 = -1;

/// Lifecycle status of a survey instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurveyInstanceStatus {
    /// Being filled in on the device.
    Saved,
    /// Completed and queued for upload.
    Submitted,
    /// Export artifacts were built by an older app version.
    Exported,
    /// Every artifact reached the server.
    Synced,
    /// Received from the server.
    Downloaded,
}

impl SurveyInstanceStatus {
    /// Stored integer code.
    pub fn code(self) -> i64 {
        match self {
            Self::Saved => 0,
            Self::Submitted => 1,
            Self::Exported => 2,
            Self::Synced => 3,
            Self::Downloaded => 4,
        }
    }

    /// Parse a stored integer code.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Saved),
            1 => Ok(Self::Submitted),
            2 => Ok(Self::Exported),
            3 => Ok(Self::Synced),
            4 => Ok(Self::Downloaded),
            other => Err(Error::DataIntegrity(format!(
                "Unknown survey instance status {}",
                other
            ))),
        }
    }

    /// Position in the forward-only lifecycle. `Downloaded` ranks with
    /// `Synced`: both mean the server holds the data.
    pub fn rank(self) -> u8 {
        match self {
            Self::Saved => 0,
            Self::Submitted => 1,
            Self::Exported => 2,
            Self::Synced | Self::Downloaded => 3,
        }
    }

    pub fn is_submitted_or_later(self) -> bool {
        self.rank() >= Self::Submitted.rank()
    }
}

/// Upload status of a single artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransmissionStatus {
    Pending,
    InProgress,
    Synced,
    Failed,
}

impl TransmissionStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Synced => 2,
            Self::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Pending),
            1 => Ok(Self::InProgress),
            2 => Ok(Self::Synced),
            3 => Ok(Self::Failed),
            other => Err(Error::DataIntegrity(format!(
                "Unknown transmission status {}",
                other
            ))),
        }
    }

    /// Allowed transitions of the upload state machine.
    ///
    /// `InProgress -> InProgress` covers an upload left stalled by an
    /// interrupted cycle. Leaving `Synced` is never allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransmissionStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Failed, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Synced)
                | (InProgress, Failed)
        )
    }

    /// Whether a sync pass should attempt this artifact.
    pub fn is_uploadable(self) -> bool {
        !matches!(self, Self::Synced)
    }
}

/// A monitored location or entity that forms are filled out about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub id: String,
    pub survey_group_id: Option<i64>,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Milliseconds since the epoch.
    pub last_modified: i64,
    pub viewed: bool,
    /// Most advanced status among the data point's instances.
    pub status: SurveyInstanceStatus,
}

/// Partial data point update. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPointFields {
    pub survey_group_id: Option<i64>,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_modified: Option<i64>,
}

/// One filled occurrence of a form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyInstance {
    pub id: InstanceId,
    pub uuid: String,
    pub form_id: String,
    pub form_version: Option<f64>,
    pub data_point_id: Option<String>,
    pub status: SurveyInstanceStatus,
    pub user_id: Option<i64>,
    pub submitter: Option<String>,
    pub start_date: Option<i64>,
    pub saved_date: Option<i64>,
    pub submitted_date: Option<i64>,
    pub exported_date: Option<i64>,
    pub sync_date: Option<i64>,
    /// Accumulated fill time in milliseconds.
    pub duration: i64,
}

/// Partial survey instance update used by [`crate::RecordStore::sync_survey_instance`].
///
/// `form_id` is required when the instance does not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurveyInstanceFields {
    pub form_id: Option<String>,
    pub form_version: Option<f64>,
    pub data_point_id: Option<String>,
    pub status: Option<SurveyInstanceStatus>,
    pub user_id: Option<i64>,
    pub submitter: Option<String>,
    pub start_date: Option<i64>,
    pub submitted_date: Option<i64>,
    pub sync_date: Option<i64>,
}

/// One answer to one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: i64,
    pub instance_id: InstanceId,
    pub question_id: String,
    /// Repeatable group iteration, if the question is repeated.
    pub iteration: Option<u32>,
    pub response_type: ResponseType,
    /// Encoded value, see `fieldsync_codec`.
    pub value: String,
    pub filename: Option<String>,
    /// Whether the answer is part of the exported form data.
    pub include: bool,
}

impl Response {
    /// Decode the stored value according to its type tag.
    pub fn answer(&self) -> AnswerValue {
        AnswerValue::decode(&self.response_type, &self.value)
    }
}

/// Fields written by [`crate::RecordStore::sync_response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFields {
    pub iteration: Option<u32>,
    pub response_type: ResponseType,
    pub value: String,
    pub filename: Option<String>,
    pub include: bool,
}

impl ResponseFields {
    /// Included response with the given type and encoded value.
    pub fn new(response_type: ResponseType, value: impl Into<String>) -> Self {
        Self {
            iteration: None,
            response_type,
            value: value.into(),
            filename: None,
            include: true,
        }
    }

    /// Encode a structured answer.
    pub fn from_answer(response_type: ResponseType, answer: &AnswerValue) -> Self {
        Self::new(response_type, answer.encode())
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn excluded(mut self) -> Self {
        self.include = false;
        self
    }
}

/// One exportable artifact of a survey instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmission {
    pub id: TransmissionId,
    pub instance_id: InstanceId,
    pub form_id: Option<String>,
    pub filename: String,
    pub status: TransmissionStatus,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    /// `false` when the last failure cannot be fixed by retrying.
    pub retryable: bool,
}

impl Transmission {
    /// Failed in a way that needs an explicit reset before retrying.
    pub fn is_blocked(&self) -> bool {
        self.status == TransmissionStatus::Failed && !self.retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            SurveyInstanceStatus::Saved,
            SurveyInstanceStatus::Submitted,
            SurveyInstanceStatus::Exported,
            SurveyInstanceStatus::Synced,
            SurveyInstanceStatus::Downloaded,
        ] {
            assert_eq!(SurveyInstanceStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(SurveyInstanceStatus::from_code(9).is_err());
    }

    #[test]
    fn test_submitted_or_later() {
        assert!(!SurveyInstanceStatus::Saved.is_submitted_or_later());
        assert!(SurveyInstanceStatus::Submitted.is_submitted_or_later());
        assert!(SurveyInstanceStatus::Downloaded.is_submitted_or_later());
    }

    #[test]
    fn test_transmission_state_machine() {
        use TransmissionStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Synced));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(Synced));
        assert!(!Synced.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Synced));
    }

    #[test]
    fn test_response_answer_decodes_by_tag() {
        let response = Response {
            id: 1,
            instance_id: InstanceId(1),
            question_id: "Q1".to_string(),
            iteration: None,
            response_type: ResponseType::Option,
            value: "A|B".to_string(),
            filename: None,
            include: true,
        };
        match response.answer() {
            AnswerValue::Options(options) => assert_eq!(options.len(), 2),
            other => panic!("unexpected answer {:?}", other),
        }
    }
}
