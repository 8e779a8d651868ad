//! Sync cycle outcomes and queue summaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use fieldsync_common::{Error, Result};
use fieldsync_store::{Transmission, TransmissionStatus};

/// Result of one attempt to upload one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOutcome {
    /// Uploaded and verified.
    Uploaded,
    /// Already synced, or being uploaded by another worker.
    Skipped,
    /// Attempted and failed.
    Failed { retryable: bool },
    /// Not started because the cycle was cancelled or aborted.
    NotStarted,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Instances that reached SYNCED in this cycle.
    pub instances_synced: usize,
    /// Instances that could not be exported.
    pub instances_failed: usize,
    pub artifacts_uploaded: usize,
    pub artifacts_failed: usize,
    pub artifacts_skipped: usize,
    /// The cycle stopped early, by cancellation or loss of connectivity.
    pub aborted: bool,
    /// Error that aborted the cycle, if any.
    pub error: Option<String>,
    pub duration: Duration,
}

impl SyncReport {
    /// Count one artifact outcome.
    pub fn record(&mut self, outcome: ArtifactOutcome) {
        match outcome {
            ArtifactOutcome::Uploaded => self.artifacts_uploaded += 1,
            ArtifactOutcome::Skipped => self.artifacts_skipped += 1,
            ArtifactOutcome::Failed { .. } => self.artifacts_failed += 1,
            ArtifactOutcome::NotStarted => self.aborted = true,
        }
    }

    /// Nothing failed and nothing was left undone.
    pub fn is_clean(&self) -> bool {
        !self.aborted && self.artifacts_failed == 0 && self.instances_failed == 0
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Counts of transmissions by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub in_progress: usize,
    pub failed: usize,
    /// Failed transmissions that need a reset before they are retried.
    pub blocked: usize,
    pub synced: usize,
    /// Failure messages by filename.
    pub errors: BTreeMap<String, String>,
}

impl QueueSummary {
    pub fn from_transmissions<'a>(transmissions: impl IntoIterator<Item = &'a Transmission>) -> Self {
        let mut summary = Self::default();
        for t in transmissions {
            match t.status {
                TransmissionStatus::Pending => summary.pending += 1,
                TransmissionStatus::InProgress => summary.in_progress += 1,
                TransmissionStatus::Synced => summary.synced += 1,
                TransmissionStatus::Failed => {
                    summary.failed += 1;
                    if t.is_blocked() {
                        summary.blocked += 1;
                    }
                }
            }
            if let Some(error) = &t.last_error {
                summary.errors.insert(t.filename.clone(), error.clone());
            }
        }
        summary
    }

    /// Whether anything is left to upload.
    pub fn has_pending_work(&self) -> bool {
        self.pending + self.in_progress + self.failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::{InstanceId, TransmissionId};

    fn transmission(id: i64, status: TransmissionStatus, retryable: bool) -> Transmission {
        Transmission {
            id: TransmissionId(id),
            instance_id: InstanceId(1),
            form_id: Some("f1".to_string()),
            filename: format!("file{}.jpg", id),
            status,
            start_date: None,
            end_date: None,
            failure_count: 0,
            last_error: (status == TransmissionStatus::Failed).then(|| "boom".to_string()),
            retryable,
        }
    }

    #[test]
    fn test_report_counts() {
        let mut report = SyncReport::default();
        report.record(ArtifactOutcome::Uploaded);
        report.record(ArtifactOutcome::Uploaded);
        report.record(ArtifactOutcome::Skipped);
        assert!(report.is_clean());

        report.record(ArtifactOutcome::Failed { retryable: true });
        assert_eq!(report.artifacts_uploaded, 2);
        assert_eq!(report.artifacts_failed, 1);
        assert!(!report.is_clean());

        report.record(ArtifactOutcome::NotStarted);
        assert!(report.aborted);
    }

    #[test]
    fn test_report_serialization() {
        let report = SyncReport {
            instances_synced: 1,
            artifacts_uploaded: 3,
            duration: Duration::from_millis(250),
            ..Default::default()
        };
        let json = report.to_json().unwrap();
        assert_eq!(SyncReport::from_json(&json).unwrap(), report);
    }

    #[test]
    fn test_queue_summary() {
        let all = vec![
            transmission(1, TransmissionStatus::Pending, true),
            transmission(2, TransmissionStatus::Synced, true),
            transmission(3, TransmissionStatus::Failed, true),
            transmission(4, TransmissionStatus::Failed, false),
        ];
        let summary = QueueSummary::from_transmissions(&all);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.errors.len(), 2);
        assert!(summary.has_pending_work());

        let done = QueueSummary::from_transmissions(&all[1..2]);
        assert!(!done.has_pending_work());
    }
}
