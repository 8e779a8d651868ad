//! fieldsync sync pipeline
//!
//! This module moves submitted survey instances to the remote store:
//! - Export of one form-data bundle per instance plus its media
//! - A transmission queue with a bounded upload pool and a single-flight
//!   guard per transmission
//! - A coordinator running one cycle at a time, with cooperative
//!   cancellation between artifacts
//!
//! Failed artifacts are retried on the next cycle; artifacts already synced
//! are never uploaded again.

pub mod engine;
pub mod export;
pub mod queue;
pub mod state;

// Re-export main types
pub use engine::{SyncConfig, SyncCoordinator, SyncListener};
pub use export::{ExportedInstance, Exporter, FormDefinitionProvider, QuestionDef, StaticForms};
pub use queue::{BatchResult, TransmissionQueue};
pub use state::{ArtifactOutcome, QueueSummary, SyncReport};
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let config = SyncConfig::default();
        assert_eq!(config.max_concurrent_uploads, 4);
        assert!(SyncReport::default().is_clean());
        assert!(!QueueSummary::default().has_pending_work());
        let _forms = StaticForms::new();
    }
}
