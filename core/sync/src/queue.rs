//! Upload queue for transmissions.
//!
//! Each transmission moves PENDING -> IN_PROGRESS -> SYNCED or FAILED.
//! Failed transmissions are picked up again by the next explicit pass;
//! there is no timer here.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldsync_common::{Error, Result, TransmissionId};
use fieldsync_storage::{ArtifactMapper, FileHasher, Md5Hasher, ObjectStore, S3Artifact};
use fieldsync_store::{RecordStore, Transmission, TransmissionStatus};

use crate::state::{ArtifactOutcome, SyncReport};

/// Ids of transmissions currently being uploaded.
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<TransmissionId>>>);

impl InFlight {
    fn try_acquire(&self, id: TransmissionId) -> Option<FlightGuard> {
        let mut ids = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.insert(id).then(|| FlightGuard {
            ids: self.0.clone(),
            id,
        })
    }
}

/// Releases the transmission id when the upload ends, however it ends.
struct FlightGuard {
    ids: Arc<Mutex<HashSet<TransmissionId>>>,
    id: TransmissionId,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.remove(&self.id);
    }
}

/// Error for a blocking task that panicked or was aborted.
pub(crate) fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(format!("spawn_blocking join: {}", e)))
}

/// Outcome of one batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub report: SyncReport,
    /// Failure that stopped the rest of the batch.
    pub fatal: Option<Error>,
}

/// Uploads transmissions through an [`ObjectStore`] on a bounded pool.
pub struct TransmissionQueue<H = Md5Hasher> {
    store: Arc<RecordStore>,
    remote: Arc<dyn ObjectStore>,
    mapper: Arc<ArtifactMapper<H>>,
    max_concurrent: usize,
    in_flight: InFlight,
}

impl<H: FileHasher + 'static> TransmissionQueue<H> {
    pub fn new(
        store: Arc<RecordStore>,
        remote: Arc<dyn ObjectStore>,
        mapper: ArtifactMapper<H>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            remote,
            mapper: Arc::new(mapper),
            max_concurrent: max_concurrent.max(1),
            in_flight: InFlight::default(),
        }
    }

    /// Upload every transmission in `batch` that is not yet synced.
    ///
    /// Up to `max_concurrent` uploads run at once. `cancel` is checked
    /// before each artifact starts; an upload already running completes.
    /// A connectivity failure stops the artifacts that have not started.
    pub async fn upload_all(&self, batch: Vec<Transmission>, cancel: &CancellationToken) -> BatchResult {
        let abort = cancel.child_token();
        let outcomes: Vec<Result<ArtifactOutcome>> = stream::iter(batch)
            .map(|transmission| {
                let abort = abort.clone();
                async move {
                    let outcome = self.upload_one(&transmission, &abort).await;
                    if matches!(&outcome, Err(e) if e.is_batch_fatal()) {
                        abort.cancel();
                    }
                    outcome
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut result = BatchResult::default();
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => result.report.record(outcome),
                Err(Error::Cancelled) => result.report.record(ArtifactOutcome::NotStarted),
                Err(e) if e.is_batch_fatal() => {
                    result.report.record(ArtifactOutcome::Failed { retryable: true });
                    result.report.aborted = true;
                    if result.fatal.is_none() {
                        result.report.error = Some(e.to_string());
                        result.fatal = Some(e);
                    }
                }
                Err(e) => {
                    error!("Upload bookkeeping failed: {}", e);
                    result.report.record(ArtifactOutcome::Failed { retryable: true });
                }
            }
        }
        if cancel.is_cancelled() {
            result.report.aborted = true;
        }
        result
    }

    /// Upload one transmission.
    ///
    /// Per-artifact failures are recorded on the transmission and reported
    /// as `Ok(Failed)`. Errors are returned for connectivity loss and for
    /// failures to update the store. `Error::Cancelled` means the upload
    /// never started and the transmission is untouched.
    pub async fn upload_one(&self, transmission: &Transmission, cancel: &CancellationToken) -> Result<ArtifactOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(_guard) = self.in_flight.try_acquire(transmission.id) else {
            debug!("Transmission {} is already uploading", transmission.id);
            return Ok(ArtifactOutcome::Skipped);
        };

        // Re-read under the guard; another worker may have finished it.
        let current = self
            .store
            .transmission(transmission.id)?
            .ok_or_else(|| Error::NotFound(format!("transmission {}", transmission.id)))?;
        if !current.status.is_uploadable() {
            return Ok(ArtifactOutcome::Skipped);
        }

        self.store
            .update_transmission_status(current.id, TransmissionStatus::InProgress)?;

        let (artifact, data) = match self.load(&current.filename).await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                let reason = format!("No uploadable artifact for {}", current.filename);
                self.store.mark_transmission_failed(current.id, &reason, false)?;
                return Ok(ArtifactOutcome::Failed { retryable: false });
            }
            Err(e) => return self.fail(&current, e),
        };

        let uploaded = self
            .remote
            .put(&artifact, data)
            .await
            .and_then(|receipt| receipt.verify(&artifact.md5_hex()));
        match uploaded {
            Ok(()) => {
                self.store
                    .update_transmission_status(current.id, TransmissionStatus::Synced)?;
                info!("Uploaded {} to {}", current.filename, self.remote.name());
                Ok(ArtifactOutcome::Uploaded)
            }
            Err(e) if e.is_batch_fatal() => {
                self.store.mark_transmission_failed(current.id, &e.to_string(), true)?;
                warn!("Lost connectivity while uploading {}", current.filename);
                Err(e)
            }
            Err(e) => self.fail(&current, e),
        }
    }

    /// Checksum and read the artifact on the blocking pool.
    async fn load(&self, filename: &str) -> Result<Option<(S3Artifact, Bytes)>> {
        let mapper = self.mapper.clone();
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<(S3Artifact, Bytes)>> {
            let Some(artifact) = mapper.describe(&filename)? else {
                return Ok(None);
            };
            let data = std::fs::read(&artifact.path)?;
            Ok(Some((artifact, Bytes::from(data))))
        })
        .await
        .map_err(join_error)?
    }

    fn fail(&self, transmission: &Transmission, e: Error) -> Result<ArtifactOutcome> {
        let retryable = e.is_retryable();
        warn!("Upload of {} failed: {}", transmission.filename, e);
        self.store
            .mark_transmission_failed(transmission.id, &e.to_string(), retryable)?;
        Ok(ArtifactOutcome::Failed { retryable })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::InstanceId;
    use fieldsync_storage::{Failure, MemoryObjectStore};
    use fieldsync_store::{SurveyInstanceFields, SurveyInstanceStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<RecordStore>,
        remote: Arc<MemoryObjectStore>,
        queue: TransmissionQueue,
        instance: InstanceId,
    }

    fn fixture(remote: MemoryObjectStore, max_concurrent: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("media");
        let data = dir.path().join("data");
        std::fs::create_dir_all(&media).unwrap();
        std::fs::create_dir_all(&data).unwrap();

        let store = Arc::new(RecordStore::in_memory().unwrap());
        let instance = store
            .create_survey_instance(&SurveyInstanceFields {
                form_id: Some("f1".to_string()),
                ..Default::default()
            })
            .unwrap();
        store
            .update_survey_status(instance.id, SurveyInstanceStatus::Submitted)
            .unwrap();

        let remote = Arc::new(remote);
        let queue = TransmissionQueue::new(
            store.clone(),
            remote.clone(),
            ArtifactMapper::new(media, data, Md5Hasher),
            max_concurrent,
        );
        Fixture {
            _dir: dir,
            store,
            remote,
            queue,
            instance: instance.id,
        }
    }

    impl Fixture {
        fn add_media(&self, name: &str) -> TransmissionId {
            std::fs::write(self._dir.path().join("media").join(name), name.as_bytes()).unwrap();
            self.store
                .create_transmission(self.instance, Some("f1"), name)
                .unwrap()
        }

        fn pending(&self) -> Vec<Transmission> {
            self.store.unsynced_transmissions().unwrap()
        }

        fn status(&self, id: TransmissionId) -> Transmission {
            self.store.transmission(id).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_upload_marks_synced() {
        let f = fixture(MemoryObjectStore::new(), 2);
        let a = f.add_media("a.jpg");
        let b = f.add_media("b.png");

        let result = f.queue.upload_all(f.pending(), &CancellationToken::new()).await;
        assert_eq!(result.report.artifacts_uploaded, 2);
        assert!(result.fatal.is_none());
        assert_eq!(f.status(a).status, TransmissionStatus::Synced);
        assert_eq!(f.status(b).status, TransmissionStatus::Synced);
        assert!(f.remote.is_public("images/a.jpg"));
    }

    #[tokio::test]
    async fn test_not_found_does_not_abort_batch() {
        let f = fixture(MemoryObjectStore::new(), 1);
        let a = f.add_media("a.jpg");
        let b = f.add_media("b.jpg");
        f.remote.fail_next("images/a.jpg", Failure::NotFound);

        let result = f.queue.upload_all(f.pending(), &CancellationToken::new()).await;
        assert!(!result.report.aborted);
        assert_eq!(result.report.artifacts_failed, 1);
        assert_eq!(result.report.artifacts_uploaded, 1);

        let failed = f.status(a);
        assert_eq!(failed.status, TransmissionStatus::Failed);
        assert!(failed.retryable);
        assert_eq!(failed.failure_count, 1);
        assert_eq!(f.status(b).status, TransmissionStatus::Synced);
    }

    #[tokio::test]
    async fn test_connectivity_aborts_batch() {
        let f = fixture(MemoryObjectStore::new(), 1);
        let ids = [f.add_media("a.jpg"), f.add_media("b.jpg"), f.add_media("c.jpg")];
        f.remote.set_offline(true);

        let result = f.queue.upload_all(f.pending(), &CancellationToken::new()).await;
        assert!(result.report.aborted);
        assert!(matches!(result.fatal, Some(Error::Connectivity(_))));
        assert_eq!(result.report.artifacts_failed, 1);
        assert_eq!(f.remote.total_puts(), 0);

        let statuses: Vec<_> = ids.iter().map(|id| f.status(*id).status).collect();
        assert_eq!(
            statuses.iter().filter(|s| **s == TransmissionStatus::Pending).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_retryable_failure() {
        let f = fixture(MemoryObjectStore::new(), 1);
        let a = f.add_media("a.jpg");
        f.remote.fail_next("images/a.jpg", Failure::BadEtag);

        let result = f.queue.upload_all(f.pending(), &CancellationToken::new()).await;
        assert_eq!(result.report.artifacts_failed, 1);
        let t = f.status(a);
        assert_eq!(t.status, TransmissionStatus::Failed);
        assert!(t.retryable);
        assert!(t.last_error.unwrap().contains("Checksum mismatch"));

        let retry = f.queue.upload_all(f.pending(), &CancellationToken::new()).await;
        assert_eq!(retry.report.artifacts_uploaded, 1);
        assert_eq!(f.status(a).status, TransmissionStatus::Synced);
    }

    #[tokio::test]
    async fn test_missing_file_blocks_transmission() {
        let f = fixture(MemoryObjectStore::new(), 1);
        let id = f
            .store
            .create_transmission(f.instance, Some("f1"), "gone.jpg")
            .unwrap();

        let result = f.queue.upload_all(f.pending(), &CancellationToken::new()).await;
        assert_eq!(result.report.artifacts_failed, 1);
        assert!(f.status(id).is_blocked());
    }

    #[tokio::test]
    async fn test_cancelled_batch_uploads_nothing() {
        let f = fixture(MemoryObjectStore::new(), 2);
        f.add_media("a.jpg");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f.queue.upload_all(f.pending(), &cancel).await;
        assert!(result.report.aborted);
        assert_eq!(result.report.artifacts_uploaded, 0);
        assert_eq!(f.remote.total_puts(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_upload_leaves_transmission_pending() {
        let f = fixture(MemoryObjectStore::new(), 1);
        let id = f.add_media("a.jpg");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let transmission = f.status(id);
        let outcome = f.queue.upload_one(&transmission, &cancel).await;
        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert_eq!(f.status(id).status, TransmissionStatus::Pending);
        assert_eq!(f.status(id).failure_count, 0);
    }

    #[tokio::test]
    async fn test_single_flight_per_transmission() {
        let f = fixture(MemoryObjectStore::new().with_latency(Duration::from_millis(50)), 4);
        f.add_media("a.jpg");
        let batch = f.pending();
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            f.queue.upload_all(batch.clone(), &cancel),
            f.queue.upload_all(batch, &cancel)
        );
        assert_eq!(first.report.artifacts_uploaded + second.report.artifacts_uploaded, 1);
        assert_eq!(first.report.artifacts_skipped + second.report.artifacts_skipped, 1);
        assert_eq!(f.remote.put_count("images/a.jpg"), 1);
    }

    #[tokio::test]
    async fn test_pool_is_bounded() {
        let f = fixture(MemoryObjectStore::new().with_latency(Duration::from_millis(20)), 2);
        for name in ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"] {
            f.add_media(name);
        }
        let result = f.queue.upload_all(f.pending(), &CancellationToken::new()).await;
        assert_eq!(result.report.artifacts_uploaded, 5);
        assert!(f.remote.max_in_flight() <= 2);
    }
}
