//! Sync coordinator that drives export and upload of submitted instances.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldsync_common::{Error, Result};
use fieldsync_storage::{ArtifactMapper, FileHasher, Md5Hasher, ObjectStore};
use fieldsync_store::{RecordStore, SurveyInstance, SurveyInstanceStatus, Transmission, TransmissionStatus};

use crate::export::{Exporter, FormDefinitionProvider};
use crate::queue::{join_error, TransmissionQueue};
use crate::state::{ArtifactOutcome, SyncReport};

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Uploads allowed to run at once.
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// Where form-data bundles are written and read from.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Where captured photos and videos live.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
            data_dir: default_data_dir(),
            media_dir: default_media_dir(),
        }
    }
}

impl SyncConfig {
    pub fn new(data_dir: impl Into<PathBuf>, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            media_dir: media_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrent_uploads(mut self, n: usize) -> Self {
        self.max_concurrent_uploads = n.max(1);
        self
    }
}

/// Receives the result of background sync cycles.
pub trait SyncListener: Send + Sync {
    fn on_sync_complete(&self, report: &SyncReport);
    fn on_sync_failed(&self, error: &Error);
}

struct Inner<H> {
    store: Arc<RecordStore>,
    exporter: Arc<Exporter>,
    queue: TransmissionQueue<H>,
    listener: Option<Arc<dyn SyncListener>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

/// Clears the running flag when a cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Selects submitted instances, exports them, uploads their artifacts and
/// marks them SYNCED once every artifact is.
///
/// At most one cycle runs at a time. Cloning yields another handle to the
/// same coordinator.
pub struct SyncCoordinator<H = Md5Hasher> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for SyncCoordinator<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl SyncCoordinator<Md5Hasher> {
    pub fn new(
        store: Arc<RecordStore>,
        remote: Arc<dyn ObjectStore>,
        forms: Arc<dyn FormDefinitionProvider>,
        config: SyncConfig,
    ) -> Self {
        Self::with_hasher(store, remote, forms, config, Md5Hasher)
    }
}

impl<H: FileHasher + 'static> SyncCoordinator<H> {
    /// Create a coordinator that checksums artifacts with `hasher`.
    pub fn with_hasher(
        store: Arc<RecordStore>,
        remote: Arc<dyn ObjectStore>,
        forms: Arc<dyn FormDefinitionProvider>,
        config: SyncConfig,
        hasher: H,
    ) -> Self {
        let exporter = Arc::new(Exporter::new(store.clone(), forms, config.data_dir.clone()));
        let mapper = ArtifactMapper::new(config.media_dir, config.data_dir, hasher);
        let queue = TransmissionQueue::new(store.clone(), remote, mapper, config.max_concurrent_uploads);
        Self {
            inner: Arc::new(Inner {
                store,
                exporter,
                queue,
                listener: None,
                running: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Notify `listener` when background cycles finish.
    ///
    /// Must be called before the coordinator is cloned or started.
    pub fn with_listener(mut self, listener: Arc<dyn SyncListener>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.listener = Some(listener);
        } else {
            warn!("Listener ignored: coordinator is already shared");
        }
        self
    }

    /// Whether a cycle is running.
    pub fn is_syncing(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Request cancellation of the running cycle. Uploads in flight finish;
    /// no new artifact starts.
    pub fn cancel(&self) {
        self.inner.current_token().cancel();
    }

    /// Start a cycle in the background.
    ///
    /// Returns `false` without doing anything if a cycle is already running.
    /// Must be called within a tokio runtime.
    pub fn start_sync(&self) -> bool {
        if !self.inner.try_start() {
            debug!("Sync already running");
            return false;
        }
        let token = self.inner.fresh_token();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _running = RunningGuard(&inner.running);
            let result = inner.run_cycle(&token).await;
            if let Err(e) = &result {
                error!("Sync failed: {}", e);
            }
            if let Some(listener) = &inner.listener {
                match &result {
                    Ok(report) => listener.on_sync_complete(report),
                    Err(e) => listener.on_sync_failed(e),
                }
            }
        });
        true
    }

    /// Run one cycle on the current task.
    ///
    /// # Errors
    /// - `Error::Precondition` if a cycle is already running
    /// - `Error::Storage` if the instances to sync cannot be read
    pub async fn sync_once(&self, cancel: CancellationToken) -> Result<SyncReport> {
        if !self.inner.try_start() {
            return Err(Error::Precondition("A sync cycle is already running".to_string()));
        }
        let _running = RunningGuard(&self.inner.running);
        *self.inner.cancel_slot() = cancel.clone();
        self.inner.run_cycle(&cancel).await
    }
}

impl<H: FileHasher + 'static> Inner<H> {
    fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn cancel_slot(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel_slot().clone()
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel_slot() = token.clone();
        token
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport::default();

        if cancel.is_cancelled() {
            info!("Sync cancelled before start");
            report.aborted = true;
            report.duration = start.elapsed();
            return Ok(report);
        }

        let instances = self.store.instances_ready_for_sync()?;
        info!("Starting sync of {} instances", instances.len());

        let mut exported: Vec<SurveyInstance> = Vec::with_capacity(instances.len());
        let mut batch: Vec<Transmission> = Vec::new();
        for instance in instances {
            if let Err(e) = self.export(&instance).await {
                error!("Failed to export instance {}: {}", instance.uuid, e);
                report.instances_failed += 1;
                continue;
            }
            let transmissions = match self.store.transmissions_for(instance.id) {
                Ok(transmissions) => transmissions,
                Err(e) => {
                    error!("Failed to read artifacts of instance {}: {}", instance.uuid, e);
                    report.instances_failed += 1;
                    continue;
                }
            };
            for transmission in transmissions {
                if transmission.status == TransmissionStatus::Synced {
                    report.record(ArtifactOutcome::Skipped);
                } else {
                    batch.push(transmission);
                }
            }
            exported.push(instance);
        }

        let result = self.queue.upload_all(batch, cancel).await;
        merge(&mut report, result.report);

        for instance in &exported {
            match self.complete_if_synced(instance) {
                Ok(true) => report.instances_synced += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to finish instance {}: {}", instance.uuid, e);
                    report.instances_failed += 1;
                }
            }
        }

        report.duration = start.elapsed();
        if let Some(e) = &result.fatal {
            warn!("Sync aborted: {}", e);
        }
        info!(
            "Sync completed in {:?}: {} instances synced, {} uploaded, {} failed, {} skipped",
            report.duration,
            report.instances_synced,
            report.artifacts_uploaded,
            report.artifacts_failed,
            report.artifacts_skipped
        );
        Ok(report)
    }

    /// Write the bundle on the blocking pool.
    async fn export(&self, instance: &SurveyInstance) -> Result<()> {
        let exporter = self.exporter.clone();
        let instance = instance.clone();
        tokio::task::spawn_blocking(move || exporter.export(&instance).map(|_| ()))
            .await
            .map_err(join_error)?
    }

    /// Flip the instance to SYNCED if every one of its artifacts is.
    fn complete_if_synced(&self, instance: &SurveyInstance) -> Result<bool> {
        let transmissions = self.store.transmissions_for(instance.id)?;
        let done = !transmissions.is_empty()
            && transmissions
                .iter()
                .all(|t| t.status == TransmissionStatus::Synced);
        if done {
            self.store
                .update_survey_status(instance.id, SurveyInstanceStatus::Synced)?;
            info!("Survey instance {} synced", instance.uuid);
        }
        Ok(done)
    }
}

fn merge(report: &mut SyncReport, batch: SyncReport) {
    report.artifacts_uploaded += batch.artifacts_uploaded;
    report.artifacts_failed += batch.artifacts_failed;
    report.artifacts_skipped += batch.artifacts_skipped;
    report.aborted |= batch.aborted;
    if report.error.is_none() {
        report.error = batch.error;
    }
}
