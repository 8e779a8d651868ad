//! In-memory object store for testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use fieldsync_common::{Error, Result};

use crate::artifact::S3Artifact;
use crate::hash::{md5_bytes, md5_hex};
use crate::provider::{ObjectStore, PutReceipt};

/// Failure a test can inject for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    Auth,
    Network,
    Connectivity,
    /// Accept the upload but answer with a wrong ETag.
    BadEtag,
}

impl Failure {
    fn into_error(self, key: &str) -> Error {
        match self {
            Failure::NotFound => Error::NotFound(key.to_string()),
            Failure::Auth => Error::Auth(format!("Signature rejected for {}", key)),
            Failure::Network => Error::Network(format!("Injected failure for {}", key)),
            Failure::Connectivity => Error::Connectivity("Endpoint unreachable".to_string()),
            Failure::BadEtag => Error::Network(format!("Bad ETag for {}", key)),
        }
    }
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Stored>,
    put_counts: HashMap<String, usize>,
    fail_next: HashMap<String, Failure>,
    fail_always: HashMap<String, Failure>,
    public: HashSet<String>,
}

struct Stored {
    data: Bytes,
    content_type: String,
}

/// In-memory object store.
///
/// Records every upload and lets tests inject failures per key. All data
/// is lost on drop.
#[derive(Default)]
pub struct MemoryObjectStore {
    state: Mutex<State>,
    offline: AtomicBool,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every request by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next request for `key` once.
    pub fn fail_next(&self, key: &str, failure: Failure) {
        self.state().fail_next.insert(key.to_string(), failure);
    }

    /// Fail every request for `key`.
    pub fn fail_always(&self, key: &str, failure: Failure) {
        self.state().fail_always.insert(key.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_next.clear();
        state.fail_always.clear();
    }

    /// Simulate loss of connectivity for all keys.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Stored object content.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).map(|o| o.data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.state().objects.get(key).map(|o| o.content_type.clone())
    }

    pub fn is_public(&self, key: &str) -> bool {
        self.state().public.contains(key)
    }

    /// Successful uploads of `key`.
    pub fn put_count(&self, key: &str) -> usize {
        self.state().put_counts.get(key).copied().unwrap_or(0)
    }

    /// Successful uploads across all keys.
    pub fn total_puts(&self) -> usize {
        self.state().put_counts.values().sum()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Highest number of concurrent requests observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn injected(&self, key: &str) -> Option<Failure> {
        if self.offline.load(Ordering::SeqCst) {
            return Some(Failure::Connectivity);
        }
        let mut state = self.state();
        if let Some(failure) = state.fail_next.remove(key) {
            return Some(failure);
        }
        state.fail_always.get(key).copied()
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, artifact: &S3Artifact, data: Bytes) -> Result<PutReceipt> {
        let _guard = self.enter().await;
        let key = artifact.key();

        let etag = match self.injected(&key) {
            Some(Failure::BadEtag) => "0".repeat(32),
            Some(failure) => return Err(failure.into_error(&key)),
            None => md5_hex(&md5_bytes(&data)),
        };

        let mut state = self.state();
        state.objects.insert(
            key.clone(),
            Stored {
                data,
                content_type: artifact.content_type.to_string(),
            },
        );
        if artifact.is_public() {
            state.public.insert(key.clone());
        } else {
            state.public.remove(&key);
        }
        *state.put_counts.entry(key.clone()).or_insert(0) += 1;

        Ok(PutReceipt { key, etag })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let _guard = self.enter().await;
        if let Some(failure) = self.injected(key) {
            return Err(failure.into_error(key));
        }
        self.state()
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}
