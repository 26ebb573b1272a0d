//! Memoization of expensive derived artifacts (rendered visuals, search
//! results) keyed by [`Fingerprint`].
//!
//! Concurrent requests for one fingerprint share a single computation.
//! Successful results are kept in a bounded LRU and, when a repository is
//! attached, written through to the `artifacts` table so they survive a
//! restart. Failures are never stored.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use watira_store::{ArtifactRepo, ArtifactRow};

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;

/// Immutable computed bytes plus their content type.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub kind: String,
    pub mime_type: String,
    pub bytes: bytes::Bytes,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(kind: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: kind.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
            created_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    /// `None` disables age expiry.
    pub max_age: Option<Duration>,
    pub compute_timeout: Duration,
    pub persisted_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 128,
            max_bytes: 64 * 1024 * 1024,
            max_age: Some(Duration::from_secs(24 * 3600)),
            compute_timeout: Duration::from_secs(30),
            persisted_max_entries: 1024,
        }
    }
}

struct Entry {
    artifact: Arc<Artifact>,
    inserted: Instant,
    tick: u64,
}

#[derive(Default)]
struct Lru {
    entries: HashMap<Fingerprint, Entry>,
    order: BTreeMap<u64, Fingerprint>,
    tick: u64,
    total_bytes: usize,
}

impl Lru {
    fn get(&mut self, fp: &Fingerprint, max_age: Option<Duration>) -> Option<Arc<Artifact>> {
        let expired = {
            let entry = self.entries.get(fp)?;
            max_age.is_some_and(|age| entry.inserted.elapsed() >= age)
        };
        if expired {
            self.remove(fp);
            return None;
        }
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(fp)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, fp.clone());
        Some(Arc::clone(&entry.artifact))
    }

    fn insert(&mut self, fp: Fingerprint, artifact: Arc<Artifact>) {
        self.remove(&fp);
        self.tick += 1;
        self.total_bytes += artifact.size();
        self.order.insert(self.tick, fp.clone());
        self.entries.insert(
            fp,
            Entry {
                artifact,
                inserted: Instant::now(),
                tick: self.tick,
            },
        );
    }

    fn remove(&mut self, fp: &Fingerprint) {
        if let Some(entry) = self.entries.remove(fp) {
            self.order.remove(&entry.tick);
            self.total_bytes -= entry.artifact.size();
        }
    }

    /// Drop least-recently-used entries until both bounds hold.
    fn evict(&mut self, max_entries: usize, max_bytes: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_entries || self.total_bytes > max_bytes {
            let Some((_, fp)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&fp) {
                self.total_bytes -= entry.artifact.size();
                evicted += 1;
            }
        }
        evicted
    }
}

type Slot = Arc<OnceCell<Arc<Artifact>>>;

/// Single-flight LRU cache of computed artifacts.
pub struct ArtifactCache {
    config: CacheConfig,
    lru: Mutex<Lru>,
    inflight: Mutex<HashMap<Fingerprint, Slot>>,
    repo: Option<ArtifactRepo>,
}

impl ArtifactCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            lru: Mutex::new(Lru::default()),
            inflight: Mutex::new(HashMap::new()),
            repo: None,
        }
    }

    /// Write computed artifacts through to `repo` and read through it on a miss.
    pub fn with_repo(mut self, repo: ArtifactRepo) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Return the artifact for `fp`, running `compute` only if no cached or
    /// in-flight result exists.
    #[instrument(skip(self, compute), fields(fingerprint = %fp))]
    pub async fn get_or_compute<F, Fut>(
        &self,
        fp: &Fingerprint,
        compute: F,
    ) -> Result<Arc<Artifact>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Artifact, CacheError>>,
    {
        if let Some(hit) = self.lookup(fp) {
            debug!("cache hit");
            return Ok(hit);
        }

        let slot: Slot = Arc::clone(self.inflight.lock().entry(fp.clone()).or_default());

        let result = slot
            .get_or_try_init(|| async {
                // A computation may have finished between the lookup and
                // taking the slot.
                if let Some(hit) = self.lookup(fp) {
                    return Ok(hit);
                }
                if let Some(persisted) = self.load_persisted(fp) {
                    return Ok(persisted);
                }

                let artifact = match tokio::time::timeout(self.config.compute_timeout, compute()).await {
                    Ok(result) => Arc::new(result?),
                    Err(_) => return Err(CacheError::Timeout(self.config.compute_timeout)),
                };
                self.persist(fp, &artifact);
                debug!(size = artifact.size(), "artifact computed");
                Ok(artifact)
            })
            .await
            .map(Arc::clone);

        if let Ok(artifact) = &result {
            self.store(fp.clone(), Arc::clone(artifact));
        }

        let mut inflight = self.inflight.lock();
        if inflight.get(fp).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            inflight.remove(fp);
        }
        drop(inflight);

        result
    }

    /// Lookup without computing. Falls back to the persisted table.
    pub fn get(&self, fp: &Fingerprint) -> Option<Arc<Artifact>> {
        if let Some(hit) = self.lookup(fp) {
            return Some(hit);
        }
        let persisted = self.load_persisted(fp)?;
        self.store(fp.clone(), Arc::clone(&persisted));
        Some(persisted)
    }

    pub fn len(&self) -> usize {
        self.lru.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.lru.lock().total_bytes
    }

    fn lookup(&self, fp: &Fingerprint) -> Option<Arc<Artifact>> {
        self.lru.lock().get(fp, self.config.max_age)
    }

    fn store(&self, fp: Fingerprint, artifact: Arc<Artifact>) {
        let mut lru = self.lru.lock();
        lru.insert(fp, artifact);
        let evicted = lru.evict(self.config.max_entries, self.config.max_bytes);
        if evicted > 0 {
            debug!(evicted, "evicted artifacts");
        }
    }

    fn load_persisted(&self, fp: &Fingerprint) -> Option<Arc<Artifact>> {
        let repo = self.repo.as_ref()?;
        match repo.get(fp.as_str()) {
            Ok(Some(row)) => {
                let age = Utc::now().signed_duration_since(row.created_at);
                let expired = self
                    .config
                    .max_age
                    .and_then(|max| chrono::Duration::from_std(max).ok())
                    .is_some_and(|max| age >= max);
                if expired {
                    return None;
                }
                Some(Arc::new(Artifact {
                    kind: row.kind,
                    mime_type: row.mime_type,
                    bytes: row.bytes.into(),
                    created_at: row.created_at,
                }))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "artifact read-through failed");
                None
            }
        }
    }

    fn persist(&self, fp: &Fingerprint, artifact: &Artifact) {
        let Some(repo) = self.repo.as_ref() else {
            return;
        };
        let row = ArtifactRow {
            fingerprint: fp.to_string(),
            kind: artifact.kind.clone(),
            mime_type: artifact.mime_type.clone(),
            bytes: artifact.bytes.to_vec(),
            created_at: artifact.created_at,
        };
        if let Err(e) = repo.put(&row) {
            warn!(error = %e, "artifact write-through failed");
            return;
        }
        if let Err(e) = repo.prune(self.config.persisted_max_entries) {
            warn!(error = %e, "artifact prune failed");
        }
    }
}
