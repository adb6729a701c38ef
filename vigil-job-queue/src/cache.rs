//! Write-through cache in front of a [`StateStore`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{merge_forward, StateStore, TransitionOutcome};
use crate::types::{JobRecord, JobStatus, StatusCounts};

/// Maximum number of records kept in memory.
const MAX_CACHED_RECORDS: usize = 1000;

/// Caches records the process has written or read.
///
/// The wrapped store stays authoritative: every write goes through to it
/// first, and only terminal records (which are write-once) are served from
/// memory. Anything else is re-read so changes made by other processes are
/// never masked.
#[derive(Clone)]
pub struct CachedStateStore {
    inner: Arc<dyn StateStore>,
    cache: Arc<DashMap<Uuid, JobRecord>>,
    capacity: usize,
}

impl fmt::Debug for CachedStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStateStore")
            .field("inner", &"<dyn StateStore>")
            .field("cached", &self.cache.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl CachedStateStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self::with_capacity(inner, MAX_CACHED_RECORDS)
    }

    pub fn with_capacity(inner: Arc<dyn StateStore>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Whether the record is currently held in memory.
    pub fn is_cached(&self, job_id: &Uuid) -> bool {
        self.cache.contains_key(job_id)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached record.
    pub fn clear(&self) {
        self.cache.clear();
    }

    fn remember(&self, record: JobRecord) {
        if self.cache.len() >= self.capacity && !self.cache.contains_key(&record.job_id) {
            // Take the key first; removing while an iterator guard is alive deadlocks.
            let victim = self.cache.iter().next().map(|entry| *entry.key());
            if let Some(victim) = victim {
                self.cache.remove(&victim);
            }
        }
        self.cache.insert(record.job_id, record);
    }
}

#[async_trait]
impl StateStore for CachedStateStore {
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.inner.create(record).await?;
        self.remember(record.clone());
        Ok(())
    }

    async fn transition(&self, record: &JobRecord) -> Result<TransitionOutcome, StoreError> {
        let outcome = self.inner.transition(record).await?;
        match outcome {
            TransitionOutcome::Applied => {
                let merged = match self.cache.get(&record.job_id) {
                    Some(cached) => {
                        let mut merged = cached.clone();
                        merge_forward(&mut merged, record);
                        merged
                    }
                    None => record.clone(),
                };
                self.remember(merged);
            }
            TransitionOutcome::Unchanged => {
                self.cache.remove(&record.job_id);
            }
        }
        Ok(outcome)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        if let Some(cached) = self.cache.get(&job_id) {
            if cached.status.is_terminal() {
                return Ok(Some(cached.clone()));
            }
        }

        let fresh = self.inner.get(job_id).await?;
        match &fresh {
            Some(record) => self.remember(record.clone()),
            None => {
                self.cache.remove(&job_id);
            }
        }
        Ok(fresh)
    }

    async fn get_all(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.get_all().await
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.inner.counts_by_status().await
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.list(status, limit, offset).await
    }
}
