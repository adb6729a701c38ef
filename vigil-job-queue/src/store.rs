//! Durable job state contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{JobRecord, JobStatus, StatusCounts};

/// Whether a transition changed the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The record was created or moved forward.
    Applied,
    /// The stored status was already at or beyond the requested one.
    Unchanged,
}

/// Authoritative record of every job, independent of broker and process lifetime.
///
/// Implementations must support concurrent upserts keyed by `job_id` without
/// cross-job locking.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new record. Must be committed when this returns `Ok`.
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Upsert the lifecycle fields of `record`, keyed by its `job_id`.
    ///
    /// Only forward moves are applied; repeating a transition, or attempting
    /// to leave a terminal state, is reported as [`TransitionOutcome::Unchanged`].
    async fn transition(&self, record: &JobRecord) -> Result<TransitionOutcome, StoreError>;

    /// `Ok(None)` means the job never existed.
    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    /// All records, newest first.
    async fn get_all(&self) -> Result<Vec<JobRecord>, StoreError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// A page of records, newest first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let all = self.get_all().await?;
        Ok(all
            .into_iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .skip(offset)
            .take(limit)
            .collect())
    }
}

/// Apply `next` onto `current` if it moves the job forward.
pub(crate) fn merge_forward(current: &mut JobRecord, next: &JobRecord) -> TransitionOutcome {
    if next.status.rank() > current.status.rank() {
        current.absorb(next);
        TransitionOutcome::Applied
    } else {
        TransitionOutcome::Unchanged
    }
}

/// Process-local store for tests and single-node development.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    records: Arc<RwLock<HashMap<Uuid, JobRecord>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.job_id) {
            return Err(StoreError::Duplicate(record.job_id));
        }
        records.insert(record.job_id, record.clone());
        Ok(())
    }

    async fn transition(&self, record: &JobRecord) -> Result<TransitionOutcome, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.job_id) {
            Some(current) => Ok(merge_forward(current, record)),
            None => {
                records.insert(record.job_id, record.clone());
                Ok(TransitionOutcome::Applied)
            }
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().await.get(&job_id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<JobRecord>, StoreError> {
        let records = self.records.read().await;
        let mut all: Vec<JobRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let records = self.records.read().await;
        let mut counts = StatusCounts::default();
        for record in records.values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }
}
