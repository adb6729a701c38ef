//! Core types for the job queue system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::search::SearchResults;

/// Opaque key-value bag attached to a job at creation.
pub type Metadata = serde_json::Map<String, Value>;

/// Lifecycle status of a job.
///
/// Transitions only ever move forward: `Pending -> Processing -> {Completed | Failed}`,
/// with `Pending -> Failed` reserved for jobs whose message never reached the broker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns true if this status represents a terminal state.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the forward-only lifecycle. Terminal states share a rank so
    /// neither can overwrite the other.
    #[inline]
    pub const fn rank(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// The durable lifecycle record of one keyword search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub keyword: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Time the job entered `Processing`; kept once set.
    pub started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub total_results: Option<u64>,
    pub results_payload: Option<Value>,
    pub error: Option<String>,
    pub processed_via: Option<String>,
}

impl JobRecord {
    /// Create a new pending job record.
    pub fn pending(
        job_id: Uuid,
        keyword: impl Into<String>,
        metadata: Metadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            keyword: keyword.into(),
            metadata,
            status: JobStatus::Pending,
            created_at,
            started_at: None,
            processed_at: None,
            total_results: None,
            results_payload: None,
            error: None,
            processed_via: None,
        }
    }

    /// Rebuild a minimal placeholder from a delivered message when no stored
    /// record is available, e.g. after the store was restored from a backup.
    pub fn resumed(message: &JobMessage) -> Self {
        Self::pending(
            message.job_id,
            message.keyword.clone(),
            message.metadata.clone(),
            message.created_at.unwrap_or_else(Utc::now),
        )
    }

    /// Mark the job as processing.
    #[inline]
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at.get_or_insert(now);
        self.processed_at = Some(now);
    }

    /// Mark the job as completed with the search outcome.
    pub fn complete(
        &mut self,
        results: SearchResults,
        via: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.status = JobStatus::Completed;
        self.total_results = Some(results.total_results);
        self.results_payload = serde_json::to_value(&results.results).ok();
        self.error = None;
        self.processed_via = Some(via.into());
        self.processed_at = Some(self.not_before_start(now));
    }

    /// Mark the job as failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>, via: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.total_results = None;
        self.results_payload = None;
        self.error = Some(error.into());
        self.processed_via = Some(via.into());
        self.processed_at = Some(self.not_before_start(now));
    }

    /// Copy the mutable lifecycle fields of `next` onto this record. Identity
    /// fields (`keyword`, `metadata`, `created_at`) never change.
    pub fn absorb(&mut self, next: &JobRecord) {
        self.status = next.status;
        if self.started_at.is_none() {
            self.started_at = next.started_at;
        }
        self.processed_at = next.processed_at;
        self.total_results = next.total_results;
        self.results_payload = next.results_payload.clone();
        self.error = next.error.clone();
        self.processed_via = next.processed_via.clone();
    }

    // An external clock and the local fallback can disagree; a terminal
    // timestamp must never precede the processing one.
    fn not_before_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.started_at {
            Some(started) if started > now => started,
            _ => now,
        }
    }
}

/// Broker message body published for each enqueued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub keyword: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Option<DateTime<Utc>>,
}

/// Wire shape used while decoding; every field is optional so a missing
/// field is reported as a malformed message rather than a serde error.
#[derive(Deserialize)]
struct RawJobMessage {
    job_id: Option<String>,
    keyword: Option<String>,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl JobMessage {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            keyword: record.keyword.clone(),
            metadata: record.metadata.clone(),
            created_at: Some(record.created_at),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, JobQueueError> {
        serde_json::to_vec(self).map_err(|e| JobQueueError::Publish(e.to_string()))
    }

    /// Decode a delivery body. Bodies without a usable `job_id` or `keyword`
    /// can never succeed and are rejected as malformed.
    pub fn parse(body: &[u8]) -> Result<Self, JobQueueError> {
        let raw: RawJobMessage = serde_json::from_slice(body)
            .map_err(|e| JobQueueError::MalformedMessage(e.to_string()))?;

        let job_id = raw
            .job_id
            .ok_or_else(|| JobQueueError::MalformedMessage("missing job_id".to_owned()))?;
        let job_id = Uuid::parse_str(&job_id)
            .map_err(|e| JobQueueError::MalformedMessage(format!("invalid job_id: {e}")))?;

        let keyword = raw
            .keyword
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| JobQueueError::MalformedMessage("missing keyword".to_owned()))?;

        Ok(Self {
            job_id,
            keyword,
            metadata: raw.metadata.unwrap_or_default(),
            created_at: raw.created_at,
        })
    }
}

/// Result returned after a job has been enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Number of stored jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    #[inline]
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    #[inline]
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
