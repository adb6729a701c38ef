use serde::Deserialize;
use vigil_job_queue::Metadata;

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize)]
pub struct EnqueueJobDto {
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}
