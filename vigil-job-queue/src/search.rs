//! Contract for the external vulnerability search collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SearchError;

/// One vulnerability returned by a keyword search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl SearchResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            published: None,
            severity: None,
            score: None,
        }
    }
}

/// Outcome of a successful search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    /// Total matches reported upstream; may exceed `results.len()` when paged.
    pub total_results: u64,
    pub results: Vec<SearchResult>,
}

/// Keyword search against a vulnerability database.
///
/// Calls may take seconds. Workers bound them with their own timeout, so an
/// implementation does not have to.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Short label recorded in `processed_via`.
    fn source(&self) -> &str;

    async fn search(&self, keyword: &str) -> Result<SearchResults, SearchError>;
}
