use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use vigil_job_queue::{SearchClient, SearchError, SearchResult, SearchResults};

use crate::error::UpstreamError;
use crate::{check_url, USER_AGENT};

pub const DEFAULT_NVD_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";
pub const DEFAULT_RESULTS_PER_PAGE: u32 = 20;

/// Connection settings for [`NvdSearchClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvdSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub results_per_page: u32,
}

impl Default for NvdSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_NVD_URL.to_owned(),
            api_key: None,
            timeout: Duration::from_secs(30),
            results_per_page: DEFAULT_RESULTS_PER_PAGE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdResponse {
    #[serde(default)]
    total_results: u64,
    #[serde(default)]
    vulnerabilities: Vec<NvdVulnerability>,
}

#[derive(Debug, Deserialize)]
struct NvdVulnerability {
    cve: NvdCve,
}

#[derive(Debug, Deserialize)]
struct NvdCve {
    id: String,
    #[serde(default)]
    published: Option<String>,
    #[serde(default)]
    descriptions: Vec<NvdDescription>,
    #[serde(default)]
    metrics: NvdMetrics,
}

#[derive(Debug, Deserialize)]
struct NvdDescription {
    lang: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdMetrics {
    #[serde(default)]
    cvss_metric_v31: Vec<NvdMetric>,
    #[serde(default)]
    cvss_metric_v30: Vec<NvdMetric>,
    #[serde(default)]
    cvss_metric_v2: Vec<NvdMetric>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdMetric {
    cvss_data: NvdCvssData,
    /// CVSS v2 reports severity beside the vector rather than inside it.
    #[serde(default)]
    base_severity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCvssData {
    #[serde(default)]
    base_score: Option<f64>,
    #[serde(default)]
    base_severity: Option<String>,
}

impl NvdCve {
    fn into_result(self) -> SearchResult {
        let description = self
            .descriptions
            .iter()
            .find(|d| d.lang == "en")
            .or_else(|| self.descriptions.first())
            .map(|d| d.value.clone());

        let metric = self
            .metrics
            .cvss_metric_v31
            .first()
            .or_else(|| self.metrics.cvss_metric_v30.first())
            .or_else(|| self.metrics.cvss_metric_v2.first());
        let (score, severity) = match metric {
            Some(m) => (
                m.cvss_data.base_score,
                m.cvss_data
                    .base_severity
                    .clone()
                    .or_else(|| m.base_severity.clone()),
            ),
            None => (None, None),
        };

        SearchResult {
            id: self.id,
            description,
            published: self.published,
            severity,
            score,
        }
    }
}

fn parse_response(body: &str) -> Result<SearchResults, serde_json::Error> {
    let response: NvdResponse = serde_json::from_str(body)?;
    Ok(SearchResults {
        total_results: response.total_results,
        results: response
            .vulnerabilities
            .into_iter()
            .map(|v| v.cve.into_result())
            .collect(),
    })
}

/// Keyword search against the NVD CVE API.
#[derive(Debug, Clone)]
pub struct NvdSearchClient {
    client: Client,
    settings: NvdSettings,
}

impl NvdSearchClient {
    pub fn new(settings: NvdSettings) -> Result<Self, UpstreamError> {
        check_url(&settings.base_url)?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &NvdSettings {
        &self.settings
    }
}

#[async_trait]
impl SearchClient for NvdSearchClient {
    fn source(&self) -> &str {
        "nvd"
    }

    async fn search(&self, keyword: &str) -> Result<SearchResults, SearchError> {
        debug!(keyword, url = %self.settings.base_url, "querying NVD");

        let per_page = self.settings.results_per_page.to_string();
        let mut request = self
            .client
            .get(&self.settings.base_url)
            .query(&[("keywordSearch", keyword), ("resultsPerPage", per_page.as_str())]);
        if let Some(key) = &self.settings.api_key {
            request = request.header("apiKey", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SearchError::Timeout
            } else {
                warn!(%e, keyword, "NVD request failed");
                SearchError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, keyword, "NVD returned an error status");
            return Err(SearchError::Unavailable(format!("NVD returned {status}")));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                SearchError::Timeout
            } else {
                SearchError::Unavailable(e.to_string())
            }
        })?;

        parse_response(&body).map_err(|e| {
            warn!(%e, keyword, "failed to parse NVD response");
            SearchError::Unavailable(format!("invalid NVD response: {e}"))
        })
    }
}
