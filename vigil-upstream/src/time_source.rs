use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use vigil_job_queue::{TimeSource, TimeSourceError};

use crate::error::UpstreamError;
use crate::{check_url, USER_AGENT};

/// Reads the current time from a JSON endpoint such as worldtimeapi.
///
/// Accepts `utc_datetime` or `datetime` (RFC 3339) or `unixtime` (seconds).
#[derive(Debug, Clone)]
pub struct HttpTimeSource {
    client: Client,
    url: String,
}

impl HttpTimeSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let url = url.into();
        check_url(&url)?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn parse_time(body: &Value) -> Result<DateTime<Utc>, TimeSourceError> {
    for field in ["utc_datetime", "datetime"] {
        if let Some(raw) = body.get(field).and_then(Value::as_str) {
            return DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| TimeSourceError(format!("bad {field} '{raw}': {e}")));
        }
    }
    if let Some(secs) = body.get("unixtime").and_then(Value::as_i64) {
        return DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| TimeSourceError(format!("unixtime {secs} out of range")));
    }
    Err(TimeSourceError("response carries no timestamp".to_owned()))
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    async fn fetch(&self) -> Result<DateTime<Utc>, TimeSourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| TimeSourceError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TimeSourceError(format!(
                "time source returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| TimeSourceError(e.to_string()))?;
        parse_time(&body)
    }
}
