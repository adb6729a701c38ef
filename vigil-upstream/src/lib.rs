//! HTTP implementations of the job queue's external collaborators.
//!
//! - [`NvdSearchClient`] queries the NVD CVE API 2.0 by keyword
//! - [`HttpTimeSource`] reads the current time from a JSON time service

mod error;
mod nvd;
mod time_source;

pub use error::UpstreamError;
pub use nvd::{NvdSearchClient, NvdSettings, DEFAULT_NVD_URL, DEFAULT_RESULTS_PER_PAGE};
pub use time_source::HttpTimeSource;

/// User agent sent with every upstream request.
pub(crate) const USER_AGENT: &str = concat!("vigil/", env!("CARGO_PKG_VERSION"));

pub(crate) fn check_url(url: &str) -> Result<(), UpstreamError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| UpstreamError::InvalidUrl {
        url: url.to_owned(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(UpstreamError::InvalidUrl {
            url: url.to_owned(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}
