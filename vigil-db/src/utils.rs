use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use crate::config::DbConnectionConfig;

pub fn config_metadata(config: &DbConnectionConfig) -> serde_json::Value {
    json!({
        "database_url": sanitize_database_url(&config.url).as_ref(),
        "max_connections": config.max_connections,
        "min_connections": config.min_connections,
        "connect_timeout_secs": config.connect_timeout_secs,
        "idle_timeout_secs": config.idle_timeout_secs,
        "busy_timeout_ms": config.busy_timeout_ms,
    })
}

/// Redact credentials from a connection URL before it is logged.
pub fn sanitize_database_url(raw: &str) -> Cow<'_, str> {
    // sqlite:relative.db and sqlite::memory: carry no authority section
    let Some(scheme_end) = raw.find("://") else {
        return Cow::Borrowed(raw);
    };
    let rest = &raw[scheme_end + 3..];
    let host_end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..host_end];

    if let Some(at_pos) = authority.rfind('@') {
        let scheme = &raw[..scheme_end + 3];
        let host_and_rest = &rest[at_pos + 1..];
        let mut result = String::with_capacity(scheme.len() + 10 + host_and_rest.len());
        result.push_str(scheme);
        result.push_str("****:****@");
        result.push_str(host_and_rest);
        Cow::Owned(result)
    } else {
        Cow::Borrowed(raw)
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}
