//! # Records
//!
//! Payloads and records flowing through the pipeline: items found by the crawl, the requests
//! carried by the queues, and the enriched records (or sentinels) landed in storage.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryError;
use crate::buffer::Keyed;
use crate::upstream::UpstreamError;

/// Status stored alongside every populated record.
pub const SUCCESS_STATUS: &str = "SUCCESS";

/// An item found on one page of a partition crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    pub id: String,
    pub name: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
}

impl SearchItem {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: None,
            country: None,
            state: None,
            city: None,
        }
    }
}

/// A message asking the next stage to enrich `source_id`.
///
/// `correlation_key` is the secondary key derived by a previous lookup, if the receiving stage
/// needs one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
}

impl EnrichmentRequest {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_owned(),
            correlation_key: None,
        }
    }

    pub fn correlated(source_id: &str, correlation_key: Option<&str>) -> Self {
        Self {
            source_id: source_id.to_owned(),
            correlation_key: correlation_key.map(str::to_owned),
        }
    }

    /// Decode a queue payload.
    ///
    /// Absent and empty fields decode to `None`, leaving it to the consuming stage to decide
    /// which fields it requires. A bare JSON string is read as the source id. Returns `None` only
    /// when no source id can be found, as such a payload cannot be attributed to any record.
    pub fn decode(payload: &serde_json::Value) -> Option<PartialRequest> {
        let non_empty = |value: Option<&serde_json::Value>| {
            value
                .and_then(|v| match v {
                    serde_json::Value::String(s) => Some(s.trim().to_owned()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
        };

        match payload {
            serde_json::Value::String(_) | serde_json::Value::Number(_) => {
                non_empty(Some(payload)).map(|source_id| PartialRequest {
                    source_id,
                    correlation_key: None,
                })
            }
            serde_json::Value::Object(map) => {
                non_empty(map.get("source_id")).map(|source_id| PartialRequest {
                    source_id,
                    correlation_key: non_empty(map.get("correlation_key")),
                })
            }
            _ => None,
        }
    }
}

/// A decoded payload that has a source id but may still be missing fields a stage requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRequest {
    pub source_id: String,
    pub correlation_key: Option<String>,
}

/// Terminal, non-retryable dispositions recorded when a lookup yields no usable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SentinelStatus {
    /// The upstream answered successfully with an empty data object.
    NoData,
    /// The upstream answered with data missing its required identifier.
    InvalidData,
    /// The request itself was missing a required correlation field.
    InvalidMessage,
    /// The upstream answered with a body that could not be decoded.
    JsonError,
    /// Every attempt failed transiently.
    Failed,
}

impl SentinelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentinelStatus::NoData => "NO_DATA",
            SentinelStatus::InvalidData => "INVALID_DATA",
            SentinelStatus::InvalidMessage => "INVALID_MESSAGE",
            SentinelStatus::JsonError => "JSON_ERROR",
            SentinelStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SentinelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placeholder recorded in place of a populated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentinel {
    pub id: String,
    pub status: SentinelStatus,
    /// The last HTTP status seen from the upstream, when there was one.
    pub status_code: Option<u16>,
    pub reason: String,
    /// The secondary key the request carried, kept so the row can still be joined.
    pub correlation_key: Option<String>,
}

impl Sentinel {
    pub fn new(id: &str, status: SentinelStatus, reason: &str) -> Self {
        Self {
            id: id.to_owned(),
            status,
            status_code: None,
            reason: reason.to_owned(),
            correlation_key: None,
        }
    }

    pub fn with_correlation_key(mut self, key: Option<&str>) -> Self {
        self.correlation_key = key.map(str::to_owned);
        self
    }

    /// Map a lookup that gave up to the sentinel recorded for it.
    pub fn from_retry_error(id: &str, error: &RetryError) -> Self {
        let (status, reason) = match error {
            RetryError::Terminal(UpstreamError::Empty(reason)) => {
                (SentinelStatus::NoData, reason.to_owned())
            }
            RetryError::Terminal(UpstreamError::Invalid(reason)) => {
                (SentinelStatus::InvalidData, reason.to_owned())
            }
            RetryError::Terminal(UpstreamError::Malformed(reason)) => (
                SentinelStatus::JsonError,
                format!("Invalid JSON response: {reason}"),
            ),
            RetryError::Terminal(other) => (SentinelStatus::Failed, other.to_string()),
            RetryError::Exhausted {
                attempts,
                last_error,
            } => (
                SentinelStatus::Failed,
                format!("Max retries reached after {attempts} attempts: {last_error}"),
            ),
        };

        Self {
            id: id.to_owned(),
            status,
            status_code: error.status_code(),
            reason,
            correlation_key: None,
        }
    }
}

/// Outcome of one lookup: exactly one of these is produced per attempt, never silence.
#[derive(Debug, Clone, PartialEq)]
pub enum Enriched<T> {
    Populated(T),
    Sentinel(Sentinel),
}

impl<T> Enriched<T> {
    pub fn status(&self) -> &'static str {
        match self {
            Enriched::Populated(_) => SUCCESS_STATUS,
            Enriched::Sentinel(sentinel) => sentinel.status.as_str(),
        }
    }

    pub fn populated(&self) -> Option<&T> {
        match self {
            Enriched::Populated(record) => Some(record),
            Enriched::Sentinel(_) => None,
        }
    }
}

impl<T: Keyed> Keyed for Enriched<T> {
    fn key(&self) -> &str {
        match self {
            Enriched::Populated(record) => record.key(),
            Enriched::Sentinel(sentinel) => &sentinel.id,
        }
    }
}

/// Attributes of a startup profile, keyed by the crawled source id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub source_id: String,
    /// Company identification number, the key for the detail lookup.
    pub cin: Option<String>,
    pub pan: Option<String>,
    #[serde(default)]
    pub members: Vec<serde_json::Value>,
}

impl Keyed for Profile {
    fn key(&self) -> &str {
        &self.source_id
    }
}

/// Registered company details for a profile's `cin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyDetail {
    pub source_id: String,
    pub cin: String,
    pub email: Option<String>,
    pub incorp_date: Option<String>,
    pub registered_address: Option<String>,
    pub registered_contact: Option<String>,
}

impl Keyed for CompanyDetail {
    fn key(&self) -> &str {
        &self.source_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_object_payload() {
        let decoded = EnrichmentRequest::decode(&json!({
            "source_id": "abc",
            "correlation_key": "U123"
        }))
        .unwrap();

        assert_eq!(decoded.source_id, "abc");
        assert_eq!(decoded.correlation_key.as_deref(), Some("U123"));
    }

    #[test]
    fn test_decode_treats_empty_fields_as_missing() {
        let decoded = EnrichmentRequest::decode(&json!({
            "source_id": "abc",
            "correlation_key": "  "
        }))
        .unwrap();
        assert_eq!(decoded.correlation_key, None);

        assert!(EnrichmentRequest::decode(&json!({"source_id": ""})).is_none());
        assert!(EnrichmentRequest::decode(&json!({"correlation_key": "U1"})).is_none());
        assert!(EnrichmentRequest::decode(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_decode_bare_string_payload() {
        let decoded = EnrichmentRequest::decode(&json!("raw-id")).unwrap();
        assert_eq!(decoded.source_id, "raw-id");
        assert_eq!(decoded.correlation_key, None);
    }

    #[test]
    fn test_request_serialization_omits_missing_key() {
        let value = serde_json::to_value(EnrichmentRequest::new("abc")).unwrap();
        assert_eq!(value, json!({"source_id": "abc"}));
    }

    #[test]
    fn test_sentinel_from_exhausted_retries() {
        let error = RetryError::Exhausted {
            attempts: 3,
            last_error: UpstreamError::Transient {
                status: Some(503),
                message: "service unavailable".to_owned(),
            },
        };
        let sentinel = Sentinel::from_retry_error("42", &error);

        assert_eq!(sentinel.status, SentinelStatus::Failed);
        assert_eq!(sentinel.status_code, Some(503));
        assert!(sentinel.reason.starts_with("Max retries reached after 3 attempts"));
    }

    #[test]
    fn test_enriched_key_and_status() {
        let populated: Enriched<Profile> = Enriched::Populated(Profile {
            source_id: "1".to_owned(),
            cin: None,
            pan: None,
            members: vec![],
        });
        let sentinel: Enriched<Profile> =
            Enriched::Sentinel(Sentinel::new("2", SentinelStatus::NoData, "nothing"));

        assert_eq!(populated.key(), "1");
        assert_eq!(populated.status(), SUCCESS_STATUS);
        assert_eq!(sentinel.key(), "2");
        assert_eq!(sentinel.status(), "NO_DATA");
    }
}
