//! The per-message half of an enrichment stage: one request in, exactly one record out.
use async_trait::async_trait;
use tracing::{info, warn};

use harvest_common::backoff::{retry_with_backoff, BackoffPolicy};
use harvest_common::buffer::Keyed;
use harvest_common::records::{
    EnrichmentRequest, Enriched, PartialRequest, Sentinel, SentinelStatus,
};
use harvest_common::upstream::UpstreamError;

/// An upstream lookup performed for every request on a stage's source queue.
#[async_trait]
pub trait Lookup: Send + Sync {
    type Output: Keyed + Clone + Send + Sync + 'static;

    /// Label used for retry metrics and logs.
    fn target(&self) -> &'static str;

    /// Check that `request` carries what `fetch` needs. The error is the sentinel reason.
    fn validate(&self, request: &PartialRequest) -> Result<(), String>;

    async fn fetch(&self, request: &PartialRequest) -> Result<Self::Output, UpstreamError>;

    /// The request for the next stage once `record` is stored, if there is a next stage.
    fn forward(&self, record: &Self::Output) -> Option<EnrichmentRequest>;
}

/// Run `lookup` for `request` under `policy`. Never fails: anything short of a populated
/// record becomes a sentinel.
pub async fn enrich<L: Lookup + ?Sized>(
    lookup: &L,
    policy: &BackoffPolicy,
    request: &PartialRequest,
) -> Enriched<L::Output> {
    let correlation_key = request.correlation_key.as_deref();

    if let Err(reason) = lookup.validate(request) {
        warn!(source_id = %request.source_id, "invalid message: {}", reason);
        let sentinel = Sentinel::new(&request.source_id, SentinelStatus::InvalidMessage, &reason)
            .with_correlation_key(correlation_key);
        return record_sentinel(lookup.target(), sentinel);
    }

    match retry_with_backoff(policy, lookup.target(), || lookup.fetch(request)).await {
        Ok(record) => {
            metrics::counter!("harvest_records_enriched_total", "target" => lookup.target())
                .increment(1);
            Enriched::Populated(record)
        }
        Err(error) => {
            let sentinel = Sentinel::from_retry_error(&request.source_id, &error)
                .with_correlation_key(correlation_key);
            info!(
                source_id = %request.source_id,
                status = %sentinel.status,
                "recording sentinel: {}", sentinel.reason
            );
            record_sentinel(lookup.target(), sentinel)
        }
    }
}

fn record_sentinel<T>(target: &'static str, sentinel: Sentinel) -> Enriched<T> {
    metrics::counter!(
        "harvest_sentinels_total",
        "target" => target,
        "status" => sentinel.status.as_str()
    )
    .increment(1);
    Enriched::Sentinel(sentinel)
}

/// Replace `placeholder` in a URL template with the percent-encoded `value`.
pub fn fill_template(template: &str, placeholder: &str, value: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
    template.replace(placeholder, &encoded)
}

/// A trimmed, non-empty text field of a payload object. Numbers are kept in their JSON form.
pub fn text_field(object: &serde_json::Value, field: &str) -> Option<String> {
    match object.get(field)? {
        serde_json::Value::String(s) => Some(s.trim().to_owned()).filter(|s| !s.is_empty()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
