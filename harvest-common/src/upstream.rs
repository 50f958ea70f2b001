//! # Upstream
//!
//! HTTP plumbing shared by every upstream call: the client, response classification and the
//! error taxonomy the backoff policy acts on.
use std::time;

use reqwest::{header, Client, Response, StatusCode};
use thiserror::Error;

use crate::backoff::RetrySignal;

/// Longest response body excerpt kept in an error message.
const MAX_BODY_EXCERPT: usize = 256;

/// Failures of a single upstream call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<time::Duration> },
    #[error("{}", transient_message(.status, .message))]
    Transient { status: Option<u16>, message: String },
    /// A successful response carrying no data for the request.
    #[error("{0}")]
    Empty(String),
    /// A successful response with data missing its required identifier.
    #[error("{0}")]
    Invalid(String),
    /// A successful response whose body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

fn transient_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("upstream returned {status}: {message}"),
        None => format!("upstream request failed: {message}"),
    }
}

impl UpstreamError {
    pub fn transient(message: &str) -> Self {
        UpstreamError::Transient {
            status: None,
            message: message.to_owned(),
        }
    }

    /// How the backoff policy should treat this error.
    pub fn retry_signal(&self) -> RetrySignal {
        match self {
            UpstreamError::RateLimited { retry_after } => RetrySignal::RateLimited(*retry_after),
            UpstreamError::Transient { .. } => RetrySignal::Transient,
            UpstreamError::Empty(_) | UpstreamError::Invalid(_) | UpstreamError::Malformed(_) => {
                RetrySignal::Terminal
            }
        }
    }

    /// The HTTP status the error was classified from, if any.
    /// Terminal payload errors are only raised for successful responses.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UpstreamError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            UpstreamError::Transient { status, .. } => *status,
            UpstreamError::Empty(_) | UpstreamError::Invalid(_) | UpstreamError::Malformed(_) => {
                Some(StatusCode::OK.as_u16())
            }
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(error: reqwest::Error) -> Self {
        UpstreamError::Transient {
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }
}

pub fn build_http_client(
    request_timeout: time::Duration,
    user_agent: &str,
) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(user_agent.to_owned())
        .timeout(request_timeout)
        .build()
}

/// Classify a response by status: 429 is a rate limit, any other non-2xx is transient.
pub async fn check_response(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(UpstreamError::RateLimited {
            retry_after: parse_retry_after_header(response.headers()),
        });
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(UpstreamError::Transient {
            status: Some(status.as_u16()),
            message: excerpt(&body),
        });
    }

    Ok(response)
}

/// Read a successful response body as JSON.
pub async fn read_json(response: Response) -> Result<serde_json::Value, UpstreamError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| UpstreamError::Malformed(e.to_string()))
}

/// Whether a payload object is absent, null or has no fields.
pub fn is_empty_object(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn excerpt(body: &str) -> String {
    if body.len() <= MAX_BODY_EXCERPT {
        return body.to_owned();
    }
    let mut end = MAX_BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Attempt to parse a Retry-After header as either a number of seconds or an RFC2822 date.
/// Returns `None` when the header is absent, unparseable or in the past.
pub fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};

    fn client() -> Client {
        build_http_client(time::Duration::from_secs(5), "harvest-test").unwrap()
    }

    #[test]
    fn test_parse_retry_after_header_seconds() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, "5".parse().unwrap());

        assert_eq!(
            parse_retry_after_header(&headers),
            Some(time::Duration::from_secs(5))
        );
    }

    #[test]
    fn test_parse_retry_after_header_date() {
        let mut headers = header::HeaderMap::new();
        let in_a_minute = chrono::Utc::now() + chrono::Duration::seconds(60);
        headers.insert(
            header::RETRY_AFTER,
            in_a_minute.to_rfc2822().parse().unwrap(),
        );

        let parsed = parse_retry_after_header(&headers).unwrap();
        assert!(parsed <= time::Duration::from_secs(60));
        assert!(parsed >= time::Duration::from_secs(55));
    }

    #[test]
    fn test_parse_retry_after_header_rejects_past_and_garbage() {
        let mut headers = header::HeaderMap::new();
        assert_eq!(parse_retry_after_header(&headers), None);

        headers.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after_header(&headers), None);

        headers.insert(header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[tokio::test]
    async fn test_check_response_rate_limited() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/lookup");
            then.status(429).header("Retry-After", "5");
        });

        let response = client().get(server.url("/lookup")).send().await.unwrap();
        let error = check_response(response).await.unwrap_err();

        assert_eq!(
            error,
            UpstreamError::RateLimited {
                retry_after: Some(time::Duration::from_secs(5))
            }
        );
        assert_eq!(
            error.retry_signal(),
            RetrySignal::RateLimited(Some(time::Duration::from_secs(5)))
        );
    }

    #[tokio::test]
    async fn test_check_response_server_error_is_transient() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/lookup");
            then.status(503).body("try later");
        });

        let response = client().get(server.url("/lookup")).send().await.unwrap();
        let error = check_response(response).await.unwrap_err();

        assert_eq!(error.status_code(), Some(503));
        assert_eq!(error.retry_signal(), RetrySignal::Transient);
        assert!(error.to_string().contains("try later"));
    }

    #[tokio::test]
    async fn test_read_json_malformed_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/lookup");
            then.status(200).body("<html>not json</html>");
        });

        let response = client().get(server.url("/lookup")).send().await.unwrap();
        let response = check_response(response).await.unwrap();
        let error = read_json(response).await.unwrap_err();

        assert!(matches!(error, UpstreamError::Malformed(_)));
        assert_eq!(error.retry_signal(), RetrySignal::Terminal);
    }

    #[test]
    fn test_is_empty_object() {
        assert!(is_empty_object(None));
        assert!(is_empty_object(Some(&serde_json::Value::Null)));
        assert!(is_empty_object(Some(&serde_json::json!({}))));
        assert!(!is_empty_object(Some(&serde_json::json!({"cin": "U1"}))));
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let body = "é".repeat(200);
        let short = excerpt(&body);
        assert!(short.ends_with("..."));
        assert!(short.len() <= MAX_BODY_EXCERPT + 3);
    }
}
