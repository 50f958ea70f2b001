use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

use harvest_common::records::SearchItem;
use harvest_common::upstream::{check_response, read_json, UpstreamError};

/// One page of search results for a partition.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        partition_key: &str,
        page: u32,
    ) -> Result<Vec<SearchItem>, UpstreamError>;
}

/// The upstream profile search, queried by name prefix.
pub struct SearchClient {
    client: Client,
    url: String,
}

impl SearchClient {
    pub fn new(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_owned(),
        }
    }

    /// The search body: every filter open, recognised startups only, sorted by name so that
    /// page boundaries are stable between requests.
    pub fn query_body(partition_key: &str, page: u32) -> Value {
        json!({
            "query": partition_key,
            "focusSector": false,
            "industries": [],
            "sectors": [],
            "states": [],
            "cities": [],
            "stages": [],
            "badges": [],
            "roles": ["Startup"],
            "sort": {
                "orders": [{"field": "name", "direction": "ASC"}]
            },
            "dpiitRecogniseUser": true,
            "internationalUser": false,
            "page": page,
        })
    }
}

#[async_trait]
impl PageSource for SearchClient {
    async fn fetch_page(
        &self,
        partition_key: &str,
        page: u32,
    ) -> Result<Vec<SearchItem>, UpstreamError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::query_body(partition_key, page))
            .send()
            .await?;
        let response = check_response(response).await?;

        // A page that cannot be decoded is retried like any other failed request.
        let body = read_json(response).await.map_err(|e| match e {
            UpstreamError::Malformed(message) => UpstreamError::Transient {
                status: None,
                message: format!("undecodable search page: {message}"),
            },
            other => other,
        })?;

        Ok(parse_page(partition_key, page, &body))
    }
}

/// Items of a search response. A response without `content` is an empty page.
pub fn parse_page(partition_key: &str, page: u32, body: &Value) -> Vec<SearchItem> {
    let Some(content) = body.get("content").and_then(Value::as_array) else {
        return Vec::new();
    };

    content
        .iter()
        .filter_map(|item| {
            let id = match item.get("id") {
                Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_owned(),
                Some(Value::Number(id)) => id.to_string(),
                _ => {
                    warn!(partition = partition_key, page, "skipping search item without id");
                    return None;
                }
            };
            let text = |field: &str| item.get(field).and_then(Value::as_str).map(str::to_owned);

            Some(SearchItem {
                id,
                name: text("name"),
                country: text("country"),
                state: text("state"),
                city: text("city"),
            })
        })
        .collect()
}
