use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use harvest_common::records::{CompanyDetail, EnrichmentRequest, PartialRequest};
use harvest_common::upstream::{check_response, is_empty_object, read_json, UpstreamError};

use crate::lookup::{fill_template, text_field, Lookup};

pub const CIN_PLACEHOLDER: &str = "{cin}";

/// Looks up registered company details by the `cin` forwarded from the profile stage.
pub struct DetailLookup {
    client: Client,
    url_template: String,
}

impl DetailLookup {
    pub fn new(client: Client, url_template: &str) -> Self {
        Self {
            client,
            url_template: url_template.to_owned(),
        }
    }
}

#[async_trait]
impl Lookup for DetailLookup {
    type Output = CompanyDetail;

    fn target(&self) -> &'static str {
        "detail"
    }

    fn validate(&self, request: &PartialRequest) -> Result<(), String> {
        match request.correlation_key {
            Some(_) => Ok(()),
            None => Err("Missing cin in message".to_owned()),
        }
    }

    async fn fetch(&self, request: &PartialRequest) -> Result<CompanyDetail, UpstreamError> {
        let cin = request.correlation_key.as_deref().unwrap_or_default();
        let url = fill_template(&self.url_template, CIN_PLACEHOLDER, cin);
        let response = check_response(self.client.get(url).send().await?).await?;
        let body = read_json(response).await?;

        parse_detail(&request.source_id, &body)
    }

    fn forward(&self, _record: &CompanyDetail) -> Option<EnrichmentRequest> {
        None
    }
}

pub fn parse_detail(source_id: &str, body: &Value) -> Result<CompanyDetail, UpstreamError> {
    let data = body.get("data");
    if is_empty_object(data) {
        return Err(UpstreamError::Empty("No data returned from API".to_owned()));
    }
    let Some(data) = data.filter(|d| d.is_object()) else {
        return Err(UpstreamError::Malformed("detail data is not an object".to_owned()));
    };
    let Some(cin) = text_field(data, "cin") else {
        return Err(UpstreamError::Invalid("Missing CIN in API response".to_owned()));
    };

    Ok(CompanyDetail {
        source_id: source_id.to_owned(),
        cin,
        email: text_field(data, "email"),
        incorp_date: text_field(data, "incorpdate"),
        registered_address: text_field(data, "registeredAddress"),
        registered_contact: text_field(data, "registeredContactNo"),
    })
}
