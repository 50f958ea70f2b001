use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use harvest_common::records::{EnrichmentRequest, PartialRequest, Profile};
use harvest_common::upstream::{check_response, is_empty_object, read_json, UpstreamError};

use crate::lookup::{fill_template, text_field, Lookup};

pub const PROFILE_ID_PLACEHOLDER: &str = "{profile_id}";

/// Looks up the startup profile of a crawled item, keyed by its source id.
pub struct ProfileLookup {
    client: Client,
    url_template: String,
}

impl ProfileLookup {
    pub fn new(client: Client, url_template: &str) -> Self {
        Self {
            client,
            url_template: url_template.to_owned(),
        }
    }
}

#[async_trait]
impl Lookup for ProfileLookup {
    type Output = Profile;

    fn target(&self) -> &'static str {
        "profile"
    }

    fn validate(&self, _request: &PartialRequest) -> Result<(), String> {
        Ok(())
    }

    async fn fetch(&self, request: &PartialRequest) -> Result<Profile, UpstreamError> {
        let url = fill_template(
            &self.url_template,
            PROFILE_ID_PLACEHOLDER,
            &request.source_id,
        );
        let response = check_response(self.client.get(url).send().await?).await?;
        let body = read_json(response).await?;

        parse_profile(&request.source_id, &body)
    }

    /// Every stored profile goes on to the detail lookup, with or without a `cin`.
    fn forward(&self, record: &Profile) -> Option<EnrichmentRequest> {
        Some(EnrichmentRequest::correlated(
            &record.source_id,
            record.cin.as_deref(),
        ))
    }
}

pub fn parse_profile(source_id: &str, body: &Value) -> Result<Profile, UpstreamError> {
    let startup = body.get("user").and_then(|user| user.get("startup"));
    if is_empty_object(startup) {
        return Err(UpstreamError::Empty(
            "No startup data in profile response".to_owned(),
        ));
    }
    let Some(startup) = startup.filter(|s| s.is_object()) else {
        return Err(UpstreamError::Malformed(
            "profile startup is not an object".to_owned(),
        ));
    };

    let members = match startup.get("members") {
        Some(Value::Array(members)) => members.clone(),
        _ => Vec::new(),
    };

    Ok(Profile {
        source_id: source_id.to_owned(),
        cin: text_field(startup, "cin"),
        pan: text_field(startup, "pan"),
        members,
    })
}
