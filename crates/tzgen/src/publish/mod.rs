//! Publishing the assembled specification as a Confluence page.

use std::env;

use anyhow::Context;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{config::ConfluenceConfig, error::PipelineError, pipeline::Pipeline};

const CONFIGURATION_ERROR: &str = "Confluence access configuration error";
const FORBIDDEN_ERROR: &str = "User has no permissions to create pages in Confluence";
const PAGE_ERROR: &str = "Failed to create/update Confluence page";

/// Body of `POST /api/v1/create-confluence-tz`. Connection fields override config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub confluence_url: Option<String>,
    #[serde(default)]
    pub confluence_username: Option<String>,
    #[serde(default)]
    pub confluence_api_token: Option<String>,
    #[serde(default)]
    pub confluence_space_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishResult {
    pub page_url: String,
    pub page_id: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfluenceSettings {
    pub url: String,
    pub username: String,
    pub api_token: String,
    pub space_key: String,
}

impl ConfluenceSettings {
    pub fn resolve(
        request: &PublishRequest,
        config: Option<&ConfluenceConfig>,
    ) -> Result<Self, PipelineError> {
        let url = pick(&request.confluence_url, config.map(|c| c.url.clone()));
        let username = pick(&request.confluence_username, config.map(|c| c.username.clone()));
        let api_token = pick(
            &request.confluence_api_token,
            config.and_then(|c| env::var(&c.api_token_env).ok()),
        );
        let space_key = pick(&request.confluence_space_key, config.map(|c| c.space_key.clone()));

        let missing: Vec<&'static str> = [
            ("confluence_url", &url),
            ("confluence_username", &username),
            ("confluence_api_token", &api_token),
            ("confluence_space_key", &space_key),
        ]
        .iter()
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| *name)
        .collect();

        match (url, username, api_token, space_key) {
            (Some(url), Some(username), Some(api_token), Some(space_key)) => Ok(Self {
                url: url.trim_end_matches('/').to_string(),
                username,
                api_token,
                space_key,
            }),
            _ => Err(PipelineError::Configuration(format!(
                "{CONFIGURATION_ERROR}: missing {}",
                missing.join(", ")
            ))),
        }
    }
}

fn pick(requested: &Option<String>, configured: Option<String>) -> Option<String> {
    let non_empty = |value: String| {
        let value = value.trim().to_string();
        (!value.is_empty()).then_some(value)
    };
    requested
        .clone()
        .and_then(non_empty)
        .or_else(|| configured.and_then(non_empty))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    pub id: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub id: String,
    pub webui: String,
}

#[derive(Debug, Deserialize)]
struct PageSearch {
    #[serde(default)]
    results: Vec<PageRecord>,
}

#[derive(Debug, Deserialize)]
struct PageRecord {
    id: String,
    #[serde(default)]
    version: Option<PageVersion>,
    #[serde(rename = "_links", default)]
    links: Option<PageLinks>,
    #[serde(default)]
    body: Option<PageBody>,
}

#[derive(Debug, Deserialize)]
struct PageVersion {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    #[serde(default)]
    webui: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(default)]
    view: Option<ContentValue>,
}

#[derive(Debug, Deserialize)]
struct ContentValue {
    value: String,
}

/// Thin client over the Confluence REST API (`/rest/api/...`).
#[derive(Debug, Clone)]
pub struct ConfluenceClient {
    http: Client,
    base_url: String,
    username: String,
    api_token: String,
}

impl ConfluenceClient {
    pub fn new(settings: &ConfluenceSettings) -> anyhow::Result<Self> {
        Ok(Self {
            http: Client::builder().build()?,
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            api_token: settings.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/rest/api/<segments>` with every segment percent-encoded.
    fn api_url(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|err| {
            PipelineError::Configuration(format!("{CONFIGURATION_ERROR}: invalid url: {err}"))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                PipelineError::Configuration(format!(
                    "{CONFIGURATION_ERROR}: url cannot be a base"
                ))
            })?
            .pop_if_empty()
            .extend(["rest", "api"])
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.username, Some(&self.api_token))
            .header("Accept", "application/json")
    }

    pub async fn check_space(&self, space_key: &str) -> anyhow::Result<bool> {
        let url = self.api_url(&["space", space_key])?;
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .with_context(|| "requesting confluence space")?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(PipelineError::Configuration(format!(
                "{CONFIGURATION_ERROR}: space lookup returned status {status}"
            ))
            .into()),
        }
    }

    pub async fn find_page(&self, space_key: &str, title: &str) -> anyhow::Result<Option<PageRef>> {
        let url = self.api_url(&["content"])?;
        let response = self
            .authorized(self.http.get(url))
            .query(&[("spaceKey", space_key), ("title", title), ("expand", "version")])
            .send()
            .await
            .with_context(|| "searching confluence page")?;
        let search: PageSearch = decode(response, "decoding confluence page search").await?;
        Ok(search.results.into_iter().next().map(|record| PageRef {
            version: record.version.map(|v| v.number).unwrap_or(1),
            id: record.id,
        }))
    }

    pub async fn create_page(
        &self,
        space_key: &str,
        title: &str,
        html: &str,
    ) -> anyhow::Result<PageInfo> {
        let url = self.api_url(&["content"])?;
        let response = self
            .authorized(self.http.post(url))
            .json(&json!({
                "type": "page",
                "title": title,
                "space": {"key": space_key},
                "body": {"storage": {"value": html, "representation": "storage"}},
            }))
            .send()
            .await
            .with_context(|| "creating confluence page")?;
        let record: PageRecord = decode(response, "decoding created confluence page").await?;
        Ok(page_info(record))
    }

    pub async fn update_page(&self, page: &PageRef, title: &str, html: &str) -> anyhow::Result<PageInfo> {
        let url = self.api_url(&["content", page.id.as_str()])?;
        let response = self
            .authorized(self.http.put(url))
            .json(&json!({
                "id": page.id,
                "type": "page",
                "title": title,
                "version": {"number": page.version + 1},
                "body": {"storage": {"value": html, "representation": "storage"}},
            }))
            .send()
            .await
            .with_context(|| "updating confluence page")?;
        let record: PageRecord = decode(response, "decoding updated confluence page").await?;
        Ok(page_info(record))
    }

    /// Confluence's own rendering of the stored page (`body.view`).
    pub async fn rendered_view(&self, page_id: &str) -> anyhow::Result<String> {
        let url = self.api_url(&["content", page_id])?;
        let response = self
            .authorized(self.http.get(url))
            .query(&[("expand", "body.view")])
            .send()
            .await
            .with_context(|| "fetching rendered confluence page")?;
        let record: PageRecord = decode(response, "decoding rendered confluence page").await?;
        Ok(record
            .body
            .and_then(|body| body.view)
            .map(|view| view.value)
            .unwrap_or_default())
    }
}

fn page_info(record: PageRecord) -> PageInfo {
    PageInfo {
        webui: record.links.and_then(|links| links.webui).unwrap_or_default(),
        id: record.id,
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: Response,
    action: &'static str,
) -> anyhow::Result<T> {
    let status = response.status();
    if status == StatusCode::FORBIDDEN {
        return Err(PipelineError::Forbidden(FORBIDDEN_ERROR.to_string()).into());
    }
    if !status.is_success() {
        return Err(PipelineError::Publish(format!(
            "{PAGE_ERROR}: Confluence returned status {status}"
        ))
        .into());
    }
    let payload = response.json().await.with_context(|| action)?;
    Ok(payload)
}

/// Creates or updates the page for `request.token` and returns its location.
pub async fn publish(
    pipeline: &Pipeline,
    request: &PublishRequest,
    config: Option<&ConfluenceConfig>,
) -> anyhow::Result<PublishResult> {
    let token = request
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| PipelineError::validation("Missing required field: token"))?;

    let settings = ConfluenceSettings::resolve(request, config)?;
    let client = ConfluenceClient::new(&settings)?;
    if !client.check_space(&settings.space_key).await? {
        warn!(space = %settings.space_key, "confluence space not found");
        return Err(PipelineError::Configuration(format!(
            "{CONFIGURATION_ERROR}: space {} not found",
            settings.space_key
        ))
        .into());
    }

    let document = pipeline.assemble(token).await?;
    let diagrams = pipeline.diagram_images(&document.token).await?;
    let html = document.confluence_html(&diagrams);
    let title = document.page_title();

    let page = match client.find_page(&settings.space_key, &title).await? {
        Some(existing) => client.update_page(&existing, &title, &html).await?,
        None => client.create_page(&settings.space_key, &title, &html).await?,
    };
    let rendered = client.rendered_view(&page.id).await?;

    info!(token = %document.token, page_id = %page.id, "confluence page published");
    Ok(PublishResult {
        page_url: format!("{}{}", client.base_url(), page.webui),
        page_id: page.id,
        html: rendered,
    })
}
