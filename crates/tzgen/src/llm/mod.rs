use std::{env, sync::Arc};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::LlmProviderConfig;

/// Refresh the GigaChat access token this many seconds before it expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, prompt: &str) -> anyhow::Result<String>;
    fn identity(&self) -> LlmIdentity;
}

pub fn client_from_config(config: &LlmProviderConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    let client: Arc<dyn LlmClient> = match config {
        LlmProviderConfig::LocalStub => Arc::new(LocalStubClient),
        LlmProviderConfig::GigaChat {
            model,
            credentials_env,
            scope,
            auth_url,
            base_url,
            temperature,
            insecure_tls,
        } => Arc::new(GigaChatClient::from_env(
            credentials_env,
            GigaChatOptions {
                model: model.clone(),
                scope: scope.clone(),
                auth_url: auth_url.clone(),
                base_url: base_url.clone(),
                temperature: *temperature,
                insecure_tls: *insecure_tls,
            },
        )?),
        LlmProviderConfig::OpenAi {
            model,
            api_key_env,
            base_url,
            organization,
            temperature,
        } => Arc::new(
            OpenAiClient::from_env(api_key_env, model, base_url.clone(), organization.clone())?
                .with_temperature(*temperature),
        ),
    };
    Ok(client)
}

/// Offline client that answers the pipeline's prompt phases deterministically.
#[derive(Debug, Default)]
pub struct LocalStubClient;

#[async_trait]
impl LlmClient for LocalStubClient {
    async fn chat(&self, prompt: &str) -> anyhow::Result<String> {
        let phase = extract_value(prompt, "# Phase:").unwrap_or_default();
        match phase.as_str() {
            "SECTION" => Ok(stub_section(prompt)),
            "CLARIFY" => {
                let input = extract_block(prompt, "Input:", "End of input.").unwrap_or_default();
                let comment = input
                    .rsplit("User comment:")
                    .next()
                    .unwrap_or_default()
                    .trim();
                if comment.split_whitespace().count() < 3 {
                    let title = extract_value(prompt, "Section:").unwrap_or_default();
                    Ok(format!(
                        "Could you describe the project in more detail for the {title} section?"
                    ))
                } else {
                    Ok(stub_section(prompt))
                }
            }
            "CRITIC" => {
                let block = extract_block(prompt, "Text:", "End of text.").unwrap_or_default();
                Ok(format!("{}\n\nReviewed for completeness.", block.trim()))
            }
            "DIAGRAM" => {
                let kind = extract_value(prompt, "Diagram:").unwrap_or_default();
                Ok(stub_diagram(&kind))
            }
            _ => anyhow::bail!("stub LLM only supports SECTION, CLARIFY, CRITIC and DIAGRAM"),
        }
    }

    fn identity(&self) -> LlmIdentity {
        LlmIdentity::new("local_stub", Some("local_stub".to_string()))
    }
}

fn stub_section(prompt: &str) -> String {
    let title = extract_value(prompt, "Section:").unwrap_or_else(|| "Section".to_string());
    let input = extract_block(prompt, "Input:", "End of input.").unwrap_or_default();
    let latest = input
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("(no input)");
    format!("{title}\n\n- {latest}")
}

fn stub_diagram(kind: &str) -> String {
    let body = match kind {
        "ER Diagram" => "erDiagram\n    CUSTOMER ||--o{ ORDER : places",
        "Activity" => "flowchart TB\n    start([Start]) --> task1[Collect input]\n    task1 --> finish([End])",
        "Use Case" => "graph TD\n    User[User] --> Login\n    subgraph System\n    Login\n    end",
        "C4 Context" => "C4Context\n    Person(user, \"User\")\n    System(app, \"Application\")\n    Rel(user, app, \"Uses\")",
        _ => "graph TD\n    User[User] -->|\"Request\"| Service((Service))\n    Service -->|Data| DB[[Storage]]",
    };
    format!("Here is the diagram:\n```mermaid\n{body}\n```\nLet me know if you need changes.")
}

#[derive(Debug, Clone)]
pub struct GigaChatOptions {
    pub model: String,
    pub scope: String,
    pub auth_url: String,
    pub base_url: String,
    pub temperature: f32,
    pub insecure_tls: bool,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GigaChatTokenResponse {
    access_token: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    expires_at: Option<i64>,
}

/// Client for the GigaChat chat-completions API with OAuth2 client credentials.
#[derive(Debug)]
pub struct GigaChatClient {
    http: Client,
    credentials: String,
    options: GigaChatOptions,
    token: Mutex<Option<CachedToken>>,
}

impl GigaChatClient {
    pub fn from_env(credentials_env: &str, options: GigaChatOptions) -> anyhow::Result<Self> {
        let credentials = env::var(credentials_env)
            .with_context(|| format!("reading GigaChat credentials from {credentials_env}"))?;
        Self::new(credentials, options)
    }

    /// `credentials` is either the base64 authorization key or `client_id:client_secret`.
    pub fn new(credentials: String, mut options: GigaChatOptions) -> anyhow::Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(options.insecure_tls)
            .build()?;
        options.base_url = options.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            credentials: encode_credentials(&credentials),
            options,
            token: Mutex::new(None),
        })
    }

    /// Held across the refresh so concurrent callers share one OAuth exchange.
    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = &*cached
            && token.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > Utc::now()
        {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .post(&self.options.auth_url)
            .header("Authorization", format!("Basic {}", self.credentials))
            .header("RqUID", Uuid::new_v4().to_string())
            .header("Accept", "application/json")
            .form(&[("scope", self.options.scope.as_str())])
            .send()
            .await
            .with_context(|| "requesting GigaChat access token")?
            .error_for_status()
            .with_context(|| "GigaChat OAuth returned an error status")?;

        let payload: GigaChatTokenResponse = response
            .json()
            .await
            .with_context(|| "parsing GigaChat OAuth response")?;

        let expires_at = payload
            .expires_at
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(30));

        *cached = Some(CachedToken {
            value: payload.access_token.clone(),
            expires_at,
        });
        Ok(payload.access_token)
    }
}

fn encode_credentials(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains(':') {
        STANDARD.encode(raw.as_bytes())
    } else {
        raw.to_string()
    }
}

#[async_trait]
impl LlmClient for GigaChatClient {
    async fn chat(&self, prompt: &str) -> anyhow::Result<String> {
        let token = self.access_token().await?;
        let url = format!("{}/chat/completions", self.options.base_url);
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("RqUID", Uuid::new_v4().to_string())
            .header("Accept", "application/json")
            .json(&json!({
                "model": self.options.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": self.options.temperature,
                "stream": false,
            }))
            .send()
            .await
            .with_context(|| "sending request to GigaChat")?
            .error_for_status()
            .with_context(|| "GigaChat returned an error status")?;

        let payload: serde_json::Value = response
            .json()
            .await
            .with_context(|| "parsing GigaChat response body")?;
        first_choice_content(&payload)
            .ok_or_else(|| anyhow!("missing message content in GigaChat response"))
    }

    fn identity(&self) -> LlmIdentity {
        LlmIdentity::new("gigachat", Some(self.options.model.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    model: String,
    api_key: String,
    base_url: String,
    organization: Option<String>,
    temperature: f32,
}

impl OpenAiClient {
    pub fn from_env(
        api_key_env: &str,
        model: &str,
        base_url: Option<String>,
        organization: Option<String>,
    ) -> anyhow::Result<Self> {
        let api_key = env::var(api_key_env)
            .with_context(|| format!("reading OpenAI api key from {api_key_env}"))?;
        Self::new(api_key, model, base_url, organization)
    }

    pub fn new(
        api_key: String,
        model: &str,
        base_url: Option<String>,
        organization: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        let normalized_base = base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http: client,
            model: model.to_string(),
            api_key,
            base_url: normalized_base,
            organization,
            temperature: 0.5,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "temperature": self.temperature,
                "messages": [
                    {"role": "user", "content": prompt}
                ],
            }));

        if let Some(org) = &self.organization {
            request = request.header("OpenAI-Organization", org);
        }

        let response = request
            .send()
            .await
            .with_context(|| "sending request to OpenAI")?
            .error_for_status()
            .with_context(|| "OpenAI returned an error status")?;

        let payload: serde_json::Value = response
            .json()
            .await
            .with_context(|| "parsing OpenAI response body")?;

        first_choice_content(&payload)
            .ok_or_else(|| anyhow!("missing message content in OpenAI response"))
    }

    fn identity(&self) -> LlmIdentity {
        LlmIdentity::new("openai", Some(self.model.clone()))
    }
}

fn first_choice_content(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("choices")
        .and_then(|choices| choices.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(|content| content.to_string())
}

pub(crate) fn extract_value(prompt: &str, prefix: &str) -> Option<String> {
    prompt
        .lines()
        .find_map(|line| line.trim().strip_prefix(prefix))
        .map(|value| value.trim().to_string())
}

/// Lines strictly between the line equal to `start` and the line equal to `end`.
pub(crate) fn extract_block(prompt: &str, start: &str, end: &str) -> Option<String> {
    let mut lines = prompt.lines();
    lines.by_ref().find(|line| line.trim() == start)?;
    let block: Vec<&str> = lines.take_while(|line| line.trim() != end).collect();
    Some(block.join("\n"))
}

#[derive(Debug, Clone)]
pub struct LlmIdentity {
    pub provider: &'static str,
    pub model: Option<String>,
}

impl LlmIdentity {
    pub fn new(provider: &'static str, model: Option<String>) -> Self {
        Self { provider, model }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmLogEntry {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    #[serde(default)]
    pub token: Option<Uuid>,
    pub prompt: String,
    pub response: String,
    pub provider: String,
    pub model: Option<String>,
}

impl LlmLogEntry {
    pub fn new(
        run_id: Uuid,
        token: Option<Uuid>,
        phase: impl Into<String>,
        prompt: impl Into<String>,
        response: impl Into<String>,
        identity: &LlmIdentity,
    ) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            phase: phase.into(),
            token,
            prompt: prompt.into(),
            response: response.into(),
            provider: identity.provider.to_string(),
            model: identity.model.clone(),
        }
    }
}
