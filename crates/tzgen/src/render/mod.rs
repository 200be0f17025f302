use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE};
use reqwest::Client;

use crate::{config::RendererConfig, error::PipelineError};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// 1x1 transparent PNG returned by the offline renderer.
const STUB_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

#[async_trait]
pub trait DiagramRenderer: Send + Sync {
    async fn render_png(&self, code: &str) -> anyhow::Result<Vec<u8>>;
}

pub fn renderer_from_config(config: &RendererConfig) -> anyhow::Result<Arc<dyn DiagramRenderer>> {
    let renderer: Arc<dyn DiagramRenderer> = match config {
        RendererConfig::LocalStub => Arc::new(LocalStubRenderer),
        RendererConfig::MermaidInk { base_url } => Arc::new(MermaidInkRenderer::new(base_url)?),
    };
    Ok(renderer)
}

fn ensure_code(code: &str) -> Result<(), PipelineError> {
    if code.trim().is_empty() {
        return Err(PipelineError::Render(
            "Mermaid code must be a non-empty string".to_string(),
        ));
    }
    Ok(())
}

pub fn is_png(bytes: &[u8]) -> bool {
    bytes.starts_with(PNG_SIGNATURE)
}

#[derive(Debug, Default)]
pub struct LocalStubRenderer;

#[async_trait]
impl DiagramRenderer for LocalStubRenderer {
    async fn render_png(&self, code: &str) -> anyhow::Result<Vec<u8>> {
        ensure_code(code)?;
        Ok(STUB_PNG.to_vec())
    }
}

/// Renders through the public mermaid.ink service (or a compatible mirror).
#[derive(Debug, Clone)]
pub struct MermaidInkRenderer {
    http: Client,
    base_url: String,
}

impl MermaidInkRenderer {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            http: Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn image_url(&self, code: &str) -> String {
        let encoded = URL_SAFE.encode(code.as_bytes());
        format!("{}/img/{}?type=png", self.base_url, encoded)
    }
}

#[async_trait]
impl DiagramRenderer for MermaidInkRenderer {
    async fn render_png(&self, code: &str) -> anyhow::Result<Vec<u8>> {
        ensure_code(code)?;

        let response = self
            .http
            .get(self.image_url(code))
            .send()
            .await
            .with_context(|| "requesting diagram from mermaid.ink")?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Render(format!(
                "Error rendering Mermaid diagram: renderer returned status {status}"
            ))
            .into());
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| "reading mermaid.ink response body")?;
        if !is_png(&bytes) {
            return Err(PipelineError::Render(
                "Error rendering Mermaid diagram: response is not a PNG image".to_string(),
            )
            .into());
        }
        Ok(bytes.to_vec())
    }
}
