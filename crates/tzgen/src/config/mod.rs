use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing_subscriber::{EnvFilter, fmt};

use crate::storage;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub server: ServerConfig,
    pub llm: LlmProviderConfig,
    pub pipeline: PipelineConfig,
    pub renderer: RendererConfig,
    pub confluence: Option<ConfluenceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum LlmProviderConfig {
    LocalStub,
    #[serde(rename = "gigachat")]
    GigaChat {
        #[serde(default = "default_gigachat_model")]
        model: String,
        #[serde(default = "default_gigachat_credentials_env")]
        credentials_env: String,
        #[serde(default = "default_gigachat_scope")]
        scope: String,
        #[serde(default = "default_gigachat_auth_url")]
        auth_url: String,
        #[serde(default = "default_gigachat_base_url")]
        base_url: String,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default)]
        insecure_tls: bool,
    },
    OpenAi {
        model: String,
        #[serde(default = "default_openai_api_key_env")]
        api_key_env: String,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        organization: Option<String>,
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub critic_enabled: bool,
    #[serde(default)]
    pub clarification_enabled: bool,
    #[serde(default)]
    pub guidelines_path: Option<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub guidelines_chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub guidelines_chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    pub guidelines_top_k: usize,
    #[serde(default = "default_diagram_attempts")]
    pub diagram_max_attempts: usize,
    #[serde(default = "default_diagram_retry_delay_ms")]
    pub diagram_retry_delay_ms: u64,
    #[serde(default = "default_diagram_types")]
    pub default_diagram_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum RendererConfig {
    LocalStub,
    MermaidInk {
        #[serde(default = "default_mermaid_ink_base")]
        base_url: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfluenceConfig {
    pub url: String,
    pub username: String,
    #[serde(default = "default_confluence_token_env")]
    pub api_token_env: String,
    pub space_key: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let root = match env::var("TZGEN_APP_ROOT") {
            Ok(path) => PathBuf::from(path),
            Err(_) => env::current_dir()?,
        };
        let data_dir = root.join("data");
        let config_dir = root.join("config");

        let llm: LlmProviderConfig = storage::load_yaml(config_dir.join("llm.yml"))?;
        let mut pipeline: PipelineConfig =
            load_optional_yaml(&config_dir.join("pipeline.yml"))?.unwrap_or_default();
        let renderer: RendererConfig =
            load_optional_yaml(&config_dir.join("renderer.yml"))?.unwrap_or_default();
        let confluence: Option<ConfluenceConfig> =
            load_optional_yaml(&config_dir.join("confluence.yml"))?;

        if let Some(path) = pipeline.guidelines_path.take() {
            pipeline.guidelines_path = Some(if path.is_absolute() {
                path
            } else {
                root.join(path)
            });
        }

        storage::ensure_data_layout(&data_dir)?;

        Ok(Self {
            data_dir,
            config_dir,
            llm,
            pipeline,
            renderer,
            confluence,
            server: ServerConfig {
                bind_addr: env::var("TZGEN_SERVER_BIND")
                    .unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            },
        })
    }
}

fn load_optional_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if path.exists() {
        Ok(Some(storage::load_yaml(path.to_path_buf())?))
    } else {
        Ok(None)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            critic_enabled: true,
            clarification_enabled: false,
            guidelines_path: None,
            guidelines_chunk_size: default_chunk_size(),
            guidelines_chunk_overlap: default_chunk_overlap(),
            guidelines_top_k: default_top_k(),
            diagram_max_attempts: default_diagram_attempts(),
            diagram_retry_delay_ms: default_diagram_retry_delay_ms(),
            default_diagram_types: default_diagram_types(),
        }
    }
}

impl PipelineConfig {
    pub fn diagram_retry_delay(&self) -> Duration {
        Duration::from_millis(self.diagram_retry_delay_ms)
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::MermaidInk {
            base_url: default_mermaid_ink_base(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> &str {
        &self.bind_addr
    }
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.5
}

fn default_gigachat_model() -> String {
    "GigaChat-Pro".to_string()
}

fn default_gigachat_credentials_env() -> String {
    "GIGACHAT_CREDENTIALS".to_string()
}

fn default_gigachat_scope() -> String {
    "GIGACHAT_API_PERS".to_string()
}

fn default_gigachat_auth_url() -> String {
    "https://ngw.devices.sberbank.ru:9443/api/v2/oauth".to_string()
}

fn default_gigachat_base_url() -> String {
    "https://gigachat.devices.sberbank.ru/api/v1".to_string()
}

fn default_openai_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_top_k() -> usize {
    5
}

fn default_diagram_attempts() -> usize {
    3
}

fn default_diagram_retry_delay_ms() -> u64 {
    250
}

fn default_diagram_types() -> Vec<String> {
    vec!["DFD".to_string()]
}

fn default_mermaid_ink_base() -> String {
    "https://mermaid.ink".to_string()
}

fn default_confluence_token_env() -> String {
    "CONFLUENCE_API_TOKEN".to_string()
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn llm_config_parses_gigachat_with_defaults() {
        let parsed: LlmProviderConfig = serde_yaml::from_str("provider: gigachat\n").unwrap();
        match parsed {
            LlmProviderConfig::GigaChat {
                model,
                scope,
                temperature,
                ..
            } => {
                assert_eq!(model, "GigaChat-Pro");
                assert_eq!(scope, "GIGACHAT_API_PERS");
                assert!((temperature - 0.5).abs() < f32::EPSILON);
            }
            other => panic!("unexpected provider {other:?}"),
        }
    }

    #[test]
    fn renderer_config_parses_both_providers() {
        let stub: RendererConfig = serde_yaml::from_str("provider: local_stub\n").unwrap();
        assert!(matches!(stub, RendererConfig::LocalStub));

        let ink: RendererConfig = serde_yaml::from_str("provider: mermaid_ink\n").unwrap();
        match ink {
            RendererConfig::MermaidInk { base_url } => assert_eq!(base_url, "https://mermaid.ink"),
            RendererConfig::LocalStub => panic!("expected mermaid_ink"),
        }
    }

    #[test]
    #[serial]
    fn load_applies_defaults_for_optional_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("config")).unwrap();
        fs::write(root.join("config/llm.yml"), "provider: local_stub\n").unwrap();
        fs::write(
            root.join("config/pipeline.yml"),
            "critic_enabled: false\nguidelines_path: docs/guidelines.md\n",
        )
        .unwrap();

        unsafe {
            env::set_var("TZGEN_APP_ROOT", root);
            env::remove_var("TZGEN_SERVER_BIND");
        }

        let config = AppConfig::load().expect("config loads");
        assert!(!config.pipeline.critic_enabled);
        assert_eq!(config.pipeline.diagram_max_attempts, 3);
        assert_eq!(
            config.pipeline.guidelines_path.as_deref(),
            Some(root.join("docs/guidelines.md").as_path())
        );
        assert!(matches!(config.renderer, RendererConfig::MermaidInk { .. }));
        assert!(config.confluence.is_none());
        assert_eq!(config.server.addr(), "0.0.0.0:8000");
        assert!(root.join("data/conversations").exists());

        unsafe {
            env::remove_var("TZGEN_APP_ROOT");
        }
    }

    #[test]
    #[serial]
    fn load_fails_without_llm_config() {
        let tmp = TempDir::new().unwrap();
        unsafe {
            env::set_var("TZGEN_APP_ROOT", tmp.path());
        }
        let err = AppConfig::load().unwrap_err();
        assert!(format!("{err:#}").contains("llm.yml"));
        unsafe {
            env::remove_var("TZGEN_APP_ROOT");
        }
    }
}
