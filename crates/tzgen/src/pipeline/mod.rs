//! Sequences stage drafting, review, assembly and diagram generation for a token.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::Mutex as AsyncMutex, time::sleep};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    agent::{self, Stage},
    config::{AppConfig, PipelineConfig},
    critic::Critic,
    diagram::{DiagramGenerator, DiagramKind},
    document::{Document, Section},
    error::{PipelineError, classify},
    llm::{self, LlmClient, LlmLogEntry},
    render::{self, DiagramRenderer},
    storage::{self, DiagramSet, ResponseKind, StoredResponse},
};

const STORAGE_RETRY_ATTEMPTS: usize = 3;
const STORAGE_RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Serialize)]
pub struct StageReply {
    pub token: Uuid,
    pub agent_id: u8,
    pub kind: ResponseKind,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagramReport {
    pub token: Uuid,
    pub diagrams: BTreeMap<String, String>,
    pub failures: BTreeMap<String, String>,
}

pub struct Pipeline {
    config: PipelineConfig,
    data_dir: PathBuf,
    llm: Arc<dyn LlmClient>,
    critic: Critic,
    diagrams: Arc<DiagramGenerator>,
    diagram_locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        data_dir: PathBuf,
        llm: Arc<dyn LlmClient>,
        renderer: Arc<dyn DiagramRenderer>,
        critic: Critic,
    ) -> Self {
        let diagrams = Arc::new(DiagramGenerator::from_config(
            Arc::clone(&llm),
            renderer,
            &config,
        ));
        Self {
            config,
            data_dir,
            llm,
            critic,
            diagrams,
            diagram_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> anyhow::Result<Self> {
        let llm = llm::client_from_config(&config.llm)?;
        let renderer = render::renderer_from_config(&config.renderer)?;
        let critic = Critic::from_config(&config.pipeline)?;
        info!(
            provider = llm.identity().provider,
            guidelines = critic.guideline_count(),
            critic = config.pipeline.critic_enabled,
            clarification = config.pipeline.clarification_enabled,
            "pipeline ready"
        );
        Ok(Self::new(
            config.pipeline.clone(),
            config.data_dir.clone(),
            llm,
            renderer,
            critic,
        ))
    }

    pub fn renderer(&self) -> Arc<dyn DiagramRenderer> {
        self.diagrams.renderer()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Runs one stage for a conversation and persists the reply.
    pub async fn run_stage(
        &self,
        agent_id: i64,
        token: Option<&str>,
        text: &str,
    ) -> anyhow::Result<StageReply> {
        if text.trim().is_empty() {
            return Err(PipelineError::validation("The 'text' field is required").into());
        }
        let stage = Stage::from_id(agent_id)?;
        let token = match token.map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => parse_token(raw)?,
            None => Uuid::new_v4(),
        };

        let seed = self.seed_for(stage, &token).await?;
        let run_id = Uuid::new_v4();
        let mut llm_logs = Vec::new();
        let drafted = self
            .draft(stage, &seed, text, run_id, token, &mut llm_logs)
            .await;
        self.persist_llm_logs(&token, llm_logs).await;
        let (kind, text) = drafted?;

        let response = StoredResponse::new(token, stage.id(), kind, text);
        run_with_retry(&token, "response", || {
            let data_dir = self.data_dir.clone();
            let response = response.clone();
            async move { storage::append_response(&data_dir, &response).await }
        })
        .await?;

        info!(token = %token, stage = %stage, kind = ?kind, "stage completed");
        Ok(StageReply {
            token,
            agent_id: stage.id(),
            kind,
            text: response.text,
        })
    }

    pub async fn history(&self, token: &str) -> anyhow::Result<Vec<StoredResponse>> {
        let token = parse_token(token)?;
        storage::list_responses(&self.data_dir, &token).await
    }

    pub async fn assemble(&self, token: &str) -> anyhow::Result<Document> {
        let token = parse_token(token)?;
        let latest = storage::latest_sections(&self.data_dir, &token).await?;
        let sections: Vec<Section> = Stage::ALL
            .iter()
            .filter_map(|stage| {
                latest
                    .get(&stage.id())
                    .map(|response| Section::new(*stage, response.text.clone()))
            })
            .collect();
        if sections.is_empty() {
            return Err(PipelineError::not_found("Technical specification not found").into());
        }
        Ok(Document::new(token, sections))
    }

    /// Generates the requested diagrams concurrently and merges successes into storage.
    pub async fn generate_diagrams(
        &self,
        token: &str,
        kinds: Option<&[String]>,
        text_override: Option<&str>,
    ) -> anyhow::Result<DiagramReport> {
        let parsed_token = parse_token(token)?;
        let kinds = match kinds.filter(|names| !names.is_empty()) {
            Some(names) => DiagramKind::parse_list(names)?,
            None => DiagramKind::parse_list(self.config.default_diagram_types.as_slice())?,
        };
        let source = match text_override.map(str::trim).filter(|text| !text.is_empty()) {
            Some(text) => text.to_string(),
            None => self.assemble(token).await?.full_text(),
        };

        let run_id = Uuid::new_v4();
        let batch = Arc::clone(&self.diagrams)
            .generate_all(kinds, Arc::from(source), run_id, parsed_token)
            .await;
        self.persist_llm_logs(&parsed_token, batch.llm_logs).await;

        if batch.images.is_empty() {
            let details = batch
                .failures
                .iter()
                .map(|(title, error)| format!("{title}: {error}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::Render(format!(
                "Error rendering Mermaid diagram: {details}"
            ))
            .into());
        }

        let images = batch.images.clone();
        let lock = self.diagram_lock(&parsed_token);
        let _guard = lock.lock().await;
        run_with_retry(&parsed_token, "diagrams", || {
            let data_dir = self.data_dir.clone();
            let images = images.clone();
            async move {
                storage::merge_diagrams(&data_dir, &parsed_token, images)
                    .await
                    .map(|_| ())
            }
        })
        .await?;

        info!(
            token = %parsed_token,
            rendered = batch.images.len(),
            failed = batch.failures.len(),
            "diagrams generated"
        );
        Ok(DiagramReport {
            token: parsed_token,
            diagrams: batch.images,
            failures: batch.failures,
        })
    }

    pub async fn diagrams(&self, token: &str) -> anyhow::Result<DiagramSet> {
        let token = parse_token(token)?;
        storage::load_diagrams(&self.data_dir, &token)
            .await?
            .ok_or_else(|| PipelineError::not_found("No diagrams generated for this token").into())
    }

    /// Stored diagrams for a token, or an empty map.
    pub async fn diagram_images(&self, token: &Uuid) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(storage::load_diagrams(&self.data_dir, token)
            .await?
            .map(|set| set.images)
            .unwrap_or_default())
    }

    /// Serializes load-merge-write of the stored diagram set per token.
    fn diagram_lock(&self, token: &Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.diagram_locks.lock();
        Arc::clone(locks.entry(*token).or_default())
    }

    /// Latest section of the same stage, else of the preceding stage, else empty.
    async fn seed_for(&self, stage: Stage, token: &Uuid) -> anyhow::Result<String> {
        let latest = storage::latest_sections(&self.data_dir, token).await?;
        let seed = latest
            .get(&stage.id())
            .or_else(|| stage.previous().and_then(|prev| latest.get(&prev.id())))
            .map(|response| response.text.clone())
            .unwrap_or_default();
        Ok(seed)
    }

    async fn draft(
        &self,
        stage: Stage,
        seed: &str,
        comment: &str,
        run_id: Uuid,
        token: Uuid,
        llm_logs: &mut Vec<LlmLogEntry>,
    ) -> anyhow::Result<(ResponseKind, String)> {
        let section = if self.config.clarification_enabled {
            let prompt = agent::clarify_prompt(stage, seed, comment);
            let reply = self.call("clarify", prompt, run_id, token, llm_logs).await?;
            if agent::is_clarification(&reply) {
                return Ok((ResponseKind::Clarification, reply.trim().to_string()));
            }
            reply
        } else {
            let prompt = agent::build_prompt(stage, seed, comment);
            self.call("section", prompt, run_id, token, llm_logs).await?
        };

        if !self.config.critic_enabled {
            return Ok((ResponseKind::Section, section.trim().to_string()));
        }
        let (prompt, reviewed) = self
            .critic
            .review(&section, self.llm.as_ref())
            .await
            .map_err(|err| upstream_error("critic", token, err))?;
        self.record("critic", prompt, &reviewed, run_id, token, llm_logs);
        Ok((ResponseKind::Section, reviewed.trim().to_string()))
    }

    async fn call(
        &self,
        phase: &str,
        prompt: String,
        run_id: Uuid,
        token: Uuid,
        llm_logs: &mut Vec<LlmLogEntry>,
    ) -> anyhow::Result<String> {
        let reply = self
            .llm
            .chat(&prompt)
            .await
            .map_err(|err| upstream_error(phase, token, err))?;
        self.record(phase, prompt, &reply, run_id, token, llm_logs);
        Ok(reply)
    }

    fn record(
        &self,
        phase: &str,
        prompt: String,
        reply: &str,
        run_id: Uuid,
        token: Uuid,
        llm_logs: &mut Vec<LlmLogEntry>,
    ) {
        llm_logs.push(LlmLogEntry::new(
            run_id,
            Some(token),
            phase,
            prompt,
            reply.to_string(),
            &self.llm.identity(),
        ));
    }

    async fn persist_llm_logs(&self, token: &Uuid, llm_logs: Vec<LlmLogEntry>) {
        let result = run_with_retry(token, "llm_logs", || {
            let data_dir = self.data_dir.clone();
            let llm_logs = llm_logs.clone();
            async move { storage::append_llm_logs(&data_dir, &llm_logs).await }
        })
        .await;
        if let Err(err) = result {
            warn!(token = %token, error = ?err, "failed to persist llm logs");
        }
    }
}

/// Model failures without a classification surface as upstream errors.
fn upstream_error(phase: &str, token: Uuid, err: anyhow::Error) -> anyhow::Error {
    if classify(&err).is_some() {
        return err;
    }
    warn!(token = %token, phase, error = ?err, "llm call failed");
    PipelineError::Upstream(format!("{err:#}")).into()
}

pub fn parse_token(raw: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| PipelineError::validation(format!("Invalid token '{}'", raw.trim())))
}

async fn run_with_retry<F, Fut>(token: &Uuid, stage: &'static str, mut operation: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut remaining = STORAGE_RETRY_ATTEMPTS;
    loop {
        match operation().await {
            Ok(()) => return Ok(()),
            Err(err) if remaining > 1 => {
                let attempt = STORAGE_RETRY_ATTEMPTS - remaining + 1;
                warn!(
                    token = %token,
                    stage,
                    attempt,
                    error = ?err,
                    "retrying storage action"
                );
                remaining -= 1;
                sleep(Duration::from_millis(STORAGE_RETRY_DELAY_MS)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
