//! Diagram generation: prompt the model for Mermaid code, sanitize it, render it.
//!
//! Every requested kind runs as its own task with a bounded number of
//! attempts. Failures of one kind never abort the others.

pub mod sanitize;

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::anyhow;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinSet, time::sleep};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::PipelineConfig,
    error::PipelineError,
    llm::{LlmClient, LlmLogEntry},
    render::DiagramRenderer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiagramKind {
    #[serde(rename = "DFD")]
    Dfd,
    #[serde(rename = "Use Case")]
    UseCase,
    #[serde(rename = "Activity")]
    Activity,
    #[serde(rename = "C4 Context")]
    C4Context,
    #[serde(rename = "ER Diagram")]
    Er,
}

impl DiagramKind {
    pub const ALL: [DiagramKind; 5] = [
        DiagramKind::Dfd,
        DiagramKind::UseCase,
        DiagramKind::Activity,
        DiagramKind::C4Context,
        DiagramKind::Er,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Self::Dfd => "DFD",
            Self::UseCase => "Use Case",
            Self::Activity => "Activity",
            Self::C4Context => "C4 Context",
            Self::Er => "ER Diagram",
        }
    }

    /// Parses a list of wire names, rejecting the first unknown one.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>, PipelineError> {
        let mut kinds = Vec::with_capacity(names.len());
        for name in names {
            let kind = name.as_ref().parse::<Self>()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    fn instructions(self) -> &'static str {
        match self {
            Self::Dfd => {
                "Build a Data Flow Diagram in Mermaid `graph TD` syntax.\n\
                 Use: external entities as [Name], processes as (Name) or ((Name)), data stores as [[Name]].\n\
                 Label every data flow with an arrow label: A -->|Data| B.\n\
                 Do not put double quotes inside arrow labels."
            }
            Self::UseCase => {
                "Build a Use Case diagram in Mermaid `graph TD` syntax.\n\
                 Actors are nodes like Customer[Customer]; group the use cases of the system inside one `subgraph` block closed by `end`.\n\
                 Connect actors to use cases with arrows."
            }
            Self::Activity => {
                "Build an Activity diagram in Mermaid `flowchart TB` syntax.\n\
                 Start and finish with rounded nodes, use {Condition} nodes for decisions and label branches."
            }
            Self::C4Context => {
                "Build a C4 Context diagram in Mermaid `C4Context` syntax.\n\
                 Use Person(...), System(...), System_Ext(...) and Rel(...) statements only."
            }
            Self::Er => {
                "Build an Entity Relationship diagram in Mermaid `erDiagram` syntax.\n\
                 Declare entities with attribute blocks and connect them with cardinality relations such as ||--o{."
            }
        }
    }
}

impl fmt::Display for DiagramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl FromStr for DiagramKind {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let folded: String = value
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .flat_map(char::to_lowercase)
            .collect();
        match folded.as_str() {
            "dfd" | "dataflow" => Ok(Self::Dfd),
            "usecase" => Ok(Self::UseCase),
            "activity" => Ok(Self::Activity),
            "c4context" | "c4" => Ok(Self::C4Context),
            "erdiagram" | "er" => Ok(Self::Er),
            _ => Err(PipelineError::Validation(format!(
                "Unknown diagram type '{}'. Available types: {}",
                value.trim(),
                Self::ALL.map(Self::title).join(", ")
            ))),
        }
    }
}

pub fn build_prompt(kind: DiagramKind, source: &str) -> String {
    format!(
        "# Phase: DIAGRAM\nDiagram: {}\nYou are an expert in system architecture.\n{}\n\nSpecification:\n\"\"\"\n{}\n\"\"\"\n\nReturn only Mermaid code without explanations.",
        kind.title(),
        kind.instructions(),
        source.trim(),
    )
}

/// Result of one fan-out run.
#[derive(Debug, Default)]
pub struct DiagramBatch {
    /// Base64 PNG images keyed by diagram title.
    pub images: BTreeMap<String, String>,
    /// Last error per exhausted diagram title.
    pub failures: BTreeMap<String, String>,
    pub llm_logs: Vec<LlmLogEntry>,
}

struct KindOutcome {
    kind: DiagramKind,
    result: anyhow::Result<Vec<u8>>,
    llm_logs: Vec<LlmLogEntry>,
}

pub struct DiagramGenerator {
    llm: Arc<dyn LlmClient>,
    renderer: Arc<dyn DiagramRenderer>,
    max_attempts: usize,
    retry_delay: Duration,
}

impl DiagramGenerator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        renderer: Arc<dyn DiagramRenderer>,
        max_attempts: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            llm,
            renderer,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(
        llm: Arc<dyn LlmClient>,
        renderer: Arc<dyn DiagramRenderer>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(
            llm,
            renderer,
            config.diagram_max_attempts,
            config.diagram_retry_delay(),
        )
    }

    pub fn renderer(&self) -> Arc<dyn DiagramRenderer> {
        Arc::clone(&self.renderer)
    }

    /// Generates every kind concurrently and collects the outcomes.
    pub async fn generate_all(
        self: Arc<Self>,
        kinds: Vec<DiagramKind>,
        source: Arc<str>,
        run_id: Uuid,
        token: Uuid,
    ) -> DiagramBatch {
        let mut tasks = JoinSet::new();
        for kind in kinds {
            let generator = Arc::clone(&self);
            let source = Arc::clone(&source);
            tasks.spawn(async move { generator.generate_one(kind, &source, run_id, token).await });
        }

        let mut batch = DiagramBatch::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(token = %token, error = ?err, "diagram task join error");
                    continue;
                }
            };
            batch.llm_logs.extend(outcome.llm_logs);
            match outcome.result {
                Ok(png) => {
                    batch
                        .images
                        .insert(outcome.kind.title().to_string(), STANDARD.encode(png));
                }
                Err(err) => {
                    batch
                        .failures
                        .insert(outcome.kind.title().to_string(), format!("{err:#}"));
                }
            }
        }
        batch
    }

    async fn generate_one(
        &self,
        kind: DiagramKind,
        source: &str,
        run_id: Uuid,
        token: Uuid,
    ) -> KindOutcome {
        let mut llm_logs = Vec::new();
        let mut attempt = 1;
        loop {
            match self.attempt(kind, source, run_id, token, &mut llm_logs).await {
                Ok(png) => {
                    info!(token = %token, diagram = kind.title(), attempt, "diagram rendered");
                    return KindOutcome {
                        kind,
                        result: Ok(png),
                        llm_logs,
                    };
                }
                Err(err) if attempt < self.max_attempts => {
                    warn!(
                        token = %token,
                        diagram = kind.title(),
                        attempt,
                        error = ?err,
                        "retrying diagram generation"
                    );
                    attempt += 1;
                    sleep(self.retry_delay).await;
                }
                Err(err) => {
                    warn!(
                        token = %token,
                        diagram = kind.title(),
                        attempts = attempt,
                        error = ?err,
                        "diagram generation exhausted"
                    );
                    return KindOutcome {
                        kind,
                        result: Err(err),
                        llm_logs,
                    };
                }
            }
        }
    }

    async fn attempt(
        &self,
        kind: DiagramKind,
        source: &str,
        run_id: Uuid,
        token: Uuid,
        llm_logs: &mut Vec<LlmLogEntry>,
    ) -> anyhow::Result<Vec<u8>> {
        let prompt = build_prompt(kind, source);
        let reply = self
            .llm
            .chat(&prompt)
            .await
            .map_err(|err| PipelineError::Upstream(format!("{err:#}")))?;
        llm_logs.push(LlmLogEntry::new(
            run_id,
            Some(token),
            "diagram",
            prompt,
            reply.clone(),
            &self.llm.identity(),
        ));

        let code = sanitize::sanitize(&reply)
            .ok_or_else(|| anyhow!("model reply contained no usable Mermaid code"))?;
        self.renderer.render_png(&code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        llm::{LlmIdentity, LocalStubClient},
        render::{LocalStubRenderer, is_png},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedClient {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedClient {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn chat(&self, _prompt: &str) -> anyhow::Result<String> {
            self.replies
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow!("script exhausted"))
        }

        fn identity(&self) -> LlmIdentity {
            LlmIdentity::new("scripted", None)
        }
    }

    fn generator(llm: Arc<dyn LlmClient>, attempts: usize) -> Arc<DiagramGenerator> {
        Arc::new(DiagramGenerator::new(
            llm,
            Arc::new(LocalStubRenderer),
            attempts,
            Duration::from_millis(1),
        ))
    }

    #[test]
    fn kind_parsing_is_lenient() {
        assert_eq!("dfd".parse::<DiagramKind>().unwrap(), DiagramKind::Dfd);
        assert_eq!("use_case".parse::<DiagramKind>().unwrap(), DiagramKind::UseCase);
        assert_eq!("C4-Context".parse::<DiagramKind>().unwrap(), DiagramKind::C4Context);
        assert_eq!("ER Diagram".parse::<DiagramKind>().unwrap(), DiagramKind::Er);
        assert!(matches!(
            "sequence".parse::<DiagramKind>(),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn parse_list_deduplicates_in_order() {
        let kinds = DiagramKind::parse_list(&["Activity", "DFD", "activity"]).unwrap();
        assert_eq!(kinds, vec![DiagramKind::Activity, DiagramKind::Dfd]);
    }

    #[test]
    fn prompt_embeds_title_and_source() {
        let prompt = build_prompt(DiagramKind::Er, "  Shop with orders  ");
        assert!(prompt.starts_with("# Phase: DIAGRAM\nDiagram: ER Diagram\n"));
        assert!(prompt.contains("\"\"\"\nShop with orders\n\"\"\""));
    }

    #[tokio::test]
    async fn every_kind_renders_with_stub_model() {
        let batch = generator(Arc::new(LocalStubClient), 1)
            .generate_all(
                DiagramKind::ALL.to_vec(),
                Arc::from("Online shop"),
                Uuid::new_v4(),
                Uuid::new_v4(),
            )
            .await;
        assert!(batch.failures.is_empty(), "{:?}", batch.failures);
        assert_eq!(batch.images.len(), 5);
        let png = STANDARD.decode(&batch.images["C4 Context"]).unwrap();
        assert!(is_png(&png));
        assert_eq!(batch.llm_logs.len(), 5);
    }

    #[tokio::test]
    async fn retries_until_model_returns_usable_code() {
        let llm = Arc::new(ScriptedClient::new(&[
            "Sorry, I can only describe it in words.",
            "```mermaid\ngraph TD\n    A[User] -->|Order| B((Shop))\n```",
        ]));
        let run_id = Uuid::new_v4();
        let batch = generator(llm, 3)
            .generate_all(vec![DiagramKind::Dfd], Arc::from("Shop"), run_id, Uuid::new_v4())
            .await;
        assert!(batch.images.contains_key("DFD"));
        assert_eq!(batch.llm_logs.len(), 2);
        assert!(batch.llm_logs.iter().all(|entry| entry.run_id == run_id));
    }

    #[tokio::test]
    async fn exhausted_kind_reports_last_error() {
        let llm = Arc::new(ScriptedClient::new(&["no diagram", "still nothing"]));
        let batch = generator(llm, 2)
            .generate_all(vec![DiagramKind::Activity], Arc::from("Shop"), Uuid::new_v4(), Uuid::new_v4())
            .await;
        assert!(batch.images.is_empty());
        assert!(batch.failures["Activity"].contains("no usable Mermaid code"));
    }
}
