//! Review pass applied to every drafted section.
//!
//! When a guidelines document is configured, the passages that share the most
//! vocabulary with the section are quoted into the review prompt as context.

use std::{collections::HashSet, path::Path};

use anyhow::Context;

use crate::{config::PipelineConfig, llm::LlmClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidelineChunk {
    pub position: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct Critic {
    chunks: Vec<GuidelineChunk>,
    top_k: usize,
}

impl Critic {
    pub fn new(chunks: Vec<GuidelineChunk>, top_k: usize) -> Self {
        Self { chunks, top_k }
    }

    pub fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let Some(path) = config.guidelines_path.as_deref() else {
            return Ok(Self::default());
        };
        let text = load_guidelines(path)?;
        let chunks = split_chunks(
            &text,
            config.guidelines_chunk_size,
            config.guidelines_chunk_overlap,
        );
        Ok(Self::new(chunks, config.guidelines_top_k))
    }

    pub fn guideline_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn build_prompt(&self, block: &str) -> String {
        let context = self.retrieve(block);
        let mut prompt = String::from(
            "# Phase: CRITIC\nYou are an expert in technical documentation. Check and, where needed, improve the text below against these criteria:\n\
             1. Logical structure and completeness\n\
             2. Concrete wording\n\
             3. Removal of redundant or vague phrases\n\
             4. Missing important blocks (name, goals, roles, use cases, security, ...)\n\
             If everything is fine, format the text and keep it.\n",
        );
        if !context.is_empty() {
            prompt.push_str("\nContext (specification guidelines):\n");
            for chunk in context {
                prompt.push_str(chunk.text.trim());
                prompt.push_str("\n---\n");
            }
        }
        prompt.push_str("\nText:\n");
        prompt.push_str(block.trim());
        prompt.push_str("\nEnd of text.\n\nReturn only the improved text without model instructions.");
        prompt
    }

    pub async fn review(&self, block: &str, llm: &dyn LlmClient) -> anyhow::Result<(String, String)> {
        let prompt = self.build_prompt(block);
        let reviewed = llm.chat(&prompt).await?;
        Ok((prompt, reviewed))
    }

    /// Top `k` chunks by shared vocabulary with `block`; ties keep document order.
    pub fn retrieve(&self, block: &str) -> Vec<&GuidelineChunk> {
        if self.chunks.is_empty() || self.top_k == 0 {
            return Vec::new();
        }
        let query = tokenize(block);
        let mut scored: Vec<(usize, &GuidelineChunk)> = self
            .chunks
            .iter()
            .map(|chunk| {
                let words = tokenize(&chunk.text);
                (query.intersection(&words).count(), chunk)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.position.cmp(&b.1.position)));
        scored
            .into_iter()
            .take(self.top_k)
            .map(|(_, chunk)| chunk)
            .collect()
    }
}

fn load_guidelines(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading guidelines {:?}", path))
}

/// Splits on character boundaries into windows of `size` chars overlapping by `overlap`.
pub fn split_chunks(text: &str, size: usize, overlap: usize) -> Vec<GuidelineChunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }
    let step = size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let text: String = chars[start..end].iter().collect();
        if !text.trim().is_empty() {
            chunks.push(GuidelineChunk {
                position: chunks.len(),
                text,
            });
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .map(|word| word.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LocalStubClient;

    #[test]
    fn split_chunks_overlaps_windows() {
        let chunks = split_chunks("abcdefghij", 4, 2);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "cdef", "efgh", "ghij"]);
        assert_eq!(chunks[3].position, 3);
    }

    #[test]
    fn split_chunks_handles_multibyte_and_degenerate_input() {
        let chunks = split_chunks("привет мир", 6, 0);
        assert_eq!(chunks[0].text, "привет");
        assert!(split_chunks("", 10, 2).is_empty());
        assert_eq!(split_chunks("abc", 2, 5).len(), 2);
    }

    #[test]
    fn retrieve_ranks_by_overlap_then_position() {
        let critic = Critic::new(
            vec![
                GuidelineChunk {
                    position: 0,
                    text: "Describe security requirements explicitly".to_string(),
                },
                GuidelineChunk {
                    position: 1,
                    text: "Goals must be measurable".to_string(),
                },
                GuidelineChunk {
                    position: 2,
                    text: "Security and authentication requirements for every role".to_string(),
                },
            ],
            2,
        );
        let hits = critic.retrieve("Security requirements: authentication for admins");
        let positions: Vec<usize> = hits.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![2, 0]);
        assert!(critic.retrieve("nothing shared here").is_empty());
    }

    #[test]
    fn prompt_includes_context_only_when_retrieved() {
        let bare = Critic::default().build_prompt("Some section");
        assert!(bare.starts_with("# Phase: CRITIC"));
        assert!(!bare.contains("Context (specification guidelines)"));
        assert!(bare.contains("Text:\nSome section\nEnd of text."));

        let critic = Critic::new(
            vec![GuidelineChunk {
                position: 0,
                text: "Every section needs measurable criteria".to_string(),
            }],
            3,
        );
        let prompt = critic.build_prompt("This section lists criteria");
        assert!(prompt.contains("Context (specification guidelines):\nEvery section needs measurable criteria"));
    }

    #[test]
    fn from_config_loads_guidelines_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guidelines.md");
        std::fs::write(&path, "a".repeat(2500)).unwrap();
        let config = PipelineConfig {
            guidelines_path: Some(path),
            ..PipelineConfig::default()
        };
        let critic = Critic::from_config(&config).unwrap();
        assert_eq!(critic.guideline_count(), 3);

        let missing = PipelineConfig {
            guidelines_path: Some(dir.path().join("absent.md")),
            ..PipelineConfig::default()
        };
        assert!(Critic::from_config(&missing).is_err());
    }

    #[tokio::test]
    async fn review_returns_prompt_and_model_reply() {
        let (prompt, reviewed) = Critic::default()
            .review("Goals\n\n- sell books", &LocalStubClient)
            .await
            .unwrap();
        assert!(prompt.contains("- sell books"));
        assert_eq!(reviewed, "Goals\n\n- sell books\n\nReviewed for completeness.");
    }
}
