use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::fs;

use anyhow::Context;
use chrono::{DateTime, Datelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::{self as async_fs, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::llm::LlmLogEntry;

const REQUIRED_DIRS: &[&str] = &["conversations", "logs/llm"];

const RESPONSES_FILE: &str = "responses.jsonl";
const DIAGRAMS_FILE: &str = "diagrams.json";

pub fn ensure_data_layout(data_dir: &Path) -> anyhow::Result<()> {
    for dir in REQUIRED_DIRS {
        let path = data_dir.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("creating dir {:?}", path))?;
    }
    Ok(())
}

pub fn load_yaml<T: DeserializeOwned>(path: PathBuf) -> anyhow::Result<T> {
    let content = fs::read_to_string(&path).with_context(|| format!("reading yaml {:?}", path))?;
    let parsed =
        serde_yaml::from_str(&content).with_context(|| format!("parsing yaml {:?}", path))?;
    Ok(parsed)
}

pub fn conversation_dir(data_dir: &Path, token: &Uuid) -> PathBuf {
    data_dir.join("conversations").join(token.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Section,
    Clarification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub id: Uuid,
    pub token: Uuid,
    pub agent_id: u8,
    pub kind: ResponseKind,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl StoredResponse {
    pub fn new(token: Uuid, agent_id: u8, kind: ResponseKind, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            agent_id,
            kind,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

pub async fn append_response(data_dir: &Path, response: &StoredResponse) -> anyhow::Result<()> {
    let dir = conversation_dir(data_dir, &response.token);
    async_fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating conversation dir {:?}", dir))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(RESPONSES_FILE))
        .await?;
    let serialized = serde_json::to_string(response)?;
    file.write_all(serialized.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}

/// All responses stored for a conversation, oldest first.
pub async fn list_responses(data_dir: &Path, token: &Uuid) -> anyhow::Result<Vec<StoredResponse>> {
    let path = conversation_dir(data_dir, token).join(RESPONSES_FILE);
    let content = match async_fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading responses {:?}", path)),
    };

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<StoredResponse>(line)
                .with_context(|| format!("parsing response line in {:?}", path))
        })
        .collect()
}

/// The most recent section per agent id.
pub async fn latest_sections(
    data_dir: &Path,
    token: &Uuid,
) -> anyhow::Result<BTreeMap<u8, StoredResponse>> {
    let mut latest = BTreeMap::new();
    for response in list_responses(data_dir, token).await? {
        if response.kind == ResponseKind::Section {
            latest.insert(response.agent_id, response);
        }
    }
    Ok(latest)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramSet {
    pub token: Uuid,
    /// Base64 PNG images keyed by diagram title.
    pub images: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn load_diagrams(data_dir: &Path, token: &Uuid) -> anyhow::Result<Option<DiagramSet>> {
    let path = conversation_dir(data_dir, token).join(DIAGRAMS_FILE);
    match async_fs::read(&path).await {
        Ok(bytes) => {
            let set = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing diagrams {:?}", path))?;
            Ok(Some(set))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading diagrams {:?}", path)),
    }
}

/// Merges freshly rendered images into the stored set; same titles are replaced.
///
/// Not atomic across callers: concurrent merges for one token must be serialized
/// by the caller.
pub async fn merge_diagrams(
    data_dir: &Path,
    token: &Uuid,
    images: BTreeMap<String, String>,
) -> anyhow::Result<DiagramSet> {
    let now = Utc::now();
    let mut set = load_diagrams(data_dir, token)
        .await?
        .unwrap_or_else(|| DiagramSet {
            token: *token,
            images: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        });
    set.images.extend(images);
    set.updated_at = now;

    let dir = conversation_dir(data_dir, token);
    async_fs::create_dir_all(&dir).await?;
    let path = dir.join(DIAGRAMS_FILE);
    let tmp_path = dir.join(format!("{DIAGRAMS_FILE}.{}.tmp", Uuid::new_v4()));
    let serialized = serde_json::to_vec_pretty(&set).context("serializing diagrams")?;
    async_fs::write(&tmp_path, serialized)
        .await
        .with_context(|| format!("writing diagrams {:?}", tmp_path))?;
    async_fs::rename(&tmp_path, &path)
        .await
        .with_context(|| format!("replacing diagrams {:?}", path))?;

    Ok(set)
}

#[derive(Debug, Clone)]
pub struct LlmLogQuery {
    pub model: Option<String>,
    pub run_id: Option<Uuid>,
    pub token: Option<Uuid>,
    pub phase: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for LlmLogQuery {
    fn default() -> Self {
        Self {
            model: None,
            run_id: None,
            token: None,
            phase: None,
            since: None,
            limit: 100,
        }
    }
}

pub async fn append_llm_logs(data_dir: &Path, entries: &[LlmLogEntry]) -> anyhow::Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    for entry in entries {
        let date = entry.timestamp.date_naive();
        let log_dir =
            data_dir
                .join("logs/llm")
                .join(format!("{:04}/{:02}", date.year(), date.month()));
        async_fs::create_dir_all(&log_dir).await?;
        let log_path = log_dir.join(format!("{:02}.jsonl", date.day()));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        let serialized = serde_json::to_string(entry)?;
        file.write_all(serialized.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
    }

    Ok(())
}

/// Newest entries first.
pub async fn read_llm_logs(
    data_dir: &Path,
    mut query: LlmLogQuery,
) -> anyhow::Result<Vec<LlmLogEntry>> {
    if query.limit == 0 {
        query.limit = 100;
    }

    let log_root = data_dir.join("logs/llm");
    if !log_root.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = WalkDir::new(&log_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files.reverse();

    let mut results = Vec::new();
    for file in files {
        let content = async_fs::read_to_string(&file).await?;
        for line in content.lines().rev() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LlmLogEntry = serde_json::from_str(line)?;

            if let Some(ref model) = query.model {
                let matches_model = entry
                    .model
                    .as_ref()
                    .map(|value| value.eq_ignore_ascii_case(model))
                    .unwrap_or(false);
                if !matches_model {
                    continue;
                }
            }

            if let Some(ref phase) = query.phase
                && !entry.phase.eq_ignore_ascii_case(phase)
            {
                continue;
            }

            if query
                .run_id
                .as_ref()
                .is_some_and(|run_id| &entry.run_id != run_id)
            {
                continue;
            }

            if query
                .token
                .as_ref()
                .is_some_and(|token| entry.token.as_ref() != Some(token))
            {
                continue;
            }

            if query
                .since
                .as_ref()
                .is_some_and(|since| &entry.timestamp < since)
            {
                continue;
            }

            results.push(entry);
            if results.len() >= query.limit {
                return Ok(results);
            }
        }
    }

    Ok(results)
}
