//! Services the orchestrator hands work to.
//!
//! Image enhancement, region splitting, AI analysis and the backend are
//! external to the link engine; only their shape is fixed here. The local
//! implementations at the bottom are what the headless CLI runs with.

use crate::domain::answer::AnswerSubmission;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

#[async_trait]
pub trait ImageEnhancer: Send + Sync {
    async fn enhance(&self, image: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Cuts one page into per-question regions. An empty result means the page
/// could not be split.
#[async_trait]
pub trait RegionSplitter: Send + Sync {
    async fn split(&self, image: &[u8]) -> anyhow::Result<Vec<Vec<u8>>>;
}

#[async_trait]
pub trait AiAnalyzer: Send + Sync {
    async fn analyze(&self, image: &[u8], prompt: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait BackendSync: Send + Sync {
    async fn submit_answer(&self, answer: &AnswerSubmission) -> anyhow::Result<()>;

    async fn pending_commands(&self, client_id: &str) -> anyhow::Result<Vec<BackendCommand>>;
}

/// Command queued on the backend for the glasses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCommand {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub timestamp: String,
}

pub struct PassthroughEnhancer;

#[async_trait]
impl ImageEnhancer for PassthroughEnhancer {
    async fn enhance(&self, image: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(image.to_vec())
    }
}

/// Treats the whole frame as a single region.
pub struct WholeFrameSplitter;

#[async_trait]
impl RegionSplitter for WholeFrameSplitter {
    async fn split(&self, image: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(vec![image.to_vec()])
    }
}

pub struct UnconfiguredAnalyzer;

#[async_trait]
impl AiAnalyzer for UnconfiguredAnalyzer {
    async fn analyze(&self, _image: &[u8], _prompt: &str) -> anyhow::Result<String> {
        anyhow::bail!("No analysis service configured")
    }
}

/// Backend kept in a local directory.
///
/// Answers are written as `<file_name>`; commands are picked up from
/// `commands.json` (a JSON array of [`BackendCommand`]) and the file is
/// removed once read.
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub const COMMANDS_FILE: &'static str = "commands.json";

    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create {}", root.display()))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl BackendSync for DirectoryBackend {
    async fn submit_answer(&self, answer: &AnswerSubmission) -> anyhow::Result<()> {
        let path = self.root.join(&answer.file_name);
        let json = serde_json::to_string_pretty(answer)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Answer {} stored at {}", answer.answer_id, path.display());
        Ok(())
    }

    async fn pending_commands(&self, client_id: &str) -> anyhow::Result<Vec<BackendCommand>> {
        let path = self.root.join(Self::COMMANDS_FILE);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        tokio::fs::remove_file(&path).await?;

        let commands: Vec<BackendCommand> = serde_json::from_str(&contents)
            .with_context(|| format!("Malformed command file {}", path.display()))?;
        debug!("{} command(s) pending for {}", commands.len(), client_id);
        Ok(commands)
    }
}
