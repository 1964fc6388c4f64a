//! Subject prompts used for AI analysis of captured pages.
//!
//! File format: `{ "subjects": { "<subject>": "<prompt>" } }`. Subjects are
//! matched case-insensitively; anything missing falls back to a built-in prompt.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const GENERIC_PROMPT: &str = "Describe the content of this image.";

#[derive(Debug, Deserialize)]
struct PromptFile {
    subjects: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptBook {
    subjects: HashMap<String, String>,
}

impl PromptBook {
    /// Load overrides from a prompts file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let book = Self::from_json(&contents)?;
        info!(
            "Loaded {} subject prompts from {}",
            book.subjects.len(),
            path.display()
        );
        Ok(book)
    }

    /// Like [`PromptBook::load`] but never fails; a broken file only costs the overrides.
    pub fn load_or_builtin(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::load(path).unwrap_or_else(|e| {
                warn!("Failed to load prompts from {}: {}", path.display(), e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: PromptFile = serde_json::from_str(json)?;
        let subjects = file
            .subjects
            .into_iter()
            .map(|(subject, prompt)| (subject.to_lowercase(), prompt))
            .collect();
        Ok(Self { subjects })
    }

    pub fn prompt_for(&self, subject: &str) -> String {
        let subject = subject.to_lowercase();
        self.subjects
            .get(&subject)
            .cloned()
            .unwrap_or_else(|| builtin_prompt(&subject).to_string())
    }

    /// Subjects with an explicit prompt, sorted.
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = if self.subjects.is_empty() {
            BUILTIN_SUBJECTS.iter().map(|s| s.to_string()).collect()
        } else {
            self.subjects.keys().cloned().collect()
        };
        subjects.sort();
        subjects
    }
}

const BUILTIN_SUBJECTS: &[&str] = &[
    "physics",
    "math",
    "chemistry",
    "politics",
    "english",
    "chinese",
    "history",
    "order",
];

fn builtin_prompt(subject: &str) -> &'static str {
    match subject {
        "physics" => "Analyze this physics problem: give the question, the solution steps and the answer.",
        "math" => "Analyze this math problem: give the question, the solution steps and the final answer.",
        "chemistry" => "Analyze this chemistry problem: give the question, the reactions involved and the answer.",
        "politics" => "Analyze this politics question: give the question, the reasoning and the answer.",
        "english" => "Read this English question or passage and provide the text with a translation.",
        "chinese" => "Analyze this Chinese-language question or passage: give the question, the answer and an explanation.",
        "history" => "Analyze this history question: give the question, the historical background and the answer.",
        _ => GENERIC_PROMPT,
    }
}

/// Whether pages of this subject are split into per-question regions.
pub fn splits_regions(subject: &str) -> bool {
    !matches!(
        subject.to_lowercase().as_str(),
        "english" | "chinese" | "order"
    )
}

/// Whether pages of this subject go through AI analysis at all.
pub fn runs_analysis(subject: &str) -> bool {
    !subject.eq_ignore_ascii_case("order")
}
