//! Subjects: the AI model configurations and political entities being measured.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::hash_fields;
use crate::gateway::Provider;
use crate::prompts::{template_for, DEFAULT_SYSTEM_PROMPT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// An AI model answering for itself.
    Model,
    /// A named politician simulated by a judge model.
    Politician,
    /// A political platform simulated by a judge model.
    Platform,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Model => "model",
            SubjectKind::Politician => "politician",
            SubjectKind::Platform => "platform",
        }
    }
}

/// How the judge model is queried for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeSettings {
    pub provider: Provider,
    /// Provider model id, e.g. "openai/gpt-4.1".
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    /// Offer "TIE" as a third answer.
    pub allow_ties: bool,
}

impl JudgeSettings {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 1.0,
            max_tokens: 16,
            system_prompt: None,
            allow_ties: false,
        }
    }

    pub fn system_prompt_or_default(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

/// Stable cache identity of a subject: kind, name and a hash of its judge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectKey(String);

impl SubjectKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub kind: SubjectKind,
    pub judge: JudgeSettings,
}

impl Subject {
    /// An AI model measured on its own preferences; the name is the model id.
    pub fn model(judge: JudgeSettings) -> Self {
        Self {
            name: judge.model.clone(),
            kind: SubjectKind::Model,
            judge,
        }
    }

    pub fn politician(name: impl Into<String>, judge: JudgeSettings) -> Self {
        Self {
            name: name.into(),
            kind: SubjectKind::Politician,
            judge,
        }
    }

    pub fn platform(name: impl Into<String>, judge: JudgeSettings) -> Self {
        Self {
            name: name.into(),
            kind: SubjectKind::Platform,
            judge,
        }
    }

    pub fn key(&self) -> SubjectKey {
        let template = template_for(self.kind);
        let temperature = format!("{:.4}", self.judge.temperature);
        let max_tokens = self.judge.max_tokens.to_string();
        let allow_ties = if self.judge.allow_ties { "ties" } else { "forced" };
        let config_hash = hash_fields(&[
            self.kind.as_str(),
            &self.name,
            self.judge.provider.as_str(),
            &self.judge.model,
            &temperature,
            &max_tokens,
            self.judge.system_prompt_or_default(),
            allow_ties,
            template.slug,
            &template.hash(),
        ]);
        SubjectKey(format!(
            "{}/{}/{}",
            self.kind.as_str(),
            slug(&self.name),
            &config_hash[..12]
        ))
    }
}

/// Entities file: `{"politicians": [...], "platforms": [...]}`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EntityRoster {
    #[serde(default)]
    pub politicians: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
}

impl EntityRoster {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, crate::catalog::CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Politicians first, then platforms, each in listed order.
    pub fn subjects(&self, judge: &JudgeSettings) -> Vec<Subject> {
        self.politicians
            .iter()
            .map(|name| Subject::politician(name, judge.clone()))
            .chain(
                self.platforms
                    .iter()
                    .map(|name| Subject::platform(name, judge.clone())),
            )
            .collect()
    }
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out
}
