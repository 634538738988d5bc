//! Forced-choice judgments: the seam between a judge and the sampler.
//!
//! A `JudgmentSource` answers one trial for one presentation order. The LLM
//! implementation renders the subject's prompt, calls the gateway and parses
//! the reply; the simulated implementation lives in `simulated.rs`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::Item;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::prompts::template_for;
use crate::subject::Subject;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of one trial, in canonical pair orientation (`a` is the lower item index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    A,
    B,
    Tie,
}

/// Which canonical item was shown in the "Policy A" slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presentation {
    AFirst,
    BFirst,
}

/// The answer as given, relative to the presentation slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    First,
    Second,
    Tie,
}

impl Choice {
    pub fn to_outcome(self, presentation: Presentation) -> Outcome {
        match (self, presentation) {
            (Choice::Tie, _) => Outcome::Tie,
            (Choice::First, Presentation::AFirst) | (Choice::Second, Presentation::BFirst) => {
                Outcome::A
            }
            (Choice::First, Presentation::BFirst) | (Choice::Second, Presentation::AFirst) => {
                Outcome::B
            }
        }
    }
}

// =============================================================================
// Source trait
// =============================================================================

/// One trial: `first` fills the "Policy A" slot, `second` the "Policy B" slot.
#[derive(Debug, Clone, Copy)]
pub struct JudgmentRequest<'a> {
    pub subject: &'a Subject,
    pub first: &'a Item,
    pub second: &'a Item,
    pub trial: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum JudgmentError {
    /// The source could not be reached or failed; may be retried.
    /// `retry_after` is the wait the source asked for, if any.
    #[error("judgment source error: {message}")]
    Source {
        message: String,
        retryable: bool,
        retry_after: Option<Duration>,
    },
    /// A reply arrived but names no usable choice. Never retried.
    #[error("unparseable answer: {0}")]
    Unparseable(String),
}

impl JudgmentError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            retryable: true,
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JudgmentError::Source { retryable: true, .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            JudgmentError::Source { retry_after, .. } => *retry_after,
            JudgmentError::Unparseable(_) => None,
        }
    }
}

impl From<ProviderError> for JudgmentError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Refused { message, .. } => JudgmentError::Unparseable(format!(
                "refused: {}",
                truncate(&message, 120)
            )),
            other => JudgmentError::Source {
                retryable: other.is_retryable(),
                retry_after: match &other {
                    ProviderError::RateLimited { retry_after, .. } => Some(*retry_after),
                    _ => None,
                },
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait JudgmentSource: Send + Sync {
    async fn judge(&self, req: JudgmentRequest<'_>) -> Result<Choice, JudgmentError>;
}

#[async_trait]
impl<T: JudgmentSource + ?Sized> JudgmentSource for Arc<T> {
    async fn judge(&self, req: JudgmentRequest<'_>) -> Result<Choice, JudgmentError> {
        (**self).judge(req).await
    }
}

// =============================================================================
// Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChoiceJson {
    #[serde(default, alias = "choice", alias = "answer")]
    preference: Option<String>,
}

/// Parse a raw reply into a choice.
///
/// Accepts an exact label ("A", "B", "TIE"), a JSON object with a
/// `preference`/`choice`/`answer` field, or free text in which exactly one
/// distinct label appears as a whole word. Anything else is unparseable.
pub fn parse_forced_choice(raw: &str) -> Result<Choice, JudgmentError> {
    let trimmed = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '.' | ' ' | '\n'));
    if let Some(choice) = label(trimmed) {
        return Ok(choice);
    }

    if let Some(json) = extract_json(raw) {
        if let Ok(parsed) = serde_json::from_str::<ChoiceJson>(json) {
            if let Some(choice) = parsed.preference.as_deref().map(str::trim).and_then(label) {
                return Ok(choice);
            }
        }
    }

    let mut found: Option<Choice> = None;
    for word in raw
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if let Some(choice) = label(word) {
            match found {
                Some(prev) if prev != choice => {
                    return Err(JudgmentError::Unparseable(truncate(raw, 80)));
                }
                _ => found = Some(choice),
            }
        }
    }
    found.ok_or_else(|| JudgmentError::Unparseable(truncate(raw, 80)))
}

fn label(text: &str) -> Option<Choice> {
    match text.to_ascii_uppercase().as_str() {
        "A" => Some(Choice::First),
        "B" => Some(Choice::Second),
        "TIE" => Some(Choice::Tie),
        _ => None,
    }
}

/// First balanced `{...}` object in the reply, if any.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let remainder = &raw[start..];
    let mut depth = 0i32;
    for (i, c) in remainder.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}

// =============================================================================
// LLM judge
// =============================================================================

/// Judgment source backed by a chat gateway.
pub struct LlmJudge<G: ChatGateway> {
    gateway: Arc<G>,
    run_id: Option<uuid::Uuid>,
}

impl<G: ChatGateway> LlmJudge<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            run_id: None,
        }
    }

    pub fn with_run(mut self, run_id: uuid::Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[async_trait]
impl<G: ChatGateway> JudgmentSource for LlmJudge<G> {
    async fn judge(&self, req: JudgmentRequest<'_>) -> Result<Choice, JudgmentError> {
        let subject = req.subject;
        let judge = &subject.judge;
        let prompt = template_for(subject.kind).render(
            judge.system_prompt_or_default(),
            &subject.name,
            &req.first.text,
            &req.second.text,
            judge.allow_ties,
        );

        let mut attribution =
            Attribution::new("sampler::judge").with_subject(subject.key().to_string());
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }

        let request = ChatRequest::new(
            ChatModel::new(judge.provider, judge.model.clone()),
            prompt.to_messages(),
            attribution,
        )
        .temperature(judge.temperature)
        .max_tokens(judge.max_tokens);

        let response = self.gateway.chat(request).await?;
        parse_forced_choice(&response.content)
    }
}

// =============================================================================
// TESTS
// =============================================================================
