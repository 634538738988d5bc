//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every call through a UsageSink so survey runs can
//! account for token spend without the gateway knowing where records go:
//! - the CLI uses `LogUsageSink` (structured `tracing` events)
//! - tests use `NoopUsageSink` or `MemoryUsageSink`

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name: "openai", "openrouter", etc.
    pub provider: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub run_id: Option<Uuid>,
    pub subject: Option<String>,
    pub latency_ms: u64,
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(provider: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            run_id: None,
            subject: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. Fire-and-forget: failures are logged, never propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// Discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits one debug-level `tracing` event per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUsageSink;

#[async_trait]
impl UsageSink for LogUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::debug!(
            provider = record.provider,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error_code = record.error_code.as_deref().unwrap_or(""),
            caller = record.caller,
            subject = record.subject.as_deref().unwrap_or(""),
            "provider call"
        );
    }
}

/// Keeps records in memory; used to total a run's token usage.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

impl MemoryUsageSink {
    pub fn records(&self) -> Vec<ProviderCallRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// (calls, input tokens, output tokens)
    pub fn totals(&self) -> (usize, u64, u64) {
        let records = self.records();
        let input = records.iter().map(|r| r.input_tokens as u64).sum();
        let output = records.iter().map(|r| r.output_tokens as u64).sum();
        (records.len(), input, output)
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match self.records.lock() {
            Ok(mut guard) => guard.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
