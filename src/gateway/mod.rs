//! Provider gateway for OpenAI-compatible chat completions.

pub mod error;
pub mod provider;
pub mod types;
pub mod usage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use provider::{ChatProvider, OpenAiCompatAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ProviderError, ResponseMeta};
pub use types::*;
pub use usage::{LogUsageSink, MemoryUsageSink, NoopUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl GatewayConfig {
    /// One provider call per request. Use when the caller owns retries, as
    /// the sampler does for every trial.
    pub fn single_attempt() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Routes each request to the adapter for its model's provider, retrying
/// transient failures and reporting every attempt to the usage sink.
pub struct ProviderGateway<U: UsageSinkTrait> {
    adapters: HashMap<Provider, OpenAiCompatAdapter>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    /// Build adapters for the given providers from their environment variables.
    pub fn from_env(
        providers: &[Provider],
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Result<Self, ProviderError> {
        let mut gateway = Self::with_config(usage_sink, config);
        for provider in providers {
            if !gateway.adapters.contains_key(provider) {
                gateway = gateway.with_adapter(OpenAiCompatAdapter::from_env(*provider)?);
            }
        }
        Ok(gateway)
    }

    pub fn with_config(usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            usage_sink,
            config,
        }
    }

    pub fn with_adapter(mut self, adapter: OpenAiCompatAdapter) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let adapter = self.adapters.get(&req.model.provider()).ok_or_else(|| {
            ProviderError::config(format!(
                "no adapter configured for provider {}",
                req.model.provider()
            ))
        })?;

        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match adapter.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(&req, &ChatResponse::empty(), Some(code))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            (*retry_after).min(backoff_delay(self.config.retry_base_delay, 5))
                        }
                        _ => backoff_delay(self.config.retry_base_delay, attempt),
                    };
                    tracing::debug!(
                        provider = req.model.provider().as_str(),
                        attempt,
                        error = %err,
                        meta = %err.meta().map(ToString::to_string).unwrap_or_default(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::provider(req.model.provider().as_str(), "unknown error", false)
        }))
    }

    async fn record_usage(&self, req: &ChatRequest, resp: &ChatResponse, error_code: Option<String>) {
        let record = ProviderCallRecord::new(
            req.model.provider().as_str(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .run(req.attribution.run_id)
        .subject(req.attribution.subject.clone())
        .latency(resp.latency.as_millis() as u64);

        let record = match error_code {
            Some(code) => record.error(code),
            None => record,
        };

        self.usage_sink.record(record).await;
    }
}

/// Exponential backoff: `base * 2^attempt`, with the exponent capped at 5.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }
}
