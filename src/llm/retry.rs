//! RetryProvider：在任意 LlmProvider 上叠加限流、重试与指标
//!
//! complete 流程：acquire 限流配额 -> 最多 3 次尝试，第 n 次重试前退避 n 秒；
//! 仅可重试错误（rate-limit / timeout / server-error / service-unavailable）触发重试，
//! 鉴权、上下文超限等立即上抛。每次尝试都记入 Monitor。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{ChunkStream, CompletionRequest, CompletionResponse, LlmError, LlmProvider, Monitor, RateLimiter};

const MAX_RETRIES: u32 = 3;

pub struct RetryProvider {
    inner: Arc<dyn LlmProvider>,
    provider_name: String,
    limiter: RateLimiter,
    monitor: Arc<Monitor>,
}

impl RetryProvider {
    pub fn new(
        inner: Arc<dyn LlmProvider>,
        provider_name: impl Into<String>,
        max_requests_per_minute: usize,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            inner,
            provider_name: provider_name.into(),
            limiter: RateLimiter::new(max_requests_per_minute, Duration::from_secs(60)),
            monitor,
        }
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }
}

#[async_trait]
impl LlmProvider for RetryProvider {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.limiter.acquire().await;

        let mut last_err = LlmError::Api("no attempt made".to_string());

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // 线性退避：第 n 次重试前等待 n 秒
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }

            let start = Instant::now();
            match self.inner.complete(req).await {
                Ok(resp) => {
                    self.monitor.record_attempt(
                        &self.provider_name,
                        start.elapsed(),
                        resp.usage.total_tokens,
                        None,
                    );
                    return Ok(resp);
                }
                Err(e) => {
                    self.monitor
                        .record_attempt(&self.provider_name, start.elapsed(), 0, Some(e.code()));
                    tracing::warn!(
                        provider = %self.provider_name,
                        attempt = attempt + 1,
                        code = e.code(),
                        "LLM request failed"
                    );
                    let retryable = e.is_retryable();
                    last_err = e;
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_err)
    }

    async fn complete_stream(&self, req: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        self.limiter.acquire().await;
        self.inner.complete_stream(req).await
    }

    fn model(&self) -> String {
        self.inner.model()
    }
}
