//! LLM 调用指标：按次（attempt）记录，聚合全局与按提供方两级

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct ProviderSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_tokens: u64,
    pub total_latency: Duration,
    pub min_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_tokens: u64,
    pub total_latency: Duration,
    pub last_request_at: Option<DateTime<Utc>>,
    /// 错误码 -> 次数
    pub error_counts: HashMap<String, u64>,
    pub providers: HashMap<String, ProviderSnapshot>,
}

/// 指标聚合器：每次 attempt 调用 record_attempt 一次
#[derive(Default)]
pub struct Monitor {
    inner: Mutex<MonitorSnapshot>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(
        &self,
        provider: &str,
        latency: Duration,
        tokens: u64,
        error_code: Option<&str>,
    ) {
        let mut m = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        m.total_requests += 1;
        m.total_tokens += tokens;
        m.total_latency += latency;
        m.last_request_at = Some(Utc::now());

        match error_code {
            None => m.successful_requests += 1,
            Some(code) => {
                m.failed_requests += 1;
                *m.error_counts.entry(code.to_string()).or_default() += 1;
            }
        }

        let pm = m.providers.entry(provider.to_string()).or_default();
        pm.total_requests += 1;
        pm.total_tokens += tokens;
        pm.total_latency += latency;
        pm.min_latency = Some(pm.min_latency.map_or(latency, |v| v.min(latency)));
        pm.max_latency = Some(pm.max_latency.map_or(latency, |v| v.max(latency)));
        if error_code.is_none() {
            pm.successful_requests += 1;
        } else {
            pm.failed_requests += 1;
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn average_latency(&self) -> Duration {
        let m = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if m.total_requests == 0 {
            return Duration::ZERO;
        }
        m.total_latency / m.total_requests as u32
    }

    pub fn success_rate(&self) -> f64 {
        let m = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if m.total_requests == 0 {
            return 0.0;
        }
        m.successful_requests as f64 / m.total_requests as f64 * 100.0
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = MonitorSnapshot::default();
    }
}
