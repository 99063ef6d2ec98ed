//! 滑动窗口限流器
//!
//! acquire 时先清除窗口外的时间戳再检查容量；满则以 100ms 粒度轮询等待。
//! 轮询可接受：调用频率受 LLM 延迟约束，不会出现高争用。

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    requests: Mutex<Vec<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            requests: Mutex::new(Vec::with_capacity(max_requests)),
            max_requests,
            window,
        }
    }

    /// 尝试占用一个配额；窗口满时返回 false
    pub fn allow(&self) -> bool {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());

        let cutoff = Instant::now() - self.window;
        requests.retain(|t| *t > cutoff);

        if requests.len() >= self.max_requests {
            return false;
        }
        requests.push(Instant::now());
        true
    }

    /// 阻塞（异步轮询）直到拿到配额
    pub async fn acquire(&self) {
        while !self.allow() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn reset(&self) {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_capacity() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        limiter.reset();
        assert!(limiter.allow());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(150));
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        // 第三次必须等窗口滑过
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
