//! 滚动窗口限流
//!
//! 与并发数无关：窗口内最多放行 `max` 个任务。

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// 限流参数
#[derive(Debug, Clone)]
pub struct RateLimit {
    /// 窗口内最大数量
    pub max: usize,
    /// 窗口长度
    pub window: Duration,
}

/// 滚动窗口限流器
#[derive(Debug)]
pub struct RollingWindowLimiter {
    limit: RateLimit,
    started: Mutex<VecDeque<Instant>>,
}

impl RollingWindowLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            started: Mutex::new(VecDeque::with_capacity(limit.max)),
            limit,
        }
    }

    pub fn limit(&self) -> &RateLimit {
        &self.limit
    }

    /// 尝试占用一个名额，失败时返回需要等待的时间
    pub async fn try_acquire(&self) -> Result<(), Duration> {
        let mut started = self.started.lock().await;
        let now = Instant::now();
        match self.wait_time(&mut started, now) {
            None => {
                started.push_back(now);
                Ok(())
            }
            Some(wait) => Err(wait),
        }
    }

    /// 等到有名额为止
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire().await {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// 等到窗口内有空余名额，但不占用
    pub async fn ready(&self) {
        loop {
            let wait = {
                let mut started = self.started.lock().await;
                self.wait_time(&mut started, Instant::now())
            };
            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// 清掉窗口外的记录；有空余名额返回 None
    fn wait_time(&self, started: &mut VecDeque<Instant>, now: Instant) -> Option<Duration> {
        while let Some(front) = started.front() {
            if now.duration_since(*front) >= self.limit.window {
                started.pop_front();
            } else {
                break;
            }
        }

        if started.len() < self.limit.max.max(1) {
            None
        } else {
            let oldest = started.front().copied().unwrap_or(now);
            Some(self.limit.window.saturating_sub(now.duration_since(oldest)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_limits_and_releases() {
        let limiter = RollingWindowLimiter::new(RateLimit {
            max: 2,
            window: Duration::from_secs(10),
        });

        assert!(limiter.try_acquire().await.is_ok());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(limiter.try_acquire().await.is_ok());

        let wait = limiter.try_acquire().await.unwrap_err();
        assert_eq!(wait, Duration::from_secs(7));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(limiter.try_acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_slot() {
        let limiter = RollingWindowLimiter::new(RateLimit {
            max: 1,
            window: Duration::from_secs(5),
        });
        limiter.acquire().await;
        let before = Instant::now();
        limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_does_not_take_a_slot() {
        let limiter = RollingWindowLimiter::new(RateLimit {
            max: 1,
            window: Duration::from_secs(5),
        });
        limiter.ready().await;
        limiter.ready().await;
        assert!(limiter.try_acquire().await.is_ok());

        let before = Instant::now();
        limiter.ready().await;
        assert!(before.elapsed() >= Duration::from_secs(5));
        assert!(limiter.try_acquire().await.is_ok());
    }
}
