//! 通用重试包装（指数退避）

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::AppResult;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数（包含第一次）
    pub max_attempts: u32,
    /// 第一次重试前的等待
    pub base_delay: Duration,
    /// 等待上限
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_backoff(self.base_delay, attempt).min(self.max_delay)
    }
}

/// `base * 2^(attempt-1)`
pub fn exponential_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp)
}

/// 重试结果：最终结果 + 过程中的警告
#[derive(Debug)]
pub struct Retried<T> {
    pub result: AppResult<T>,
    pub warnings: Vec<String>,
    pub attempts: u32,
}

/// 对瞬时错误按指数退避重试，非瞬时错误立即返回
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut warnings = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    warnings,
                    attempts: attempt,
                }
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} 第 {}/{} 次尝试失败: {}，{}ms 后重试",
                    label,
                    attempt,
                    max_attempts,
                    err,
                    delay.as_millis()
                );
                warnings.push(format!("{} 第 {} 次尝试失败: {}", label, attempt, err));
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Retried {
                    result: Err(err),
                    warnings,
                    attempts: attempt,
                }
            }
        }
    }
}
