use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    /// 等待重试（退避中）或延迟执行
    Delayed,
    Active,
    Completed,
    /// 重试耗尽（死信）
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 任务快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: JsonValue,
    pub status: JobStatus,
    /// 已开始执行的次数
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<JsonValue>,
}

impl Job {
    pub fn new(spec: &JobSpec, queue: &str, payload: JsonValue) -> Self {
        Self {
            id: spec.id.clone(),
            queue: queue.to_string(),
            payload,
            status: if spec.delay.is_zero() {
                JobStatus::Waiting
            } else {
                JobStatus::Delayed
            },
            attempts_made: 0,
            max_attempts: spec.attempts.max(1),
            backoff_ms: spec.backoff.as_millis() as u64,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            return_value: None,
        }
    }

    /// 第 `attempts_made` 次失败后的退避时间
    pub fn backoff_delay(&self) -> Duration {
        crate::resilience::exponential_backoff(Duration::from_millis(self.backoff_ms), self.attempts_made)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// 入队参数，未设置的字段使用网关默认值
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// 自定义任务 id（相同 id 重复入队会被忽略）
    pub job_id: Option<String>,
    pub attempts: Option<u32>,
    pub backoff: Option<Duration>,
    pub delay: Option<Duration>,
    pub keep_completed: Option<usize>,
    pub keep_failed: Option<usize>,
}

/// 补齐默认值后交给队列实现的参数
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub attempts: u32,
    pub backoff: Duration,
    pub delay: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

/// 入队回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    /// 是否只记录在进程内（降级模式）
    pub fallback: bool,
}

/// 各状态的任务数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl QueueCounts {
    /// 还没有结束的任务数
    pub fn pending(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}

/// 失败上报后的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// 退避后重试
    Retrying { delay: Duration },
    /// 进入死信
    DeadLettered,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(attempts: u32) -> JobSpec {
        JobSpec {
            id: "j-1".into(),
            attempts,
            backoff: Duration::from_secs(5),
            delay: Duration::ZERO,
            keep_completed: 10,
            keep_failed: 10,
        }
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let mut job = Job::new(&spec(3), "entry", JsonValue::Null);
        job.attempts_made = 1;
        assert_eq!(job.backoff_delay(), Duration::from_secs(5));
        job.attempts_made = 2;
        assert_eq!(job.backoff_delay(), Duration::from_secs(10));
        assert!(job.can_retry());
        job.attempts_made = 3;
        assert!(!job.can_retry());
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let job = Job::new(&spec(0), "entry", JsonValue::Null);
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.status, JobStatus::Waiting);
    }
}
