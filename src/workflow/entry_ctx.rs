//! 参赛处理上下文
//!
//! 封装"我正在处理哪个任务的第几次尝试、目标是哪个站点"这一信息

use std::fmt::Display;

use crate::models::EntryJob;
use crate::queue::Job;
use crate::resilience::domain_key;

/// 单次参赛尝试的上下文
#[derive(Debug, Clone)]
pub struct EntryCtx {
    /// 参赛 ID（结果和截图以它命名）
    pub entry_id: String,

    /// 队列任务 ID
    pub job_id: String,

    /// 第几次尝试（从 1 开始）
    pub attempt: u32,

    /// 活动 ID
    pub contest_id: String,

    /// 熔断键
    pub domain: String,
}

impl EntryCtx {
    pub fn new(job: &Job, entry: &EntryJob) -> Self {
        Self {
            entry_id: entry.entry_id.clone().unwrap_or_else(|| job.id.clone()),
            job_id: job.id.clone(),
            attempt: job.attempts_made.max(1),
            contest_id: entry.contest.id.clone(),
            domain: domain_key(&entry.contest.url),
        }
    }
}

impl Display for EntryCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[参赛 {} 活动#{} 域名#{} 第{}次]",
            self.entry_id, self.contest_id, self.domain, self.attempt
        )
    }
}
