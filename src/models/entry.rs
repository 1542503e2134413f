use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::models::contest::EntryJob;

/// 参赛结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// 页面给出了明确的成功提示
    Confirmed,
    /// 已提交，但页面没有可识别的提示
    Submitted,
    Failed,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Confirmed => write!(f, "confirmed"),
            EntryStatus::Submitted => write!(f, "submitted"),
            EntryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// 失败原因分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 已经参加过
    AlreadyEntered,
    /// 页面明确拒绝（资格不符等）
    Rejected,
    /// 流程本身出错（导航、表单、提交）
    StepError,
}

/// 即开型活动的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantWinOutcome {
    pub won: bool,
    pub prize_text: Option<String>,
}

/// 一次参赛的最终结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryResult {
    pub entry_id: String,
    pub contest_id: String,
    pub profile_id: String,
    pub strategy: String,
    pub status: EntryStatus,
    pub confirmation_token: Option<String>,
    /// 截图路径
    pub proof_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub failure_kind: Option<FailureKind>,
    pub instant_win: Option<InstantWinOutcome>,
    /// 打码花费
    pub challenge_cost: f64,
}

impl EntryResult {
    /// 是否应该计入域名的失败次数
    ///
    /// 已参加过 / 被页面拒绝说明站点本身是正常的，只有流程错误才算。
    pub fn is_domain_failure(&self) -> bool {
        self.status == EntryStatus::Failed && self.failure_kind == Some(FailureKind::StepError)
    }
}

/// 进行中的一次参赛
///
/// 在策略开始时创建，`finish` 消耗自身，保证结果只生成一次。
#[derive(Debug)]
pub struct EntryAttempt {
    entry_id: String,
    contest_id: String,
    profile_id: String,
    strategy: String,
    started: Instant,
    pub confirmation_token: Option<String>,
    pub proof_path: Option<PathBuf>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub instant_win: Option<InstantWinOutcome>,
    pub challenge_cost: f64,
}

impl EntryAttempt {
    pub fn start(entry_id: &str, job: &EntryJob, strategy: &str) -> Self {
        Self {
            entry_id: entry_id.to_string(),
            contest_id: job.contest.id.clone(),
            profile_id: job.profile.id.clone(),
            strategy: strategy.to_string(),
            started: Instant::now(),
            confirmation_token: None,
            proof_path: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            instant_win: None,
            challenge_cost: 0.0,
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn contest_id(&self) -> &str {
        &self.contest_id
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn finish(self, status: EntryStatus, failure_kind: Option<FailureKind>) -> EntryResult {
        EntryResult {
            entry_id: self.entry_id,
            contest_id: self.contest_id,
            profile_id: self.profile_id,
            strategy: self.strategy,
            status,
            confirmation_token: self.confirmation_token,
            proof_path: self.proof_path,
            duration_ms: self.started.elapsed().as_millis() as u64,
            errors: self.errors,
            warnings: self.warnings,
            failure_kind: if status == EntryStatus::Failed {
                failure_kind
            } else {
                None
            },
            instant_win: self.instant_win,
            challenge_cost: self.challenge_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::contest::{Contest, ContestType, EntryMethod, ProfileData};

    fn job() -> EntryJob {
        EntryJob::new(
            Contest {
                id: "c-9".into(),
                url: "https://a.test".into(),
                title: None,
                contest_type: ContestType::Sweepstakes,
                entry_method: EntryMethod::Form,
                is_multi_step: false,
            },
            ProfileData {
                id: "p-3".into(),
                ..ProfileData::default()
            },
        )
    }

    #[test]
    fn test_only_step_errors_count_against_domain() {
        let attempt = EntryAttempt::start("e-1", &job(), "simple_form");
        let already = attempt.finish(EntryStatus::Failed, Some(FailureKind::AlreadyEntered));
        assert!(!already.is_domain_failure());

        let attempt = EntryAttempt::start("e-2", &job(), "simple_form");
        let broken = attempt.finish(EntryStatus::Failed, Some(FailureKind::StepError));
        assert!(broken.is_domain_failure());
    }

    #[test]
    fn test_success_drops_failure_kind() {
        let mut attempt = EntryAttempt::start("e-1", &job(), "simple_form");
        attempt.warn("验证重试一次");
        let result = attempt.finish(EntryStatus::Confirmed, Some(FailureKind::StepError));
        assert_eq!(result.failure_kind, None);
        assert_eq!(result.contest_id, "c-9");
        assert_eq!(result.profile_id, "p-3");
        assert_eq!(result.warnings.len(), 1);
    }
}
