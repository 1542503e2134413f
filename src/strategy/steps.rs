//! 各策略共用的步骤

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use crate::challenge::{detect_challenge, inject_token};
use crate::classifier::{Classification, Verdict};
use crate::error::{AppError, AppResult};
use crate::forms::FormAnalysis;
use crate::models::{EntryAttempt, EntryResult, EntryStatus, FailureKind};
use crate::resilience::retry_with_backoff;
use crate::strategy::{EntryContext, StrategyDeps};

impl StrategyDeps {
    /// 导航（带超时）
    pub async fn navigate(&self, session: &dyn BrowserSession, url: &str) -> AppResult<()> {
        match timeout(self.config.navigation_timeout, session.goto(url)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout("navigate", self.config.navigation_timeout)),
        }
    }

    /// 分析 → 填写 → 勾选项
    ///
    /// 勾选项失败只记警告。
    pub async fn prepare_form(
        &self,
        ctx: &EntryContext<'_>,
        attempt: &mut EntryAttempt,
    ) -> AppResult<FormAnalysis> {
        ctx.touch();
        let analysis = self.forms.analyzer.analyze(ctx.session).await?;
        let filled = self
            .forms
            .filler
            .fill(ctx.session, &analysis, &ctx.job.profile)
            .await?;
        debug!(
            "[参赛 {}] 已填写 {}/{} 个字段",
            ctx.entry_id,
            filled,
            analysis.fields.len()
        );

        if let Err(e) = self
            .forms
            .checkboxes
            .handle_optional_checkboxes(ctx.session, &self.config.checkbox_policy)
            .await
        {
            warn!("[参赛 {}] 处理勾选项失败: {}", ctx.entry_id, e);
            attempt.warn(format!("处理勾选项失败: {}", e));
        }
        Ok(analysis)
    }

    /// 检测 → 打码 → 回填，整体包在通用重试里
    ///
    /// 重试过程中的警告写入结果；花费累加到 `challenge_cost`。
    pub async fn solve_challenge(
        &self,
        ctx: &EntryContext<'_>,
        attempt: &mut EntryAttempt,
    ) -> AppResult<()> {
        ctx.touch();
        let session = ctx.session;
        let coordinator = &self.coordinator;

        let retried = retry_with_backoff(&self.config.challenge_retry, "打码", move |_| async move {
            let Some(detection) = detect_challenge(session).await? else {
                return Ok(None);
            };
            let solved = coordinator.solve(&detection).await?;
            inject_token(session, detection.challenge_type, &solved.solution).await?;
            Ok(Some(solved))
        })
        .await;

        attempt.warnings.extend(retried.warnings);
        match retried.result? {
            Some(solved) => {
                attempt.challenge_cost += solved.cost;
                info!(
                    "[参赛 {}] 🔓 验证已通过 ({}, {}ms)",
                    ctx.entry_id, solved.provider, solved.duration_ms
                );
            }
            None => attempt.warn("表单标记了验证，但页面上没有检测到"),
        }
        Ok(())
    }

    /// 点击提交按钮
    pub async fn submit(&self, session: &dyn BrowserSession, analysis: &FormAnalysis) -> AppResult<()> {
        let target = analysis
            .submit_target
            .as_deref()
            .ok_or_else(|| AppError::step("submit", "没有找到提交按钮"))?;
        session.click(target).await
    }

    /// 点击后等待页面稳定，超时不算失败
    pub async fn settle(&self, ctx: &EntryContext<'_>) {
        ctx.touch();
        if let Err(e) = ctx
            .session
            .wait_for_network_idle(self.config.step_settle_timeout)
            .await
        {
            debug!("[参赛 {}] 等待页面稳定超时: {}", ctx.entry_id, e);
        }
    }

    /// 判定当前页面
    pub async fn classify(&self, ctx: &EntryContext<'_>) -> Classification {
        ctx.touch();
        self.classifier.classify(ctx.session, ctx.entry_id).await
    }

    /// 把判定结果写成最终结果
    pub fn conclude(&self, mut attempt: EntryAttempt, classification: Classification) -> EntryResult {
        attempt.warnings.extend(classification.warnings);
        attempt.proof_path = classification.proof_path;
        let entry_id = attempt.entry_id().to_string();

        let result = match classification.verdict {
            Verdict::Success { confirmation_token } => {
                attempt.confirmation_token = confirmation_token;
                attempt.finish(EntryStatus::Confirmed, None)
            }
            Verdict::AlreadyEntered { message } => {
                attempt.error(format!("已经参加过: {}", message));
                attempt.finish(EntryStatus::Failed, Some(FailureKind::AlreadyEntered))
            }
            Verdict::Failure { message } => {
                attempt.error(format!("页面拒绝了提交: {}", message));
                attempt.finish(EntryStatus::Failed, Some(FailureKind::Rejected))
            }
            Verdict::Unmatched if self.classifier.config().assume_success_on_no_match => {
                warn!("[参赛 {}] ⚠️ 页面没有可识别的结果提示，按已提交处理", entry_id);
                attempt.warn("页面没有可识别的结果提示，按已提交处理");
                attempt.finish(EntryStatus::Submitted, None)
            }
            Verdict::Unmatched => {
                attempt.error("页面没有可识别的结果提示");
                attempt.finish(EntryStatus::Failed, Some(FailureKind::StepError))
            }
        };

        info!(
            "[参赛 {}] 结果: {} ({}ms)",
            result.entry_id, result.status, result.duration_ms
        );
        result
    }

    /// 流程出错：记录错误，尽量截图，返回失败结果
    pub async fn fail(&self, ctx: &EntryContext<'_>, mut attempt: EntryAttempt, err: AppError) -> EntryResult {
        warn!("[参赛 {}] ❌ 参赛失败: {}", ctx.entry_id, err);
        attempt.error(err.to_string());

        let mut warnings = Vec::new();
        attempt.proof_path = self
            .classifier
            .capture(ctx.session, ctx.entry_id, "error", &mut warnings)
            .await;
        attempt.warnings.extend(warnings);

        attempt.finish(EntryStatus::Failed, Some(FailureKind::StepError))
    }
}
