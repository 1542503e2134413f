//! 分步表单（向导）

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::classifier::Classification;
use crate::error::{AppError, AppResult};
use crate::models::{EntryAttempt, EntryResult};
use crate::strategy::{EntryContext, EntryStrategy, StrategyDeps};

/// 分步表单：每一页都分析、填写；打码失败直接放弃本次参赛
///
/// 页面给出 `next_target` 时点击下一步继续，否则提交。最多前进 `max_steps` 页。
pub struct MultiStepStrategy {
    deps: Arc<StrategyDeps>,
}

impl MultiStepStrategy {
    pub fn new(deps: Arc<StrategyDeps>) -> Self {
        Self { deps }
    }

    async fn run(&self, ctx: &EntryContext<'_>, attempt: &mut EntryAttempt) -> AppResult<Classification> {
        let deps = &self.deps;
        let max_steps = deps.config.max_steps.max(1);
        deps.navigate(ctx.session, &ctx.job.contest.url).await?;

        for step in 1..=max_steps {
            let analysis = deps.prepare_form(ctx, attempt).await?;

            if analysis.has_challenge {
                deps.solve_challenge(ctx, attempt)
                    .await
                    .map_err(|e| AppError::step(format!("challenge@{}", step), e.to_string()))?;
            }

            match analysis.next_target.as_deref() {
                Some(next) => {
                    debug!("[参赛 {}] 第 {} 页完成，进入下一页", ctx.entry_id, step);
                    ctx.session.click(next).await?;
                    deps.settle(ctx).await;
                }
                None => {
                    info!("[参赛 {}] 共 {} 页，提交", ctx.entry_id, step);
                    deps.submit(ctx.session, &analysis).await?;
                    return Ok(deps.classify(ctx).await);
                }
            }
        }

        Err(AppError::step(
            "multi_step",
            format!("超过最大步数 {} 仍未到达提交页", max_steps),
        ))
    }
}

#[async_trait]
impl EntryStrategy for MultiStepStrategy {
    fn name(&self) -> &'static str {
        "multi_step"
    }

    async fn execute(&self, ctx: &EntryContext<'_>) -> EntryResult {
        info!("[参赛 {}] 🧭 分步表单: {}", ctx.entry_id, ctx.job.contest.url);
        let mut attempt = EntryAttempt::start(ctx.entry_id, ctx.job, self.name());
        match self.run(ctx, &mut attempt).await {
            Ok(classification) => self.deps.conclude(attempt, classification),
            Err(e) => self.deps.fail(ctx, attempt, e).await,
        }
    }
}
