//! 参赛处理流程 - 流程层
//!
//! 核心职责：定义"一次参赛"的完整处理流程
//!
//! 流程顺序：
//! 1. 熔断器按域名放行（熔断中直接抛出 `CircuitOpen`，由队列退避重试）
//! 2. 从会话池租用会话（池满抛出 `ResourceExhausted`）
//! 3. 选择策略并执行，策略自己兜底所有步骤错误
//! 4. 无论结果如何都交还会话，再把结果记入熔断器

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{EntryJob, EntryResult, EntryStatus, FailureKind};
use crate::pool::SessionPool;
use crate::queue::{Job, JobHandler};
use crate::resilience::CircuitBreaker;
use crate::strategy::{EntryContext, StrategySelector};
use crate::workflow::entry_ctx::EntryCtx;

/// 参赛统计（按尝试计数，和队列的保留数量无关）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntryStats {
    pub confirmed: usize,
    pub submitted: usize,
    pub failed: usize,
    pub already_entered: usize,
    /// 熔断拦下的尝试
    pub circuit_open: usize,
    /// 租用会话等基础设施错误
    pub infrastructure_errors: usize,
    pub instant_wins: usize,
    pub challenge_cost: f64,
}

impl EntryStats {
    fn record(&mut self, result: &EntryResult) {
        match result.status {
            EntryStatus::Confirmed => self.confirmed += 1,
            EntryStatus::Submitted => self.submitted += 1,
            EntryStatus::Failed => self.failed += 1,
        }
        if result.failure_kind == Some(FailureKind::AlreadyEntered) {
            self.already_entered += 1;
        }
        if result.instant_win.as_ref().is_some_and(|w| w.won) {
            self.instant_wins += 1;
        }
        self.challenge_cost += result.challenge_cost;
    }
}

/// 参赛处理流程
///
/// - 不创建任何资源，会话池和熔断器由引擎上下文注入
/// - 保证租用的会话在每条退出路径上都被交还
pub struct EntryFlow {
    pool: Arc<SessionPool>,
    breaker: Arc<CircuitBreaker>,
    selector: Arc<StrategySelector>,
    stats: Mutex<EntryStats>,
}

impl EntryFlow {
    pub fn new(pool: Arc<SessionPool>, breaker: Arc<CircuitBreaker>, selector: Arc<StrategySelector>) -> Self {
        Self {
            pool,
            breaker,
            selector,
            stats: Mutex::new(EntryStats::default()),
        }
    }

    pub fn stats(&self) -> EntryStats {
        self.stats.lock().clone()
    }

    pub async fn run(&self, ctx: &EntryCtx, job: &EntryJob) -> AppResult<EntryResult> {
        if !self.breaker.can_execute(&ctx.domain) {
            warn!("{} ⚠️ 域名熔断中，跳过本次尝试", ctx);
            self.stats.lock().circuit_open += 1;
            return Err(AppError::CircuitOpen {
                domain: ctx.domain.clone(),
            });
        }

        let lease = match self.pool.acquire(None).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("{} ⚠️ 无法租用会话: {}", ctx, e);
                self.breaker.abandon_trial(&ctx.domain);
                self.stats.lock().infrastructure_errors += 1;
                return Err(e);
            }
        };

        let strategy = self.selector.select(&job.contest);
        info!("{} 🚀 开始参赛，策略 {}，会话 {}", ctx, strategy.name(), lease.id());

        let pool = self.pool.clone();
        let session_id = lease.id();
        let activity = move || pool.touch(session_id);
        let entry_ctx = EntryContext::new(&ctx.entry_id, job, lease.session()).with_activity(&activity);
        let outcome = AssertUnwindSafe(strategy.execute(&entry_ctx)).catch_unwind().await;
        self.pool.release(lease.id()).await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                error!("{} ❌ 策略执行 panic", ctx);
                self.breaker.record_failure(&ctx.domain);
                self.stats.lock().infrastructure_errors += 1;
                return Err(AppError::step(strategy.name(), "策略执行 panic"));
            }
        };

        if result.is_domain_failure() {
            self.breaker.record_failure(&ctx.domain);
        } else {
            self.breaker.record_success(&ctx.domain);
        }
        self.stats.lock().record(&result);

        match result.status {
            EntryStatus::Failed => warn!(
                "{} ❌ 参赛失败（{}ms）: {}",
                ctx,
                result.duration_ms,
                result.errors.join("; ")
            ),
            status => info!(
                "{} ✓ 参赛结束: {}（{}ms，确认号 {}）",
                ctx,
                status,
                result.duration_ms,
                result.confirmation_token.as_deref().unwrap_or("-")
            ),
        }
        Ok(result)
    }
}

#[async_trait]
impl JobHandler for EntryFlow {
    async fn handle(&self, job: &Job) -> AppResult<JsonValue> {
        let entry: EntryJob = serde_json::from_value(job.payload.clone())?;
        let ctx = EntryCtx::new(job, &entry);
        let result = self.run(&ctx, &entry).await?;
        Ok(serde_json::to_value(result)?)
    }
}
