//! 单页表单

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::classifier::Classification;
use crate::error::AppResult;
use crate::models::{EntryAttempt, EntryResult};
use crate::strategy::{EntryContext, EntryStrategy, StrategyDeps};

/// 单页表单：打码失败时仍然尝试提交
pub struct SimpleFormStrategy {
    deps: Arc<StrategyDeps>,
}

impl SimpleFormStrategy {
    pub fn new(deps: Arc<StrategyDeps>) -> Self {
        Self { deps }
    }

    async fn run(&self, ctx: &EntryContext<'_>, attempt: &mut EntryAttempt) -> AppResult<Classification> {
        let deps = &self.deps;
        deps.navigate(ctx.session, &ctx.job.contest.url).await?;
        let analysis = deps.prepare_form(ctx, attempt).await?;

        if analysis.has_challenge {
            if let Err(e) = deps.solve_challenge(ctx, attempt).await {
                warn!("[参赛 {}] 打码失败，继续提交: {}", ctx.entry_id, e);
                attempt.error(format!("打码失败: {}", e));
            }
        }

        deps.submit(ctx.session, &analysis).await?;
        Ok(deps.classify(ctx).await)
    }
}

#[async_trait]
impl EntryStrategy for SimpleFormStrategy {
    fn name(&self) -> &'static str {
        "simple_form"
    }

    async fn execute(&self, ctx: &EntryContext<'_>) -> EntryResult {
        info!("[参赛 {}] 📝 单页表单: {}", ctx.entry_id, ctx.job.contest.url);
        let mut attempt = EntryAttempt::start(ctx.entry_id, ctx.job, self.name());
        match self.run(ctx, &mut attempt).await {
            Ok(classification) => self.deps.conclude(attempt, classification),
            Err(e) => self.deps.fail(ctx, attempt, e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::FormAnalysis;
    use crate::models::{EntryStatus, FailureKind};
    use crate::strategy::tests_support::{deps, job, solvable_page};
    use crate::testing::{MockProvider, MockSession, StaticForms};
    use serde_json::json;

    fn form(has_challenge: bool) -> FormAnalysis {
        FormAnalysis {
            has_challenge,
            submit_target: Some("#submit".into()),
            ..FormAnalysis::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_entry_with_token() {
        let dir = tempfile::tempdir().unwrap();
        let forms = Arc::new(StaticForms::new(form(false)));
        let deps = deps(dir.path(), forms.clone(), vec![]);
        let session = MockSession::new("").on_click("#submit", "Thanks for your entry! Confirmation #A1B2C3");
        let job = job("https://promo.test/enter");

        let ctx = EntryContext::new("e-1", &job, &session);
        let result = SimpleFormStrategy::new(deps).execute(&ctx).await;

        assert_eq!(result.status, EntryStatus::Confirmed);
        assert_eq!(result.confirmation_token.as_deref(), Some("A1B2C3"));
        assert_eq!(result.strategy, "simple_form");
        assert_eq!(session.visited(), vec!["https://promo.test/enter"]);
        assert_eq!(forms.filled_profiles(), vec!["p-1"]);
        assert!(result.proof_path.unwrap().ends_with("e-1-confirmation.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_step_reports_activity() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path(), Arc::new(StaticForms::new(form(false))), vec![]);
        let session = MockSession::new("").on_click("#submit", "Thanks for entering!");
        let job = job("https://promo.test/enter");
        let touches = std::sync::atomic::AtomicUsize::new(0);
        let activity = || {
            touches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        };

        let ctx = EntryContext::new("e-6", &job, &session).with_activity(&activity);
        SimpleFormStrategy::new(deps).execute(&ctx).await;

        // 填表、等待稳定、判定各一次
        assert!(touches.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_failure_still_submits() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(
            dir.path(),
            Arc::new(StaticForms::new(form(true))),
            vec![MockProvider::failing("alpha", 1, false)],
        );
        let session = solvable_page().on_click("#submit", "Good luck!");
        let job = job("https://promo.test/enter");

        let ctx = EntryContext::new("e-2", &job, &session);
        let result = SimpleFormStrategy::new(deps).execute(&ctx).await;

        assert_eq!(session.clicks(), vec!["#submit"]);
        assert_eq!(result.status, EntryStatus::Confirmed);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("打码失败"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_failure_is_captured_as_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path(), Arc::new(StaticForms::new(form(false))), vec![]);
        let session = MockSession::new("").with_goto_failures(1);
        let job = job("https://down.test");

        let ctx = EntryContext::new("e-3", &job, &session);
        let result = SimpleFormStrategy::new(deps).execute(&ctx).await;

        assert_eq!(result.status, EntryStatus::Failed);
        assert_eq!(result.failure_kind, Some(FailureKind::StepError));
        assert!(result.is_domain_failure());
        assert_eq!(session.screenshots(), vec![dir.path().join("e-3-error.png")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_page_is_submitted_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path(), Arc::new(StaticForms::new(form(false))), vec![]);
        let session = MockSession::new("Welcome back");
        let job = job("https://promo.test");

        let ctx = EntryContext::new("e-4", &job, &session);
        let result = SimpleFormStrategy::new(deps).execute(&ctx).await;

        assert_eq!(result.status, EntryStatus::Submitted);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_submit_button_fails() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path(), Arc::new(StaticForms::new(FormAnalysis::default())), vec![]);
        let session = MockSession::new("").respond("__detectChallenge", json!(null));
        let job = job("https://promo.test");

        let ctx = EntryContext::new("e-5", &job, &session);
        let result = SimpleFormStrategy::new(deps).execute(&ctx).await;

        assert_eq!(result.status, EntryStatus::Failed);
        assert!(result.errors[0].contains("提交按钮"));
    }
}
