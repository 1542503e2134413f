//! 参赛策略
//!
//! 策略是无状态的执行单元，固定的步骤顺序：
//!
//! ```text
//! 导航 → 分析表单 → 填写 → 勾选项 → (打码) → 提交 / 开始游戏 → 判定
//! ```
//!
//! 策略从不向外抛错：内部失败被捕获，尽量截图后返回 `failed` 结果。

pub mod instant_win;
pub mod multi_step;
pub mod selector;
pub mod simple_form;
pub mod steps;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::browser::BrowserSession;
use crate::challenge::ChallengeCoordinator;
use crate::classifier::ConfirmationClassifier;
use crate::events::EventBus;
use crate::forms::{CheckboxPolicy, FormKit};
use crate::models::{EntryJob, EntryResult};
use crate::resilience::RetryPolicy;

pub use instant_win::InstantWinStrategy;
pub use multi_step::MultiStepStrategy;
pub use selector::{select_strategy_kind, StrategyKind, StrategySelector};
pub use simple_form::SimpleFormStrategy;

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub navigation_timeout: Duration,
    /// 分步表单最多前进的页数
    pub max_steps: usize,
    /// 点击"下一步"后等待页面稳定的时间
    pub step_settle_timeout: Duration,
    pub screenshot_dir: PathBuf,
    /// 打码步骤的重试
    pub challenge_retry: RetryPolicy,
    pub checkbox_policy: CheckboxPolicy,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            max_steps: 10,
            step_settle_timeout: Duration::from_secs(10),
            screenshot_dir: PathBuf::from("screenshots"),
            challenge_retry: RetryPolicy::default(),
            checkbox_policy: CheckboxPolicy::default(),
        }
    }
}

fn no_activity() {}

/// 一次参赛的输入
pub struct EntryContext<'a> {
    pub entry_id: &'a str,
    pub job: &'a EntryJob,
    pub session: &'a dyn BrowserSession,
    activity: &'a (dyn Fn() + Send + Sync),
}

impl<'a> EntryContext<'a> {
    pub fn new(entry_id: &'a str, job: &'a EntryJob, session: &'a dyn BrowserSession) -> Self {
        Self {
            entry_id,
            job,
            session,
            activity: &no_activity,
        }
    }

    /// 每一步开始时调用，会话池据此判断会话是否还在使用
    pub fn with_activity(mut self, activity: &'a (dyn Fn() + Send + Sync)) -> Self {
        self.activity = activity;
        self
    }

    pub fn touch(&self) {
        (self.activity)();
    }
}

/// 策略共用的协作者
pub struct StrategyDeps {
    pub config: StrategyConfig,
    pub forms: FormKit,
    pub coordinator: Arc<ChallengeCoordinator>,
    pub classifier: ConfirmationClassifier,
    pub events: EventBus,
}

#[async_trait]
pub trait EntryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 执行一次参赛，总是返回结构化结果
    async fn execute(&self, ctx: &EntryContext<'_>) -> EntryResult;
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::path::Path;
    use std::sync::Arc;

    use serde_json::json;

    use super::{StrategyConfig, StrategyDeps};
    use crate::challenge::{ChallengeCoordinator, CoordinatorConfig};
    use crate::classifier::{ClassifierConfig, ConfirmationClassifier};
    use crate::events::EventBus;
    use crate::forms::FormKit;
    use crate::models::{Contest, ContestType, EntryJob, EntryMethod, ProfileData};
    use crate::testing::{MockProvider, MockSession, StaticForms};

    pub fn deps_with_events(
        dir: &Path,
        forms: Arc<StaticForms>,
        providers: Vec<MockProvider>,
        events: EventBus,
    ) -> Arc<StrategyDeps> {
        let coordinator = Arc::new(ChallengeCoordinator::new(CoordinatorConfig::default(), events.clone()));
        for provider in providers {
            coordinator.register(Arc::new(provider));
        }
        Arc::new(StrategyDeps {
            config: StrategyConfig {
                screenshot_dir: dir.to_path_buf(),
                max_steps: 3,
                ..StrategyConfig::default()
            },
            forms: FormKit::from_single(forms),
            coordinator,
            classifier: ConfirmationClassifier::new(ClassifierConfig {
                screenshot_dir: dir.to_path_buf(),
                ..ClassifierConfig::default()
            }),
            events,
        })
    }

    pub fn deps(dir: &Path, forms: Arc<StaticForms>, providers: Vec<MockProvider>) -> Arc<StrategyDeps> {
        deps_with_events(dir, forms, providers, EventBus::new())
    }

    pub fn job(url: &str) -> EntryJob {
        EntryJob::new(
            Contest {
                id: "c-1".into(),
                url: url.into(),
                title: None,
                contest_type: ContestType::Sweepstakes,
                entry_method: EntryMethod::Form,
                is_multi_step: false,
            },
            ProfileData {
                id: "p-1".into(),
                fields: [("email".to_string(), "a@b.test".to_string())].into(),
            },
        )
    }

    /// 带 reCAPTCHA 且可以回填 token 的页面
    pub fn solvable_page() -> MockSession {
        MockSession::new("")
            .respond(
                "__detectChallenge",
                json!({ "type": "recaptcha_v2", "siteKey": "site", "pageUrl": "https://promo.test" }),
            )
            .respond("__injectChallengeToken", json!(true))
    }
}
