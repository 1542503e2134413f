//! 策略选择
//!
//! 固定的优先级规则：
//! 1. 即开型活动 → instant_win（与参与方式无关）
//! 2. 分步表单 → multi_step
//! 3. 按参与方式查表
//! 4. 按活动类型查表
//! 5. 默认 simple_form

use std::sync::Arc;

use serde::Serialize;

use crate::models::{Contest, ContestType, EntryMethod};
use crate::strategy::{EntryStrategy, InstantWinStrategy, MultiStepStrategy, SimpleFormStrategy, StrategyDeps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SimpleForm,
    MultiStep,
    InstantWin,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::SimpleForm => "simple_form",
            StrategyKind::MultiStep => "multi_step",
            StrategyKind::InstantWin => "instant_win",
        }
    }
}

/// 参与方式 → 策略
static METHOD_STRATEGIES: phf::Map<&'static str, StrategyKind> = phf::phf_map! {
    "email" => StrategyKind::SimpleForm,
    "wizard" => StrategyKind::MultiStep,
    "game" => StrategyKind::InstantWin,
};

/// 活动类型 → 策略
static TYPE_STRATEGIES: phf::Map<&'static str, StrategyKind> = phf::phf_map! {
    "sweepstakes" => StrategyKind::SimpleForm,
    "giveaway" => StrategyKind::SimpleForm,
    "contest" => StrategyKind::MultiStep,
};

pub fn select_strategy_kind(contest_type: ContestType, entry_method: EntryMethod, is_multi_step: bool) -> StrategyKind {
    if contest_type == ContestType::InstantWin {
        return StrategyKind::InstantWin;
    }
    if is_multi_step {
        return StrategyKind::MultiStep;
    }
    if let Some(kind) = METHOD_STRATEGIES.get(entry_method.as_str()) {
        return *kind;
    }
    if let Some(kind) = TYPE_STRATEGIES.get(contest_type.as_str()) {
        return *kind;
    }
    StrategyKind::SimpleForm
}

/// 持有三个策略实例
pub struct StrategySelector {
    simple_form: Arc<dyn EntryStrategy>,
    multi_step: Arc<dyn EntryStrategy>,
    instant_win: Arc<dyn EntryStrategy>,
}

impl StrategySelector {
    pub fn new(deps: Arc<StrategyDeps>) -> Self {
        Self {
            simple_form: Arc::new(SimpleFormStrategy::new(deps.clone())),
            multi_step: Arc::new(MultiStepStrategy::new(deps.clone())),
            instant_win: Arc::new(InstantWinStrategy::new(deps)),
        }
    }

    pub fn get(&self, kind: StrategyKind) -> Arc<dyn EntryStrategy> {
        match kind {
            StrategyKind::SimpleForm => self.simple_form.clone(),
            StrategyKind::MultiStep => self.multi_step.clone(),
            StrategyKind::InstantWin => self.instant_win.clone(),
        }
    }

    pub fn select(&self, contest: &Contest) -> Arc<dyn EntryStrategy> {
        self.get(select_strategy_kind(
            contest.contest_type,
            contest.entry_method,
            contest.is_multi_step,
        ))
    }
}
