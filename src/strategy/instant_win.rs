//! 即开型活动（刮刮乐、转盘等）

use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::classifier::{Classification, Verdict};
use crate::error::{AppError, AppResult};
use crate::events::EngineEvent;
use crate::models::{EntryAttempt, EntryResult, EntryStatus, InstantWinOutcome};
use crate::strategy::{EntryContext, EntryStrategy, StrategyDeps};
use crate::utils::logging::truncate_text;

struct GamePatterns {
    lose: Option<Regex>,
    win: Option<Regex>,
    prize: Option<Regex>,
}

fn game_patterns() -> &'static GamePatterns {
    static PATTERNS: OnceLock<GamePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| GamePatterns {
        lose: Regex::new(r"(?i)not\s+a\s+winner|better\s+luck|sorry,?\s+you\s+(did\s+not|didn't)\s+win|no\s+prize").ok(),
        win: Regex::new(r"(?i)you(\s+have|'ve)?\s+won|congratulations|instant\s+winner").ok(),
        prize: Regex::new(r"(?i)you(?:\s+have|'ve)?\s+won\s+(?:an?\s+|the\s+)?([^.!\n]+)").ok(),
    })
}

fn matches(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// 从游戏结束后的页面文本判断输赢，判断不出时返回 None
pub fn detect_game_outcome(text: &str) -> Option<InstantWinOutcome> {
    let patterns = game_patterns();
    if matches(&patterns.lose, text) {
        return Some(InstantWinOutcome {
            won: false,
            prize_text: None,
        });
    }
    if matches(&patterns.win, text) {
        let prize_text = patterns
            .prize
            .as_ref()
            .and_then(|re| re.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|m| truncate_text(m.as_str().trim(), 120));
        return Some(InstantWinOutcome {
            won: true,
            prize_text,
        });
    }
    None
}

/// 即开型：先提交报名表（如果有），再点开始游戏；打码失败继续
pub struct InstantWinStrategy {
    deps: Arc<StrategyDeps>,
}

impl InstantWinStrategy {
    pub fn new(deps: Arc<StrategyDeps>) -> Self {
        Self { deps }
    }

    async fn run(&self, ctx: &EntryContext<'_>, attempt: &mut EntryAttempt) -> AppResult<Classification> {
        let deps = &self.deps;
        deps.navigate(ctx.session, &ctx.job.contest.url).await?;
        let analysis = deps.prepare_form(ctx, attempt).await?;

        if analysis.has_challenge {
            if let Err(e) = deps.solve_challenge(ctx, attempt).await {
                warn!("[参赛 {}] 打码失败，继续游戏: {}", ctx.entry_id, e);
                attempt.error(format!("打码失败: {}", e));
            }
        }

        if analysis.submit_target.is_some() {
            deps.submit(ctx.session, &analysis).await?;
            deps.settle(ctx).await;
        }

        match analysis.play_target.as_deref() {
            Some(play) => {
                info!("[参赛 {}] 🎰 开始游戏", ctx.entry_id);
                ctx.session.click(play).await?;
            }
            None if analysis.submit_target.is_some() => {
                attempt.warn("页面上没有游戏按钮，按提交后的页面判定");
            }
            None => return Err(AppError::step("play", "没有找到提交或游戏按钮")),
        }

        Ok(deps.classify(ctx).await)
    }
}

#[async_trait]
impl EntryStrategy for InstantWinStrategy {
    fn name(&self) -> &'static str {
        "instant_win"
    }

    async fn execute(&self, ctx: &EntryContext<'_>) -> EntryResult {
        info!("[参赛 {}] 🎁 即开型活动: {}", ctx.entry_id, ctx.job.contest.url);
        let mut attempt = EntryAttempt::start(ctx.entry_id, ctx.job, self.name());

        let mut classification = match self.run(ctx, &mut attempt).await {
            Ok(classification) => classification,
            Err(e) => return self.deps.fail(ctx, attempt, e).await,
        };

        let text = ctx.session.text_content().await.unwrap_or_default();
        if let Some(outcome) = detect_game_outcome(&text) {
            if outcome.won {
                info!(
                    "[参赛 {}] 🎉 即时中奖: {}",
                    ctx.entry_id,
                    outcome.prize_text.as_deref().unwrap_or("-")
                );
                self.deps.events.emit(EngineEvent::InstantWin {
                    entry_id: ctx.entry_id.to_string(),
                    contest_id: ctx.job.contest.id.clone(),
                    prize_text: outcome.prize_text.clone(),
                });
                // 中奖页面通常没有常规的成功提示
                if classification.verdict == Verdict::Unmatched {
                    classification.verdict = Verdict::Success {
                        confirmation_token: None,
                    };
                }
            }
            attempt.instant_win = Some(outcome);
        }

        let result = self.deps.conclude(attempt, classification);
        if result.status == EntryStatus::Failed {
            warn!("[参赛 {}] 即开型参赛失败", result.entry_id);
        }
        result
    }
}
