//! 提交结果判定
//!
//! 提交后等待页面稳定，按"已参加 → 成功 → 失败"的顺序匹配页面文本，
//! 成功时尝试提取确认号。无论结果如何都会截图留证。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::{Regex, RegexSet};
use tracing::{debug, warn};

use crate::browser::BrowserSession;
use crate::utils::logging::truncate_text;

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub network_idle_timeout: Duration,
    /// 网络空闲后再额外等待的时间
    pub settle_delay: Duration,
    /// 没有任何规则命中时视为"已提交"（否则视为失败）
    pub assume_success_on_no_match: bool,
    pub screenshot_dir: PathBuf,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            network_idle_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
            assume_success_on_no_match: true,
            screenshot_dir: PathBuf::from("screenshots"),
        }
    }
}

/// 判定结果
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    AlreadyEntered { message: String },
    Success { confirmation_token: Option<String> },
    Failure { message: String },
    /// 没有任何规则命中
    Unmatched,
}

/// 判定 + 截图
#[derive(Debug, Clone)]
pub struct Classification {
    pub verdict: Verdict,
    pub proof_path: Option<PathBuf>,
    /// 过程中的非致命问题（等待超时、截图失败）
    pub warnings: Vec<String>,
}

const ALREADY_ENTERED_PATTERNS: &[&str] = &[
    r"(?i)already\s+(been\s+)?entered",
    r"(?i)already\s+(participated|registered|submitted)",
    r"(?i)only\s+(one|1)\s+entry\s+(per|allowed)",
    r"(?i)duplicate\s+entry",
    r"(?i)you\s+have\s+reached\s+the\s+(maximum|max)",
    r"(?i)come\s+back\s+tomorrow",
];

const SUCCESS_PATTERNS: &[&str] = &[
    r"(?i)thank\s*(s|\s+you)\s+(for\s+)?(your\s+)?(entry|entering|participating|submission)",
    r"(?i)(your\s+)?entry\s+(has\s+been\s+)?(received|confirmed|submitted|recorded)",
    r"(?i)successfully\s+(entered|submitted|registered)",
    r"(?i)you('re|\s+are)\s+(now\s+)?entered",
    r"(?i)good\s+luck",
    r"(?i)^\s*thank\s+you[.!]?\s*$",
];

const FAILURE_PATTERNS: &[&str] = &[
    r"(?i)(an\s+)?error\s+(has\s+)?occurred",
    r"(?i)something\s+went\s+wrong",
    r"(?i)(not\s+|in)eligible",
    r"(?i)invalid\s+(email|entry|input|submission)",
    r"(?i)(required|missing)\s+field",
    r"(?i)please\s+(try\s+again|correct)",
    r"(?i)(promotion|contest|sweepstakes)\s+(has\s+)?(ended|closed|expired)",
];

/// 确认号提取规则，按顺序尝试，第一个捕获组为确认号
const TOKEN_PATTERNS: &[&str] = &[
    r"(?i)confirmation\s*(?:#|no\.?|number|code)?\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{3,})",
    r"(?i)entry\s*(?:#|no\.?|number|id)\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{3,})",
    r"(?i)reference\s*(?:#|no\.?|number|code)?\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{3,})",
    r"(?i)ticket\s*(?:#|no\.?|number)\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{3,})",
];

struct Patterns {
    already_entered: RegexSet,
    success: RegexSet,
    failure: RegexSet,
    tokens: Vec<Regex>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        already_entered: build_set(ALREADY_ENTERED_PATTERNS),
        success: build_set(&with_multiline(SUCCESS_PATTERNS)),
        failure: build_set(FAILURE_PATTERNS),
        tokens: TOKEN_PATTERNS.iter().filter_map(|p| Regex::new(p).ok()).collect(),
    })
}

fn with_multiline(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.replacen("(?i)", "(?im)", 1)).collect()
}

fn build_set<S: AsRef<str>>(patterns: &[S]) -> RegexSet {
    RegexSet::new(patterns).unwrap_or_else(|e| {
        warn!("判定规则编译失败: {}", e);
        RegexSet::empty()
    })
}

/// 纯文本判定（不涉及页面）
pub fn classify_text(text: &str) -> Verdict {
    let patterns = patterns();

    if let Some(message) = first_match(&patterns.already_entered, text) {
        return Verdict::AlreadyEntered { message };
    }
    if patterns.success.is_match(text) {
        return Verdict::Success {
            confirmation_token: extract_confirmation_token(text),
        };
    }
    if let Some(message) = first_match(&patterns.failure, text) {
        return Verdict::Failure { message };
    }
    Verdict::Unmatched
}

/// 返回命中规则所在的那一行，作为失败信息
fn first_match(set: &RegexSet, text: &str) -> Option<String> {
    if !set.is_match(text) {
        return None;
    }
    let line = text
        .lines()
        .find(|line| set.is_match(line))
        .unwrap_or(text)
        .trim();
    Some(truncate_text(line, 200))
}

/// 提取确认号
pub fn extract_confirmation_token(text: &str) -> Option<String> {
    // 确认号至少包含一个数字
    patterns().tokens.iter().find_map(|re| {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim_end_matches('-'))
            .find(|token| token.chars().any(|c| c.is_ascii_digit()))
            .map(str::to_string)
    })
}

/// 结果判定器
#[derive(Debug, Clone, Default)]
pub struct ConfirmationClassifier {
    config: ClassifierConfig,
}

impl ConfirmationClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// 判定当前页面
    ///
    /// 等待超时不影响判定；读取文本失败时按空页面处理。
    pub async fn classify(&self, session: &dyn BrowserSession, entry_id: &str) -> Classification {
        let mut warnings = Vec::new();

        if let Err(e) = session
            .wait_for_network_idle(self.config.network_idle_timeout)
            .await
        {
            debug!("[{}] 等待网络空闲失败，继续判定: {}", entry_id, e);
            warnings.push(format!("等待页面稳定超时: {}", e));
        }
        tokio::time::sleep(self.config.settle_delay).await;

        let text = match session.text_content().await {
            Ok(text) => text,
            Err(e) => {
                warnings.push(format!("读取页面文本失败: {}", e));
                String::new()
            }
        };
        let verdict = classify_text(&text);
        debug!("[{}] 判定结果: {:?}", entry_id, verdict);

        let label = match &verdict {
            Verdict::AlreadyEntered { .. } => "already-entered",
            Verdict::Success { .. } => "confirmation",
            Verdict::Failure { .. } => "failure",
            Verdict::Unmatched => "unmatched",
        };
        let proof_path = self.capture(session, entry_id, label, &mut warnings).await;

        Classification {
            verdict,
            proof_path,
            warnings,
        }
    }

    /// 截图到 `{screenshot_dir}/{entry_id}-{label}.png`，失败只记录警告
    pub async fn capture(
        &self,
        session: &dyn BrowserSession,
        entry_id: &str,
        label: &str,
        warnings: &mut Vec<String>,
    ) -> Option<PathBuf> {
        let path = screenshot_path(&self.config.screenshot_dir, entry_id, label);
        match session.screenshot(&path).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("[{}] 截图失败: {}", entry_id, e);
                warnings.push(format!("截图失败: {}", e));
                None
            }
        }
    }
}

pub fn screenshot_path(dir: &Path, entry_id: &str, label: &str) -> PathBuf {
    dir.join(format!("{}-{}.png", entry_id, label))
}
