use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 活动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestType {
    /// 抽奖
    #[default]
    Sweepstakes,
    /// 即开型（刮刮乐 / 转盘）
    InstantWin,
    /// 赠品活动
    Giveaway,
    /// 作品评选类比赛
    Contest,
    Other,
}

impl ContestType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContestType::Sweepstakes => "sweepstakes",
            ContestType::InstantWin => "instant_win",
            ContestType::Giveaway => "giveaway",
            ContestType::Contest => "contest",
            ContestType::Other => "other",
        }
    }
}

impl fmt::Display for ContestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 参与方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMethod {
    /// 普通表单
    #[default]
    Form,
    /// 只留邮箱
    Email,
    /// 分步向导
    Wizard,
    /// 小游戏
    Game,
    Other,
}

impl EntryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryMethod::Form => "form",
            EntryMethod::Email => "email",
            EntryMethod::Wizard => "wizard",
            EntryMethod::Game => "game",
            EntryMethod::Other => "other",
        }
    }
}

impl fmt::Display for EntryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 活动
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contest {
    pub id: String,
    /// 参赛页面
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub contest_type: ContestType,
    #[serde(default)]
    pub entry_method: EntryMethod,
    /// 发现阶段判断出的分步表单
    #[serde(default)]
    pub is_multi_step: bool,
}

/// 用户资料（字段名 → 值），字段含义由外部的填表实现解释
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileData {
    pub id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl ProfileData {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// 一次参赛任务的载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryJob {
    /// 为空时自动生成
    #[serde(default)]
    pub entry_id: Option<String>,
    pub contest: Contest,
    pub profile: ProfileData,

    /// 来源文件（批量运行时使用）
    #[serde(skip)]
    pub file_path: Option<String>,
}

impl EntryJob {
    pub fn new(contest: Contest, profile: ProfileData) -> Self {
        Self {
            entry_id: None,
            contest,
            profile,
            file_path: None,
        }
    }

    /// 保证有 entry_id
    pub fn ensure_entry_id(&mut self) -> &str {
        self.entry_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_job_parses_from_toml_with_defaults() {
        let job: EntryJob = toml::from_str(
            r#"
            [contest]
            id = "c-1"
            url = "https://promo.example.com/win"
            contest_type = "instant_win"

            [profile]
            id = "p-1"
            [profile.fields]
            email = "a@example.com"
            "#,
        )
        .unwrap();

        assert_eq!(job.contest.contest_type, ContestType::InstantWin);
        assert_eq!(job.contest.entry_method, EntryMethod::Form);
        assert!(!job.contest.is_multi_step);
        assert_eq!(job.profile.get("email"), Some("a@example.com"));
        assert!(job.entry_id.is_none());
    }

    #[test]
    fn test_ensure_entry_id_is_stable() {
        let mut job = EntryJob::new(
            Contest {
                id: "c".into(),
                url: "https://a.test".into(),
                title: None,
                contest_type: ContestType::default(),
                entry_method: EntryMethod::default(),
                is_multi_step: false,
            },
            ProfileData::default(),
        );
        let first = job.ensure_entry_id().to_string();
        assert_eq!(job.ensure_entry_id(), first);
    }
}
