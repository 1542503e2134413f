//! 表单处理契约
//!
//! 表单识别、字段映射属于站点相关的启发式逻辑，不在引擎内实现。
//! 引擎只通过这里的三个 trait 调用它们；`ScriptForms` 是一个现成的适配器，
//! 运行运维方提供的 JS 脚本。

pub mod script;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::browser::BrowserSession;
use crate::error::AppResult;
use crate::models::ProfileData;

pub use script::ScriptForms;

/// 表单字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormField {
    pub name: String,
    pub selector: String,
    pub field_type: String,
    pub required: bool,
    /// 对应的资料字段
    pub profile_key: Option<String>,
}

/// 表单分析结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormAnalysis {
    pub fields: Vec<FormField>,
    pub has_challenge: bool,
    /// 提交按钮选择器
    pub submit_target: Option<String>,
    pub is_multi_step: bool,
    /// 分步表单的"下一步"按钮
    pub next_target: Option<String>,
    /// 即开型活动的开始按钮
    pub play_target: Option<String>,
}

/// 可选勾选项的处理策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckboxPolicy {
    /// 同意条款
    pub accept_terms: bool,
    /// 营销邮件
    pub opt_in_marketing: bool,
    /// 第三方合作方
    pub opt_in_partners: bool,
}

impl Default for CheckboxPolicy {
    fn default() -> Self {
        Self {
            accept_terms: true,
            opt_in_marketing: false,
            opt_in_partners: false,
        }
    }
}

#[async_trait]
pub trait FormAnalyzer: Send + Sync {
    async fn analyze(&self, session: &dyn BrowserSession) -> AppResult<FormAnalysis>;
}

#[async_trait]
pub trait FieldFiller: Send + Sync {
    /// 返回实际填写的字段数
    async fn fill(
        &self,
        session: &dyn BrowserSession,
        analysis: &FormAnalysis,
        profile: &ProfileData,
    ) -> AppResult<usize>;
}

#[async_trait]
pub trait CheckboxHandler: Send + Sync {
    /// 返回勾选的数量
    async fn handle_optional_checkboxes(
        &self,
        session: &dyn BrowserSession,
        policy: &CheckboxPolicy,
    ) -> AppResult<usize>;
}

/// 三个表单能力的组合
#[derive(Clone)]
pub struct FormKit {
    pub analyzer: Arc<dyn FormAnalyzer>,
    pub filler: Arc<dyn FieldFiller>,
    pub checkboxes: Arc<dyn CheckboxHandler>,
}

impl FormKit {
    pub fn new(
        analyzer: Arc<dyn FormAnalyzer>,
        filler: Arc<dyn FieldFiller>,
        checkboxes: Arc<dyn CheckboxHandler>,
    ) -> Self {
        Self {
            analyzer,
            filler,
            checkboxes,
        }
    }

    /// 用同一个实现提供全部三种能力
    pub fn from_single<T>(forms: Arc<T>) -> Self
    where
        T: FormAnalyzer + FieldFiller + CheckboxHandler + 'static,
    {
        Self {
            analyzer: forms.clone(),
            filler: forms.clone(),
            checkboxes: forms,
        }
    }
}

impl std::fmt::Debug for FormKit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormKit").finish_non_exhaustive()
    }
}
