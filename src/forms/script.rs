//! 脚本驱动的表单适配器
//!
//! 目录里放三个文件，每个文件是一个函数表达式，接收一个 JSON 参数：
//! - `analyze.js`：`() => FormAnalysis`
//! - `fill.js`：`({ analysis, profile }) => 填写数量`
//! - `checkboxes.js`：`(policy) => 勾选数量`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::browser::BrowserSession;
use crate::error::{AppError, AppResult};
use crate::forms::{CheckboxHandler, CheckboxPolicy, FieldFiller, FormAnalysis, FormAnalyzer};
use crate::infrastructure::js_call;
use crate::models::ProfileData;

const ANALYZE_FILE: &str = "analyze.js";
const FILL_FILE: &str = "fill.js";
const CHECKBOXES_FILE: &str = "checkboxes.js";

#[derive(Debug, Clone)]
pub struct ScriptForms {
    analyze_src: String,
    fill_src: String,
    checkboxes_src: String,
}

impl ScriptForms {
    pub fn new(
        analyze_src: impl Into<String>,
        fill_src: impl Into<String>,
        checkboxes_src: impl Into<String>,
    ) -> Self {
        Self {
            analyze_src: analyze_src.into(),
            fill_src: fill_src.into(),
            checkboxes_src: checkboxes_src.into(),
        }
    }

    /// 从目录加载三个脚本
    pub async fn load(dir: impl AsRef<Path>) -> AppResult<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| -> PathBuf { dir.join(name) };

        let analyze_src = read_script(&read(ANALYZE_FILE)).await?;
        let fill_src = read_script(&read(FILL_FILE)).await?;
        let checkboxes_src = read_script(&read(CHECKBOXES_FILE)).await?;

        info!("已加载表单脚本: {}", dir.display());
        Ok(Self::new(analyze_src, fill_src, checkboxes_src))
    }
}

async fn read_script(path: &Path) -> AppResult<String> {
    let src = tokio::fs::read_to_string(path).await?;
    if src.trim().is_empty() {
        return Err(AppError::invalid_config(
            "form_scripts_dir",
            format!("脚本为空: {}", path.display()),
        ));
    }
    Ok(src)
}

fn as_count(step: &str, value: serde_json::Value) -> AppResult<usize> {
    match value {
        serde_json::Value::Null => Ok(0),
        serde_json::Value::Number(n) => Ok(n.as_u64().unwrap_or(0) as usize),
        serde_json::Value::Bool(b) => Ok(usize::from(b)),
        other => Err(AppError::step(step, format!("脚本返回了无法识别的结果: {}", other))),
    }
}

#[async_trait]
impl FormAnalyzer for ScriptForms {
    async fn analyze(&self, session: &dyn BrowserSession) -> AppResult<FormAnalysis> {
        let script = js_call(&self.analyze_src, &json!({}))?;
        let value = session.evaluate(&script).await?;
        if value.is_null() {
            return Err(AppError::step("analyze", "页面上没有找到表单"));
        }
        let analysis: FormAnalysis = serde_json::from_value(value)?;
        debug!(
            "表单分析: {} 个字段, 验证: {}, 分步: {}",
            analysis.fields.len(),
            analysis.has_challenge,
            analysis.is_multi_step
        );
        Ok(analysis)
    }
}

#[async_trait]
impl FieldFiller for ScriptForms {
    async fn fill(
        &self,
        session: &dyn BrowserSession,
        analysis: &FormAnalysis,
        profile: &ProfileData,
    ) -> AppResult<usize> {
        let script = js_call(&self.fill_src, &json!({ "analysis": analysis, "profile": profile }))?;
        as_count("fill", session.evaluate(&script).await?)
    }
}

#[async_trait]
impl CheckboxHandler for ScriptForms {
    async fn handle_optional_checkboxes(
        &self,
        session: &dyn BrowserSession,
        policy: &CheckboxPolicy,
    ) -> AppResult<usize> {
        let script = js_call(&self.checkboxes_src, &json!(policy))?;
        as_count("checkboxes", session.evaluate(&script).await?)
    }
}
