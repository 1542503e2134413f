//! JS 执行器 - 基础设施层
//!
//! 持有唯一的 page 资源，只暴露"执行 JS"的能力

use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult, BrowserError};

/// JS 执行器
///
/// 职责：
/// - 持有唯一的 Page 资源
/// - 暴露 eval() 能力
/// - 不认识比赛 / 用户资料
/// - 不处理参赛流程
pub struct JsExecutor {
    page: Page,
}

impl JsExecutor {
    /// 创建新的 JS 执行器
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// 获取 page 的引用（用于导航、点击、截图等操作）
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// 执行 JS 代码并返回 JSON 结果
    pub async fn eval(&self, js_code: impl Into<String>) -> AppResult<JsonValue> {
        let result = self.page.evaluate(js_code.into()).await.map_err(|e| {
            AppError::Browser(BrowserError::ScriptExecutionFailed {
                message: e.to_string(),
            })
        })?;
        // 脚本没有返回值时 into_value 会失败，统一视为 null
        Ok(result.into_value().unwrap_or(JsonValue::Null))
    }

    /// 执行 JS 代码并反序列化为指定类型
    pub async fn eval_as<T: DeserializeOwned>(&self, js_code: impl Into<String>) -> AppResult<T> {
        let json_value = self.eval(js_code).await?;
        let typed_value = serde_json::from_value(json_value)?;
        Ok(typed_value)
    }
}

/// 把一段函数源码和 JSON 参数拼成立即执行的表达式
///
/// `function_src` 必须是一个函数表达式，例如 `async (args) => { ... }`。
pub fn js_call(function_src: &str, args: &JsonValue) -> AppResult<String> {
    let args_json = serde_json::to_string(args)?;
    Ok(format!("({})({})", function_src.trim(), args_json))
}
