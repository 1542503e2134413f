//! 自动化引擎契约
//!
//! 会话池只依赖这里的三个 trait：工厂启动实例，实例创建会话，会话执行页面操作。
//! 具体注入什么反检测脚本由调用方通过 `SessionOptions.init_scripts` 决定，引擎不关心内容。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::watch;

use crate::error::AppResult;

/// 会话创建参数
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// 每个新文档加载前执行的脚本
    pub init_scripts: Vec<String>,
    /// 覆盖 User-Agent
    pub user_agent: Option<String>,
    /// 视口大小 (宽, 高)
    pub viewport: Option<(u32, u32)>,
}

/// 引擎工厂
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// 启动一个新的引擎实例
    async fn launch(&self) -> AppResult<Arc<dyn EngineInstance>>;
}

/// 引擎实例（一个浏览器进程）
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// 创建一个隔离的会话
    async fn new_session(&self, options: &SessionOptions) -> AppResult<Arc<dyn BrowserSession>>;

    /// 断开通知：值变为 true 表示实例已经不可用
    fn disconnected(&self) -> watch::Receiver<bool>;

    /// 关闭实例
    async fn close(&self) -> AppResult<()>;
}

/// 一个隔离的浏览器会话（单次使用）
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// 导航到指定 URL（超时由调用方控制）
    async fn goto(&self, url: &str) -> AppResult<()>;

    /// 执行 JS 表达式并返回 JSON 结果
    async fn evaluate(&self, script: &str) -> AppResult<JsonValue>;

    /// 点击元素
    async fn click(&self, selector: &str) -> AppResult<()>;

    /// 页面可见文本
    async fn text_content(&self) -> AppResult<String>;

    /// 当前 URL
    async fn current_url(&self) -> AppResult<Option<String>>;

    /// 等待网络空闲，超时返回 `StepTimeout`
    async fn wait_for_network_idle(&self, timeout: Duration) -> AppResult<()>;

    /// 整页截图
    async fn screenshot(&self, path: &Path) -> AppResult<()>;

    /// 关闭会话（重复调用无副作用）
    async fn close(&self) -> AppResult<()>;
}
