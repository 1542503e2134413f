//! 基于 chromiumoxide 的引擎实现

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::browser::engine::{BrowserSession, EngineFactory, EngineInstance, SessionOptions};
use crate::error::{AppError, AppResult, BrowserError};
use crate::infrastructure::JsExecutor;

/// 启动方式
#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// 启动本地浏览器进程
    Launch {
        headless: bool,
        executable: Option<PathBuf>,
        args: Vec<String>,
    },
    /// 连接到已经开启调试端口的浏览器
    Connect { debug_url: String },
}

impl Default for LaunchMode {
    fn default() -> Self {
        LaunchMode::Launch {
            headless: true,
            executable: None,
            args: default_args(),
        }
    }
}

fn default_args() -> Vec<String> {
    vec![
        "--disable-gpu".to_string(),             // 无头模式禁用 GPU
        "--no-sandbox".to_string(),              // 容器内没有沙盒权限
        "--disable-dev-shm-usage".to_string(),   // 防止共享内存不足
    ]
}

/// chromiumoxide 引擎工厂
#[derive(Debug, Clone, Default)]
pub struct ChromiumEngineFactory {
    mode: LaunchMode,
}

impl ChromiumEngineFactory {
    pub fn new(mode: LaunchMode) -> Self {
        Self { mode }
    }

    /// 本地启动（常用配置）
    pub fn headless(headless: bool, executable: Option<PathBuf>) -> Self {
        Self::new(LaunchMode::Launch {
            headless,
            executable,
            args: default_args(),
        })
    }

    async fn launch_local(
        &self,
        headless: bool,
        executable: Option<&Path>,
        args: &[String],
    ) -> AppResult<(Browser, chromiumoxide::Handler, Option<PathBuf>)> {
        // 每个实例一个独立的用户目录，多个进程不会争用同一份 profile
        let data_dir = std::env::temp_dir().join(format!("entry-engine-{}", uuid::Uuid::new_v4()));

        let mut builder = BrowserConfig::builder().user_data_dir(&data_dir);
        builder = if headless {
            builder.new_headless_mode()
        } else {
            builder.with_head()
        };
        if let Some(path) = executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.args(args.to_vec()).build().map_err(|e| {
            error!("配置浏览器失败: {}", e);
            BrowserError::LaunchFailed { message: e }
        })?;

        let (browser, handler) = Browser::launch(config).await.map_err(|e| {
            error!("启动浏览器失败: {}", e);
            BrowserError::LaunchFailed {
                message: e.to_string(),
            }
        })?;
        Ok((browser, handler, Some(data_dir)))
    }
}

#[async_trait]
impl EngineFactory for ChromiumEngineFactory {
    async fn launch(&self) -> AppResult<Arc<dyn EngineInstance>> {
        let (browser, mut handler, data_dir) = match &self.mode {
            LaunchMode::Launch {
                headless,
                executable,
                args,
            } => {
                info!("🚀 启动浏览器实例 (headless: {})", headless);
                self.launch_local(*headless, executable.as_deref(), args).await?
            }
            LaunchMode::Connect { debug_url } => {
                info!("正在连接到浏览器: {}", debug_url);
                let (browser, handler) = Browser::connect(debug_url).await.map_err(|e| {
                    error!("连接浏览器失败: {}", e);
                    BrowserError::LaunchFailed {
                        message: e.to_string(),
                    }
                })?;
                (browser, handler, None)
            }
        };

        let (tx, rx) = watch::channel(false);

        // 在后台处理浏览器事件，事件流结束即视为断开
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("浏览器事件处理出错: {}", e);
                }
            }
            warn!("浏览器事件流结束，实例已断开");
            let _ = tx.send(true);
        });

        // 等待浏览器状态同步
        sleep(Duration::from_millis(300)).await;

        let owns_process = matches!(self.mode, LaunchMode::Launch { .. });
        Ok(Arc::new(ChromiumInstance {
            browser: Arc::new(Mutex::new(browser)),
            disconnected: rx,
            data_dir,
            owns_process,
            closed: AtomicBool::new(false),
        }))
    }
}

/// 一个浏览器进程
pub struct ChromiumInstance {
    browser: Arc<Mutex<Browser>>,
    disconnected: watch::Receiver<bool>,
    data_dir: Option<PathBuf>,
    owns_process: bool,
    closed: AtomicBool,
}

#[async_trait]
impl EngineInstance for ChromiumInstance {
    async fn new_session(&self, options: &SessionOptions) -> AppResult<Arc<dyn BrowserSession>> {
        if *self.disconnected.borrow() {
            return Err(BrowserError::Disconnected.into());
        }

        let session_err = |e: String| {
            AppError::Browser(BrowserError::SessionCreationFailed { message: e })
        };

        // 每个会话独立的浏览器上下文：cookie / storage 互不可见
        let (page, context_id) = {
            let mut browser = self.browser.lock().await;
            let context_id = browser
                .create_browser_context(CreateBrowserContextParams::default())
                .await
                .map_err(|e| session_err(e.to_string()))?;
            let params = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(session_err)?;
            let page = browser
                .new_page(params)
                .await
                .map_err(|e| session_err(e.to_string()))?;
            (page, context_id)
        };

        if let Some(user_agent) = &options.user_agent {
            page.set_user_agent(user_agent.as_str()).await?;
        }
        if let Some((width, height)) = options.viewport {
            page.execute(SetDeviceMetricsOverrideParams::new(
                width as i64,
                height as i64,
                1.0,
                false,
            ))
            .await?;
        }
        for script in &options.init_scripts {
            page.evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
                .await?;
        }

        debug!("创建会话成功，已注入 {} 个初始化脚本", options.init_scripts.len());
        Ok(Arc::new(ChromiumSession {
            executor: JsExecutor::new(page),
            context_id,
            browser: self.browser.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.clone()
    }

    async fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.owns_process {
            let mut browser = self.browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!("关闭浏览器失败: {}", e);
            }
            let _ = browser.wait().await;
        }

        if let Some(dir) = &self.data_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                debug!("清理用户目录失败 {}: {}", dir.display(), e);
            }
        }
        Ok(())
    }
}

/// 一个浏览器上下文中的页面
pub struct ChromiumSession {
    executor: JsExecutor,
    context_id: BrowserContextId,
    browser: Arc<Mutex<Browser>>,
    closed: AtomicBool,
}

#[derive(Deserialize)]
struct LoadProbe {
    ready: String,
    resources: u64,
}

const LOAD_PROBE_SCRIPT: &str = r#"
(() => ({
    ready: document.readyState,
    resources: performance.getEntriesByType('resource').length
}))()
"#;

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn goto(&self, url: &str) -> AppResult<()> {
        self.executor.page().goto(url).await.map_err(|e| {
            error!("导航到 {} 失败: {}", url, e);
            BrowserError::NavigationFailed {
                url: url.to_string(),
                message: e.to_string(),
            }
        })?;
        debug!("已导航到: {}", url);
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> AppResult<JsonValue> {
        self.executor.eval(script).await
    }

    async fn click(&self, selector: &str) -> AppResult<()> {
        let element = self
            .executor
            .page()
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound {
                selector: selector.to_string(),
            })?;
        element.click().await?;
        Ok(())
    }

    async fn text_content(&self) -> AppResult<String> {
        self.executor
            .eval_as::<Option<String>>("document.body ? document.body.innerText : ''")
            .await
            .map(|text| text.unwrap_or_default())
    }

    async fn current_url(&self) -> AppResult<Option<String>> {
        Ok(self.executor.page().url().await?)
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> AppResult<()> {
        // 页面加载完成且资源数量在 500ms 内不再变化即视为空闲
        let deadline = Instant::now() + timeout;
        let quiet_window = Duration::from_millis(500);
        let mut last_count = None;
        let mut quiet_since = Instant::now();

        loop {
            if Instant::now() >= deadline {
                return Err(AppError::timeout("network_idle", timeout));
            }

            if let Ok(probe) = self.executor.eval_as::<LoadProbe>(LOAD_PROBE_SCRIPT).await {
                if last_count != Some(probe.resources) {
                    last_count = Some(probe.resources);
                    quiet_since = Instant::now();
                } else if probe.ready == "complete" && quiet_since.elapsed() >= quiet_window {
                    return Ok(());
                }
            }
            sleep(Duration::from_millis(250)).await;
        }
    }

    async fn screenshot(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.executor
            .page()
            .save_screenshot(ScreenshotParams::builder().full_page(true).build(), path)
            .await
            .map_err(|e| BrowserError::ScreenshotFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let page_result = self.executor.page().clone().close().await;
        let browser = self.browser.lock().await;
        let context_result = browser.dispose_browser_context(self.context_id.clone()).await;

        page_result?;
        context_result?;
        Ok(())
    }
}
