//! 测试替身
//!
//! 内存中的引擎、会话、打码服务和表单实现，单元测试与集成测试共用。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::watch;

use crate::browser::{BrowserSession, EngineFactory, EngineInstance, SessionOptions};
use crate::challenge::ChallengeProvider;
use crate::error::{AppError, AppResult, BrowserError};
use crate::forms::{CheckboxHandler, CheckboxPolicy, FieldFiller, FormAnalysis, FormAnalyzer, FormKit};
use crate::models::ProfileData;

// ========== 会话 ==========

#[derive(Debug, Default)]
struct PageState {
    text: String,
    url: Option<String>,
    responses: Vec<(String, JsonValue)>,
    click_effects: Vec<(String, String)>,
    clicks: Vec<String>,
    visited: Vec<String>,
    screenshots: Vec<PathBuf>,
    evaluated: Vec<String>,
}

/// 内存页面
///
/// `evaluate` 按注册顺序查找脚本中包含的关键字并返回对应的值，找不到时返回 null。
#[derive(Debug, Default)]
pub struct MockSession {
    state: Mutex<PageState>,
    goto_failures: AtomicU32,
    goto_delay: Option<Duration>,
    fail_close: bool,
    network_idle_times_out: bool,
    closed: AtomicBool,
}

impl MockSession {
    pub fn new(text: impl Into<String>) -> Self {
        let session = Self::default();
        session.state.lock().text = text.into();
        session
    }

    pub fn respond(self, needle: impl Into<String>, value: JsonValue) -> Self {
        self.state.lock().responses.push((needle.into(), value));
        self
    }

    /// 点击某个选择器后页面文本变为 `text`
    pub fn on_click(self, selector: impl Into<String>, text: impl Into<String>) -> Self {
        self.state
            .lock()
            .click_effects
            .push((selector.into(), text.into()));
        self
    }

    /// 前 `times` 次导航失败
    pub fn with_goto_failures(self, times: u32) -> Self {
        self.goto_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_goto_delay(mut self, delay: Duration) -> Self {
        self.goto_delay = Some(delay);
        self
    }

    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn with_network_idle_timeout(mut self) -> Self {
        self.network_idle_times_out = true;
        self
    }

    pub fn set_text(&self, text: impl Into<String>) {
        self.state.lock().text = text.into();
    }

    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().clicks.clone()
    }

    pub fn visited(&self) -> Vec<String> {
        self.state.lock().visited.clone()
    }

    pub fn screenshots(&self) -> Vec<PathBuf> {
        self.state.lock().screenshots.clone()
    }

    pub fn evaluated(&self) -> Vec<String> {
        self.state.lock().evaluated.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserSession for MockSession {
    async fn goto(&self, url: &str) -> AppResult<()> {
        if let Some(delay) = self.goto_delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.goto_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.goto_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BrowserError::NavigationFailed {
                url: url.to_string(),
                message: "connection reset".to_string(),
            }
            .into());
        }
        let mut state = self.state.lock();
        state.visited.push(url.to_string());
        state.url = Some(url.to_string());
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> AppResult<JsonValue> {
        let mut state = self.state.lock();
        state.evaluated.push(script.to_string());
        Ok(state
            .responses
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map(|(_, value)| value.clone())
            .unwrap_or(JsonValue::Null))
    }

    async fn click(&self, selector: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        state.clicks.push(selector.to_string());
        let effect = state
            .click_effects
            .iter()
            .find(|(target, _)| target == selector)
            .map(|(_, text)| text.clone());
        if let Some(text) = effect {
            state.text = text;
        }
        Ok(())
    }

    async fn text_content(&self) -> AppResult<String> {
        Ok(self.state.lock().text.clone())
    }

    async fn current_url(&self) -> AppResult<Option<String>> {
        Ok(self.state.lock().url.clone())
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> AppResult<()> {
        if self.network_idle_times_out {
            tokio::time::sleep(timeout).await;
            return Err(AppError::timeout("network_idle", timeout));
        }
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, b"mock-png").await?;
        self.state.lock().screenshots.push(path.to_path_buf());
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(BrowserError::Disconnected.into());
        }
        Ok(())
    }
}

// ========== 引擎 ==========

type SessionBuilder = Arc<dyn Fn() -> MockSession + Send + Sync>;

#[derive(Default)]
struct FactoryShared {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    instances: Mutex<Vec<Arc<MockInstance>>>,
}

/// 内存引擎工厂
pub struct MockEngineFactory {
    shared: Arc<FactoryShared>,
    builder: SessionBuilder,
    launch_delay: Duration,
    fail_launch: AtomicBool,
    launches: AtomicUsize,
}

impl Default for MockEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FactoryShared::default()),
            builder: Arc::new(|| MockSession::new("")),
            launch_delay: Duration::ZERO,
            fail_launch: AtomicBool::new(false),
            launches: AtomicUsize::new(0),
        }
    }

    /// 每个新会话由 `builder` 生成
    pub fn with_session<F>(mut self, builder: F) -> Self
    where
        F: Fn() -> MockSession + Send + Sync + 'static,
    {
        self.builder = Arc::new(builder);
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_failing_session_close(self) -> Self {
        let inner = self.builder.clone();
        self.with_session(move || inner().with_failing_close())
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// 成功启动的实例数
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.shared.sessions.lock().clone()
    }

    pub fn instances(&self) -> Vec<Arc<MockInstance>> {
        self.shared.instances.lock().clone()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn launch(&self) -> AppResult<Arc<dyn EngineInstance>> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(BrowserError::LaunchFailed {
                message: "mock launch failure".to_string(),
            }
            .into());
        }

        let (tx, _rx) = watch::channel(false);
        let instance = Arc::new(MockInstance {
            shared: self.shared.clone(),
            builder: self.builder.clone(),
            disconnect_tx: tx,
            closed: AtomicBool::new(false),
        });
        self.shared.instances.lock().push(instance.clone());
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(instance)
    }
}

/// 内存引擎实例
pub struct MockInstance {
    shared: Arc<FactoryShared>,
    builder: SessionBuilder,
    disconnect_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl MockInstance {
    /// 模拟浏览器崩溃
    pub fn disconnect(&self) {
        self.disconnect_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineInstance for MockInstance {
    async fn new_session(&self, _options: &SessionOptions) -> AppResult<Arc<dyn BrowserSession>> {
        if *self.disconnect_tx.borrow() {
            return Err(BrowserError::Disconnected.into());
        }
        let session = Arc::new((self.builder)());
        self.shared.sessions.lock().push(session.clone());
        Ok(session)
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnect_tx.subscribe()
    }

    async fn close(&self) -> AppResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ========== 打码服务 ==========

/// 可编排的打码服务：前 `failures` 次调用失败，之后返回 `token`
pub struct MockProvider {
    name: String,
    priority: u32,
    token: String,
    failures: u32,
    transient: bool,
    delay: Option<Duration>,
    balance: Option<f64>,
    calls: AtomicU32,
}

impl MockProvider {
    pub fn succeeding(name: &str, priority: u32, token: &str) -> Self {
        Self {
            name: name.to_string(),
            priority,
            token: token.to_string(),
            failures: 0,
            transient: true,
            delay: None,
            balance: Some(10.0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(name: &str, priority: u32, transient: bool) -> Self {
        Self {
            failures: u32::MAX,
            transient,
            ..Self::succeeding(name, priority, "")
        }
    }

    /// 前 `failures` 次瞬时失败
    pub fn flaky(name: &str, priority: u32, failures: u32, token: &str) -> Self {
        Self {
            failures,
            ..Self::succeeding(name, priority, token)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_balance(mut self, balance: Option<f64>) -> Self {
        self.balance = balance;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer(&self) -> AppResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.failures {
            return Err(AppError::provider(
                &self.name,
                format!("第 {} 次调用失败", call + 1),
                self.transient,
            ));
        }
        Ok(self.token.clone())
    }
}

#[async_trait]
impl ChallengeProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn solve_recaptcha_v2(&self, _site_key: &str, _page_url: &str, _invisible: bool) -> AppResult<String> {
        self.answer().await
    }

    async fn solve_recaptcha_v3(&self, _site_key: &str, _page_url: &str, _action: Option<&str>) -> AppResult<String> {
        self.answer().await
    }

    async fn solve_hcaptcha(&self, _site_key: &str, _page_url: &str) -> AppResult<String> {
        self.answer().await
    }

    async fn solve_turnstile(&self, _site_key: &str, _page_url: &str) -> AppResult<String> {
        self.answer().await
    }

    async fn solve_image(&self, _image_base64: &str) -> AppResult<String> {
        self.answer().await
    }

    async fn balance(&self) -> AppResult<f64> {
        self.balance
            .ok_or_else(|| AppError::provider(&self.name, "余额接口不可用", true))
    }
}

// ========== 表单 ==========

/// 固定返回的表单实现
///
/// `analyses` 按调用顺序返回，用完后重复最后一个。
#[derive(Default)]
pub struct StaticForms {
    analyses: Mutex<Vec<FormAnalysis>>,
    analyze_calls: AtomicUsize,
    fill_error: Option<String>,
    filled: Mutex<Vec<String>>,
    checkbox_policies: Mutex<Vec<CheckboxPolicy>>,
}

impl StaticForms {
    pub fn new(analysis: FormAnalysis) -> Self {
        Self::sequence(vec![analysis])
    }

    pub fn sequence(analyses: Vec<FormAnalysis>) -> Self {
        Self {
            analyses: Mutex::new(analyses),
            ..Self::default()
        }
    }

    pub fn with_fill_error(mut self, message: &str) -> Self {
        self.fill_error = Some(message.to_string());
        self
    }

    pub fn kit(self) -> FormKit {
        FormKit::from_single(Arc::new(self))
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    /// 填写过的资料 id
    pub fn filled_profiles(&self) -> Vec<String> {
        self.filled.lock().clone()
    }

    pub fn checkbox_policies(&self) -> Vec<CheckboxPolicy> {
        self.checkbox_policies.lock().clone()
    }
}

#[async_trait]
impl FormAnalyzer for StaticForms {
    async fn analyze(&self, _session: &dyn BrowserSession) -> AppResult<FormAnalysis> {
        let call = self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        let analyses = self.analyses.lock();
        analyses
            .get(call)
            .or_else(|| analyses.last())
            .cloned()
            .ok_or_else(|| AppError::step("analyze", "页面上没有找到表单"))
    }
}

#[async_trait]
impl FieldFiller for StaticForms {
    async fn fill(
        &self,
        _session: &dyn BrowserSession,
        analysis: &FormAnalysis,
        profile: &ProfileData,
    ) -> AppResult<usize> {
        if let Some(message) = &self.fill_error {
            return Err(AppError::step("fill", message.clone()));
        }
        self.filled.lock().push(profile.id.clone());
        Ok(analysis.fields.len())
    }
}

#[async_trait]
impl CheckboxHandler for StaticForms {
    async fn handle_optional_checkboxes(
        &self,
        _session: &dyn BrowserSession,
        policy: &CheckboxPolicy,
    ) -> AppResult<usize> {
        self.checkbox_policies.lock().push(policy.clone());
        Ok(usize::from(policy.accept_terms))
    }
}
