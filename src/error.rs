use thiserror::Error;

/// 应用程序错误类型
///
/// 分为两类：
/// - 基础设施错误（会话池、熔断、队列）直接抛给任务层，由任务层决定重试
/// - 策略内部的步骤错误在策略边界被捕获，累积到 `EntryResult.errors`
#[derive(Debug, Error)]
pub enum AppError {
    /// 会话池已满（背压信号，调用方不能静默排队）
    #[error("会话池已满: 活跃实例 {active}/{max}")]
    ResourceExhausted { active: usize, max: usize },

    /// 会话池已销毁
    #[error("会话池已销毁，无法再获取会话")]
    ResourceDestroyed,

    /// 单个打码服务失败
    #[error("打码服务 {provider} 失败: {message}")]
    ProviderFailure {
        provider: String,
        message: String,
        /// 是否为瞬时错误（网络抖动、限流等）
        transient: bool,
    },

    /// 所有打码服务都失败
    #[error("所有打码服务均失败 (共尝试 {attempts} 次), 最后错误: {last_error}")]
    AllProvidersExhausted {
        attempts: usize,
        last_error: String,
        /// 最后一个底层错误是否为瞬时错误
        transient: bool,
    },

    /// 步骤超时（导航 / 打码 / 等待页面稳定）
    #[error("步骤 {step} 超时 ({timeout_ms}ms)")]
    StepTimeout { step: String, timeout_ms: u64 },

    /// 域名熔断中
    #[error("域名 {domain} 熔断中，暂不允许新的尝试")]
    CircuitOpen { domain: String },

    /// 参赛步骤失败（表单 / 提交 / 判定）
    #[error("步骤 {step} 失败: {message}")]
    EntryStepFailure { step: String, message: String },

    /// 浏览器相关错误
    #[error("浏览器错误: {0}")]
    Browser(#[from] BrowserError),

    /// 任务队列错误
    #[error("任务队列错误: {message}")]
    Broker { message: String, transient: bool },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// JSON 解析失败
    #[error("JSON解析失败: {0}")]
    Json(#[from] serde_json::Error),

    /// 文件读写失败
    #[error("文件错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 浏览器相关错误
#[derive(Debug, Error)]
pub enum BrowserError {
    /// 启动浏览器失败
    #[error("启动浏览器实例失败: {message}")]
    LaunchFailed { message: String },

    /// 创建会话失败
    #[error("创建会话失败: {message}")]
    SessionCreationFailed { message: String },

    /// 导航失败
    #[error("导航到 {url} 失败: {message}")]
    NavigationFailed { url: String, message: String },

    /// 执行脚本失败
    #[error("执行脚本失败: {message}")]
    ScriptExecutionFailed { message: String },

    /// 元素不存在
    #[error("找不到元素: {selector}")]
    ElementNotFound { selector: String },

    /// 截图失败
    #[error("截图失败: {message}")]
    ScreenshotFailed { message: String },

    /// 浏览器实例已断开
    #[error("浏览器实例已断开")]
    Disconnected,
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置值非法
    #[error("配置项 {field} 非法: {reason}")]
    Invalid { field: String, reason: String },

    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {message}")]
    TomlParseFailed { path: String, message: String },
}

// ========== 从常见错误类型转换 ==========

impl From<chromiumoxide::error::CdpError> for AppError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        AppError::Browser(BrowserError::ScriptExecutionFailed {
            message: err.to_string(),
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建步骤失败错误
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::EntryStepFailure {
            step: step.into(),
            message: message.into(),
        }
    }

    /// 创建步骤超时错误
    pub fn timeout(step: impl Into<String>, timeout: std::time::Duration) -> Self {
        AppError::StepTimeout {
            step: step.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// 创建打码服务错误
    pub fn provider(provider: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        AppError::ProviderFailure {
            provider: provider.into(),
            message: message.into(),
            transient,
        }
    }

    /// 创建队列错误
    pub fn broker(message: impl Into<String>, transient: bool) -> Self {
        AppError::Broker {
            message: message.into(),
            transient,
        }
    }

    /// 创建配置非法错误
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::ProviderFailure { transient, .. }
            | AppError::AllProvidersExhausted { transient, .. }
            | AppError::Broker { transient, .. } => *transient,
            AppError::StepTimeout { .. } => true,
            AppError::Browser(BrowserError::NavigationFailed { .. }) => true,
            _ => false,
        }
    }

    /// 是否为基础设施级错误（需要抛给任务层）
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AppError::ResourceExhausted { .. }
                | AppError::ResourceDestroyed
                | AppError::CircuitOpen { .. }
                | AppError::Broker { .. }
        )
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
