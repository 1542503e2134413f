use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::challenge::CoordinatorConfig;
use crate::classifier::ClassifierConfig;
use crate::error::{AppError, AppResult, ConfigError};
use crate::forms::CheckboxPolicy;
use crate::pool::PoolConfig;
use crate::queue::GatewayConfig;
use crate::resilience::{CircuitBreakerConfig, RateLimit, RetryPolicy};
use crate::strategy::StrategyConfig;

/// 程序配置文件
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- 会话池 ---
    /// 浏览器实例上限
    pub max_browser_instances: usize,
    /// 单个实例上的会话上限
    pub max_sessions_per_instance: usize,
    /// 会话闲置超时（秒），仅用于兜底清理泄漏
    pub session_idle_timeout_secs: u64,
    /// 闲置扫描间隔（秒）
    pub session_sweep_interval_secs: u64,
    /// 是否无头模式
    pub headless: bool,
    /// 浏览器可执行文件路径
    pub chrome_executable: Option<String>,

    // --- 任务队列 ---
    /// 参赛任务并发数（会被会话池容量截断）
    pub entry_concurrency: usize,
    /// 发现任务并发数
    pub discovery_concurrency: usize,
    /// 发现任务限流：窗口内最大数量
    pub discovery_rate_max: usize,
    /// 发现任务限流：窗口长度（秒）
    pub discovery_rate_window_secs: u64,
    /// 队列探活超时（秒）
    pub broker_probe_timeout_secs: u64,
    /// 任务最大尝试次数
    pub job_attempts: u32,
    /// 指数退避起始值（毫秒）
    pub job_backoff_ms: u64,
    /// 保留的已完成任务数
    pub keep_completed_jobs: usize,
    /// 保留的失败任务数
    pub keep_failed_jobs: usize,
    /// 任务处理锁有效期（秒）
    pub job_lock_ttl_secs: u64,

    // --- 熔断器 ---
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout_secs: u64,
    pub breaker_half_open_successes: u32,

    // --- 打码 ---
    pub captcha_solve_timeout_secs: u64,
    pub captcha_max_provider_retries: usize,
    /// 显式的服务优先级（为空时按服务自身优先级排序）
    pub captcha_provider_priority: Vec<String>,
    /// 打码步骤的重试次数（通用重试包装）
    pub captcha_step_attempts: u32,

    // --- 参赛策略 ---
    pub navigation_timeout_secs: u64,
    pub max_form_steps: usize,
    pub accept_terms: bool,
    pub opt_in_marketing: bool,
    pub opt_in_partners: bool,
    /// 表单脚本目录（analyze.js / fill.js / checkboxes.js）
    pub form_scripts_dir: String,

    // --- 结果判定 ---
    pub network_idle_timeout_secs: u64,
    pub settle_delay_ms: u64,
    /// 没有任何规则命中时是否视为已提交
    pub assume_success_on_no_match: bool,
    pub screenshot_dir: String,

    // --- 批量运行 ---
    /// 参赛任务 TOML 文件目录
    pub jobs_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_browser_instances: 3,
            max_sessions_per_instance: 4,
            session_idle_timeout_secs: 300,
            session_sweep_interval_secs: 60,
            headless: true,
            chrome_executable: None,
            entry_concurrency: 6,
            discovery_concurrency: 2,
            discovery_rate_max: 10,
            discovery_rate_window_secs: 60,
            broker_probe_timeout_secs: 3,
            job_attempts: 3,
            job_backoff_ms: 5000,
            keep_completed_jobs: 100,
            keep_failed_jobs: 500,
            job_lock_ttl_secs: 30,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_secs: 300,
            breaker_half_open_successes: 2,
            captcha_solve_timeout_secs: 120,
            captcha_max_provider_retries: 3,
            captcha_provider_priority: Vec::new(),
            captcha_step_attempts: 3,
            navigation_timeout_secs: 30,
            max_form_steps: 10,
            accept_terms: true,
            opt_in_marketing: false,
            opt_in_partners: false,
            form_scripts_dir: "form_scripts".to_string(),
            network_idle_timeout_secs: 10,
            settle_delay_ms: 2000,
            assume_success_on_no_match: true,
            screenshot_dir: "screenshots".to_string(),
            jobs_folder: "entry_jobs".to_string(),
            verbose_logging: false,
            output_log_file: "entry_log.txt".to_string(),
        }
    }
}

/// 读取环境变量，解析失败时使用默认值
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_browser_instances: env_or("MAX_BROWSER_INSTANCES", d.max_browser_instances),
            max_sessions_per_instance: env_or("MAX_SESSIONS_PER_INSTANCE", d.max_sessions_per_instance),
            session_idle_timeout_secs: env_or("SESSION_IDLE_TIMEOUT_SECS", d.session_idle_timeout_secs),
            session_sweep_interval_secs: env_or("SESSION_SWEEP_INTERVAL_SECS", d.session_sweep_interval_secs),
            headless: env_or("HEADLESS", d.headless),
            chrome_executable: std::env::var("CHROME_EXECUTABLE").ok().or(d.chrome_executable),
            entry_concurrency: env_or("ENTRY_CONCURRENCY", d.entry_concurrency),
            discovery_concurrency: env_or("DISCOVERY_CONCURRENCY", d.discovery_concurrency),
            discovery_rate_max: env_or("DISCOVERY_RATE_MAX", d.discovery_rate_max),
            discovery_rate_window_secs: env_or("DISCOVERY_RATE_WINDOW_SECS", d.discovery_rate_window_secs),
            broker_probe_timeout_secs: env_or("BROKER_PROBE_TIMEOUT_SECS", d.broker_probe_timeout_secs),
            job_attempts: env_or("JOB_ATTEMPTS", d.job_attempts),
            job_backoff_ms: env_or("JOB_BACKOFF_MS", d.job_backoff_ms),
            keep_completed_jobs: env_or("KEEP_COMPLETED_JOBS", d.keep_completed_jobs),
            keep_failed_jobs: env_or("KEEP_FAILED_JOBS", d.keep_failed_jobs),
            job_lock_ttl_secs: env_or("JOB_LOCK_TTL_SECS", d.job_lock_ttl_secs),
            breaker_failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", d.breaker_failure_threshold),
            breaker_recovery_timeout_secs: env_or("BREAKER_RECOVERY_TIMEOUT_SECS", d.breaker_recovery_timeout_secs),
            breaker_half_open_successes: env_or("BREAKER_HALF_OPEN_SUCCESSES", d.breaker_half_open_successes),
            captcha_solve_timeout_secs: env_or("CAPTCHA_SOLVE_TIMEOUT_SECS", d.captcha_solve_timeout_secs),
            captcha_max_provider_retries: env_or("CAPTCHA_MAX_PROVIDER_RETRIES", d.captcha_max_provider_retries),
            captcha_provider_priority: std::env::var("CAPTCHA_PROVIDER_PRIORITY")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(d.captcha_provider_priority),
            captcha_step_attempts: env_or("CAPTCHA_STEP_ATTEMPTS", d.captcha_step_attempts),
            navigation_timeout_secs: env_or("NAVIGATION_TIMEOUT_SECS", d.navigation_timeout_secs),
            max_form_steps: env_or("MAX_FORM_STEPS", d.max_form_steps),
            accept_terms: env_or("ACCEPT_TERMS", d.accept_terms),
            opt_in_marketing: env_or("OPT_IN_MARKETING", d.opt_in_marketing),
            opt_in_partners: env_or("OPT_IN_PARTNERS", d.opt_in_partners),
            form_scripts_dir: std::env::var("FORM_SCRIPTS_DIR").unwrap_or(d.form_scripts_dir),
            network_idle_timeout_secs: env_or("NETWORK_IDLE_TIMEOUT_SECS", d.network_idle_timeout_secs),
            settle_delay_ms: env_or("SETTLE_DELAY_MS", d.settle_delay_ms),
            assume_success_on_no_match: env_or("ASSUME_SUCCESS_ON_NO_MATCH", d.assume_success_on_no_match),
            screenshot_dir: std::env::var("SCREENSHOT_DIR").unwrap_or(d.screenshot_dir),
            jobs_folder: std::env::var("JOBS_FOLDER").unwrap_or(d.jobs_folder),
            verbose_logging: env_or("VERBOSE_LOGGING", d.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(d.output_log_file),
        }
    }

    /// 从 TOML 文件加载配置，缺省字段使用默认值
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            AppError::Config(ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `ENTRY_ENGINE_CONFIG` 指向配置文件时从文件加载，否则读取环境变量
    pub fn load() -> AppResult<Self> {
        match std::env::var("ENTRY_ENGINE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => {
                let config = Self::from_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_browser_instances == 0 {
            return Err(AppError::invalid_config("max_browser_instances", "必须大于 0"));
        }
        if self.max_sessions_per_instance == 0 {
            return Err(AppError::invalid_config("max_sessions_per_instance", "必须大于 0"));
        }
        if self.job_attempts == 0 {
            return Err(AppError::invalid_config("job_attempts", "必须大于 0"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(AppError::invalid_config("breaker_failure_threshold", "必须大于 0"));
        }
        if self.breaker_half_open_successes == 0 {
            return Err(AppError::invalid_config("breaker_half_open_successes", "必须大于 0"));
        }
        Ok(())
    }

    // ========== 组件配置 ==========

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_instances: self.max_browser_instances,
            max_sessions_per_instance: self.max_sessions_per_instance,
            idle_timeout: Duration::from_secs(self.session_idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.session_sweep_interval_secs),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            recovery_timeout: Duration::from_secs(self.breaker_recovery_timeout_secs),
            half_open_success_threshold: self.breaker_half_open_successes,
            half_open_max_trials: self.breaker_half_open_successes,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            solve_timeout: Duration::from_secs(self.captcha_solve_timeout_secs),
            max_provider_retries: self.captcha_max_provider_retries,
            priority_order: self.captcha_provider_priority.clone(),
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            network_idle_timeout: Duration::from_secs(self.network_idle_timeout_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            assume_success_on_no_match: self.assume_success_on_no_match,
            screenshot_dir: self.screenshot_dir.clone().into(),
        }
    }

    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig {
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            max_steps: self.max_form_steps,
            step_settle_timeout: Duration::from_secs(self.network_idle_timeout_secs),
            screenshot_dir: self.screenshot_dir.clone().into(),
            challenge_retry: RetryPolicy {
                max_attempts: self.captcha_step_attempts,
                ..RetryPolicy::default()
            },
            checkbox_policy: self.checkbox_policy(),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            probe_timeout: Duration::from_secs(self.broker_probe_timeout_secs),
            default_attempts: self.job_attempts,
            backoff_base: Duration::from_millis(self.job_backoff_ms),
            keep_completed: self.keep_completed_jobs,
            keep_failed: self.keep_failed_jobs,
            lock_ttl: Duration::from_secs(self.job_lock_ttl_secs),
            ..GatewayConfig::default()
        }
    }

    pub fn discovery_rate_limit(&self) -> RateLimit {
        RateLimit {
            max: self.discovery_rate_max,
            window: Duration::from_secs(self.discovery_rate_window_secs),
        }
    }

    pub fn checkbox_policy(&self) -> CheckboxPolicy {
        CheckboxPolicy {
            accept_terms: self.accept_terms,
            opt_in_marketing: self.opt_in_marketing,
            opt_in_partners: self.opt_in_partners,
        }
    }
}
