//! 多服务打码协调器
//!
//! 按优先级依次尝试已注册的服务，每次尝试都和超时赛跑，失败后换下一个服务。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::challenge::provider::{dispatch, ChallengeProvider};
use crate::challenge::types::{ChallengeDetection, ProviderAttempt, ProviderBalance, SolveResult};
use crate::error::{AppError, AppResult};
use crate::events::{EngineEvent, EventBus};

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 单个服务一次求解的超时
    pub solve_timeout: Duration,
    /// 一次求解最多尝试几个服务
    pub max_provider_retries: usize,
    /// 显式优先级（服务名），为空时按服务自身的优先级排序
    pub priority_order: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            solve_timeout: Duration::from_secs(120),
            max_provider_retries: 3,
            priority_order: Vec::new(),
        }
    }
}

/// 打码协调器
pub struct ChallengeCoordinator {
    config: CoordinatorConfig,
    providers: RwLock<Vec<Arc<dyn ChallengeProvider>>>,
    events: EventBus,
}

impl ChallengeCoordinator {
    pub fn new(config: CoordinatorConfig, events: EventBus) -> Self {
        Self {
            config,
            providers: RwLock::new(Vec::new()),
            events,
        }
    }

    /// 注册服务，同名服务会被替换
    pub fn register(&self, provider: Arc<dyn ChallengeProvider>) {
        let mut providers = self.providers.write();
        providers.retain(|p| p.name() != provider.name());
        info!("注册打码服务: {} (优先级 {})", provider.name(), provider.priority());
        providers.push(provider);
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().len()
    }

    /// 当前的尝试顺序
    ///
    /// 配置了显式优先级时，列表中的服务按列表顺序排在前面，其余服务按自身优先级排在后面；
    /// 优先级相同时保持注册顺序。
    pub fn ordered_providers(&self) -> Vec<Arc<dyn ChallengeProvider>> {
        let mut providers: Vec<Arc<dyn ChallengeProvider>> = self.providers.read().clone();
        let explicit = &self.config.priority_order;
        providers.sort_by_key(|p| {
            match explicit.iter().position(|name| name == p.name()) {
                Some(index) => (0, index as u64),
                None => (1, u64::from(p.priority())),
            }
        });
        providers
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.ordered_providers()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// 求解验证
    ///
    /// 最多尝试 `min(max_provider_retries, 服务数)` 个服务，全部失败时返回
    /// `AllProvidersExhausted`，其中带上最后一个错误。
    pub async fn solve(&self, detection: &ChallengeDetection) -> AppResult<SolveResult> {
        let providers = self.ordered_providers();
        let budget = self.config.max_provider_retries.min(providers.len());
        let started = Instant::now();
        let mut attempts = Vec::with_capacity(budget);
        let mut last_error: Option<AppError> = None;

        for provider in providers.into_iter().take(budget) {
            let name = provider.name().to_string();
            self.events.emit(EngineEvent::ChallengeSolving {
                challenge_type: detection.challenge_type,
                provider: name.clone(),
            });
            info!("🔐 使用 {} 求解 {}", name, detection.challenge_type);

            let attempt_started = Instant::now();
            let outcome = match timeout(self.config.solve_timeout, dispatch(provider.as_ref(), detection)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::timeout(
                    format!("challenge_solve:{}", name),
                    self.config.solve_timeout,
                )),
            };
            let attempt_ms = attempt_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(solution) => {
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        duration_ms: attempt_ms,
                        error: None,
                    });
                    let cost = detection.challenge_type.estimated_cost();
                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.events.emit(EngineEvent::ChallengeSolved {
                        challenge_type: detection.challenge_type,
                        provider: name.clone(),
                        cost,
                        duration_ms,
                    });
                    info!(
                        provider = %name,
                        cost,
                        duration_ms,
                        "✓ 验证已解决"
                    );
                    return Ok(SolveResult {
                        solution,
                        provider: name,
                        challenge_type: detection.challenge_type,
                        cost,
                        duration_ms,
                        attempts,
                    });
                }
                Err(err) => {
                    warn!(provider = %name, "打码失败，切换下一个服务: {}", err);
                    self.events.emit(EngineEvent::ChallengeFailed {
                        challenge_type: detection.challenge_type,
                        provider: name.clone(),
                        error: err.to_string(),
                    });
                    attempts.push(ProviderAttempt {
                        provider: name,
                        duration_ms: attempt_ms,
                        error: Some(err.to_string()),
                    });
                    last_error = Some(err);
                }
            }
        }

        let (last_message, transient) = match &last_error {
            Some(err) => (err.to_string(), err.is_transient()),
            None => ("没有可用的打码服务".to_string(), false),
        };
        Err(AppError::AllProvidersExhausted {
            attempts: attempts.len(),
            last_error: last_message,
            transient,
        })
    }

    /// 查询所有服务的余额，单个服务失败不影响其它服务
    pub async fn balances(&self) -> Vec<ProviderBalance> {
        let mut balances = Vec::new();
        for provider in self.ordered_providers() {
            let result = timeout(self.config.solve_timeout, provider.balance()).await;
            let (balance, error) = match result {
                Ok(Ok(value)) => (Some(value), None),
                Ok(Err(e)) => (None, Some(e.to_string())),
                Err(_) => (None, Some("查询余额超时".to_string())),
            };
            balances.push(ProviderBalance {
                provider: provider.name().to_string(),
                balance,
                error,
            });
        }
        balances
    }
}

impl std::fmt::Debug for ChallengeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeCoordinator")
            .field("config", &self.config)
            .field("providers", &self.provider_names())
            .finish()
    }
}
