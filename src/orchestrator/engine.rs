//! 引擎上下文
//!
//! 启动时构造一次，持有所有共享组件（会话池、熔断器、打码协调器、策略选择、
//! 任务网关），再显式传给需要它们的地方。没有全局单例。

use std::sync::Arc;

use tracing::{info, warn};

use crate::browser::{EngineFactory, SessionOptions};
use crate::challenge::{ChallengeCoordinator, ChallengeProvider};
use crate::classifier::ConfirmationClassifier;
use crate::config::Config;
use crate::error::AppResult;
use crate::events::EventBus;
use crate::forms::FormKit;
use crate::models::EntryJob;
use crate::pool::SessionPool;
use crate::queue::{JobBroker, JobGateway, JobHandle, JobHandler, JobOptions, WorkerOptions};
use crate::resilience::CircuitBreaker;
use crate::strategy::{StrategyDeps, StrategySelector};
use crate::workflow::EntryFlow;

/// 参赛任务队列
pub const ENTRY_QUEUE: &str = "entry";
/// 发现任务队列
pub const DISCOVERY_QUEUE: &str = "discovery";

pub struct EntryEngine {
    config: Config,
    events: EventBus,
    pool: Arc<SessionPool>,
    breaker: Arc<CircuitBreaker>,
    coordinator: Arc<ChallengeCoordinator>,
    selector: Arc<StrategySelector>,
    gateway: Arc<JobGateway>,
    flow: Arc<EntryFlow>,
}

impl EntryEngine {
    /// 组装所有组件并探测队列后端
    pub async fn build(
        config: Config,
        factory: Arc<dyn EngineFactory>,
        broker: Arc<dyn JobBroker>,
        forms: FormKit,
        events: EventBus,
    ) -> AppResult<Self> {
        config.validate()?;

        let pool = Arc::new(SessionPool::new(factory, config.pool_config(), SessionOptions::default()));
        pool.start_sweeper();

        let breaker = Arc::new(CircuitBreaker::new(config.breaker_config(), events.clone()));
        let coordinator = Arc::new(ChallengeCoordinator::new(config.coordinator_config(), events.clone()));
        let deps = Arc::new(StrategyDeps {
            config: config.strategy_config(),
            forms,
            coordinator: coordinator.clone(),
            classifier: ConfirmationClassifier::new(config.classifier_config()),
            events: events.clone(),
        });
        let selector = Arc::new(StrategySelector::new(deps));
        let flow = Arc::new(EntryFlow::new(pool.clone(), breaker.clone(), selector.clone()));
        let gateway = Arc::new(JobGateway::connect(broker, config.gateway_config(), events.clone()).await);

        Ok(Self {
            config,
            events,
            pool,
            breaker,
            coordinator,
            selector,
            gateway,
            flow,
        })
    }

    /// 参赛并发数：每个并发尝试占一个会话，不能超过会话池容量
    pub fn entry_concurrency(&self) -> usize {
        let capacity = self.pool.config().capacity();
        let requested = self.config.entry_concurrency.max(1);
        if requested > capacity {
            warn!(
                "⚠️ 参赛并发数 {} 超过会话池容量 {}，按 {} 运行",
                requested, capacity, capacity
            );
        }
        requested.min(capacity)
    }

    pub fn register_provider(&self, provider: Arc<dyn ChallengeProvider>) {
        info!("🔐 注册打码服务: {}", provider.name());
        self.coordinator.register(provider);
    }

    /// 启动参赛 worker，降级模式下返回 false
    pub fn start_entry_workers(&self) -> bool {
        self.gateway.register_worker(
            ENTRY_QUEUE,
            self.flow.clone(),
            WorkerOptions::new(self.entry_concurrency()),
        )
    }

    /// 启动发现 worker（带滚动窗口限流）
    pub fn register_discovery_worker(&self, handler: Arc<dyn JobHandler>) -> bool {
        let options = WorkerOptions::new(self.config.discovery_concurrency)
            .with_rate_limit(self.config.discovery_rate_limit());
        self.gateway.register_worker(DISCOVERY_QUEUE, handler, options)
    }

    /// 提交参赛任务，任务 ID 与 entry_id 相同
    pub async fn submit_entry(&self, mut job: EntryJob) -> AppResult<JobHandle> {
        let entry_id = job.ensure_entry_id().to_string();
        let payload = serde_json::to_value(&job)?;
        let options = JobOptions {
            job_id: Some(entry_id),
            ..JobOptions::default()
        };
        self.gateway.enqueue(ENTRY_QUEUE, payload, options).await
    }

    /// 停止 worker，再关闭所有会话和浏览器
    pub async fn shutdown(&self) {
        self.gateway.shutdown().await;
        self.pool.destroy().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn coordinator(&self) -> &Arc<ChallengeCoordinator> {
        &self.coordinator
    }

    pub fn selector(&self) -> &Arc<StrategySelector> {
        &self.selector
    }

    pub fn gateway(&self) -> &Arc<JobGateway> {
        &self.gateway
    }

    pub fn flow(&self) -> &Arc<EntryFlow> {
        &self.flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Job, MemoryBroker};
    use crate::testing::{MockEngineFactory, StaticForms};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value as JsonValue};
    use std::time::Duration;
    use tokio::time::Instant;

    /// 发现任务：只记录开始时间
    #[derive(Default)]
    struct DiscoveryRecorder {
        starts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl JobHandler for DiscoveryRecorder {
        async fn handle(&self, job: &Job) -> AppResult<JsonValue> {
            self.starts.lock().push(Instant::now());
            Ok(json!({ "id": job.id }))
        }
    }

    async fn engine(config: Config, broker: MemoryBroker) -> EntryEngine {
        EntryEngine::build(
            config,
            Arc::new(MockEngineFactory::new()),
            Arc::new(broker),
            StaticForms::default().kit(),
            EventBus::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_concurrency_is_clamped_to_pool_capacity() {
        let config = Config {
            max_browser_instances: 2,
            max_sessions_per_instance: 2,
            entry_concurrency: 10,
            ..Config::default()
        };
        assert_eq!(engine(config, MemoryBroker::new()).await.entry_concurrency(), 4);

        let config = Config {
            entry_concurrency: 2,
            ..Config::default()
        };
        assert_eq!(engine(config, MemoryBroker::new()).await.entry_concurrency(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_entry_uses_entry_id_as_job_id() {
        let engine = engine(Config::default(), MemoryBroker::new()).await;
        let mut job = crate::strategy::tests_support::job("https://promo.test");
        job.entry_id = Some("e-42".into());

        let handle = engine.submit_entry(job.clone()).await.unwrap();
        assert_eq!(handle.id, "e-42");
        assert!(!handle.fallback);
        // 重复提交不会产生第二个任务
        engine.submit_entry(job).await.unwrap();
        assert_eq!(engine.gateway().status(ENTRY_QUEUE).await.unwrap().waiting, 1);
        engine.shutdown().await;
        assert!(engine.pool().is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_engine_skips_workers() {
        let engine = engine(Config::default(), MemoryBroker::unreachable()).await;
        assert!(engine.gateway().is_fallback());
        assert!(!engine.start_entry_workers());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let config = Config {
            max_browser_instances: 0,
            ..Config::default()
        };
        let result = EntryEngine::build(
            config,
            Arc::new(MockEngineFactory::new()),
            Arc::new(MemoryBroker::new()),
            StaticForms::default().kit(),
            EventBus::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_worker_is_rate_limited() {
        let config = Config {
            discovery_concurrency: 2,
            discovery_rate_max: 1,
            discovery_rate_window_secs: 60,
            job_lock_ttl_secs: 30,
            ..Config::default()
        };
        let engine = engine(config, MemoryBroker::new()).await;
        for n in 0..3 {
            let options = JobOptions {
                job_id: Some(format!("d-{}", n)),
                ..JobOptions::default()
            };
            engine
                .gateway()
                .enqueue(DISCOVERY_QUEUE, json!({ "page": n }), options)
                .await
                .unwrap();
        }

        let handler = Arc::new(DiscoveryRecorder::default());
        let begin = Instant::now();
        assert!(engine.register_discovery_worker(handler.clone()));
        let counts = engine
            .gateway()
            .wait_for_idle(DISCOVERY_QUEUE, Duration::from_secs(1))
            .await
            .unwrap();
        engine.shutdown().await;

        assert_eq!(counts.completed, 3);
        assert_eq!(counts.failed, 0);
        let starts = handler.starts.lock().clone();
        assert_eq!(starts.len(), 3);
        // 每 60 秒只放行一个
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(60));
        }
        assert!(starts[2].duration_since(begin) >= Duration::from_secs(120));
    }
}
