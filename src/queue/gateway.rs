//! 任务分发网关
//!
//! 启动时对队列后端做一次限时探活：
//! - 可达：任务交给队列，由注册的 worker 异步执行
//! - 不可达：整个进程生命周期内进入降级模式，任务只记录在进程内，
//!   `enqueue` 不会失败，但没有 worker 执行它们

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::events::EventBus;
use crate::queue::broker::JobBroker;
use crate::queue::fallback::FallbackStore;
use crate::queue::job::{Job, JobHandle, JobOptions, JobSpec, QueueCounts};
use crate::queue::worker::{JobHandler, WorkerLoop, WorkerOptions};

/// 网关参数
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 探活超时
    pub probe_timeout: Duration,
    /// 默认最大尝试次数
    pub default_attempts: u32,
    /// 指数退避起始值
    pub backoff_base: Duration,
    /// 保留的已完成任务数
    pub keep_completed: usize,
    /// 保留的死信数
    pub keep_failed: usize,
    /// 处理锁有效期
    pub lock_ttl: Duration,
    /// 队列为空时 worker 的轮询间隔
    pub poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            default_attempts: 3,
            backoff_base: Duration::from_secs(5),
            keep_completed: 100,
            keep_failed: 500,
            lock_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    Broker,
    Fallback,
}

pub struct JobGateway {
    config: GatewayConfig,
    mode: GatewayMode,
    broker: Arc<dyn JobBroker>,
    fallback: FallbackStore,
    events: EventBus,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl JobGateway {
    /// 探活并确定运行模式，探活失败不会返回错误
    pub async fn connect(broker: Arc<dyn JobBroker>, config: GatewayConfig, events: EventBus) -> Self {
        let mode = match tokio::time::timeout(config.probe_timeout, broker.ping()).await {
            Ok(Ok(())) => {
                info!("✓ 任务队列连接成功");
                GatewayMode::Broker
            }
            Ok(Err(e)) => {
                warn!("⚠️ 任务队列不可用，进入降级模式（任务只记录不执行）: {}", e);
                GatewayMode::Fallback
            }
            Err(_) => {
                warn!(
                    "⚠️ 任务队列探活超时（{}ms），进入降级模式（任务只记录不执行）",
                    config.probe_timeout.as_millis()
                );
                GatewayMode::Fallback
            }
        };
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            mode,
            broker,
            fallback: FallbackStore::new(),
            events,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> GatewayMode {
        self.mode
    }

    pub fn is_fallback(&self) -> bool {
        self.mode == GatewayMode::Fallback
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn spec(&self, options: JobOptions) -> JobSpec {
        JobSpec {
            id: options
                .job_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            attempts: options.attempts.unwrap_or(self.config.default_attempts),
            backoff: options.backoff.unwrap_or(self.config.backoff_base),
            delay: options.delay.unwrap_or(Duration::ZERO),
            keep_completed: options.keep_completed.unwrap_or(self.config.keep_completed),
            keep_failed: options.keep_failed.unwrap_or(self.config.keep_failed),
        }
    }

    /// 入队
    ///
    /// 降级模式下只记录到进程内列表，永远返回 Ok
    pub async fn enqueue(&self, queue: &str, payload: JsonValue, options: JobOptions) -> AppResult<JobHandle> {
        let spec = self.spec(options);
        if self.is_fallback() {
            let job = self.fallback.record(queue, payload, &spec);
            return Ok(JobHandle {
                id: job.id,
                queue: queue.to_string(),
                fallback: true,
            });
        }

        let job = self.broker.add(queue, payload, &spec).await?;
        Ok(JobHandle {
            id: job.id,
            queue: queue.to_string(),
            fallback: false,
        })
    }

    pub async fn status(&self, queue: &str) -> AppResult<QueueCounts> {
        if self.is_fallback() {
            return Ok(self.fallback.counts(queue));
        }
        self.broker.counts(queue).await
    }

    pub async fn pause(&self, queue: &str) -> AppResult<()> {
        if self.is_fallback() {
            self.fallback.set_paused(queue, true);
            return Ok(());
        }
        info!(queue = %queue, "⏸️ 暂停队列");
        self.broker.pause(queue).await
    }

    pub async fn resume(&self, queue: &str) -> AppResult<()> {
        if self.is_fallback() {
            self.fallback.set_paused(queue, false);
            return Ok(());
        }
        info!(queue = %queue, "▶️ 恢复队列");
        self.broker.resume(queue).await
    }

    pub async fn is_paused(&self, queue: &str) -> AppResult<bool> {
        if self.is_fallback() {
            return Ok(self.fallback.is_paused(queue));
        }
        self.broker.is_paused(queue).await
    }

    /// 重试耗尽的任务
    pub async fn dead_letters(&self, queue: &str) -> AppResult<Vec<Job>> {
        if self.is_fallback() {
            return Ok(Vec::new());
        }
        self.broker.dead_letters(queue).await
    }

    /// 所有死信重新入队
    pub async fn retry_all(&self, queue: &str) -> AppResult<usize> {
        if self.is_fallback() {
            return Ok(0);
        }
        let count = self.broker.retry_dead_letters(queue).await?;
        if count > 0 {
            info!(queue = %queue, "🔁 {} 个死信任务重新入队", count);
        }
        Ok(count)
    }

    pub async fn job(&self, job_id: &str) -> AppResult<Option<Job>> {
        if self.is_fallback() {
            return Ok(self.fallback.job(job_id));
        }
        self.broker.job(job_id).await
    }

    /// 为队列注册 worker，降级模式下返回 false
    pub fn register_worker(&self, queue: &str, handler: Arc<dyn JobHandler>, options: WorkerOptions) -> bool {
        if self.is_fallback() {
            warn!(queue = %queue, "⚠️ 降级模式下不启动 worker，任务不会被执行");
            return false;
        }

        let worker = WorkerLoop {
            queue: queue.to_string(),
            broker: self.broker.clone(),
            handler,
            events: self.events.clone(),
            options,
            lock_ttl: self.config.lock_ttl,
            poll_interval: self.config.poll_interval,
        };
        let handle = worker.spawn(self.shutdown_tx.subscribe());
        self.workers.lock().push((queue.to_string(), handle));
        true
    }

    /// 等到队列里没有未结束的任务，降级模式下立即返回
    pub async fn wait_for_idle(&self, queue: &str, poll: Duration) -> AppResult<QueueCounts> {
        loop {
            let counts = self.status(queue).await?;
            if self.is_fallback() || counts.pending() == 0 {
                return Ok(counts);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// 停止所有 worker，等待进行中的任务结束
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let workers: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.workers.lock());
        for (queue, handle) in workers {
            if let Err(e) = handle.await {
                warn!(queue = %queue, "⚠️ worker 退出异常: {}", e);
            }
        }
    }
}
