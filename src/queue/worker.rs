//! 队列 worker
//!
//! 每个队列一个调度循环：Semaphore 控制并发，可选的滚动窗口限流控制速率。
//! 任务执行期间定时续期处理锁；handler 的错误（包括 panic）都上报给队列，
//! 由队列决定重试还是进入死信。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::events::{EngineEvent, EventBus};
use crate::queue::broker::{JobBroker, LockToken};
use crate::queue::job::{FailOutcome, Job};
use crate::resilience::{RateLimit, RollingWindowLimiter};

/// 任务处理器
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// 返回值作为任务结果保存
    async fn handle(&self, job: &Job) -> AppResult<JsonValue>;
}

/// worker 参数
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
}

impl WorkerOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }
}

/// 调度循环需要的共享状态
pub(crate) struct WorkerLoop {
    pub queue: String,
    pub broker: Arc<dyn JobBroker>,
    pub handler: Arc<dyn JobHandler>,
    pub events: EventBus,
    pub options: WorkerOptions,
    pub lock_ttl: Duration,
    pub poll_interval: Duration,
}

impl WorkerLoop {
    /// 启动调度循环，`shutdown` 变为 true 后停止取任务并等待进行中的任务结束
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.options.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let limiter = self
            .options
            .rate_limit
            .clone()
            .map(|limit| Arc::new(RollingWindowLimiter::new(limit)));
        let this = Arc::new(self);
        info!(queue = %this.queue, "👷 worker 启动，并发 {}", concurrency);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            // 先等限流名额再取任务，处理锁不会在排队时过期
            if let Some(limiter) = &limiter {
                tokio::select! {
                    _ = limiter.ready() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let fetched = match this.broker.fetch_next(&this.queue, this.lock_ttl).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(queue = %this.queue, "⚠️ 取任务失败: {}", e);
                    None
                }
            };

            let Some((job, token)) = fetched else {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(this.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            // 只有这个循环占用名额，ready 之后立即可得
            if let Some(limiter) = &limiter {
                limiter.acquire().await;
            }

            let worker = this.clone();
            tokio::spawn(async move {
                let _permit = permit;
                worker.process(job, token).await;
            });
        }

        // 等待进行中的任务
        let _ = semaphore.acquire_many(concurrency as u32).await;
        info!(queue = %this.queue, "worker 已停止");
    }

    async fn process(&self, job: Job, token: LockToken) {
        debug!(queue = %self.queue, job_id = %job.id, attempt = job.attempts_made, "开始执行任务");

        let renewal = self.spawn_lock_renewal(&job.id, &token);
        let outcome = std::panic::AssertUnwindSafe(self.handler.handle(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(AppError::step("worker", "任务处理器 panic")));
        renewal.abort();

        match outcome {
            Ok(result) => match self.broker.complete(&job.id, &token, result).await {
                Ok(()) => {
                    debug!(queue = %self.queue, job_id = %job.id, "✓ 任务完成");
                    self.events.emit(EngineEvent::JobCompleted {
                        queue: self.queue.clone(),
                        job_id: job.id.clone(),
                    });
                }
                Err(e) => warn!(queue = %self.queue, job_id = %job.id, "⚠️ 上报完成失败: {}", e),
            },
            Err(err) => {
                let reason = err.to_string();
                match self.broker.fail(&job.id, &token, &reason).await {
                    Ok(outcome) => {
                        let will_retry = matches!(outcome, FailOutcome::Retrying { .. });
                        match outcome {
                            FailOutcome::Retrying { delay } => warn!(
                                queue = %self.queue,
                                job_id = %job.id,
                                "⚠️ 任务失败，{}ms 后重试: {}",
                                delay.as_millis(),
                                reason
                            ),
                            FailOutcome::DeadLettered => error!(
                                queue = %self.queue,
                                job_id = %job.id,
                                "❌ 任务重试耗尽，进入死信: {}",
                                reason
                            ),
                        }
                        self.events.emit(EngineEvent::JobFailed {
                            queue: self.queue.clone(),
                            job_id: job.id.clone(),
                            error: reason,
                            will_retry,
                        });
                    }
                    Err(e) => warn!(queue = %self.queue, job_id = %job.id, "⚠️ 上报失败结果失败: {}", e),
                }
            }
        }
    }

    /// 按锁有效期的一半定时续期
    fn spawn_lock_renewal(&self, job_id: &str, token: &LockToken) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let job_id = job_id.to_string();
        let token = token.clone();
        let ttl = self.lock_ttl;
        let period = (ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match broker.extend_lock(&job_id, &token, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "⚠️ 处理锁已丢失，停止续期");
                        return;
                    }
                    Err(e) => warn!(job_id = %job_id, "⚠️ 续期处理锁失败: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::broker::MemoryBroker;
    use crate::queue::job::{JobSpec, JobStatus};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: usize,
        hold: Duration,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, job: &Job) -> AppResult<JsonValue> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            if n < self.fail_first {
                return Err(AppError::step("test", "boom"));
            }
            Ok(json!({ "id": job.id }))
        }
    }

    /// 记录每次开始执行的时间
    #[derive(Default)]
    struct TimedHandler {
        starts: Mutex<Vec<(String, tokio::time::Instant)>>,
    }

    #[async_trait]
    impl JobHandler for TimedHandler {
        async fn handle(&self, job: &Job) -> AppResult<JsonValue> {
            self.starts.lock().push((job.id.clone(), tokio::time::Instant::now()));
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(json!({ "id": job.id }))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _job: &Job) -> AppResult<JsonValue> {
            panic!("handler exploded");
        }
    }

    fn spec(id: &str, attempts: u32) -> JobSpec {
        JobSpec {
            id: id.into(),
            attempts,
            backoff: Duration::from_secs(5),
            delay: Duration::ZERO,
            keep_completed: 100,
            keep_failed: 100,
        }
    }

    fn worker(broker: Arc<MemoryBroker>, handler: Arc<dyn JobHandler>, events: EventBus) -> WorkerLoop {
        WorkerLoop {
            queue: "entry".into(),
            broker,
            handler,
            events,
            options: WorkerOptions::new(2),
            lock_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_is_retried_after_backoff() {
        let broker = Arc::new(MemoryBroker::new());
        broker.add("entry", json!({}), &spec("j", 3)).await.unwrap();
        let events = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            events.subscribe(move |e| seen.lock().push(e.clone()));
        }
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_first: 1,
            hold: Duration::ZERO,
        });

        let (tx, rx) = watch::channel(false);
        let handle = worker(broker.clone(), handler.clone(), events).spawn(rx);
        tokio::time::sleep(Duration::from_secs(6)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let job = broker.job("j").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        let seen = seen.lock();
        assert!(matches!(&seen[0], EngineEvent::JobFailed { will_retry: true, .. }));
        assert!(matches!(&seen[1], EngineEvent::JobCompleted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_job_keeps_its_lock() {
        let broker = Arc::new(MemoryBroker::new());
        broker.add("entry", json!({}), &spec("slow", 1)).await.unwrap();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            hold: Duration::from_secs(90),
        });

        let (tx, rx) = watch::channel(false);
        let handle = worker(broker.clone(), handler.clone(), EventBus::new()).spawn(rx);
        tokio::time::sleep(Duration::from_secs(95)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // 锁一直在续期，不会被当成过期任务重复投递
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.job("slow").await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_becomes_failure() {
        let broker = Arc::new(MemoryBroker::new());
        broker.add("entry", json!({}), &spec("p", 1)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = worker(broker.clone(), Arc::new(PanickingHandler), EventBus::new()).spawn(rx);
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let dead = broker.dead_letters("entry").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].failed_reason.as_deref().unwrap_or("").contains("panic"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_jobs_run_once_per_slot() {
        let broker = Arc::new(MemoryBroker::new());
        let ids = ["a", "b", "c", "d", "e"];
        for id in ids {
            broker.add("discovery", json!({}), &spec(id, 3)).await.unwrap();
        }
        let handler = Arc::new(TimedHandler::default());
        let mut w = worker(broker.clone(), handler.clone(), EventBus::new());
        w.queue = "discovery".into();
        w.options = WorkerOptions::new(2).with_rate_limit(RateLimit {
            max: 2,
            window: Duration::from_secs(60),
        });

        let begin = tokio::time::Instant::now();
        let (tx, rx) = watch::channel(false);
        let handle = w.spawn(rx);
        // 等待限流的时间远超锁有效期
        tokio::time::sleep(Duration::from_secs(400)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let starts = handler.starts.lock().clone();
        assert_eq!(starts.len(), ids.len());
        for id in ids {
            let job = broker.job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.attempts_made, 1);
        }
        for (_, at) in &starts {
            let in_window = starts
                .iter()
                .filter(|(_, other)| *other >= *at && *other < *at + Duration::from_secs(60))
                .count();
            assert!(in_window <= 2);
        }
        let last = starts.iter().map(|(_, at)| *at).max().unwrap();
        assert!(last.duration_since(begin) >= Duration::from_secs(120));
    }
}
