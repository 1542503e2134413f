//! 任务队列契约 + 内存实现
//!
//! 至少一次投递：任务被取走时加处理锁，锁需要在有效期内续期；
//! 锁过期的任务按失败处理（走重试 / 死信），再次投递给其它 worker。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::queue::job::{FailOutcome, Job, JobSpec, JobStatus, QueueCounts};

/// 处理锁凭证
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(pub String);

impl LockToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// 队列后端
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// 探活
    async fn ping(&self) -> AppResult<()>;

    /// 入队，相同 id 已存在时返回已有任务
    async fn add(&self, queue: &str, payload: JsonValue, spec: &JobSpec) -> AppResult<Job>;

    /// 取下一个可执行的任务并加锁
    async fn fetch_next(&self, queue: &str, lock_ttl: Duration) -> AppResult<Option<(Job, LockToken)>>;

    /// 续期处理锁，锁已经失效时返回 false
    async fn extend_lock(&self, job_id: &str, token: &LockToken, lock_ttl: Duration) -> AppResult<bool>;

    async fn complete(&self, job_id: &str, token: &LockToken, result: JsonValue) -> AppResult<()>;

    async fn fail(&self, job_id: &str, token: &LockToken, reason: &str) -> AppResult<FailOutcome>;

    async fn counts(&self, queue: &str) -> AppResult<QueueCounts>;

    async fn pause(&self, queue: &str) -> AppResult<()>;

    async fn resume(&self, queue: &str) -> AppResult<()>;

    async fn is_paused(&self, queue: &str) -> AppResult<bool>;

    /// 死信（重试耗尽的任务）
    async fn dead_letters(&self, queue: &str) -> AppResult<Vec<Job>>;

    /// 把死信全部重新入队，返回数量
    async fn retry_dead_letters(&self, queue: &str) -> AppResult<usize>;

    async fn job(&self, job_id: &str) -> AppResult<Option<Job>>;
}

#[derive(Debug)]
struct Record {
    job: Job,
    keep_completed: usize,
    keep_failed: usize,
    available_at: Instant,
    lock: Option<(LockToken, Instant)>,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<String>,
    delayed: Vec<String>,
    active: Vec<String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    paused: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    records: HashMap<String, Record>,
}

/// 进程内队列
///
/// 语义与外部队列一致（锁、重试、死信、保留数量），用于单机运行和测试。
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    ping_delay: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            reachable: AtomicBool::new(true),
            ping_delay: Duration::ZERO,
        }
    }

    /// 探活失败的队列
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.reachable.store(false, Ordering::SeqCst);
        broker
    }

    /// 探活响应延迟
    pub fn with_ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay = delay;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> AppResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::broker("队列不可达", true))
        }
    }
}

impl BrokerState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    /// 到期的延迟任务进入等待队列
    fn promote_delayed(&mut self, queue: &str, now: Instant) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        let records = &mut self.records;
        let mut due = Vec::new();
        q.delayed.retain(|id| match records.get(id) {
            Some(record) if record.available_at <= now => {
                due.push(id.clone());
                false
            }
            Some(_) => true,
            None => false,
        });
        for id in due {
            if let Some(record) = records.get_mut(&id) {
                record.job.status = JobStatus::Waiting;
            }
            q.waiting.push_back(id);
        }
    }

    /// 锁过期的任务按失败处理
    fn reclaim_expired(&mut self, queue: &str, now: Instant) -> usize {
        let expired: Vec<String> = match self.queues.get(queue) {
            Some(q) => q
                .active
                .iter()
                .filter(|id| {
                    self.records
                        .get(*id)
                        .and_then(|r| r.lock.as_ref())
                        .is_some_and(|(_, expires_at)| *expires_at <= now)
                })
                .cloned()
                .collect(),
            None => return 0,
        };

        for id in &expired {
            warn!(job_id = %id, "处理锁已过期，任务将重新投递");
            self.settle_failure(queue, id, "处理锁过期（worker 可能已退出）", now);
        }
        expired.len()
    }

    fn settle_failure(&mut self, queue: &str, id: &str, reason: &str, now: Instant) -> FailOutcome {
        let Some(record) = self.records.get_mut(id) else {
            return FailOutcome::DeadLettered;
        };
        record.lock = None;
        record.job.failed_reason = Some(reason.to_string());

        let outcome = if record.job.can_retry() {
            let delay = record.job.backoff_delay();
            record.job.status = JobStatus::Delayed;
            record.available_at = now + delay;
            FailOutcome::Retrying { delay }
        } else {
            record.job.status = JobStatus::Failed;
            record.job.finished_at = Some(Utc::now());
            FailOutcome::DeadLettered
        };
        let keep_failed = record.keep_failed;

        let q = self.queue(queue);
        q.active.retain(|a| a != id);
        let evicted = match outcome {
            FailOutcome::Retrying { .. } => {
                q.delayed.push(id.to_string());
                Vec::new()
            }
            FailOutcome::DeadLettered => {
                q.failed.push_back(id.to_string());
                trim(&mut q.failed, keep_failed)
            }
        };
        for old in evicted {
            self.records.remove(&old);
        }
        outcome
    }

    fn locked_record(&mut self, job_id: &str, token: &LockToken) -> AppResult<&mut Record> {
        match self.records.get_mut(job_id) {
            Some(record) if record.lock.as_ref().is_some_and(|(t, _)| t == token) => Ok(record),
            Some(_) => Err(AppError::broker(format!("任务 {} 的处理锁已失效", job_id), false)),
            None => Err(AppError::broker(format!("任务 {} 不存在", job_id), false)),
        }
    }
}

/// 超出保留数量时丢弃最旧的，返回被丢弃的 id
fn trim(list: &mut VecDeque<String>, keep: usize) -> Vec<String> {
    let mut evicted = Vec::new();
    while list.len() > keep {
        if let Some(old) = list.pop_front() {
            evicted.push(old);
        }
    }
    evicted
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn ping(&self) -> AppResult<()> {
        if !self.ping_delay.is_zero() {
            tokio::time::sleep(self.ping_delay).await;
        }
        self.check_reachable()
    }

    async fn add(&self, queue: &str, payload: JsonValue, spec: &JobSpec) -> AppResult<Job> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if let Some(existing) = state.records.get(&spec.id) {
            debug!(job_id = %spec.id, "任务已存在，忽略重复入队");
            return Ok(existing.job.clone());
        }

        let job = Job::new(spec, queue, payload);
        let delayed = job.status == JobStatus::Delayed;
        state.records.insert(
            spec.id.clone(),
            Record {
                job: job.clone(),
                keep_completed: spec.keep_completed,
                keep_failed: spec.keep_failed,
                available_at: Instant::now() + spec.delay,
                lock: None,
            },
        );
        let q = state.queue(queue);
        if delayed {
            q.delayed.push(spec.id.clone());
        } else {
            q.waiting.push_back(spec.id.clone());
        }
        Ok(job)
    }

    async fn fetch_next(&self, queue: &str, lock_ttl: Duration) -> AppResult<Option<(Job, LockToken)>> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.reclaim_expired(queue, now);
        state.promote_delayed(queue, now);

        let q = state.queue(queue);
        if q.paused {
            return Ok(None);
        }
        let Some(id) = q.waiting.pop_front() else {
            return Ok(None);
        };
        q.active.push(id.clone());

        let token = LockToken::generate();
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(None);
        };
        record.job.status = JobStatus::Active;
        record.job.attempts_made += 1;
        record.job.processed_at = Some(Utc::now());
        record.lock = Some((token.clone(), now + lock_ttl));
        Ok(Some((record.job.clone(), token)))
    }

    async fn extend_lock(&self, job_id: &str, token: &LockToken, lock_ttl: Duration) -> AppResult<bool> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        match state.locked_record(job_id, token) {
            Ok(record) => {
                record.lock = Some((token.clone(), Instant::now() + lock_ttl));
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn complete(&self, job_id: &str, token: &LockToken, result: JsonValue) -> AppResult<()> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        let record = state.locked_record(job_id, token)?;
        record.lock = None;
        record.job.status = JobStatus::Completed;
        record.job.finished_at = Some(Utc::now());
        record.job.return_value = Some(result);
        record.job.failed_reason = None;
        let queue = record.job.queue.clone();
        let keep = record.keep_completed;

        let q = state.queue(&queue);
        q.active.retain(|a| a != job_id);
        q.completed.push_back(job_id.to_string());
        let evicted = trim(&mut q.completed, keep);
        for old in evicted {
            state.records.remove(&old);
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, token: &LockToken, reason: &str) -> AppResult<FailOutcome> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        let queue = state.locked_record(job_id, token)?.job.queue.clone();
        Ok(state.settle_failure(&queue, job_id, reason, Instant::now()))
    }

    async fn counts(&self, queue: &str) -> AppResult<QueueCounts> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.promote_delayed(queue, Instant::now());
        Ok(state
            .queues
            .get(queue)
            .map(|q| QueueCounts {
                waiting: q.waiting.len(),
                active: q.active.len(),
                completed: q.completed.len(),
                failed: q.failed.len(),
                delayed: q.delayed.len(),
            })
            .unwrap_or_default())
    }

    async fn pause(&self, queue: &str) -> AppResult<()> {
        self.check_reachable()?;
        self.state.lock().queue(queue).paused = true;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> AppResult<()> {
        self.check_reachable()?;
        self.state.lock().queue(queue).paused = false;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> AppResult<bool> {
        self.check_reachable()?;
        Ok(self.state.lock().queues.get(queue).is_some_and(|q| q.paused))
    }

    async fn dead_letters(&self, queue: &str) -> AppResult<Vec<Job>> {
        self.check_reachable()?;
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|q| {
                q.failed
                    .iter()
                    .filter_map(|id| state.records.get(id))
                    .map(|r| r.job.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn retry_dead_letters(&self, queue: &str) -> AppResult<usize> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        let ids: Vec<String> = match state.queues.get_mut(queue) {
            Some(q) => q.failed.drain(..).collect(),
            None => return Ok(0),
        };

        let now = Instant::now();
        let mut revived = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = state.records.get_mut(&id) {
                record.job.status = JobStatus::Waiting;
                record.job.attempts_made = 0;
                record.job.finished_at = None;
                record.available_at = now;
                revived.push(id);
            }
        }
        let count = revived.len();
        state.queue(queue).waiting.extend(revived);
        Ok(count)
    }

    async fn job(&self, job_id: &str) -> AppResult<Option<Job>> {
        self.check_reachable()?;
        Ok(self.state.lock().records.get(job_id).map(|r| r.job.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(id: &str, attempts: u32) -> JobSpec {
        JobSpec {
            id: id.into(),
            attempts,
            backoff: Duration::from_secs(5),
            delay: Duration::ZERO,
            keep_completed: 2,
            keep_failed: 10,
        }
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_failure_backs_off_then_dead_letters() {
        let broker = MemoryBroker::new();
        broker.add("entry", json!({}), &spec("j", 2)).await.unwrap();

        let (job, token) = broker.fetch_next("entry", TTL).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        let outcome = broker.fail("j", &token, "boom").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(broker.counts("entry").await.unwrap().delayed, 1);
        assert!(broker.fetch_next("entry", TTL).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let (job, token) = broker.fetch_next("entry", TTL).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        assert_eq!(broker.fail("j", &token, "boom").await.unwrap(), FailOutcome::DeadLettered);

        let dead = broker.dead_letters("entry").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].failed_reason.as_deref(), Some("boom"));

        assert_eq!(broker.retry_dead_letters("entry").await.unwrap(), 1);
        let counts = broker.counts("entry").await.unwrap();
        assert_eq!((counts.waiting, counts.failed), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_is_redelivered() {
        let broker = MemoryBroker::new();
        broker.add("entry", json!({}), &spec("j", 3)).await.unwrap();

        let (_, stale) = broker.fetch_next("entry", TTL).await.unwrap().unwrap();
        tokio::time::advance(TTL).await;
        // 过期后进入退避
        assert!(broker.fetch_next("entry", TTL).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(5)).await;
        let (job, fresh) = broker.fetch_next("entry", TTL).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);

        assert!(broker.complete("j", &stale, json!(null)).await.is_err());
        assert!(!broker.extend_lock("j", &stale, TTL).await.unwrap());
        broker.complete("j", &fresh, json!({"ok": true})).await.unwrap();
        assert_eq!(broker.job("j").await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_lock_keeps_job_active() {
        let broker = MemoryBroker::new();
        broker.add("entry", json!({}), &spec("j", 1)).await.unwrap();
        let (_, token) = broker.fetch_next("entry", TTL).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(broker.extend_lock("j", &token, TTL).await.unwrap());
        tokio::time::advance(Duration::from_secs(20)).await;
        broker.fetch_next("entry", TTL).await.unwrap();

        assert_eq!(broker.counts("entry").await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_completed_retention_and_duplicate_ids() {
        let broker = MemoryBroker::new();
        for id in ["a", "b", "c"] {
            broker.add("entry", json!({}), &spec(id, 1)).await.unwrap();
            broker.add("entry", json!({}), &spec(id, 1)).await.unwrap();
        }
        assert_eq!(broker.counts("entry").await.unwrap().waiting, 3);

        while let Some((job, token)) = broker.fetch_next("entry", TTL).await.unwrap() {
            broker.complete(&job.id, &token, json!(null)).await.unwrap();
        }
        assert_eq!(broker.counts("entry").await.unwrap().completed, 2);
        assert!(broker.job("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_paused_queue_hands_out_nothing() {
        let broker = MemoryBroker::new();
        broker.add("entry", json!({}), &spec("j", 1)).await.unwrap();
        broker.pause("entry").await.unwrap();
        assert!(broker.is_paused("entry").await.unwrap());
        assert!(broker.fetch_next("entry", TTL).await.unwrap().is_none());
        broker.resume("entry").await.unwrap();
        assert!(broker.fetch_next("entry", TTL).await.unwrap().is_some());
    }
}
