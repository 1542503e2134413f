//! 会话池
//!
//! - 浏览器实例数量不超过 `max_instances`
//! - 每次尝试拿到一个全新的隔离会话，释放即关闭，不复用
//! - 池只保存以会话 ID 为键的索引，会话本身不持有池的引用
//! - 满载时直接返回 `ResourceExhausted`，由调用方做背压

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, EngineFactory, EngineInstance, SessionOptions};
use crate::error::{AppError, AppResult};

/// 会话池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 浏览器实例上限
    pub max_instances: usize,
    /// 单个实例上的并发会话上限
    pub max_sessions_per_instance: usize,
    /// 会话被视为泄漏的闲置时长
    pub idle_timeout: Duration,
    /// 后台扫描间隔
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 3,
            max_sessions_per_instance: 4,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// 同时可租出的会话总数
    pub fn capacity(&self) -> usize {
        self.max_instances * self.max_sessions_per_instance
    }
}

/// 会话 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// 浏览器实例 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceId(u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// 会话租约：调用方独占，直到交还给池
pub struct SessionLease {
    id: SessionId,
    instance_id: InstanceId,
    session: Arc<dyn BrowserSession>,
}

impl SessionLease {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn session(&self) -> &dyn BrowserSession {
        self.session.as_ref()
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// 池统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub instances: usize,
    pub active_sessions: usize,
    pub pending_launches: usize,
    pub destroyed: bool,
}

struct InstanceSlot {
    engine: Arc<dyn EngineInstance>,
    disconnected: watch::Receiver<bool>,
    active: usize,
}

impl InstanceSlot {
    fn is_connected(&self) -> bool {
        !*self.disconnected.borrow()
    }
}

struct SessionRecord {
    instance_id: InstanceId,
    session: Arc<dyn BrowserSession>,
    last_used_at: Instant,
}

#[derive(Default)]
struct PoolState {
    instances: HashMap<InstanceId, InstanceSlot>,
    sessions: HashMap<SessionId, SessionRecord>,
    pending_launches: usize,
}

struct PoolInner {
    factory: Arc<dyn EngineFactory>,
    config: PoolConfig,
    session_options: SessionOptions,
    state: Mutex<PoolState>,
    destroyed: AtomicBool,
    next_id: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

enum Placement {
    Existing(InstanceId, Arc<dyn EngineInstance>),
    Launch,
}

/// 会话池
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn EngineFactory>, config: PoolConfig, session_options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                session_options,
                state: Mutex::new(PoolState::default()),
                destroyed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 租用一个新会话
    ///
    /// 选择负载最低且仍有余量的实例；没有时在上限内启动新实例；
    /// 已满返回 `ResourceExhausted`。
    pub async fn acquire(&self, options: Option<&SessionOptions>) -> AppResult<SessionLease> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(AppError::ResourceDestroyed);
        }

        let placement = {
            let mut state = inner.state.lock();
            let per_instance = inner.config.max_sessions_per_instance;

            let least_loaded = state
                .instances
                .iter_mut()
                .filter(|(_, slot)| slot.is_connected() && slot.active < per_instance)
                .min_by_key(|(_, slot)| slot.active)
                .map(|(id, slot)| {
                    // 先占位，防止并发请求超出单实例上限
                    slot.active += 1;
                    (*id, slot.engine.clone())
                });

            match least_loaded {
                Some((id, engine)) => Placement::Existing(id, engine),
                None if state.instances.len() + state.pending_launches < inner.config.max_instances => {
                    state.pending_launches += 1;
                    Placement::Launch
                }
                None => {
                    warn!(
                        "会话池已满: 实例 {}/{}, 活跃会话 {}",
                        state.instances.len(),
                        inner.config.max_instances,
                        state.sessions.len()
                    );
                    return Err(AppError::ResourceExhausted {
                        active: state.instances.len(),
                        max: inner.config.max_instances,
                    });
                }
            }
        };

        let (instance_id, engine) = match placement {
            Placement::Existing(id, engine) => (id, engine),
            Placement::Launch => self.launch_instance().await?,
        };

        let options = options.unwrap_or(&inner.session_options);
        let session = match engine.new_session(options).await {
            Ok(session) => session,
            Err(e) => {
                if let Some(slot) = inner.state.lock().instances.get_mut(&instance_id) {
                    slot.active = slot.active.saturating_sub(1);
                }
                return Err(e);
            }
        };

        let id = SessionId(inner.next_id.fetch_add(1, Ordering::SeqCst));
        let tracked = {
            let mut state = inner.state.lock();
            if inner.destroyed.load(Ordering::SeqCst) {
                false
            } else {
                state.sessions.insert(
                    id,
                    SessionRecord {
                        instance_id,
                        session: session.clone(),
                        last_used_at: Instant::now(),
                    },
                );
                true
            }
        };
        if !tracked {
            let _ = session.close().await;
            return Err(AppError::ResourceDestroyed);
        }

        debug!("租出会话 {} (实例 {})", id, instance_id);
        Ok(SessionLease {
            id,
            instance_id,
            session,
        })
    }

    /// 启动新实例，成功后已为调用方占好一个会话名额
    async fn launch_instance(&self) -> AppResult<(InstanceId, Arc<dyn EngineInstance>)> {
        let inner = &self.inner;
        let launched = inner.factory.launch().await;

        let mut state = inner.state.lock();
        state.pending_launches = state.pending_launches.saturating_sub(1);

        let engine = match launched {
            Ok(engine) => engine,
            Err(e) => {
                warn!("启动浏览器实例失败: {}", e);
                return Err(e);
            }
        };

        if inner.destroyed.load(Ordering::SeqCst) {
            drop(state);
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = engine.close().await;
            });
            return Err(AppError::ResourceDestroyed);
        }

        let id = InstanceId(inner.next_id.fetch_add(1, Ordering::SeqCst));
        let disconnected = engine.disconnected();
        state.instances.insert(
            id,
            InstanceSlot {
                engine: engine.clone(),
                disconnected: disconnected.clone(),
                active: 1,
            },
        );
        let total = state.instances.len();
        drop(state);

        info!("✓ 浏览器实例 {} 已启动 ({}/{})", id, total, inner.config.max_instances);
        self.watch_disconnect(id, disconnected);
        Ok((id, engine))
    }

    /// 实例断开后移除它以及仍归属于它的会话
    fn watch_disconnect(&self, id: InstanceId, mut rx: watch::Receiver<bool>) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                if *rx.borrow() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                if state.instances.remove(&id).is_some() {
                    let before = state.sessions.len();
                    state.sessions.retain(|_, record| record.instance_id != id);
                    let dropped = before - state.sessions.len();
                    warn!("浏览器实例 {} 意外断开，丢弃 {} 个会话", id, dropped);
                }
            }
        });
    }

    /// 交还会话：立即关闭，不复用
    ///
    /// 重复调用是安全的；即使关闭失败，会话也已从跟踪中移除。
    /// 返回该会话在调用前是否仍被跟踪。
    pub async fn release(&self, id: SessionId) -> bool {
        let record = {
            let mut state = self.inner.state.lock();
            let record = state.sessions.remove(&id);
            if let Some(record) = &record {
                if let Some(slot) = state.instances.get_mut(&record.instance_id) {
                    slot.active = slot.active.saturating_sub(1);
                }
            }
            record
        };

        match record {
            Some(record) => {
                if let Err(e) = record.session.close().await {
                    warn!("关闭会话 {} 失败: {}", id, e);
                }
                debug!("会话 {} 已释放", id);
                true
            }
            None => {
                debug!("会话 {} 已不在池中，忽略重复释放", id);
                false
            }
        }
    }

    /// 刷新会话最后使用时间
    pub fn touch(&self, id: SessionId) {
        if let Some(record) = self.inner.state.lock().sessions.get_mut(&id) {
            record.last_used_at = Instant::now();
        }
    }

    /// 关闭闲置超时的会话（兜底：正常情况下会话在释放时就已关闭）
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let stale: Vec<SessionId> = {
            let state = self.inner.state.lock();
            state
                .sessions
                .iter()
                .filter(|(_, record)| record.last_used_at.elapsed() >= idle_timeout)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut closed = 0;
        for id in stale {
            warn!("会话 {} 闲置超过 {:?}，可能泄漏，强制关闭", id, idle_timeout);
            if self.release(id).await {
                closed += 1;
            }
        }
        closed
    }

    /// 启动后台闲置扫描
    pub fn start_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = SessionPool { inner };
                if pool.inner.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                pool.sweep_idle().await;
            }
        });
        if let Some(previous) = self.inner.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// 关闭所有会话和实例；之后的 `acquire` 返回 `ResourceDestroyed`
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = inner.sweeper.lock().take() {
            handle.abort();
        }

        let (sessions, instances) = {
            let mut state = inner.state.lock();
            let sessions: Vec<_> = state.sessions.drain().collect();
            let instances: Vec<_> = state.instances.drain().collect();
            (sessions, instances)
        };

        info!("销毁会话池: {} 个会话, {} 个实例", sessions.len(), instances.len());
        for (id, record) in sessions {
            if let Err(e) = record.session.close().await {
                warn!("关闭会话 {} 失败: {}", id, e);
            }
        }
        for (id, slot) in instances {
            if let Err(e) = slot.engine.close().await {
                warn!("关闭实例 {} 失败: {}", id, e);
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            instances: state.instances.len(),
            active_sessions: state.sessions.len(),
            pending_launches: state.pending_launches,
            destroyed: self.is_destroyed(),
        }
    }

    /// 是否仍在跟踪该会话
    pub fn is_tracked(&self, id: SessionId) -> bool {
        self.inner.state.lock().sessions.contains_key(&id)
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngineFactory;

    fn pool(factory: Arc<MockEngineFactory>, max_instances: usize, per_instance: usize) -> SessionPool {
        SessionPool::new(
            factory,
            PoolConfig {
                max_instances,
                max_sessions_per_instance: per_instance,
                idle_timeout: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(10),
            },
            SessionOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_acquire_beyond_capacity_is_exhausted() {
        let factory = Arc::new(MockEngineFactory::new());
        let pool = pool(factory.clone(), 2, 1);

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        let err = pool.acquire(None).await.unwrap_err();

        assert!(matches!(err, AppError::ResourceExhausted { active: 2, max: 2 }));
        assert_eq!(factory.launch_count(), 2);
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[tokio::test]
    async fn test_least_loaded_instance_is_reused() {
        let factory = Arc::new(MockEngineFactory::new());
        let pool = pool(factory.clone(), 2, 2);

        let a = pool.acquire(None).await.unwrap();
        let _b = pool.acquire(None).await.unwrap();
        // 第一个实例还有余量，不会启动新实例
        assert_eq!(factory.launch_count(), 1);

        pool.release(a.id()).await;
        let c = pool.acquire(None).await.unwrap();
        assert_eq!(c.instance_id(), a.instance_id());
        assert_eq!(pool.stats().instances, 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_exceeds_max_instances() {
        let factory = Arc::new(MockEngineFactory::new().with_launch_delay(Duration::from_millis(20)));
        let pool = pool(factory.clone(), 3, 1);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire(None).await }));
        }
        let mut ok = 0;
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AppError::ResourceExhausted { .. }) => exhausted += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 3);
        assert_eq!(exhausted, 7);
        assert_eq!(factory.launch_count(), 3);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_survives_close_failure() {
        let factory = Arc::new(MockEngineFactory::new().with_failing_session_close());
        let pool = pool(factory.clone(), 1, 1);

        let lease = pool.acquire(None).await.unwrap();
        assert!(pool.is_tracked(lease.id()));

        assert!(pool.release(lease.id()).await);
        assert!(!pool.is_tracked(lease.id()));
        assert!(!pool.release(lease.id()).await);

        // 名额已归还
        assert!(pool.acquire(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_sessions_are_never_reused() {
        let factory = Arc::new(MockEngineFactory::new());
        let pool = pool(factory.clone(), 1, 1);

        let first = pool.acquire(None).await.unwrap();
        pool.release(first.id()).await;
        let second = pool.acquire(None).await.unwrap();

        assert_ne!(first.id(), second.id());
        let sessions = factory.sessions();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].is_closed());
        assert!(!sessions[1].is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_removes_instance_and_its_sessions() {
        let factory = Arc::new(MockEngineFactory::new());
        let pool = pool(factory.clone(), 1, 2);

        let lease = pool.acquire(None).await.unwrap();
        factory.instances()[0].disconnect();

        for _ in 0..50 {
            if pool.stats().instances == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.stats().instances, 0);
        assert!(!pool.is_tracked(lease.id()));

        // 断开后可以启动替代实例
        assert!(pool.acquire(None).await.is_ok());
        assert_eq!(factory.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_destroy_closes_everything_and_blocks_acquire() {
        let factory = Arc::new(MockEngineFactory::new());
        let pool = pool(factory.clone(), 2, 1);

        let _a = pool.acquire(None).await.unwrap();
        let _b = pool.acquire(None).await.unwrap();

        pool.destroy().await;
        pool.destroy().await;

        assert!(factory.sessions().iter().all(|s| s.is_closed()));
        assert!(factory.instances().iter().all(|i| i.is_closed()));
        assert!(matches!(pool.acquire(None).await, Err(AppError::ResourceDestroyed)));
        assert!(pool.stats().destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_leaked_sessions() {
        let factory = Arc::new(MockEngineFactory::new());
        let pool = pool(factory.clone(), 1, 2);

        let leaked = pool.acquire(None).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let fresh = pool.acquire(None).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(pool.sweep_idle().await, 1);
        assert!(!pool.is_tracked(leaked.id()));
        assert!(pool.is_tracked(fresh.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_busy_session_from_sweep() {
        let factory = Arc::new(MockEngineFactory::new());
        let pool = pool(factory.clone(), 1, 1);

        let busy = pool.acquire(None).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        pool.touch(busy.id());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(pool.sweep_idle().await, 0);
        assert_eq!(pool.stats().active_sessions, 1);

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(pool.sweep_idle().await, 1);
        assert_eq!(pool.stats().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_launch_failure_releases_reservation() {
        let factory = Arc::new(MockEngineFactory::new());
        factory.set_fail_launch(true);
        let pool = pool(factory.clone(), 1, 1);

        assert!(pool.acquire(None).await.is_err());
        assert_eq!(pool.stats().pending_launches, 0);

        factory.set_fail_launch(false);
        assert!(pool.acquire(None).await.is_ok());
    }
}
