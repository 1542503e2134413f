//! 生命周期通知
//!
//! 显式的订阅者列表，在固定的状态转换点同步调用。
//! 事件只用于观测，不是状态的第二来源。

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::challenge::ChallengeType;
use crate::resilience::BreakerState;

/// 引擎事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 任务完成
    JobCompleted { queue: String, job_id: String },
    /// 任务失败（`will_retry` 为 false 时进入死信）
    JobFailed {
        queue: String,
        job_id: String,
        error: String,
        will_retry: bool,
    },
    /// 开始打码
    ChallengeSolving {
        challenge_type: ChallengeType,
        provider: String,
    },
    /// 打码成功
    ChallengeSolved {
        challenge_type: ChallengeType,
        provider: String,
        cost: f64,
        duration_ms: u64,
    },
    /// 打码失败
    ChallengeFailed {
        challenge_type: ChallengeType,
        provider: String,
        error: String,
    },
    /// 熔断状态变化
    CircuitStateChanged {
        key: String,
        from: BreakerState,
        to: BreakerState,
    },
    /// 即时中奖
    InstantWin {
        entry_id: String,
        contest_id: String,
        prize_text: Option<String>,
    },
}

type Subscriber = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// 事件总线
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册订阅者
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(callback));
    }

    /// 同步通知所有订阅者
    pub fn emit(&self, event: EngineEvent) {
        // 先复制列表，回调里允许再次订阅
        let subscribers: Vec<Subscriber> = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
