//! 按域名划分的熔断器
//!
//! 状态转换：
//! ```text
//! Closed   → Open:     失败次数达到阈值
//! Open     → HalfOpen: 恢复超时已过
//! HalfOpen → Closed:   试探调用连续成功达到阈值
//! HalfOpen → Open:     任意一次试探失败（重新计时）
//! ```

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// 正常，允许请求
    Closed,
    /// 熔断，拒绝请求
    Open,
    /// 半开，允许有限的试探请求
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后熔断
    pub failure_threshold: u32,
    /// 熔断后多久允许试探
    pub recovery_timeout: Duration,
    /// 半开状态下需要连续成功多少次才能恢复
    pub half_open_success_threshold: u32,
    /// 半开状态下同时放行的试探请求上限
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
            half_open_success_threshold: 2,
            half_open_max_trials: 2,
        }
    }
}

/// 单个域名的熔断状态（对外快照）
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub key: String,
    pub failure_count: u32,
    pub success_count: u32,
    pub state: BreakerState,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct Circuit {
    failure_count: u32,
    success_count: u32,
    state: BreakerState,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            failure_count: 0,
            success_count: 0,
            state: BreakerState::Closed,
            opened_at: None,
            trials_in_flight: 0,
        }
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.success_count = 0;
        self.trials_in_flight = 0;
    }
}

/// 熔断器
///
/// 所有域名的状态放在同一把锁后面，每次更新在锁内完成，
/// 并发完成的回调不会丢失计数。
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 是否允许对该域名发起新的尝试
    ///
    /// 半开状态下返回 true 会占用一个试探名额，
    /// 调用方随后必须调用 `record_success` 或 `record_failure`。
    pub fn can_execute(&self, key: &str) -> bool {
        let mut transition = None;
        let allowed = {
            let mut circuits = self.circuits.lock();
            let Some(circuit) = circuits.get_mut(key) else {
                return true;
            };

            match circuit.state {
                BreakerState::Closed => true,
                BreakerState::Open => {
                    let elapsed = circuit
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or_default();
                    if elapsed >= self.config.recovery_timeout {
                        circuit.state = BreakerState::HalfOpen;
                        circuit.success_count = 0;
                        circuit.trials_in_flight = 1;
                        transition = Some((BreakerState::Open, BreakerState::HalfOpen));
                        true
                    } else {
                        false
                    }
                }
                BreakerState::HalfOpen => {
                    if circuit.trials_in_flight < self.config.half_open_max_trials {
                        circuit.trials_in_flight += 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            info!(key, %from, %to, "熔断器进入半开状态，允许试探");
            self.notify(key, from, to);
        }
        if !allowed {
            debug!(key, "熔断器拒绝请求");
        }
        allowed
    }

    /// 记录一次成功
    pub fn record_success(&self, key: &str) {
        let transition = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);

            match circuit.state {
                BreakerState::Closed => {
                    circuit.failure_count = 0;
                    circuit.success_count = circuit.success_count.saturating_add(1);
                    None
                }
                BreakerState::HalfOpen => {
                    circuit.trials_in_flight = circuit.trials_in_flight.saturating_sub(1);
                    circuit.success_count += 1;
                    if circuit.success_count >= self.config.half_open_success_threshold {
                        circuit.state = BreakerState::Closed;
                        circuit.failure_count = 0;
                        circuit.opened_at = None;
                        circuit.trials_in_flight = 0;
                        Some((BreakerState::HalfOpen, BreakerState::Closed))
                    } else {
                        None
                    }
                }
                // 熔断期间迟到的完成回调，不改变状态
                BreakerState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            info!(key, %from, %to, "熔断器恢复");
            self.notify(key, from, to);
        }
    }

    /// 记录一次失败
    pub fn record_failure(&self, key: &str) {
        let transition = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);

            match circuit.state {
                BreakerState::Closed => {
                    circuit.failure_count += 1;
                    circuit.success_count = 0;
                    if circuit.failure_count >= self.config.failure_threshold {
                        circuit.open();
                        Some((BreakerState::Closed, BreakerState::Open))
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    circuit.failure_count += 1;
                    circuit.open();
                    Some((BreakerState::HalfOpen, BreakerState::Open))
                }
                BreakerState::Open => {
                    circuit.failure_count += 1;
                    None
                }
            }
        };

        if let Some((from, to)) = transition {
            warn!(key, %from, %to, threshold = self.config.failure_threshold, "熔断器打开");
            self.notify(key, from, to);
        }
    }

    /// 放弃一次已放行但没有真正执行的尝试
    ///
    /// 半开状态下归还试探名额，其他状态不做任何事。
    pub fn abandon_trial(&self, key: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.state == BreakerState::HalfOpen {
                circuit.trials_in_flight = circuit.trials_in_flight.saturating_sub(1);
                debug!(key, "试探未执行，归还名额");
            }
        }
    }

    /// 当前状态快照（未观测过的域名返回 None）
    pub fn snapshot(&self, key: &str) -> Option<CircuitState> {
        self.circuits.lock().get(key).map(|c| CircuitState {
            key: key.to_string(),
            failure_count: c.failure_count,
            success_count: c.success_count,
            state: c.state,
            opened_at: c.opened_at,
        })
    }

    /// 强制恢复为 Closed
    pub fn reset(&self, key: &str) {
        let previous = {
            let mut circuits = self.circuits.lock();
            circuits.get_mut(key).map(|circuit| {
                let previous = circuit.state;
                *circuit = Circuit::new();
                previous
            })
        };
        if let Some(from) = previous {
            if from != BreakerState::Closed {
                self.notify(key, from, BreakerState::Closed);
            }
        }
    }

    /// 当前处于非 Closed 状态的域名
    pub fn tripped_keys(&self) -> Vec<String> {
        self.circuits
            .lock()
            .iter()
            .filter(|(_, c)| c.state != BreakerState::Closed)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn notify(&self, key: &str, from: BreakerState, to: BreakerState) {
        self.events.emit(EngineEvent::CircuitStateChanged {
            key: key.to_string(),
            from,
            to,
        });
    }
}
