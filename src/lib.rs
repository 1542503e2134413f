//! # Entry Engine
//!
//! 一个用于自动化参加线上抽奖 / 促销活动的 Rust 引擎
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（Page），只暴露能力
//! - `browser/` - 自动化引擎契约（工厂 → 实例 → 会话）和 chromium 实现
//! - `pool/` - 会话池：实例数上限、最低负载分配、会话不复用
//!
//! ### ② 业务能力层（Capabilities）
//! - `resilience/` - 按域名熔断、通用重试、滚动窗口限流
//! - `challenge/` - 验证码检测、多服务商打码、token 回填
//! - `forms/` - 外部表单分析 / 填写契约
//! - `classifier/` - 提交后的结果判定
//! - `strategy/` - 三种参赛策略和固定优先级的策略选择
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一次参赛"的完整处理流程
//! - `EntryCtx` - 上下文封装（entry_id + 尝试次数 + 域名）
//! - `EntryFlow` - 流程编排（熔断 → 租用会话 → 策略 → 交还会话 → 记录熔断）
//!
//! ### ④ 编排层（Orchestration）
//! - `queue/` - 任务网关：重试、死信、处理锁、降级模式
//! - `orchestrator/engine` - 引擎上下文，启动时构造一次
//! - `orchestrator/batch_processor` - 批量参赛，从 TOML 目录加载任务
//!
//! ## 模块结构

pub mod browser;
pub mod challenge;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod forms;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod resilience;
pub mod strategy;
pub mod testing;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use events::{EngineEvent, EventBus};
pub use models::{Contest, EntryJob, EntryResult, EntryStatus, ProfileData};
pub use orchestrator::{App, EntryEngine, ENTRY_QUEUE};
pub use queue::{JobGateway, MemoryBroker};
pub use workflow::{EntryCtx, EntryFlow};
