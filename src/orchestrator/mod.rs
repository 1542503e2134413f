//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责组装组件和批量调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `engine` - 引擎上下文
//! - 启动时构造一次：会话池、熔断器、打码协调器、策略选择、任务网关
//! - 参赛并发数按会话池容量截断
//! - 注册参赛 / 发现 worker
//!
//! ### `batch_processor` - 批量参赛处理器
//! - 管理应用生命周期（初始化、运行、清理）
//! - 批量加载参赛任务（Vec<EntryJob>）并入队
//! - 等待队列清空，输出全局统计
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<EntryJob>)
//!     ↓
//! queue::JobGateway (入队、worker、重试)
//!     ↓
//! workflow::EntryFlow (处理单个任务：熔断 → 租用会话 → 策略)
//!     ↓
//! strategy / challenge / classifier (能力层)
//!     ↓
//! pool / browser (基础设施)
//! ```

pub mod batch_processor;
pub mod engine;

pub use batch_processor::{App, RunSummary};
pub use engine::{EntryEngine, DISCOVERY_QUEUE, ENTRY_QUEUE};
