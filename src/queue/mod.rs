//! 任务队列：任务模型、队列后端、worker 与分发网关

pub mod broker;
pub mod fallback;
pub mod gateway;
pub mod job;
pub mod worker;

pub use broker::{JobBroker, LockToken, MemoryBroker};
pub use fallback::FallbackStore;
pub use gateway::{GatewayConfig, GatewayMode, JobGateway};
pub use job::{FailOutcome, Job, JobHandle, JobOptions, JobSpec, JobStatus, QueueCounts};
pub use worker::{JobHandler, WorkerOptions};
