pub mod session_pool;

pub use session_pool::{InstanceId, PoolConfig, PoolStats, SessionId, SessionLease, SessionPool};
