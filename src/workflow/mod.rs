pub mod entry_ctx;
pub mod entry_flow;

pub use entry_ctx::EntryCtx;
pub use entry_flow::{EntryFlow, EntryStats};
