pub mod js_executor;

pub use js_executor::{js_call, JsExecutor};
