//! 浏览器层：引擎契约 + chromiumoxide 实现

pub mod chromium;
pub mod engine;

pub use chromium::{ChromiumEngineFactory, LaunchMode};
pub use engine::{BrowserSession, EngineFactory, EngineInstance, SessionOptions};
