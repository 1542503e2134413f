//! 验证（CAPTCHA）处理：检测、服务契约、多服务协调

pub mod coordinator;
pub mod detector;
pub mod provider;
pub mod types;

pub use coordinator::{ChallengeCoordinator, CoordinatorConfig};
pub use detector::{detect_challenge, inject_token};
pub use provider::ChallengeProvider;
pub use types::{ChallengeDetection, ChallengeType, ProviderAttempt, ProviderBalance, SolveResult};
