//! 打码服务契约

use async_trait::async_trait;

use crate::challenge::types::{ChallengeDetection, ChallengeType};
use crate::error::{AppError, AppResult};

/// 打码服务
///
/// 每种验证类型一个操作，默认实现返回"不支持"，服务只需实现自己支持的类型。
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    /// 服务名称（注册表中的键）
    fn name(&self) -> &str;

    /// 服务自身声明的优先级，数字越小越优先
    fn priority(&self) -> u32 {
        100
    }

    async fn solve_recaptcha_v2(&self, site_key: &str, page_url: &str, invisible: bool) -> AppResult<String> {
        let _ = (site_key, page_url, invisible);
        Err(unsupported(self.name(), ChallengeType::RecaptchaV2))
    }

    async fn solve_recaptcha_v3(&self, site_key: &str, page_url: &str, action: Option<&str>) -> AppResult<String> {
        let _ = (site_key, page_url, action);
        Err(unsupported(self.name(), ChallengeType::RecaptchaV3))
    }

    async fn solve_hcaptcha(&self, site_key: &str, page_url: &str) -> AppResult<String> {
        let _ = (site_key, page_url);
        Err(unsupported(self.name(), ChallengeType::Hcaptcha))
    }

    async fn solve_turnstile(&self, site_key: &str, page_url: &str) -> AppResult<String> {
        let _ = (site_key, page_url);
        Err(unsupported(self.name(), ChallengeType::Turnstile))
    }

    async fn solve_image(&self, image_base64: &str) -> AppResult<String> {
        let _ = image_base64;
        Err(unsupported(self.name(), ChallengeType::Image))
    }

    /// 账户余额
    async fn balance(&self) -> AppResult<f64>;
}

fn unsupported(provider: &str, challenge_type: ChallengeType) -> AppError {
    AppError::provider(provider, format!("不支持验证类型 {}", challenge_type), false)
}

/// 按检测结果分派到对应的求解操作
pub async fn dispatch(provider: &dyn ChallengeProvider, detection: &ChallengeDetection) -> AppResult<String> {
    let site_key = || {
        detection
            .site_key
            .as_deref()
            .ok_or_else(|| AppError::provider(provider.name(), "页面缺少 site key", false))
    };
    let url = detection.page_url.as_str();

    match detection.challenge_type {
        ChallengeType::RecaptchaV2 => {
            provider
                .solve_recaptcha_v2(site_key()?, url, detection.is_invisible)
                .await
        }
        ChallengeType::RecaptchaV3 => {
            provider
                .solve_recaptcha_v3(site_key()?, url, detection.action.as_deref())
                .await
        }
        ChallengeType::Hcaptcha => provider.solve_hcaptcha(site_key()?, url).await,
        ChallengeType::Turnstile => provider.solve_turnstile(site_key()?, url).await,
        ChallengeType::Image => {
            let image = detection
                .image
                .as_deref()
                .ok_or_else(|| AppError::provider(provider.name(), "页面缺少验证码图片", false))?;
            provider.solve_image(image).await
        }
    }
}
