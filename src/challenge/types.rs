use serde::{Deserialize, Serialize};

/// 验证类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    RecaptchaV2,
    RecaptchaV3,
    Hcaptcha,
    Turnstile,
    /// 图片识别类验证码
    Image,
}

impl ChallengeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeType::RecaptchaV2 => "recaptcha_v2",
            ChallengeType::RecaptchaV3 => "recaptcha_v3",
            ChallengeType::Hcaptcha => "hcaptcha",
            ChallengeType::Turnstile => "turnstile",
            ChallengeType::Image => "image",
        }
    }

    /// 单次求解的预估成本（美元），供调用方做预算统计
    pub fn estimated_cost(self) -> f64 {
        SOLVE_COST.get(self.as_str()).copied().unwrap_or(DEFAULT_SOLVE_COST)
    }
}

impl std::fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_SOLVE_COST: f64 = 0.003;

/// 各类验证的单价表
static SOLVE_COST: phf::Map<&'static str, f64> = phf::phf_map! {
    "recaptcha_v2" => 0.003,
    "recaptcha_v3" => 0.004,
    "hcaptcha" => 0.003,
    "turnstile" => 0.002,
    "image" => 0.001,
};

/// 页面上检测到的验证
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeDetection {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    #[serde(default)]
    pub site_key: Option<String>,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub is_invisible: bool,
    /// reCAPTCHA v3 的 action
    #[serde(default)]
    pub action: Option<String>,
    /// 图片验证码的 base64 内容
    #[serde(default)]
    pub image: Option<String>,
}

/// 单个服务的一次尝试记录
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub duration_ms: u64,
    /// None 表示成功
    pub error: Option<String>,
}

/// 求解结果
#[derive(Debug, Clone, Serialize)]
pub struct SolveResult {
    /// token 或识别出的文本
    pub solution: String,
    /// 最终成功的服务
    pub provider: String,
    pub challenge_type: ChallengeType,
    pub cost: f64,
    pub duration_ms: u64,
    /// 按顺序记录的所有尝试（包括成功的那次）
    pub attempts: Vec<ProviderAttempt>,
}

/// 服务余额
#[derive(Debug, Clone, Serialize)]
pub struct ProviderBalance {
    pub provider: String,
    pub balance: Option<f64>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_table_lookup() {
        assert_eq!(ChallengeType::Turnstile.estimated_cost(), 0.002);
        assert_eq!(ChallengeType::RecaptchaV3.estimated_cost(), 0.004);
    }

    #[test]
    fn test_detection_deserializes_from_page_script() {
        let detection: ChallengeDetection = serde_json::from_value(serde_json::json!({
            "type": "hcaptcha",
            "siteKey": "abc",
            "pageUrl": "https://example.com",
            "isInvisible": true
        }))
        .unwrap();
        assert_eq!(detection.challenge_type, ChallengeType::Hcaptcha);
        assert_eq!(detection.site_key.as_deref(), Some("abc"));
        assert!(detection.is_invisible);
    }
}
