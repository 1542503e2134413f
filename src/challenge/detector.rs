//! 页面验证检测与 token 回填

use serde_json::json;
use tracing::{debug, warn};

use crate::browser::BrowserSession;
use crate::challenge::types::{ChallengeDetection, ChallengeType};
use crate::error::{AppError, AppResult};
use crate::infrastructure::js_call;

/// 检测脚本，按 Turnstile → hCaptcha → reCAPTCHA v3 → v2 → 图片验证码 的顺序识别，
/// 没有验证时返回 null
const DETECT_SCRIPT: &str = r#"
(function __detectChallenge() {
    const pageUrl = location.href;
    const param = (src, name) => {
        try { return new URL(src, pageUrl).searchParams.get(name); } catch (e) { return null; }
    };

    const turnstile = document.querySelector('.cf-turnstile[data-sitekey], iframe[src*="challenges.cloudflare.com"]');
    if (turnstile) {
        return {
            type: 'turnstile',
            siteKey: turnstile.getAttribute('data-sitekey') || param(turnstile.src || '', 'k'),
            pageUrl,
            isInvisible: false
        };
    }

    const hcaptcha = document.querySelector('.h-captcha[data-sitekey], iframe[src*="hcaptcha.com"]');
    if (hcaptcha) {
        return {
            type: 'hcaptcha',
            siteKey: hcaptcha.getAttribute('data-sitekey') || param(hcaptcha.src || '', 'sitekey'),
            pageUrl,
            isInvisible: hcaptcha.getAttribute('data-size') === 'invisible'
        };
    }

    const v3 = Array.from(document.querySelectorAll('script[src*="recaptcha/api.js"]'))
        .map(s => param(s.src, 'render'))
        .find(key => key && key !== 'explicit');
    if (v3) {
        const actionEl = document.querySelector('[data-action]');
        return {
            type: 'recaptcha_v3',
            siteKey: v3,
            pageUrl,
            isInvisible: true,
            action: actionEl ? actionEl.getAttribute('data-action') : null
        };
    }

    const v2 = document.querySelector('.g-recaptcha[data-sitekey], iframe[src*="recaptcha/api2/anchor"]');
    if (v2) {
        return {
            type: 'recaptcha_v2',
            siteKey: v2.getAttribute('data-sitekey') || param(v2.src || '', 'k'),
            pageUrl,
            isInvisible: v2.getAttribute('data-size') === 'invisible'
        };
    }

    const img = document.querySelector('img[src*="captcha" i], img[alt*="captcha" i], img[id*="captcha" i]');
    if (img) {
        let image = null;
        try {
            const canvas = document.createElement('canvas');
            canvas.width = img.naturalWidth || img.width;
            canvas.height = img.naturalHeight || img.height;
            canvas.getContext('2d').drawImage(img, 0, 0);
            image = canvas.toDataURL('image/png').split(',')[1];
        } catch (e) {}
        return { type: 'image', siteKey: null, pageUrl, isInvisible: false, image };
    }

    return null;
})()
"#;

/// 把 token 写回页面的响应字段，返回是否找到了可写的字段
const INJECT_SCRIPT: &str = r#"
function __injectChallengeToken(args) {
    const { type, token } = args;
    const selectors = {
        recaptcha_v2: ['textarea[name="g-recaptcha-response"]', '#g-recaptcha-response'],
        recaptcha_v3: ['textarea[name="g-recaptcha-response"]', 'input[name="g-recaptcha-response"]'],
        hcaptcha: ['textarea[name="h-captcha-response"]', 'textarea[name="g-recaptcha-response"]'],
        turnstile: ['input[name="cf-turnstile-response"]'],
        image: ['input[name*="captcha" i]', 'input[id*="captcha" i]']
    }[type] || [];

    let written = 0;
    for (const selector of selectors) {
        for (const el of document.querySelectorAll(selector)) {
            el.value = token;
            if (el.tagName === 'TEXTAREA') el.innerHTML = token;
            el.dispatchEvent(new Event('input', { bubbles: true }));
            el.dispatchEvent(new Event('change', { bubbles: true }));
            written++;
        }
    }

    const widget = document.querySelector('[data-callback]');
    const callbackName = widget ? widget.getAttribute('data-callback') : null;
    if (callbackName && typeof window[callbackName] === 'function') {
        try { window[callbackName](token); } catch (e) {}
    }

    return written > 0;
}
"#;

/// 检测页面上的验证
pub async fn detect_challenge(session: &dyn BrowserSession) -> AppResult<Option<ChallengeDetection>> {
    let value = session.evaluate(DETECT_SCRIPT).await?;
    if value.is_null() {
        return Ok(None);
    }

    let detection: ChallengeDetection = serde_json::from_value(value)?;
    debug!(
        "检测到验证: {} (site key: {})",
        detection.challenge_type,
        detection.site_key.as_deref().unwrap_or("-")
    );
    Ok(Some(detection))
}

/// 回填 token
pub async fn inject_token(session: &dyn BrowserSession, challenge_type: ChallengeType, token: &str) -> AppResult<()> {
    let script = js_call(
        INJECT_SCRIPT,
        &json!({ "type": challenge_type.as_str(), "token": token }),
    )?;

    let written = session.evaluate(&script).await?.as_bool().unwrap_or(false);
    if !written {
        warn!("页面上没有找到 {} 的响应字段", challenge_type);
        return Err(AppError::step(
            "inject_token",
            format!("页面上没有 {} 的响应字段", challenge_type),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSession;

    #[tokio::test]
    async fn test_detect_returns_none_on_clean_page() {
        let session = MockSession::new("欢迎参加");
        assert!(detect_challenge(&session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_detect_parses_script_result() {
        let session = MockSession::new("请完成验证").respond(
            "__detectChallenge",
            json!({ "type": "recaptcha_v2", "siteKey": "k-1", "pageUrl": "https://a.test" }),
        );
        let detection = detect_challenge(&session).await.unwrap().unwrap();
        assert_eq!(detection.challenge_type, ChallengeType::RecaptchaV2);
        assert_eq!(detection.site_key.as_deref(), Some("k-1"));
    }

    #[tokio::test]
    async fn test_inject_fails_without_response_field() {
        let session = MockSession::new("").respond("__injectChallengeToken", json!(false));
        let err = inject_token(&session, ChallengeType::Turnstile, "tok").await.unwrap_err();
        assert!(matches!(err, AppError::EntryStepFailure { .. }));
    }
}
