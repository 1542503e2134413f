//! 熔断键：从目标 URL 推导域名

use url::Url;

/// 从 URL 推导熔断键
///
/// - 主机名转小写并去掉开头的 `www.`
/// - 缺少协议时补 `https://` 再解析一次
/// - 仍无法解析时退回到原始字符串（去空白、小写）
pub fn domain_key(raw: &str) -> String {
    let trimmed = raw.trim();

    let host = Url::parse(trimmed)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .or_else(|| {
            Url::parse(&format!("https://{}", trimmed))
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
        });

    match host {
        Some(host) => normalize_host(&host),
        None => trimmed.to_lowercase(),
    }
}

fn normalize_host(host: &str) -> String {
    let lower = host.to_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_is_normalized() {
        assert_eq!(domain_key("https://WWW.Example.com/enter?x=1"), "example.com");
        assert_eq!(domain_key("http://promo.example.com:8080/a"), "promo.example.com");
    }

    #[test]
    fn test_missing_scheme_resolves_to_same_key() {
        assert_eq!(domain_key("www.example.com/path"), domain_key("https://example.com"));
    }

    #[test]
    fn test_unparseable_falls_back_to_raw() {
        assert_eq!(domain_key("  Not A Url  "), "not a url");
    }
}
