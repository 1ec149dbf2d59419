//! 面向客户端的 API Key 鉴权与配额。

use axum::http::HeaderMap;
use chrono::{TimeZone, Utc};
use subtle::ConstantTimeEq;

use crate::config::{ApiKeyConfig, ProxyConfig};
use crate::error::AppError;
use crate::types::UsageRecord;

const USAGE_HISTORY_LIMIT: usize = 100;

/// 从请求头提取客户端 key：`Authorization: Bearer xxx` 或 `x-api-key: xxx`。
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let trimmed = auth.trim();
        if let Some(token) = trimmed.strip_prefix("Bearer ").or_else(|| trimmed.strip_prefix("bearer ")) {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// 常数时间比较，避免通过响应时延推断 key 前缀。
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// 鉴权结果：命中多 key 时返回 key id；旧版单一 key 或匿名模式返回 None。
pub fn authenticate(config: &ProxyConfig, headers: &HeaderMap) -> Result<Option<String>, AppError> {
    if !config.auth_enabled {
        return Ok(None);
    }

    let has_multi = config.api_keys.iter().any(|k| k.enabled);
    let legacy = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    // 未配置任何 key 时视为匿名放行。
    if !has_multi && legacy.is_none() {
        return Ok(None);
    }

    let Some(presented) = extract_api_key(headers) else {
        return Err(AppError::unauthorized("缺少 API Key"));
    };

    for key in &config.api_keys {
        if key.enabled && constant_time_eq(&key.key, &presented) {
            return Ok(Some(key.id.clone()));
        }
    }

    if let Some(legacy_key) = legacy
        && constant_time_eq(legacy_key, &presented)
    {
        return Ok(None);
    }

    Err(AppError::unauthorized("API Key 无效"))
}

/// 在任何账号选择之前检查额度上限。
pub fn enforce_quota(key: &ApiKeyConfig) -> Result<(), AppError> {
    if let Some(limit) = key.credits_limit
        && key.usage.total_credits >= limit
    {
        return Err(AppError::QuotaExceeded(format!(
            "API Key {} 额度已达上限 {limit}",
            key.name
        )));
    }
    Ok(())
}

/// 记录一次用量：总量 + 按天 + 按模型 + 有界历史（最新在前）。
pub fn record_usage(key: &mut ApiKeyConfig, record: UsageRecord) {
    key.last_used_at = Some(record.timestamp);
    key.usage.total_requests += 1;
    key.usage.total_input_tokens += record.input_tokens;
    key.usage.total_output_tokens += record.output_tokens;
    key.usage.total_credits += record.credits;

    let day = Utc
        .timestamp_opt(record.timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string();
    let daily = key.usage.daily.entry(day).or_default();
    daily.requests += 1;
    daily.input_tokens += record.input_tokens;
    daily.output_tokens += record.output_tokens;
    daily.credits += record.credits;

    let by_model = key.usage.by_model.entry(record.model.clone()).or_default();
    by_model.requests += 1;
    by_model.input_tokens += record.input_tokens;
    by_model.output_tokens += record.output_tokens;
    by_model.credits += record.credits;

    key.usage_history.insert(0, record);
    key.usage_history.truncate(USAGE_HISTORY_LIMIT);
}

/// 对外视图只暴露 key 的前后片段。
pub fn key_preview(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars.iter().take(4).collect();
    let tail: String = chars.iter().rev().take(4).rev().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config_with_keys(keys: Vec<ApiKeyConfig>, legacy: Option<&str>) -> ProxyConfig {
        ProxyConfig {
            auth_enabled: true,
            api_key: legacy.map(|s| s.to_string()),
            api_keys: keys,
            ..ProxyConfig::default()
        }
    }

    fn api_key(id: &str, key: &str, enabled: bool) -> ApiKeyConfig {
        ApiKeyConfig {
            id: id.to_string(),
            name: id.to_string(),
            key: key.to_string(),
            enabled,
            created_at: 0,
            last_used_at: None,
            credits_limit: None,
            usage: Default::default(),
            usage_history: Vec::new(),
        }
    }

    fn headers_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn extracts_bearer_and_x_api_key() {
        assert_eq!(
            extract_api_key(&headers_bearer("sk-abc")),
            Some("sk-abc".to_string())
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-xyz"));
        assert_eq!(extract_api_key(&headers), Some("sk-xyz".to_string()));
        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }

    #[test]
    fn auth_disabled_is_anonymous() {
        let mut config = config_with_keys(vec![api_key("k1", "sk-1", true)], None);
        config.auth_enabled = false;
        assert_eq!(authenticate(&config, &HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn no_keys_configured_is_anonymous() {
        let config = config_with_keys(Vec::new(), None);
        assert_eq!(authenticate(&config, &HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn multi_key_match_returns_key_id() {
        let config = config_with_keys(
            vec![api_key("k1", "sk-1", true), api_key("k2", "sk-2", true)],
            None,
        );
        assert_eq!(
            authenticate(&config, &headers_bearer("sk-2")).unwrap(),
            Some("k2".to_string())
        );
    }

    #[test]
    fn disabled_key_does_not_authenticate() {
        let config = config_with_keys(vec![api_key("k1", "sk-1", false)], Some("legacy"));
        assert!(authenticate(&config, &headers_bearer("sk-1")).is_err());
    }

    #[test]
    fn legacy_key_falls_back_without_id() {
        let config = config_with_keys(vec![api_key("k1", "sk-1", true)], Some("sk-legacy"));
        assert_eq!(
            authenticate(&config, &headers_bearer("sk-legacy")).unwrap(),
            None
        );
    }

    #[test]
    fn wrong_key_is_rejected() {
        let config = config_with_keys(vec![api_key("k1", "sk-1", true)], None);
        let err = authenticate(&config, &headers_bearer("sk-wrong")).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn quota_rejects_at_limit() {
        let mut key = api_key("k1", "sk-1", true);
        key.credits_limit = Some(10.0);
        key.usage.total_credits = 9.9;
        assert!(enforce_quota(&key).is_ok());
        key.usage.total_credits = 10.0;
        let err = enforce_quota(&key).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn usage_history_is_bounded_newest_first() {
        let mut key = api_key("k1", "sk-1", true);
        for i in 0..110 {
            record_usage(
                &mut key,
                UsageRecord {
                    timestamp: i,
                    model: "m".to_string(),
                    input_tokens: 1,
                    output_tokens: 2,
                    credits: 0.1,
                    path: "/v1/messages".to_string(),
                },
            );
        }
        assert_eq!(key.usage_history.len(), USAGE_HISTORY_LIMIT);
        assert_eq!(key.usage_history[0].timestamp, 109);
        assert_eq!(key.usage.total_requests, 110);
        assert_eq!(key.usage.total_input_tokens, 110);
        assert_eq!(key.usage.by_model.get("m").unwrap().requests, 110);
    }

    #[test]
    fn key_preview_masks_middle() {
        assert_eq!(key_preview("sk-1234567890"), "sk-1...7890");
        assert_eq!(key_preview("short"), "****");
    }
}
