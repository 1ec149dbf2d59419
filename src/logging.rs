//! 调试日志等级与请求/响应输出。
//!
//! DEBUG 环境变量控制详细程度，与 tracing 的等级过滤相互独立。

use arc_swap::ArcSwap;
use axum::http::HeaderMap;
use std::sync::OnceLock;
use std::time::Duration;

/// 日志等级：
/// - off：不输出客户端/上游的详细请求响应
/// - low：输出客户端请求/响应（脱敏）
/// - medium：输出客户端 + 上游请求/响应（脱敏）
/// - high：在 medium 基础上逐条输出上游流式分块
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn stream_enabled(self) -> bool {
        self >= Self::High
    }
}

static LOG_LEVEL: OnceLock<ArcSwap<LogLevel>> = OnceLock::new();

fn level_cell() -> &'static ArcSwap<LogLevel> {
    LOG_LEVEL.get_or_init(|| ArcSwap::from_pointee(LogLevel::Off))
}

/// 进程级日志等级，启动时设置，读路径无锁。
pub fn set_level(level: LogLevel) {
    level_cell().store(std::sync::Arc::new(level));
}

pub fn level() -> LogLevel {
    **level_cell().load()
}

pub fn format_duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        format_body(body)
    );
}

pub fn client_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        format_body(body)
    );
}

pub fn backend_request(method: &str, url: &str, body: &[u8]) {
    tracing::info!(
        "\n====================== 上游请求 ========================\n[上游请求] {method} {url}\n{}\n=========================================================",
        format_body(body)
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 上游响应 ========================\n[上游响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        format_body(body)
    );
}

pub fn backend_stream_chunk(line: &str) {
    tracing::info!("data: {line}");
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();
        let redacted = key_lc == "authorization"
            || key_lc == "proxy-authorization"
            || key_lc == "x-api-key"
            || key_lc == "cookie";
        let val = if redacted {
            "***"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(val);
        out.push('\n');
    }
    out
}

fn format_body(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => sonic_rs::to_string_pretty(&v).unwrap_or_else(|_| v.to_string()),
        Err(_) => truncate_text(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse(""), LogLevel::Off);
        assert_eq!(LogLevel::parse("LOW"), LogLevel::Low);
        assert_eq!(LogLevel::parse("backend"), LogLevel::Medium);
        assert_eq!(LogLevel::parse(" high "), LogLevel::High);
    }

    #[test]
    fn level_gating() {
        assert!(!LogLevel::Off.client_enabled());
        assert!(LogLevel::Low.client_enabled());
        assert!(!LogLevel::Low.backend_enabled());
        assert!(LogLevel::Medium.backend_enabled());
        assert!(!LogLevel::Medium.stream_enabled());
        assert!(LogLevel::High.stream_enabled());
    }
}
