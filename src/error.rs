use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::upstream::UpstreamError;

/// 请求处理过程中的终态错误分类。
///
/// 只有上游暂时性错误 / 配额耗尽 / 无可用账号会在调度循环内部重试，
/// 其余类型一律立即向调用方传播。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("额度已用尽: {0}")]
    QuotaExceeded(String),

    #[error("没有可用账号: {0}")]
    NoAccountAvailable(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("上游请求失败 {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::NoAccountAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            // 上游状态码直接透传；非法值兜底为 502。
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Io(_) | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::QuotaExceeded(_) => "quota_exceeded",
            AppError::NoAccountAvailable(_) => "no_account_available",
            AppError::BadRequest(_) => "bad_request",
            AppError::Upstream { .. } => "upstream",
            AppError::Io(_) | AppError::Anyhow(_) => "internal",
        }
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Auth { status, message } => Self::Upstream { status, message },
            UpstreamError::QuotaExhausted { message } => Self::QuotaExceeded(message),
            UpstreamError::Transient { status, message } => Self::Upstream { status, message },
            UpstreamError::Fatal { status, message } => Self::Upstream { status, message },
            UpstreamError::Network(e) => Self::Upstream {
                status: 502,
                message: e.to_string(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: Some(self.kind().to_string()),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// 截断写入 Account.last_error 的错误串，避免把整段响应体塞进账号状态里。
pub fn truncate_error(message: &str) -> String {
    const MAX: usize = 200;
    if message.chars().count() <= MAX {
        return message.to_string();
    }
    let truncated: String = message.chars().take(MAX).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_passthrough() {
        let err = AppError::Upstream {
            status: 418,
            message: "x".to_string(),
        };
        assert_eq!(err.status(), StatusCode::IM_A_TEAPOT);

        let err = AppError::Upstream {
            status: 99,
            message: "x".to_string(),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn truncate_error_caps_length() {
        let long = "e".repeat(500);
        let out = truncate_error(&long);
        assert!(out.chars().count() <= 201);
        assert!(out.ends_with('…'));
        assert_eq!(truncate_error("short"), "short");
    }
}
