//! 上游调用边界：trait + 错误分类。
//!
//! 上游协议的逐字节编解码不在本层职责内；这里约定一份固定的 JSON
//! 契约，真实实现负责把它投递到对应的服务端点。

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::ModelView;

pub use client::HttpUpstream;

/// 上游错误分类，决定调度器是否换号/换模型重试。
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("上游认证失败 {status}: {message}")]
    Auth { status: u16, message: String },

    #[error("上游配额耗尽: {message}")]
    QuotaExhausted { message: String },

    #[error("上游暂时性错误 {status}: {message}")]
    Transient { status: u16, message: String },

    #[error("上游请求被拒绝 {status}: {message}")]
    Fatal { status: u16, message: String },

    #[error("上游网络错误: {0}")]
    Network(#[from] reqwest::Error),
}

/// 按 HTTP 状态码归类上游失败。
pub fn classify_status(status: u16, message: String) -> UpstreamError {
    match status {
        401 | 403 => UpstreamError::Auth { status, message },
        429 => UpstreamError::QuotaExhausted { message },
        408 | 500..=599 => UpstreamError::Transient { status, message },
        _ => UpstreamError::Fatal { status, message },
    }
}

/// 调用所需的账号凭据。
#[derive(Debug, Clone)]
pub struct CallContext {
    pub access_token: String,
    pub profile_arn: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// "codewhisperer" | "amazonq"，决定端点尝试顺序。
    pub preferred_endpoint: Option<String>,
    pub disable_tools: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub credits: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// 非流式调用的完整结果。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOutput {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub tool_uses: Vec<ToolUse>,
    #[serde(default)]
    pub usage: Usage,
    /// 输出因长度上限被截断，可触发自动续写。
    #[serde(default)]
    pub truncated: bool,
}

/// 流式分块（上游 SSE data 行的 JSON 形态）。
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Text { text: String },
    Thinking { text: String },
    ToolUse { id: String, name: String, input: Value },
    Usage { usage: Usage },
    Done {
        #[serde(default)]
        truncated: bool,
    },
}

#[async_trait]
pub trait UpstreamCaller: Send + Sync {
    /// 非流式调用：body 为已归一化的会话 JSON（messages/system/tools）。
    async fn call(
        &self,
        ctx: &CallContext,
        model: &str,
        body: &Value,
        options: &CallOptions,
    ) -> Result<CallOutput, UpstreamError>;

    /// 流式调用：返回分块接收端；连接级失败在建立阶段报错。
    async fn call_stream(
        &self,
        ctx: &CallContext,
        model: &str,
        body: &Value,
        options: &CallOptions,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, UpstreamError>>, UpstreamError>;

    /// 上游可用模型列表。
    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<ModelView>, UpstreamError>;
}
