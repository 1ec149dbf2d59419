//! 上游 HTTP 实现：CodeWhisperer / AmazonQ 双端点，按偏好排序逐个尝试。

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::logging;
use crate::types::ModelView;
use crate::upstream::{
    CallContext, CallOptions, CallOutput, StreamChunk, UpstreamCaller, UpstreamError,
    classify_status,
};

const CODEWHISPERER_BASE: &str = "https://codewhisperer.us-east-1.amazonaws.com";
const AMAZONQ_BASE: &str = "https://q.us-east-1.amazonaws.com";
const GENERATE_PATH: &str = "/generateAssistantResponse";
const LIST_MODELS_PATH: &str = "/listAvailableModels";

const REQUEST_TIMEOUT_SECS: u64 = 300;
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct HttpUpstream {
    http: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// 端点尝试顺序：偏好端点在前，另一个兜底。
    fn endpoints(options: &CallOptions) -> [&'static str; 2] {
        match options.preferred_endpoint.as_deref() {
            Some("amazonq") => [AMAZONQ_BASE, CODEWHISPERER_BASE],
            _ => [CODEWHISPERER_BASE, AMAZONQ_BASE],
        }
    }

    fn build_payload(ctx: &CallContext, model: &str, body: &Value, options: &CallOptions) -> Value {
        let mut conversation = body.clone();
        if options.disable_tools
            && let Some(obj) = conversation.as_object_mut()
        {
            obj.remove("tools");
            obj.remove("tool_choice");
        }
        let mut payload = json!({
            "model": model,
            "conversation": conversation,
        });
        if let Some(arn) = &ctx.profile_arn {
            payload["profileArn"] = json!(arn);
        }
        payload
    }

    async fn send(
        &self,
        ctx: &CallContext,
        url: &str,
        payload: &Value,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        if logging::level().backend_enabled() {
            logging::backend_request("POST", url, payload.to_string().as_bytes());
        }
        let mut request = self
            .http
            .post(url)
            .bearer_auth(&ctx.access_token)
            .json(payload);
        if stream {
            request = request.header("accept", "text/event-stream");
        }
        let response = request.send().await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }
        Ok(response)
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamCaller for HttpUpstream {
    async fn call(
        &self,
        ctx: &CallContext,
        model: &str,
        body: &Value,
        options: &CallOptions,
    ) -> Result<CallOutput, UpstreamError> {
        let payload = Self::build_payload(ctx, model, body, options);
        let mut last_err: Option<UpstreamError> = None;

        for base in Self::endpoints(options) {
            let url = format!("{base}{GENERATE_PATH}");
            let started = Instant::now();
            match self.send(ctx, &url, &payload, false).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let raw = response.bytes().await?;
                    if logging::level().backend_enabled() {
                        logging::backend_response(status, started.elapsed(), &raw);
                    }
                    let output: CallOutput =
                        sonic_rs::from_slice(&raw).map_err(|e| UpstreamError::Fatal {
                            status: 502,
                            message: format!("解析上游响应失败: {e}"),
                        })?;
                    return Ok(output);
                }
                // 暂时性/网络错误换下一个端点，其余直接返回。
                Err(e @ (UpstreamError::Transient { .. } | UpstreamError::Network(_))) => {
                    tracing::debug!(url = %url, error = %e, "端点失败，尝试下一个");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(UpstreamError::Transient {
            status: 502,
            message: "没有可用的上游端点".to_string(),
        }))
    }

    async fn call_stream(
        &self,
        ctx: &CallContext,
        model: &str,
        body: &Value,
        options: &CallOptions,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, UpstreamError>>, UpstreamError> {
        let payload = Self::build_payload(ctx, model, body, options);
        let mut last_err: Option<UpstreamError> = None;
        let mut response = None;

        for base in Self::endpoints(options) {
            let url = format!("{base}{GENERATE_PATH}");
            match self.send(ctx, &url, &payload, true).await {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(e @ (UpstreamError::Transient { .. } | UpstreamError::Network(_))) => {
                    tracing::debug!(url = %url, error = %e, "流式端点失败，尝试下一个");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let response = response.ok_or_else(|| {
            last_err.unwrap_or(UpstreamError::Transient {
                status: 502,
                message: "没有可用的上游端点".to_string(),
            })
        })?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(next) = byte_stream.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(UpstreamError::Network(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE 按空行分帧，data: 后跟单行 JSON。
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    match sonic_rs::from_str::<StreamChunk>(data) {
                        Ok(chunk) => {
                            let done = matches!(chunk, StreamChunk::Done { .. });
                            if tx.send(Ok(chunk)).await.is_err() || done {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "忽略无法解析的流式分块");
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<ModelView>, UpstreamError> {
        let mut payload = json!({});
        if let Some(arn) = &ctx.profile_arn {
            payload["profileArn"] = json!(arn);
        }
        let url = format!("{CODEWHISPERER_BASE}{LIST_MODELS_PATH}");
        let response = self.send(ctx, &url, &payload, false).await?;
        let value: Value = response.json().await?;

        let mut models = Vec::new();
        if let Some(items) = value.get("models").and_then(Value::as_array) {
            for item in items {
                let Some(id) = item.get("id").and_then(Value::as_str) else {
                    continue;
                };
                models.push(ModelView {
                    id: id.to_string(),
                    name: item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(id)
                        .to_string(),
                    description: item
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    source: "upstream".to_string(),
                });
            }
        }
        Ok(models)
    }
}
