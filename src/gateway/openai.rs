//! OpenAI 兼容入口：/v1/models 与 /v1/chat/completions。

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::dispatch::{self, DispatchRequest};
use crate::error::AppError;
use crate::events::ProxyEvent;
use crate::logging;
use crate::pool::Outcome;
use crate::service::{CompletionRecord, ProxyService};
use crate::types::OpenAiChatRequest;
use crate::upstream::{StreamChunk, ToolUse, Usage};
use crate::util::id;

pub async fn models(
    State(service): State<Arc<ProxyService>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    super::authorize(&service, &headers).await?;
    let models = service.models().await;
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "created": 0,
                "owned_by": m.source,
            })
        })
        .collect();
    Ok(Json(json!({"object": "list", "data": data})))
}

/// 入站 OpenAI 请求转归一化会话 JSON。
fn conversation_body(request: &OpenAiChatRequest) -> Value {
    let mut body = json!({
        "messages": request.messages,
    });
    if let Some(tools) = &request.tools {
        body["tools"] = tools.clone();
    }
    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = choice.clone();
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    body
}

fn tool_calls_json(tool_uses: &[ToolUse]) -> Value {
    Value::Array(
        tool_uses
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "arguments": t.input.to_string(),
                    },
                })
            })
            .collect(),
    )
}

/// think 输出格式下 `<think>` 标签的开闭状态。
/// 思考片段可能直接被工具调用或流结束打断，闭合标签不能只依赖后续正文。
struct ThinkTag {
    open: bool,
}

impl ThinkTag {
    fn new() -> Self {
        Self { open: false }
    }

    /// 包装一段思考内容；首个片段补上 `<think>` 前缀。
    fn thinking(&mut self, text: String) -> String {
        if self.open {
            text
        } else {
            self.open = true;
            format!("<think>{text}")
        }
    }

    /// 包装一段正文；若标签仍然悬挂则先闭合。
    fn text(&mut self, text: String) -> String {
        if self.open {
            self.open = false;
            format!("</think>{text}")
        } else {
            text
        }
    }

    /// 思考后未出现正文时（工具调用或流结束），单独补发闭合标签。
    fn close(&mut self) -> Option<&'static str> {
        if self.open {
            self.open = false;
            Some("</think>")
        } else {
            None
        }
    }
}

fn finish_reason(tool_uses: &[ToolUse], truncated: bool) -> &'static str {
    if !tool_uses.is_empty() {
        "tool_calls"
    } else if truncated {
        "length"
    } else {
        "stop"
    }
}

pub async fn chat_completions(
    State(service): State<Arc<ProxyService>>,
    headers: HeaderMap,
    Json(request): Json<OpenAiChatRequest>,
) -> Response {
    let started = Instant::now();
    let path = "/v1/chat/completions";

    if logging::level().client_enabled()
        && let Ok(raw) = serde_json::to_vec(&request)
    {
        logging::client_request("POST", path, &headers, &raw);
    }

    let api_key_id = match super::authorize(&service, &headers).await {
        Ok(key) => key,
        Err(e) => return e.into_response(),
    };

    service.events().emit(ProxyEvent::Request {
        path: path.to_string(),
        model: Some(request.model.clone()),
        account_id: None,
    });

    let dispatch_request = DispatchRequest {
        path: path.to_string(),
        method: "POST".to_string(),
        requested_model: request.model.clone(),
        api_key_id: api_key_id.clone(),
        body: conversation_body(&request),
    };

    if request.stream.unwrap_or(false) {
        return stream_chat(service, request, dispatch_request, api_key_id, started).await;
    }

    match dispatch::dispatch(&service, &dispatch_request).await {
        Ok(success) => {
            let config = service.config_snapshot().await;
            super::record_success(
                &service,
                path,
                "POST",
                &success.model,
                &success.account_id,
                api_key_id,
                &success.output.usage,
                started,
            )
            .await;

            let output = &success.output;
            let mut message = json!({"role": "assistant"});
            let mut content = output.content.clone();
            if let Some(thinking) = &output.thinking
                && !thinking.is_empty()
            {
                match config.thinking_output_format.as_str() {
                    "thinking" => message["thinking"] = json!(thinking),
                    "think" => content = format!("<think>{thinking}</think>{content}"),
                    _ => message["reasoning_content"] = json!(thinking),
                }
            }
            message["content"] = json!(content);
            if !output.tool_uses.is_empty() {
                message["tool_calls"] = tool_calls_json(&output.tool_uses);
            }

            let body = json!({
                "id": id::chat_completion_id(),
                "object": "chat.completion",
                "created": Utc::now().timestamp(),
                "model": request.model,
                "choices": [{
                    "index": 0,
                    "message": message,
                    "finish_reason": finish_reason(&output.tool_uses, output.truncated),
                }],
                "usage": {
                    "prompt_tokens": output.usage.input_tokens,
                    "completion_tokens": output.usage.output_tokens,
                    "total_tokens": output.usage.input_tokens + output.usage.output_tokens,
                },
            });
            if logging::level().client_enabled()
                && let Ok(raw) = serde_json::to_vec(&body)
            {
                logging::client_response(200, started.elapsed(), &raw);
            }
            Json(body).into_response()
        }
        Err(failure) => {
            super::record_failure(&service, path, "POST", api_key_id, started, &failure).await;
            failure.error.into_response()
        }
    }
}

async fn stream_chat(
    service: Arc<ProxyService>,
    request: OpenAiChatRequest,
    dispatch_request: DispatchRequest,
    api_key_id: Option<String>,
    started: Instant,
) -> Response {
    let path = dispatch_request.path.clone();
    let handle = match dispatch::dispatch_stream(&service, &dispatch_request).await {
        Ok(handle) => handle,
        Err(failure) => {
            super::record_failure(&service, &path, "POST", api_key_id, started, &failure).await;
            return failure.error.into_response();
        }
    };

    let config = service.config_snapshot().await;
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let chunk_id = id::chat_completion_id();
    let created = Utc::now().timestamp();
    let requested_model = request.model.clone();

    tokio::spawn(async move {
        let mut receiver = handle.receiver;
        let mut usage = Usage::default();
        let mut truncated = false;
        let mut tool_seen = false;
        let mut tool_index = 0u32;
        let mut think = ThinkTag::new();
        let mut failed: Option<Outcome> = None;
        let mut failed_error: Option<String> = None;

        let base = |delta: Value, finish: Option<&str>| {
            json!({
                "id": chunk_id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": requested_model,
                "choices": [{
                    "index": 0,
                    "delta": delta,
                    "finish_reason": finish,
                }],
            })
        };

        let _ = tx
            .send(Ok(Event::default().data(base(json!({"role": "assistant"}), None).to_string())))
            .await;

        while let Some(next) = receiver.recv().await {
            match next {
                Ok(StreamChunk::Text { text }) => {
                    let text = think.text(text);
                    let event = base(json!({"content": text}), None);
                    if logging::level().stream_enabled() {
                        logging::backend_stream_chunk(&event.to_string());
                    }
                    if tx
                        .send(Ok(Event::default().data(event.to_string())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(StreamChunk::Thinking { text }) => {
                    let delta = match config.thinking_output_format.as_str() {
                        "thinking" => json!({"thinking": text}),
                        "think" => json!({"content": think.thinking(text)}),
                        _ => json!({"reasoning_content": text}),
                    };
                    if tx
                        .send(Ok(Event::default().data(base(delta, None).to_string())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(StreamChunk::ToolUse { id, name, input }) => {
                    tool_seen = true;
                    if let Some(tag) = think.close() {
                        let _ = tx
                            .send(Ok(Event::default()
                                .data(base(json!({"content": tag}), None).to_string())))
                            .await;
                    }
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()},
                        }],
                    });
                    tool_index += 1;
                    if tx
                        .send(Ok(Event::default().data(base(delta, None).to_string())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(StreamChunk::Usage { usage: u }) => {
                    usage = u;
                }
                Ok(StreamChunk::Done { truncated: t }) => {
                    truncated = t;
                    break;
                }
                Err(e) => {
                    failed_error = Some(e.to_string());
                    failed = Some(match &e {
                        crate::upstream::UpstreamError::QuotaExhausted { message } => {
                            Outcome::QuotaExhausted {
                                message: message.clone(),
                            }
                        }
                        other => Outcome::Transient {
                            message: other.to_string(),
                        },
                    });
                    let _ = tx
                        .send(Ok(Event::default().data(
                            json!({"error": {"message": e.to_string(), "type": "upstream"}})
                                .to_string(),
                        )))
                        .await;
                    break;
                }
            }
        }

        if failed.is_none() {
            if let Some(tag) = think.close() {
                let _ = tx
                    .send(Ok(Event::default()
                        .data(base(json!({"content": tag}), None).to_string())))
                    .await;
            }
            let finish = if tool_seen {
                "tool_calls"
            } else if truncated {
                "length"
            } else {
                "stop"
            };
            let _ = tx
                .send(Ok(Event::default().data(base(json!({}), Some(finish)).to_string())))
                .await;
            let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
        }

        let success = failed.is_none();
        service
            .record_completion(CompletionRecord {
                path,
                method: "POST".to_string(),
                model: Some(handle.model),
                account_id: Some(handle.account_id),
                api_key_id,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                credits: usage.credits,
                response_time_ms: started.elapsed().as_millis() as u64,
                status: if success { 200 } else { 502 },
                success,
                error: failed_error,
                outcome: Some(failed.unwrap_or(Outcome::Success)),
            })
            .await;
    });

    Sse::new(ReceiverStream::new(rx)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_tag_wraps_thinking_then_text() {
        let mut tag = ThinkTag::new();
        assert_eq!(tag.thinking("思".to_string()), "<think>思");
        assert_eq!(tag.thinking("考".to_string()), "考");
        assert_eq!(tag.text("正文".to_string()), "</think>正文");
        assert_eq!(tag.close(), None);
    }

    #[test]
    fn think_tag_closes_without_trailing_text() {
        // 思考之后直接结束或进入工具调用，也要闭合标签。
        let mut tag = ThinkTag::new();
        let _ = tag.thinking("推理".to_string());
        assert_eq!(tag.close(), Some("</think>"));
        assert_eq!(tag.close(), None);
    }

    #[test]
    fn think_tag_is_noop_without_thinking() {
        let mut tag = ThinkTag::new();
        assert_eq!(tag.text("hello".to_string()), "hello");
        assert_eq!(tag.close(), None);
    }

    #[test]
    fn finish_reason_prefers_tool_calls() {
        let tool = ToolUse {
            id: "t1".to_string(),
            name: "lookup".to_string(),
            input: json!({}),
        };
        assert_eq!(finish_reason(&[tool], true), "tool_calls");
        assert_eq!(finish_reason(&[], true), "length");
        assert_eq!(finish_reason(&[], false), "stop");
    }
}
