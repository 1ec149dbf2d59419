//! Claude 兼容入口：/v1/messages 与 /v1/messages/count_tokens。

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
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
use crate::types::ClaudeRequest;
use crate::upstream::{StreamChunk, Usage};
use crate::util::id;

/// 收集 content 值里的全部文本（字符串或 text 块数组）。
fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                } else if let Some(content) = item.get("content") {
                    collect_text(content, out);
                }
            }
        }
        _ => {}
    }
}

/// 字符数 / 4 的粗略 token 估算。
pub async fn count_tokens(
    State(service): State<Arc<ProxyService>>,
    headers: HeaderMap,
    Json(request): Json<ClaudeRequest>,
) -> Result<Json<Value>, AppError> {
    super::authorize(&service, &headers).await?;

    let mut text = String::new();
    if let Some(system) = &request.system {
        collect_text(system, &mut text);
    }
    for message in &request.messages {
        collect_text(&message.content, &mut text);
    }
    let tokens = (text.chars().count() as u64).div_ceil(4).max(1);
    Ok(Json(json!({"input_tokens": tokens})))
}

fn conversation_body(request: &ClaudeRequest) -> Value {
    let mut body = json!({
        "messages": request.messages,
    });
    if let Some(system) = &request.system {
        body["system"] = system.clone();
    }
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
    body
}

pub async fn messages(
    State(service): State<Arc<ProxyService>>,
    headers: HeaderMap,
    Json(request): Json<ClaudeRequest>,
) -> Response {
    let started = Instant::now();
    let path = "/v1/messages";

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
        return stream_messages(service, request, dispatch_request, api_key_id, started).await;
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
            let mut content = Vec::new();
            let mut text = output.content.clone();
            if let Some(thinking) = &output.thinking
                && !thinking.is_empty()
            {
                if config.thinking_output_format == "think" {
                    text = format!("<think>{thinking}</think>{text}");
                } else {
                    content.push(json!({"type": "thinking", "thinking": thinking}));
                }
            }
            if !text.is_empty() {
                content.push(json!({"type": "text", "text": text}));
            }
            for tool in &output.tool_uses {
                content.push(json!({
                    "type": "tool_use",
                    "id": tool.id,
                    "name": tool.name,
                    "input": tool.input,
                }));
            }

            let stop_reason = if !output.tool_uses.is_empty() {
                "tool_use"
            } else if output.truncated {
                "max_tokens"
            } else {
                "end_turn"
            };
            let body = json!({
                "id": id::message_id(),
                "type": "message",
                "role": "assistant",
                "model": request.model,
                "content": content,
                "stop_reason": stop_reason,
                "stop_sequence": null,
                "usage": {
                    "input_tokens": output.usage.input_tokens,
                    "output_tokens": output.usage.output_tokens,
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

async fn stream_messages(
    service: Arc<ProxyService>,
    request: ClaudeRequest,
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

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let message_id = id::message_id();
    let requested_model = request.model.clone();

    tokio::spawn(async move {
        let mut receiver = handle.receiver;
        let mut usage = Usage::default();
        let mut truncated = false;
        let mut tool_seen = false;
        let mut failed: Option<Outcome> = None;
        let mut failed_error: Option<String> = None;

        // 当前内容块：None / Some("text") / Some("thinking")。
        let mut open_block: Option<&'static str> = None;
        let mut block_index: u32 = 0;

        let send = |name: &'static str, data: Value| {
            let tx = tx.clone();
            async move {
                tx.send(Ok(Event::default().event(name).data(data.to_string())))
                    .await
                    .is_ok()
            }
        };

        let _ = send(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": requested_model,
                    "content": [],
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        )
        .await;

        while let Some(next) = receiver.recv().await {
            match next {
                Ok(StreamChunk::Text { text }) => {
                    if open_block != Some("text") {
                        if open_block.is_some() {
                            block_index += 1;
                            let _ = send(
                                "content_block_stop",
                                json!({"type": "content_block_stop", "index": block_index - 1}),
                            )
                            .await;
                        }
                        open_block = Some("text");
                        let _ = send(
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": {"type": "text", "text": ""},
                            }),
                        )
                        .await;
                    }
                    let ok = send(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": block_index,
                            "delta": {"type": "text_delta", "text": text},
                        }),
                    )
                    .await;
                    if !ok {
                        break;
                    }
                }
                Ok(StreamChunk::Thinking { text }) => {
                    if open_block != Some("thinking") {
                        if open_block.is_some() {
                            block_index += 1;
                            let _ = send(
                                "content_block_stop",
                                json!({"type": "content_block_stop", "index": block_index - 1}),
                            )
                            .await;
                        }
                        open_block = Some("thinking");
                        let _ = send(
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": {"type": "thinking", "thinking": ""},
                            }),
                        )
                        .await;
                    }
                    let ok = send(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": block_index,
                            "delta": {"type": "thinking_delta", "thinking": text},
                        }),
                    )
                    .await;
                    if !ok {
                        break;
                    }
                }
                Ok(StreamChunk::ToolUse { id, name, input }) => {
                    tool_seen = true;
                    if open_block.is_some() {
                        let _ = send(
                            "content_block_stop",
                            json!({"type": "content_block_stop", "index": block_index}),
                        )
                        .await;
                        block_index += 1;
                        open_block = None;
                    }
                    let _ = send(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                        }),
                    )
                    .await;
                    let _ = send(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": block_index,
                            "delta": {"type": "input_json_delta", "partial_json": input.to_string()},
                        }),
                    )
                    .await;
                    let ok = send(
                        "content_block_stop",
                        json!({"type": "content_block_stop", "index": block_index}),
                    )
                    .await;
                    block_index += 1;
                    if !ok {
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
                    let _ = send(
                        "error",
                        json!({"type": "error", "error": {"type": "upstream", "message": e.to_string()}}),
                    )
                    .await;
                    break;
                }
            }
        }

        if failed.is_none() {
            if open_block.is_some() {
                let _ = send(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": block_index}),
                )
                .await;
            }
            let stop_reason = if tool_seen {
                "tool_use"
            } else if truncated {
                "max_tokens"
            } else {
                "end_turn"
            };
            let _ = send(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                    "usage": {"output_tokens": usage.output_tokens},
                }),
            )
            .await;
            let _ = send("message_stop", json!({"type": "message_stop"})).await;
        }

        if logging::level().stream_enabled() {
            logging::backend_stream_chunk(&format!(
                "stream closed: input={} output={}",
                usage.input_tokens, usage.output_tokens
            ));
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
