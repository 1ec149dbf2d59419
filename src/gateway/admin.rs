//! 管理接口：状态、账号、日志、配置与 API Key。

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ProxyConfig;
use crate::credential::CredentialAccount;
use crate::error::AppError;
use crate::service::ProxyService;
use crate::types::{
    AccountView, AddApiKeyInput, AdminLogsResponse, AdminStatsResponse, ApiKeyView,
    UpdateApiKeyInput,
};

pub async fn stats(State(service): State<Arc<ProxyService>>) -> Json<AdminStatsResponse> {
    Json(service.admin_stats().await)
}

/// 运行事件推送（SSE）。观察者落后时丢失的事件不补发。
pub async fn events(State(service): State<Arc<ProxyService>>) -> Response {
    let mut rx = service.events().subscribe();
    let (tx, out) = mpsc::channel::<Result<Event, Infallible>>(32);
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Ok(data) = serde_json::to_string(&event) else {
                continue;
            };
            if tx.send(Ok(Event::default().data(data))).await.is_err() {
                break;
            }
        }
    });
    Sse::new(ReceiverStream::new(out)).into_response()
}

pub async fn reset_stats(State(service): State<Arc<ProxyService>>) -> Json<Value> {
    service.reset_stats().await;
    Json(json!({"ok": true}))
}

pub async fn accounts(State(service): State<Arc<ProxyService>>) -> Json<Vec<AccountView>> {
    Json(service.accounts().await)
}

pub async fn add_account(
    State(service): State<Arc<ProxyService>>,
    Json(account): Json<CredentialAccount>,
) -> Result<Json<Value>, AppError> {
    if account.refresh_token.trim().is_empty() {
        return Err(AppError::bad_request("refreshToken 不能为空"));
    }
    service.add_account(account).await?;
    Ok(Json(json!({"ok": true})))
}

pub async fn delete_account(
    State(service): State<Arc<ProxyService>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    service.delete_account(&id).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledInput {
    pub enabled: bool,
}

pub async fn set_account_enabled(
    State(service): State<Arc<ProxyService>>,
    Path(id): Path<String>,
    Json(input): Json<SetEnabledInput>,
) -> Result<Json<Value>, AppError> {
    service.set_account_enabled(&id, input.enabled).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

pub async fn logs(
    State(service): State<Arc<ProxyService>>,
    Query(query): Query<LogsQuery>,
) -> Json<AdminLogsResponse> {
    let limit = query.limit.unwrap_or(100).min(2000);
    Json(AdminLogsResponse {
        logs: service.get_logs(limit).await,
    })
}

pub async fn clear_logs(State(service): State<Arc<ProxyService>>) -> Json<Value> {
    service.clear_logs().await;
    Json(json!({"ok": true}))
}

pub async fn get_config(State(service): State<Arc<ProxyService>>) -> Json<ProxyConfig> {
    Json((*service.config_snapshot().await).clone())
}

/// 配置整体替换：校验通过后原子生效并落盘。
pub async fn set_config(
    State(service): State<Arc<ProxyService>>,
    Json(config): Json<ProxyConfig>,
) -> Result<Json<Value>, AppError> {
    service.update_config(config).await?;
    Ok(Json(json!({"ok": true})))
}

pub async fn api_keys(State(service): State<Arc<ProxyService>>) -> Json<Vec<ApiKeyView>> {
    Json(service.api_keys().await)
}

pub async fn add_api_key(
    State(service): State<Arc<ProxyService>>,
    Json(input): Json<AddApiKeyInput>,
) -> Result<Json<Value>, AppError> {
    let id = service.add_api_key(input).await?;
    Ok(Json(json!({"ok": true, "id": id})))
}

pub async fn update_api_key(
    State(service): State<Arc<ProxyService>>,
    Path(id): Path<String>,
    Json(mut input): Json<UpdateApiKeyInput>,
) -> Result<Json<Value>, AppError> {
    input.id = id;
    service.update_api_key(input).await?;
    Ok(Json(json!({"ok": true})))
}

pub async fn delete_api_key(
    State(service): State<Arc<ProxyService>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    service.delete_api_key(&id).await?;
    Ok(Json(json!({"ok": true})))
}
