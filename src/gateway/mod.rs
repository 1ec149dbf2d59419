//! HTTP 网关：OpenAI / Claude 兼容入口与管理接口。

pub mod admin;
pub mod claude;
pub mod openai;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::apikey;
use crate::dispatch::DispatchFailure;
use crate::error::AppError;
use crate::pool::Outcome;
use crate::service::{CompletionRecord, ProxyService};

pub fn build_router(service: Arc<ProxyService>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/models", get(openai::models))
        .route("/models", get(openai::models))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/chat/completions", post(openai::chat_completions))
        .route("/v1/messages", post(claude::messages))
        .route("/messages", post(claude::messages))
        .route("/v1/messages/count_tokens", post(claude::count_tokens))
        .route("/messages/count_tokens", post(claude::count_tokens))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/events", get(admin::events))
        .route("/admin/stats/reset", post(admin::reset_stats))
        .route("/admin/accounts", get(admin::accounts).post(admin::add_account))
        .route(
            "/admin/accounts/{id}",
            axum::routing::delete(admin::delete_account),
        )
        .route("/admin/accounts/{id}/enabled", post(admin::set_account_enabled))
        .route("/admin/logs", get(admin::logs))
        .route("/admin/logs/clear", post(admin::clear_logs))
        .route("/admin/config", get(admin::get_config).post(admin::set_config))
        .route("/admin/keys", get(admin::api_keys).post(admin::add_api_key))
        .route(
            "/admin/keys/{id}",
            axum::routing::put(admin::update_api_key).delete(admin::delete_api_key),
        )
        .with_state(service)
}

async fn root() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(
    axum::extract::State(service): axum::extract::State<Arc<ProxyService>>,
) -> axum::Json<serde_json::Value> {
    let status = service.status().await;
    axum::Json(json!({
        "status": "ok",
        "running": status.running,
        "uptimeSeconds": status.uptime_seconds,
        "requestCount": status.request_count,
    }))
}

/// 鉴权 + 额度检查，返回命中的 key id（匿名/旧版单 key 为 None）。
pub(crate) async fn authorize(
    service: &Arc<ProxyService>,
    headers: &HeaderMap,
) -> Result<Option<String>, AppError> {
    let config = service.config_snapshot().await;
    let key_id = apikey::authenticate(&config, headers)?;
    if let Some(id) = &key_id
        && let Some(key) = config.api_keys.iter().find(|k| &k.id == id)
    {
        apikey::enforce_quota(key)?;
    }
    Ok(key_id)
}

/// 终态失败的统一记录：一条日志 + 最终账号回报。
pub(crate) async fn record_failure(
    service: &Arc<ProxyService>,
    path: &str,
    method: &str,
    api_key_id: Option<String>,
    started: Instant,
    failure: &DispatchFailure,
) {
    service
        .record_completion(CompletionRecord {
            path: path.to_string(),
            method: method.to_string(),
            model: failure.model.clone(),
            account_id: failure.account_id.clone(),
            api_key_id,
            input_tokens: 0,
            output_tokens: 0,
            credits: 0.0,
            response_time_ms: started.elapsed().as_millis() as u64,
            status: failure.error.status().as_u16(),
            success: false,
            error: Some(failure.error.to_string()),
            outcome: failure.outcome.clone(),
        })
        .await;
}

/// 成功终态的统一记录。
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_success(
    service: &Arc<ProxyService>,
    path: &str,
    method: &str,
    model: &str,
    account_id: &str,
    api_key_id: Option<String>,
    usage: &crate::upstream::Usage,
    started: Instant,
) {
    service
        .record_completion(CompletionRecord {
            path: path.to_string(),
            method: method.to_string(),
            model: Some(model.to_string()),
            account_id: Some(account_id.to_string()),
            api_key_id,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            credits: usage.credits,
            response_time_ms: started.elapsed().as_millis() as u64,
            status: 200,
            success: true,
            error: None,
            outcome: Some(Outcome::Success),
        })
        .await;
}
