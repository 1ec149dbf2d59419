//! 代理服务：全部运行时状态的唯一访问边界。
//!
//! 配置快照、账号池、统计与 HTTP 服务器句柄都收在一把 RwLock 后面；
//! 上游 I/O 与文件持久化永远不在锁内进行。

use anyhow::Context;
use chrono::Utc;
use moka::future::Cache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use crate::apikey;
use crate::config::{ApiKeyConfig, ProxyConfig};
use crate::credential::refresh_task;
use crate::credential::store::Store;
use crate::error::AppError;
use crate::events::{EventBus, ProxyEvent};
use crate::pool::{AccountPool, Outcome};
use crate::stats::StatsStore;
use crate::storage;
use crate::types::{
    AccountView, AddApiKeyInput, AdminStatsResponse, ApiKeyView, ModelView, ProxyStatus,
    RequestLogEntry, UpdateApiKeyInput, UsageRecord,
};
use crate::upstream::{CallContext, UpstreamCaller};
use crate::util::id;

const MODEL_CACHE_KEY: &str = "models";

/// 一次请求的终态记录：日志、统计、账号回报与 key 计费一步完成。
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub path: String,
    pub method: String,
    pub model: Option<String>,
    pub account_id: Option<String>,
    pub api_key_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub credits: f64,
    pub response_time_ms: u64,
    pub status: u16,
    pub success: bool,
    pub error: Option<String>,
    /// 终态对应的账号池回报；None 表示未选中任何账号。
    pub outcome: Option<Outcome>,
}

struct ServerRuntime {
    shutdown: watch::Sender<bool>,
    server_handle: JoinHandle<()>,
    refresh_handle: JoinHandle<()>,
}

struct RuntimeState {
    config: Arc<ProxyConfig>,
    status: ProxyStatus,
    pool: AccountPool,
    stats: StatsStore,
    server: Option<ServerRuntime>,
    /// 上游模型列表缓存；TTL 来自配置，配置变更时整体重建。
    model_cache: Cache<&'static str, Arc<Vec<ModelView>>>,
}

fn build_model_cache(ttl_sec: u64) -> Cache<&'static str, Arc<Vec<ModelView>>> {
    Cache::builder()
        .max_capacity(4)
        .time_to_live(Duration::from_secs(ttl_sec))
        .build()
}

pub struct ProxyService {
    state: RwLock<RuntimeState>,
    store: Arc<Store>,
    upstream: Arc<dyn UpstreamCaller>,
    events: EventBus,
    data_dir: PathBuf,
}

impl ProxyService {
    pub fn new(data_dir: PathBuf, store: Arc<Store>, upstream: Arc<dyn UpstreamCaller>) -> Self {
        let config = ProxyConfig::default();
        Self {
            state: RwLock::new(RuntimeState {
                status: ProxyStatus {
                    host: config.host.clone(),
                    port: config.port,
                    ..ProxyStatus::default()
                },
                model_cache: build_model_cache(config.model_cache_ttl_sec),
                config: Arc::new(config),
                pool: AccountPool::new(),
                stats: StatsStore::new(),
                server: None,
            }),
            store,
            upstream,
            events: EventBus::new(),
            data_dir,
        }
    }

    /// 启动前的一次性加载：凭据、持久化配置与统计，随后同步账号池。
    pub async fn init(
        &self,
        host_override: Option<String>,
        port_override: Option<u16>,
    ) -> anyhow::Result<()> {
        self.store.load().await.context("加载账号凭据失败")?;

        let mut config = storage::load_config(&self.data_dir)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = ?e, "读取持久化配置失败，使用默认配置");
                None
            })
            .unwrap_or_default();
        if let Some(host) = host_override {
            config.host = host;
        }
        if let Some(port) = port_override {
            config.port = port;
        }

        let stats = storage::load_stats(&self.data_dir).await?.unwrap_or_default();
        let logs = storage::load_logs(&self.data_dir).await?.unwrap_or_default();
        let seeds = self.store.seeds().await;

        let mut state = self.state.write().await;
        if state.config.model_cache_ttl_sec != config.model_cache_ttl_sec {
            state.model_cache = build_model_cache(config.model_cache_ttl_sec);
        }
        state.status.host = config.host.clone();
        state.status.port = config.port;
        state.status.request_count = stats.total_requests;
        state.status.success_count = stats.success_requests;
        state.status.failed_count = stats.failed_requests;
        state.status.total_input_tokens = stats.total_input_tokens;
        state.status.total_output_tokens = stats.total_output_tokens;
        state.status.total_credits = stats.total_credits;
        state.config = Arc::new(config);
        state.stats = StatsStore::from_parts(logs, stats);
        state.pool.sync_accounts(seeds);
        Ok(())
    }

    pub async fn config_snapshot(&self) -> Arc<ProxyConfig> {
        self.state.read().await.config.clone()
    }

    /// 整体替换配置快照（选项 + 映射规则原子生效），并落盘。
    pub async fn update_config(&self, config: ProxyConfig) -> Result<(), AppError> {
        config.validate().map_err(AppError::bad_request)?;
        let snapshot = {
            let mut state = self.state.write().await;
            if state.config.model_cache_ttl_sec != config.model_cache_ttl_sec {
                state.model_cache = build_model_cache(config.model_cache_ttl_sec);
            } else {
                state.model_cache.invalidate_all();
            }
            state.status.host = config.host.clone();
            state.status.port = config.port;
            state.config = Arc::new(config);
            state.config.clone()
        };
        storage::save_config(&self.data_dir, &snapshot)
            .await
            .map_err(AppError::Anyhow)?;
        Ok(())
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn upstream(&self) -> &Arc<dyn UpstreamCaller> {
        &self.upstream
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ===== 启停 =====

    /// 启动 HTTP 监听与令牌刷新任务。已在运行时为幂等 no-op。
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.server.is_some() {
            return Ok(());
        }

        let addr = format!("{}:{}", state.config.host, state.config.port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                state.status.error = Some(format!("监听 {addr} 失败: {e}"));
                return Err(e).with_context(|| format!("监听 {addr} 失败"));
            }
        };
        tracing::info!(addr = %addr, "代理服务已启动");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = crate::gateway::build_router(self.clone());
        let mut server_shutdown = shutdown_rx.clone();
        let server_handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                // 发送端关闭同样视为停机信号。
                let _ = server_shutdown.changed().await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = ?e, "HTTP 服务异常退出");
            }
        });
        let refresh_handle = refresh_task::spawn(self.clone(), shutdown_rx);

        state.server = Some(ServerRuntime {
            shutdown: shutdown_tx,
            server_handle,
            refresh_handle,
        });
        state.status.running = true;
        state.status.started_at = Some(Utc::now().timestamp());
        state.status.error = None;
        drop(state);

        self.events.emit(ProxyEvent::StatusChange { running: true });
        Ok(())
    }

    /// 优雅停机：通知监听循环与刷新任务退出并等待其结束。未运行时为 no-op。
    pub async fn stop(&self) {
        let runtime = {
            let mut state = self.state.write().await;
            let runtime = state.server.take();
            if runtime.is_some() {
                state.status.running = false;
                state.status.started_at = None;
            }
            runtime
        };
        let Some(runtime) = runtime else {
            return;
        };

        let _ = runtime.shutdown.send(true);
        let _ = runtime.server_handle.await;
        let _ = runtime.refresh_handle.await;
        tracing::info!("代理服务已停止");
        self.events.emit(ProxyEvent::StatusChange { running: false });
    }

    pub async fn status(&self) -> ProxyStatus {
        let state = self.state.read().await;
        let mut status = state.status.clone();
        status.uptime_seconds = status
            .started_at
            .map(|started| (Utc::now().timestamp() - started).max(0));
        status
    }

    // ===== 账号管理 =====

    async fn sync_pool(&self) {
        let seeds = self.store.seeds().await;
        self.state.write().await.pool.sync_accounts(seeds);
    }

    pub async fn accounts(&self) -> Vec<AccountView> {
        self.state.read().await.pool.views()
    }

    pub async fn add_account(
        &self,
        account: crate::credential::CredentialAccount,
    ) -> anyhow::Result<()> {
        self.store.add(account).await?;
        self.sync_pool().await;
        Ok(())
    }

    pub async fn delete_account(&self, account_id: &str) -> anyhow::Result<()> {
        self.store.delete(account_id).await?;
        self.sync_pool().await;
        Ok(())
    }

    pub async fn set_account_enabled(&self, account_id: &str, enabled: bool) -> anyhow::Result<()> {
        self.store.set_enabled(account_id, enabled).await?;
        self.sync_pool().await;
        Ok(())
    }

    pub async fn select_account(&self, now: i64) -> Option<String> {
        let mut state = self.state.write().await;
        let candidates = state.config.selected_account_ids.clone();
        let multi = state.config.enable_multi_account;
        state.pool.select_account(&candidates, multi, now)
    }

    pub async fn report_outcome(&self, account_id: &str, outcome: &Outcome, now: i64) {
        self.state
            .write()
            .await
            .pool
            .report_outcome(account_id, outcome, now);
    }

    pub async fn mark_refresh_failed(&self, account_id: &str, message: &str) {
        self.state
            .write()
            .await
            .pool
            .mark_refresh_failed(account_id, message);
    }

    pub async fn mark_refresh_ok(&self, account_id: &str) {
        self.state.write().await.pool.mark_refresh_ok(account_id);
    }

    pub async fn account_email(&self, account_id: &str) -> Option<String> {
        self.state.read().await.pool.account_email(account_id)
    }

    // ===== API Key 管理 =====

    pub async fn api_keys(&self) -> Vec<ApiKeyView> {
        let config = self.config_snapshot().await;
        config
            .api_keys
            .iter()
            .map(|key| ApiKeyView {
                id: key.id.clone(),
                name: key.name.clone(),
                key_preview: apikey::key_preview(&key.key),
                enabled: key.enabled,
                created_at: key.created_at,
                last_used_at: key.last_used_at,
                credits_limit: key.credits_limit,
                usage: key.usage.clone(),
                usage_history: key.usage_history.clone(),
            })
            .collect()
    }

    pub async fn add_api_key(&self, input: AddApiKeyInput) -> Result<String, AppError> {
        if input.key.trim().is_empty() {
            return Err(AppError::bad_request("key 不能为空"));
        }
        let mut config = (*self.config_snapshot().await).clone();
        if config.api_keys.iter().any(|k| k.key == input.key) {
            return Err(AppError::bad_request("重复的 key"));
        }
        let key_id = id::api_key_id();
        config.api_keys.push(ApiKeyConfig {
            id: key_id.clone(),
            name: input.name,
            key: input.key,
            enabled: input.enabled.unwrap_or(true),
            created_at: Utc::now().timestamp(),
            last_used_at: None,
            credits_limit: input.credits_limit,
            usage: Default::default(),
            usage_history: Vec::new(),
        });
        self.update_config(config).await?;
        Ok(key_id)
    }

    pub async fn update_api_key(&self, input: UpdateApiKeyInput) -> Result<(), AppError> {
        let mut config = (*self.config_snapshot().await).clone();
        let key = config
            .api_keys
            .iter_mut()
            .find(|k| k.id == input.id)
            .ok_or_else(|| AppError::bad_request(format!("API Key 不存在: {}", input.id)))?;
        if let Some(name) = input.name {
            key.name = name;
        }
        if let Some(enabled) = input.enabled {
            key.enabled = enabled;
        }
        if input.credits_limit.is_some() {
            key.credits_limit = input.credits_limit;
        }
        self.update_config(config).await
    }

    pub async fn delete_api_key(&self, key_id: &str) -> Result<(), AppError> {
        let mut config = (*self.config_snapshot().await).clone();
        let before = config.api_keys.len();
        config.api_keys.retain(|k| k.id != key_id);
        if config.api_keys.len() == before {
            return Err(AppError::bad_request(format!("API Key 不存在: {key_id}")));
        }
        self.update_config(config).await
    }

    // ===== 统计 =====

    /// 单把写锁内完成日志、聚合、账号回报与 key 计费，避免部分更新被观察到。
    pub async fn record_completion(&self, record: CompletionRecord) {
        let now = Utc::now().timestamp();
        let config_changed = {
            let mut state = self.state.write().await;
            let keep_log = state.config.log_requests;

            if let (Some(account_id), Some(outcome)) = (&record.account_id, &record.outcome) {
                state.pool.report_outcome(account_id, outcome, now);
            }

            let account_email = record
                .account_id
                .as_deref()
                .and_then(|aid| state.pool.account_email(aid));
            state.stats.record(RequestLogEntry {
                timestamp: now,
                path: record.path.clone(),
                method: record.method.clone(),
                model: record.model.clone(),
                account_id: record.account_id.clone(),
                account_email,
                api_key_id: record.api_key_id.clone(),
                input_tokens: record.input_tokens,
                output_tokens: record.output_tokens,
                credits: record.credits,
                response_time_ms: record.response_time_ms,
                status: record.status,
                success: record.success,
                error: record.error.clone(),
            }, keep_log);

            state.status.request_count += 1;
            if record.success {
                state.status.success_count += 1;
            } else {
                state.status.failed_count += 1;
            }
            state.status.total_input_tokens += record.input_tokens;
            state.status.total_output_tokens += record.output_tokens;
            state.status.total_credits += record.credits;

            let mut config_changed = false;
            if let Some(key_id) = &record.api_key_id {
                let mut config = (*state.config).clone();
                if let Some(key) = config.api_keys.iter_mut().find(|k| &k.id == key_id) {
                    apikey::record_usage(
                        key,
                        UsageRecord {
                            timestamp: now,
                            model: record.model.clone().unwrap_or_default(),
                            input_tokens: record.input_tokens,
                            output_tokens: record.output_tokens,
                            credits: record.credits,
                            path: record.path.clone(),
                        },
                    );
                    state.config = Arc::new(config);
                    config_changed = true;
                }
            }
            config_changed
        };

        self.persist_stats(config_changed).await;

        self.events.emit(ProxyEvent::Response {
            path: record.path,
            status: record.status,
            success: record.success,
            response_time_ms: record.response_time_ms,
        });
    }

    async fn persist_stats(&self, include_config: bool) {
        let (aggregate, logs, config) = {
            let state = self.state.read().await;
            (
                state.stats.aggregate().clone(),
                state.stats.logs_snapshot(),
                state.config.clone(),
            )
        };
        if let Err(e) = storage::save_stats(&self.data_dir, &aggregate).await {
            tracing::warn!(error = ?e, "持久化统计失败");
        }
        if let Err(e) = storage::save_logs(&self.data_dir, &logs).await {
            tracing::warn!(error = ?e, "持久化请求日志失败");
        }
        if include_config
            && let Err(e) = storage::save_config(&self.data_dir, &config).await
        {
            tracing::warn!(error = ?e, "持久化配置失败");
        }
    }

    pub async fn get_logs(&self, limit: usize) -> Vec<RequestLogEntry> {
        self.state.read().await.stats.get_logs(limit)
    }

    pub async fn clear_logs(&self) {
        self.state.write().await.stats.clear_logs();
        self.persist_stats(false).await;
    }

    /// 统计归零：聚合计数、状态镜像与账号计数一并清零，身份保留。
    pub async fn reset_stats(&self) {
        {
            let mut state = self.state.write().await;
            state.stats.reset();
            state.pool.reset_counters();
            state.status.request_count = 0;
            state.status.success_count = 0;
            state.status.failed_count = 0;
            state.status.total_input_tokens = 0;
            state.status.total_output_tokens = 0;
            state.status.total_credits = 0.0;
        }
        self.persist_stats(false).await;
    }

    pub async fn admin_stats(&self) -> AdminStatsResponse {
        let status = self.status().await;
        let state = self.state.read().await;
        AdminStatsResponse {
            status,
            aggregate: state.stats.aggregate().clone(),
            accounts: state.pool.views(),
        }
    }

    // ===== 模型列表 =====

    /// 上游模型列表（TTL 缓存）与映射规则来源模型合并。
    pub async fn models(&self) -> Vec<ModelView> {
        let (config, cache) = {
            let state = self.state.read().await;
            (state.config.clone(), state.model_cache.clone())
        };

        let upstream_models = cache
            .get_with(MODEL_CACHE_KEY, async {
                Arc::new(self.fetch_upstream_models().await)
            })
            .await;

        let mut models: Vec<ModelView> = (*upstream_models).clone();
        for rule in config.model_mappings.iter().filter(|r| r.enabled) {
            if rule.source_model == "*" || models.iter().any(|m| m.id == rule.source_model) {
                continue;
            }
            models.push(ModelView {
                id: rule.source_model.clone(),
                name: rule.source_model.clone(),
                description: format!("映射规则 {} 的来源模型", rule.name),
                source: "mapping".to_string(),
            });
        }
        models
    }

    async fn fetch_upstream_models(&self) -> Vec<ModelView> {
        let now = Utc::now().timestamp();
        let Some(account) = self
            .store
            .get_all()
            .await
            .into_iter()
            .find(|a| a.enabled && !a.expires_within(now, 0))
        else {
            return Vec::new();
        };
        let ctx = CallContext {
            access_token: account.access_token,
            profile_arn: account.profile_arn,
        };
        match self.upstream.list_models(&ctx).await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(error = %e, "获取上游模型列表失败");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AddApiKeyInput;
    use crate::upstream::{CallOptions, CallOutput, StreamChunk, UpstreamError};
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue};
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct NullUpstream;

    #[async_trait]
    impl UpstreamCaller for NullUpstream {
        async fn call(
            &self,
            _ctx: &CallContext,
            _model: &str,
            _body: &Value,
            _options: &CallOptions,
        ) -> Result<CallOutput, UpstreamError> {
            Ok(CallOutput::default())
        }

        async fn call_stream(
            &self,
            _ctx: &CallContext,
            _model: &str,
            _body: &Value,
            _options: &CallOptions,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, UpstreamError>>, UpstreamError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn list_models(&self, _ctx: &CallContext) -> Result<Vec<ModelView>, UpstreamError> {
            Ok(Vec::new())
        }
    }

    async fn build_service() -> Arc<ProxyService> {
        let dir = std::env::temp_dir().join(format!("kiro2api-service-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(Store::new(dir.to_str().unwrap()));
        let service = Arc::new(ProxyService::new(dir, store, Arc::new(NullUpstream)));
        service.init(None, None).await.unwrap();
        service
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn deleted_api_key_fails_auth_but_logs_keep_its_id() {
        let service = build_service().await;
        let kept = service
            .add_api_key(AddApiKeyInput {
                name: "kept".to_string(),
                key: "sk-kept-1234567890".to_string(),
                enabled: None,
                credits_limit: None,
            })
            .await
            .unwrap();
        let doomed = service
            .add_api_key(AddApiKeyInput {
                name: "doomed".to_string(),
                key: "sk-doomed-1234567890".to_string(),
                enabled: None,
                credits_limit: None,
            })
            .await
            .unwrap();

        service
            .record_completion(CompletionRecord {
                path: "/v1/chat/completions".to_string(),
                method: "POST".to_string(),
                model: Some("m".to_string()),
                account_id: None,
                api_key_id: Some(doomed.clone()),
                input_tokens: 1,
                output_tokens: 2,
                credits: 0.1,
                response_time_ms: 5,
                status: 200,
                success: true,
                error: None,
                outcome: None,
            })
            .await;

        service.delete_api_key(&doomed).await.unwrap();

        let config = service.config_snapshot().await;
        assert!(apikey::authenticate(&config, &bearer("sk-doomed-1234567890")).is_err());
        assert_eq!(
            apikey::authenticate(&config, &bearer("sk-kept-1234567890")).unwrap(),
            Some(kept)
        );

        // 删除只影响鉴权，历史日志保留孤儿 key id。
        let logs = service.get_logs(10).await;
        assert_eq!(logs[0].api_key_id.as_deref(), Some(doomed.as_str()));
    }

    #[tokio::test]
    async fn reset_stats_keeps_api_key_identity() {
        let service = build_service().await;
        let id = service
            .add_api_key(AddApiKeyInput {
                name: "k".to_string(),
                key: "sk-keep-1234567890".to_string(),
                enabled: None,
                credits_limit: None,
            })
            .await
            .unwrap();

        service.reset_stats().await;
        let keys = service.api_keys().await;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, id);
        assert_eq!(service.status().await.request_count, 0);
    }

    #[tokio::test]
    async fn model_cache_ttl_follows_config_update() {
        let service = build_service().await;
        let mut config = (*service.config_snapshot().await).clone();
        config.model_cache_ttl_sec = 1;
        service.update_config(config).await.unwrap();

        let state = service.state.read().await;
        assert_eq!(
            state.model_cache.policy().time_to_live(),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn init_applies_persisted_model_cache_ttl() {
        let dir = std::env::temp_dir().join(format!("kiro2api-service-{}", uuid::Uuid::new_v4()));
        let mut config = ProxyConfig::default();
        config.model_cache_ttl_sec = 7;
        storage::save_config(&dir, &config).await.unwrap();

        let store = Arc::new(Store::new(dir.to_str().unwrap()));
        let service = Arc::new(ProxyService::new(dir, store, Arc::new(NullUpstream)));
        service.init(None, None).await.unwrap();

        let state = service.state.read().await;
        assert_eq!(
            state.model_cache.policy().time_to_live(),
            Some(Duration::from_secs(7))
        );
    }
}
