//! 请求调度：鉴权后的单次客户端请求在账号池与模型映射之上的重试状态机。
//!
//! 失败分类决定走向：暂时性/配额类错误换号重试（配额在开启
//! autoSwitchOnQuotaExhausted 时同时换模型），401/403 先刷新一次凭据后
//! 原账号重试，不可重试错误立即向调用方传播。每个终态只产生一条日志、
//! 一次聚合更新与一次最终账号回报（由调用方经 record_completion 完成）。

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::pool::Outcome;
use crate::router;
use crate::service::ProxyService;
use crate::upstream::{CallContext, CallOptions, CallOutput, StreamChunk, UpstreamError};

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub path: String,
    pub method: String,
    pub requested_model: String,
    pub api_key_id: Option<String>,
    /// 归一化会话 JSON（messages/system/tools）。
    pub body: Value,
}

#[derive(Debug)]
pub struct DispatchSuccess {
    pub model: String,
    pub account_id: String,
    pub output: CallOutput,
}

/// 终态失败：error 面向调用方，outcome 留给 record_completion 做最终回报。
#[derive(Debug)]
pub struct DispatchFailure {
    pub error: AppError,
    pub model: Option<String>,
    pub account_id: Option<String>,
    pub outcome: Option<Outcome>,
}

impl DispatchFailure {
    fn without_account(error: AppError, model: Option<String>) -> Self {
        Self {
            error,
            model,
            account_id: None,
            outcome: None,
        }
    }
}

pub struct StreamHandle {
    pub model: String,
    pub account_id: String,
    pub receiver: tokio::sync::mpsc::Receiver<Result<StreamChunk, UpstreamError>>,
}

fn outcome_for(error: &UpstreamError) -> Outcome {
    match error {
        UpstreamError::Auth { message, .. } => Outcome::AuthFailure {
            message: message.clone(),
        },
        UpstreamError::QuotaExhausted { message } => Outcome::QuotaExhausted {
            message: message.clone(),
        },
        UpstreamError::Transient { message, .. } => Outcome::Transient {
            message: message.clone(),
        },
        UpstreamError::Network(e) => Outcome::Transient {
            message: e.to_string(),
        },
        UpstreamError::Fatal { message, .. } => Outcome::Fatal {
            message: message.clone(),
        },
    }
}

fn is_retryable(error: &UpstreamError) -> bool {
    !matches!(error, UpstreamError::Fatal { .. })
}

/// 本轮尝试的账号与凭据。
struct Attempt {
    account_id: String,
    ctx: CallContext,
}

async fn prepare_attempt(
    service: &Arc<ProxyService>,
    margin_secs: i64,
) -> Result<Attempt, AttemptError> {
    let now = Utc::now().timestamp();
    let Some(account_id) = service.select_account(now).await else {
        return Err(AttemptError::NoAccount);
    };

    if let Err(e) = service.store().ensure_fresh(&account_id, margin_secs).await {
        service.mark_refresh_failed(&account_id, &e.to_string()).await;
        return Err(AttemptError::RefreshFailed {
            account_id,
            message: e.to_string(),
        });
    }
    let Some(account) = service.store().get(&account_id).await else {
        return Err(AttemptError::NoAccount);
    };
    Ok(Attempt {
        account_id,
        ctx: CallContext {
            access_token: account.access_token,
            profile_arn: account.profile_arn,
        },
    })
}

enum AttemptError {
    NoAccount,
    RefreshFailed { account_id: String, message: String },
}

/// 非流式调度。
pub async fn dispatch(
    service: &Arc<ProxyService>,
    request: &DispatchRequest,
) -> Result<DispatchSuccess, DispatchFailure> {
    let config = service.config_snapshot().await;
    let max_attempts = config.max_retries.max(1);
    let margin = config.token_refresh_before_expiry_sec as i64;
    let options = CallOptions {
        preferred_endpoint: config.preferred_endpoint.clone(),
        disable_tools: config.disable_tools,
    };

    let mut tried_models: HashSet<String> = HashSet::new();
    let mut refreshed_accounts: HashSet<String> = HashSet::new();

    for attempt in 0..max_attempts {
        if attempt > 0 && config.retry_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(
                config.retry_delay_ms * attempt as u64,
            ))
            .await;
        }

        let model = router::resolve(
            &config.model_mappings,
            &request.requested_model,
            request.api_key_id.as_deref(),
            &tried_models,
        );

        let prepared = match prepare_attempt(service, margin).await {
            Ok(p) => p,
            Err(AttemptError::NoAccount) => {
                return Err(DispatchFailure::without_account(
                    AppError::NoAccountAvailable("账号池没有可用账号".to_string()),
                    Some(model),
                ));
            }
            Err(AttemptError::RefreshFailed { account_id, message }) => {
                tracing::warn!(account_id = %account_id, "凭据刷新失败，换号重试: {message}");
                continue;
            }
        };

        let mut result = service
            .upstream()
            .call(&prepared.ctx, &model, &request.body, &options)
            .await;

        // 401/403：先刷新一次凭据并在同一账号上重试，再考虑换号。
        if matches!(result, Err(UpstreamError::Auth { .. }))
            && refreshed_accounts.insert(prepared.account_id.clone())
            && service.store().refresh(&prepared.account_id).await.is_ok()
            && let Some(account) = service.store().get(&prepared.account_id).await
        {
            service.mark_refresh_ok(&prepared.account_id).await;
            let ctx = CallContext {
                access_token: account.access_token,
                profile_arn: account.profile_arn,
            };
            result = service
                .upstream()
                .call(&ctx, &model, &request.body, &options)
                .await;
        }

        match result {
            Ok(output) => {
                let output = auto_continue(
                    service,
                    &prepared.ctx,
                    &model,
                    &request.body,
                    &options,
                    output,
                    config.auto_continue_rounds,
                )
                .await;
                return Ok(DispatchSuccess {
                    model,
                    account_id: prepared.account_id,
                    output,
                });
            }
            Err(error) => {
                let outcome = outcome_for(&error);
                let terminal = !is_retryable(&error) || attempt + 1 >= max_attempts;
                if terminal {
                    return Err(DispatchFailure {
                        error: error.into(),
                        model: Some(model),
                        account_id: Some(prepared.account_id),
                        outcome: Some(outcome),
                    });
                }

                tracing::warn!(
                    account_id = %prepared.account_id,
                    model = %model,
                    attempt = attempt + 1,
                    error = %error,
                    "上游调用失败，换号重试"
                );
                let quota = matches!(outcome, Outcome::QuotaExhausted { .. });
                service
                    .report_outcome(&prepared.account_id, &outcome, Utc::now().timestamp())
                    .await;
                if quota && config.auto_switch_on_quota_exhausted {
                    tried_models.insert(model);
                }
            }
        }
    }

    Err(DispatchFailure::without_account(
        AppError::NoAccountAvailable("重试次数已用尽".to_string()),
        None,
    ))
}

/// 流式调度：重试只覆盖连接建立阶段，流开始后的终态由调用方回报。
pub async fn dispatch_stream(
    service: &Arc<ProxyService>,
    request: &DispatchRequest,
) -> Result<StreamHandle, DispatchFailure> {
    let config = service.config_snapshot().await;
    let max_attempts = config.max_retries.max(1);
    let margin = config.token_refresh_before_expiry_sec as i64;
    let options = CallOptions {
        preferred_endpoint: config.preferred_endpoint.clone(),
        disable_tools: config.disable_tools,
    };

    let mut tried_models: HashSet<String> = HashSet::new();
    let mut refreshed_accounts: HashSet<String> = HashSet::new();

    for attempt in 0..max_attempts {
        if attempt > 0 && config.retry_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(
                config.retry_delay_ms * attempt as u64,
            ))
            .await;
        }

        let model = router::resolve(
            &config.model_mappings,
            &request.requested_model,
            request.api_key_id.as_deref(),
            &tried_models,
        );

        let prepared = match prepare_attempt(service, margin).await {
            Ok(p) => p,
            Err(AttemptError::NoAccount) => {
                return Err(DispatchFailure::without_account(
                    AppError::NoAccountAvailable("账号池没有可用账号".to_string()),
                    Some(model),
                ));
            }
            Err(AttemptError::RefreshFailed { account_id, message }) => {
                tracing::warn!(account_id = %account_id, "凭据刷新失败，换号重试: {message}");
                continue;
            }
        };

        let mut result = service
            .upstream()
            .call_stream(&prepared.ctx, &model, &request.body, &options)
            .await;

        if matches!(result, Err(UpstreamError::Auth { .. }))
            && refreshed_accounts.insert(prepared.account_id.clone())
            && service.store().refresh(&prepared.account_id).await.is_ok()
            && let Some(account) = service.store().get(&prepared.account_id).await
        {
            service.mark_refresh_ok(&prepared.account_id).await;
            let ctx = CallContext {
                access_token: account.access_token,
                profile_arn: account.profile_arn,
            };
            result = service
                .upstream()
                .call_stream(&ctx, &model, &request.body, &options)
                .await;
        }

        match result {
            Ok(receiver) => {
                return Ok(StreamHandle {
                    model,
                    account_id: prepared.account_id,
                    receiver,
                });
            }
            Err(error) => {
                let outcome = outcome_for(&error);
                let terminal = !is_retryable(&error) || attempt + 1 >= max_attempts;
                if terminal {
                    return Err(DispatchFailure {
                        error: error.into(),
                        model: Some(model),
                        account_id: Some(prepared.account_id),
                        outcome: Some(outcome),
                    });
                }
                let quota = matches!(outcome, Outcome::QuotaExhausted { .. });
                service
                    .report_outcome(&prepared.account_id, &outcome, Utc::now().timestamp())
                    .await;
                if quota && config.auto_switch_on_quota_exhausted {
                    tried_models.insert(model);
                }
            }
        }
    }

    Err(DispatchFailure::without_account(
        AppError::NoAccountAvailable("重试次数已用尽".to_string()),
        None,
    ))
}

/// 输出被截断时在同一账号/模型上续写，拼接内容并累计用量。
async fn auto_continue(
    service: &Arc<ProxyService>,
    ctx: &CallContext,
    model: &str,
    body: &Value,
    options: &CallOptions,
    first: CallOutput,
    rounds: u32,
) -> CallOutput {
    let mut merged = first;
    if rounds == 0 || !merged.truncated {
        return merged;
    }

    let mut body = body.clone();
    for round in 0..rounds {
        if !merged.truncated {
            break;
        }
        if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
            messages.push(json!({"role": "assistant", "content": merged.content}));
            messages.push(json!({"role": "user", "content": "continue"}));
        } else {
            break;
        }

        match service.upstream().call(ctx, model, &body, options).await {
            Ok(next) => {
                merged.content.push_str(&next.content);
                merged.tool_uses.extend(next.tool_uses);
                merged.usage.input_tokens += next.usage.input_tokens;
                merged.usage.output_tokens += next.usage.output_tokens;
                merged.usage.credits += next.usage.credits;
                merged.truncated = next.truncated;
            }
            Err(e) => {
                tracing::warn!(round = round + 1, error = %e, "自动续写失败，保留已有内容");
                break;
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelMappingRule, ProxyConfig};
    use crate::credential::CredentialAccount;
    use crate::credential::store::Store;
    use crate::types::ModelView;
    use crate::upstream::{Usage, UpstreamCaller};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// 脚本化上游：按顺序回放预置结果，并记录每次调用的 token 与模型。
    struct MockUpstream {
        script: Mutex<VecDeque<Result<CallOutput, UpstreamError>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl MockUpstream {
        fn new(script: Vec<Result<CallOutput, UpstreamError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamCaller for MockUpstream {
        async fn call(
            &self,
            ctx: &CallContext,
            model: &str,
            _body: &Value,
            _options: &CallOptions,
        ) -> Result<CallOutput, UpstreamError> {
            self.calls
                .lock()
                .unwrap()
                .push((ctx.access_token.clone(), model.to_string()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CallOutput::default()))
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

    fn ok_output(content: &str, truncated: bool) -> Result<CallOutput, UpstreamError> {
        Ok(CallOutput {
            content: content.to_string(),
            thinking: None,
            tool_uses: Vec::new(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 20,
                credits: 0.1,
            },
            truncated,
        })
    }

    fn account(id: &str, token: &str) -> CredentialAccount {
        CredentialAccount {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            access_token: token.to_string(),
            refresh_token: format!("rt-{id}"),
            expires_at: Utc::now().timestamp() + 86400,
            enabled: true,
            profile_arn: None,
        }
    }

    async fn build_service(
        upstream: Arc<MockUpstream>,
        accounts: &[(&str, &str)],
        config: ProxyConfig,
    ) -> Arc<ProxyService> {
        let dir = std::env::temp_dir().join(format!("kiro2api-dispatch-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(Store::new(dir.to_str().unwrap()));
        let service = Arc::new(ProxyService::new(dir, store, upstream));
        service.init(None, None).await.unwrap();
        for (id, token) in accounts {
            service.add_account(account(id, token)).await.unwrap();
        }
        service.update_config(config).await.unwrap();
        service
    }

    fn fast_config() -> ProxyConfig {
        ProxyConfig {
            max_retries: 3,
            retry_delay_ms: 0,
            ..ProxyConfig::default()
        }
    }

    fn request(model: &str) -> DispatchRequest {
        DispatchRequest {
            path: "/v1/chat/completions".to_string(),
            method: "POST".to_string(),
            requested_model: model.to_string(),
            api_key_id: None,
            body: json!({"messages": [{"role": "user", "content": "hi"}]}),
        }
    }

    #[tokio::test]
    async fn transient_failure_rotates_to_second_account() {
        let upstream = Arc::new(MockUpstream::new(vec![
            Err(UpstreamError::Transient {
                status: 503,
                message: "busy".to_string(),
            }),
            ok_output("ok", false),
        ]));
        let service = build_service(
            upstream.clone(),
            &[("a", "tok-a"), ("b", "tok-b")],
            fast_config(),
        )
        .await;

        let success = dispatch(&service, &request("m")).await.expect("success");
        assert_eq!(success.output.content, "ok");

        let calls = upstream.calls();
        assert_eq!(calls.len(), 2);
        // 第二次调用换了账号。
        assert_ne!(calls[0].0, calls[1].0);
        assert_ne!(success.account_id, {
            let failed = service
                .accounts()
                .await
                .into_iter()
                .find(|a| a.error_count == 1)
                .expect("failed account");
            failed.id
        });
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let upstream = Arc::new(MockUpstream::new(vec![Err(UpstreamError::Fatal {
            status: 400,
            message: "bad request".to_string(),
        })]));
        let service = build_service(upstream.clone(), &[("a", "tok-a")], fast_config()).await;

        let failure = dispatch(&service, &request("m")).await.unwrap_err();
        assert_eq!(upstream.calls().len(), 1);
        assert!(matches!(failure.outcome, Some(Outcome::Fatal { .. })));
        assert_eq!(failure.error.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retries_exhaust_and_propagate_last_error() {
        let transient = || {
            Err(UpstreamError::Transient {
                status: 503,
                message: "busy".to_string(),
            })
        };
        let upstream = Arc::new(MockUpstream::new(vec![transient(), transient(), transient()]));
        let service = build_service(
            upstream.clone(),
            &[("a", "tok-a"), ("b", "tok-b"), ("c", "tok-c")],
            fast_config(),
        )
        .await;

        let failure = dispatch(&service, &request("m")).await.unwrap_err();
        assert_eq!(upstream.calls().len(), 3);
        assert!(matches!(failure.outcome, Some(Outcome::Transient { .. })));
    }

    #[tokio::test]
    async fn quota_rotates_model_when_auto_switch_enabled() {
        let upstream = Arc::new(MockUpstream::new(vec![
            Err(UpstreamError::QuotaExhausted {
                message: "quota".to_string(),
            }),
            ok_output("ok", false),
        ]));
        let mut config = fast_config();
        config.auto_switch_on_quota_exhausted = true;
        config.model_mappings = vec![ModelMappingRule {
            id: "r".to_string(),
            name: "lb".to_string(),
            enabled: true,
            mapping_type: "replace".to_string(),
            source_model: "m".to_string(),
            target_models: vec!["t1".to_string(), "t2".to_string()],
            weights: Vec::new(),
            priority: 100,
            api_key_ids: Vec::new(),
        }];
        let service = build_service(
            upstream.clone(),
            &[("a", "tok-a"), ("b", "tok-b")],
            config,
        )
        .await;

        let success = dispatch(&service, &request("m")).await.expect("success");
        assert_eq!(success.model, "t2");

        let calls = upstream.calls();
        assert_eq!(calls[0].1, "t1");
        assert_eq!(calls[1].1, "t2");
    }

    #[tokio::test]
    async fn no_account_available_fails_fast() {
        let upstream = Arc::new(MockUpstream::new(Vec::new()));
        let service = build_service(upstream.clone(), &[], fast_config()).await;

        let failure = dispatch(&service, &request("m")).await.unwrap_err();
        assert!(upstream.calls().is_empty());
        assert_eq!(
            failure.error.status(),
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn truncated_output_triggers_auto_continue() {
        let upstream = Arc::new(MockUpstream::new(vec![
            ok_output("第一段", true),
            ok_output("第二段", false),
        ]));
        let mut config = fast_config();
        config.auto_continue_rounds = 2;
        let service = build_service(upstream.clone(), &[("a", "tok-a")], config).await;

        let success = dispatch(&service, &request("m")).await.expect("success");
        assert_eq!(success.output.content, "第一段第二段");
        assert!(!success.output.truncated);
        assert_eq!(success.output.usage.output_tokens, 40);
        assert_eq!(upstream.calls().len(), 2);
    }
}
