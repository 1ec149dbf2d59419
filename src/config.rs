//! 配置：环境变量引导 + 代理实例的可识别选项集合。
//!
//! `ProxyConfig` 是一份不可变快照：更新时整体构造新值并原子替换，
//! 并发请求不会观察到字段逐个变化的中间态。

use figment::Figment;
use figment::providers::Env;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::UsageRecord;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5580;

/// 进程级引导配置（只从环境变量读取一次）。
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub debug: String,
    pub host_override: Option<String>,
    pub port_override: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,
}

impl Config {
    pub fn load() -> Self {
        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        Self {
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            host_override: raw.host,
            port_override: raw.port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyUsageDaily {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub credits: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyUsageModel {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub credits: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyUsage {
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_credits: f64,
    pub daily: HashMap<String, ApiKeyUsageDaily>,
    pub by_model: HashMap<String, ApiKeyUsageModel>,
}

/// 面向客户端的 API Key。删除后只失去鉴权能力，历史日志保留其 id。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyConfig {
    pub id: String,
    pub name: String,
    pub key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timestamp_now")]
    pub created_at: i64,
    #[serde(default)]
    pub last_used_at: Option<i64>,
    #[serde(default)]
    pub credits_limit: Option<f64>,
    #[serde(default)]
    pub usage: ApiKeyUsage,
    #[serde(default)]
    pub usage_history: Vec<UsageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMappingRule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        rename = "type",
        alias = "mappingType",
        default = "default_mapping_type"
    )]
    pub mapping_type: String,
    pub source_model: String,
    #[serde(default)]
    pub target_models: Vec<String>,
    #[serde(default)]
    pub weights: Vec<f64>,
    #[serde(default = "default_mapping_priority")]
    pub priority: i32,
    #[serde(default)]
    pub api_key_ids: Vec<String>,
}

impl ModelMappingRule {
    /// 规则保存时的不变量：目标非空；weights 要么为空要么与目标等长且均为正数。
    pub fn validate(&self) -> Result<(), String> {
        if self.target_models.iter().all(|t| t.trim().is_empty()) {
            return Err(format!("规则 {} 缺少目标模型", self.name));
        }
        if !self.weights.is_empty() {
            if self.weights.len() != self.target_models.len() {
                return Err(format!("规则 {} 的权重数量与目标模型不一致", self.name));
            }
            if self.weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
                return Err(format!("规则 {} 含非正权重", self.name));
            }
        }
        Ok(())
    }
}

/// 代理实例的完整可识别选项集合（camelCase JSON，持久化于 data_dir/config.json）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub auth_enabled: bool,
    /// 兼容旧版的单一 key；apiKeys 均不匹配时回退到它。
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    #[serde(default = "default_true")]
    pub enable_multi_account: bool,
    #[serde(default)]
    pub selected_account_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub log_requests: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_thinking_output_format")]
    pub thinking_output_format: String,
    #[serde(default)]
    pub auto_continue_rounds: u32,
    #[serde(default)]
    pub disable_tools: bool,
    #[serde(default)]
    pub preferred_endpoint: Option<String>,
    #[serde(default = "default_model_cache_ttl_sec")]
    pub model_cache_ttl_sec: u64,
    #[serde(default = "default_token_refresh_before_expiry_sec")]
    pub token_refresh_before_expiry_sec: u64,
    #[serde(default)]
    pub auto_switch_on_quota_exhausted: bool,
    #[serde(default)]
    pub model_mappings: Vec<ModelMappingRule>,
}

impl ProxyConfig {
    /// 整份配置的不变量检查（映射规则全量替换前调用）。
    pub fn validate(&self) -> Result<(), String> {
        for rule in &self.model_mappings {
            rule.validate()?;
        }
        Ok(())
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_thinking_output_format() -> String {
    "reasoning_content".to_string()
}

fn default_model_cache_ttl_sec() -> u64 {
    300
}

fn default_token_refresh_before_expiry_sec() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_timestamp_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn default_mapping_type() -> String {
    "replace".to_string()
}

fn default_mapping_priority() -> i32 {
    100
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_start: false,
            host: default_host(),
            port: default_port(),
            auth_enabled: true,
            api_key: None,
            api_keys: Vec::new(),
            enable_multi_account: true,
            selected_account_ids: Vec::new(),
            log_requests: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            thinking_output_format: default_thinking_output_format(),
            auto_continue_rounds: 0,
            disable_tools: false,
            preferred_endpoint: None,
            model_cache_ttl_sec: default_model_cache_ttl_sec(),
            token_refresh_before_expiry_sec: default_token_refresh_before_expiry_sec(),
            auto_switch_on_quota_exhausted: false,
            model_mappings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(targets: &[&str], weights: &[f64]) -> ModelMappingRule {
        ModelMappingRule {
            id: "r1".to_string(),
            name: "test".to_string(),
            enabled: true,
            mapping_type: "loadbalance".to_string(),
            source_model: "*".to_string(),
            target_models: targets.iter().map(|s| s.to_string()).collect(),
            weights: weights.to_vec(),
            priority: 100,
            api_key_ids: Vec::new(),
        }
    }

    #[test]
    fn rule_validation() {
        assert!(rule(&["a", "b"], &[]).validate().is_ok());
        assert!(rule(&["a", "b"], &[1.0, 2.0]).validate().is_ok());
        assert!(rule(&[], &[]).validate().is_err());
        assert!(rule(&["a", "b"], &[1.0]).validate().is_err());
        assert!(rule(&["a", "b"], &[1.0, -2.0]).validate().is_err());
        assert!(rule(&["a", "b"], &[1.0, f64::NAN]).validate().is_err());
    }

    #[test]
    fn proxy_config_defaults_from_empty_json() {
        let cfg: ProxyConfig = sonic_rs::from_str("{}").expect("empty json");
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 5580);
        assert!(cfg.auth_enabled);
        assert!(cfg.enable_multi_account);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay_ms, 1000);
        assert_eq!(cfg.thinking_output_format, "reasoning_content");
        assert_eq!(cfg.model_cache_ttl_sec, 300);
        assert_eq!(cfg.token_refresh_before_expiry_sec, 300);
        assert!(!cfg.auto_switch_on_quota_exhausted);
    }

    #[test]
    fn mapping_rule_accepts_type_alias() {
        let raw = r#"{
            "id": "m1",
            "name": "lb",
            "mappingType": "loadbalance",
            "sourceModel": "gpt-4o",
            "targetModels": ["claude-sonnet-4.5"]
        }"#;
        let rule: ModelMappingRule = sonic_rs::from_str(raw).expect("rule json");
        assert_eq!(rule.mapping_type, "loadbalance");
        assert_eq!(rule.priority, 100);
        assert!(rule.enabled);
    }
}
