//! 账号池内部状态类型。凭据本体不进池，只保留调度所需的运行时信息。

use serde::{Deserialize, Serialize};

use crate::types::AccountView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Cooldown,
    Error,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooldown => "cooldown",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

/// 一次上游调用的终态，决定账号状态如何迁移。
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    QuotaExhausted { message: String },
    AuthFailure { message: String },
    Transient { message: String },
    /// 不可重试错误：记录 last_error 但不进入冷却，账号仍可被选中。
    Fatal { message: String },
}

#[derive(Debug, Clone)]
pub struct PoolAccount {
    pub id: String,
    pub email: String,
    pub enabled: bool,
    pub status: AccountStatus,
    pub last_used: i64,
    /// 选中即更新的时间戳，避免并发请求在结果回报前重复命中同一账号。
    pub last_picked: i64,
    pub request_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<i64>,
    pub last_error: Option<String>,
    pub profile_arn: Option<String>,
}

impl PoolAccount {
    pub fn view(&self) -> AccountView {
        AccountView {
            id: self.id.clone(),
            email: self.email.clone(),
            enabled: self.enabled,
            status: self.status.as_str().to_string(),
            last_used: self.last_used,
            request_count: self.request_count,
            error_count: self.error_count,
            cooldown_until: self.cooldown_until,
            last_error: self.last_error.clone(),
            profile_arn: self.profile_arn.clone(),
        }
    }
}
