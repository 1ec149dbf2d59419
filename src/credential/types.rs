use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 持久化的账号凭据（data_dir/accounts.json 中的一条）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialAccount {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    /// 过期时刻（epoch 秒）。
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

impl CredentialAccount {
    /// token 是否会在 margin_secs 内过期（含已过期）。
    pub fn expires_within(&self, now: i64, margin_secs: i64) -> bool {
        if self.expires_at == 0 || self.access_token.is_empty() {
            return true;
        }
        self.expires_at - now < margin_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_margin() {
        let account = CredentialAccount {
            id: "a".to_string(),
            email: String::new(),
            access_token: "tok".to_string(),
            refresh_token: "ref".to_string(),
            expires_at: 1000,
            enabled: true,
            profile_arn: None,
        };
        assert!(!account.expires_within(600, 300));
        assert!(account.expires_within(701, 300));
        assert!(account.expires_within(2000, 300));
    }

    #[test]
    fn missing_token_counts_as_expired() {
        let account = CredentialAccount {
            id: "a".to_string(),
            email: String::new(),
            access_token: String::new(),
            refresh_token: "ref".to_string(),
            expires_at: i64::MAX,
            enabled: true,
            profile_arn: None,
        };
        assert!(account.expires_within(0, 300));
    }
}
