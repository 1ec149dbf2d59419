//! 凭据仓库：accounts.json 的读写 + 向身份服务换取新 access token。

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::credential::types::CredentialAccount;
use crate::pool::manager::AccountSeed;

const REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// 新 token 的有效期（秒）。
    expires_in: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// 其他调用方正在刷新同一账号，本次跳过。
    AlreadyRefreshing,
    /// token 距过期尚远，无需刷新。
    StillValid,
}

#[derive(Debug, Default)]
struct State {
    accounts: Vec<CredentialAccount>,
    /// 正在刷新的账号 id，保证每账号同时至多一个刷新请求。
    refreshing: HashSet<String>,
}

#[derive(Debug)]
pub struct Store {
    file_path: PathBuf,
    state: RwLock<State>,
    http: reqwest::Client,
}

impl Store {
    pub fn new(data_dir: &str) -> Self {
        Self {
            file_path: PathBuf::from(data_dir).join("accounts.json"),
            state: RwLock::new(State::default()),
            http: reqwest::Client::new(),
        }
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;

        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.state.write().await.accounts.clear();
                return Ok(());
            }
            Err(e) => return Err(e).context("读取 accounts.json 失败"),
        };

        let accounts: Vec<CredentialAccount> =
            sonic_rs::from_slice(&data).context("解析 accounts.json 失败")?;
        self.state.write().await.accounts = accounts;
        Ok(())
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let snapshot = {
            let state = self.state.read().await;
            state.accounts.clone()
        };
        ensure_parent_dir(&self.file_path).await?;
        let data = sonic_rs::to_vec_pretty(&snapshot).context("序列化 accounts.json 失败")?;
        tokio::fs::write(&self.file_path, data)
            .await
            .context("写入 accounts.json 失败")
    }

    pub async fn get_all(&self) -> Vec<CredentialAccount> {
        self.state.read().await.accounts.clone()
    }

    /// 账号池同步所需的种子（不含 token）。
    pub async fn seeds(&self) -> Vec<AccountSeed> {
        self.state
            .read()
            .await
            .accounts
            .iter()
            .map(|a| AccountSeed {
                id: a.id.clone(),
                email: a.email.clone(),
                enabled: a.enabled,
                profile_arn: a.profile_arn.clone(),
            })
            .collect()
    }

    pub async fn get(&self, account_id: &str) -> Option<CredentialAccount> {
        self.state
            .read()
            .await
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .cloned()
    }

    pub async fn add(&self, account: CredentialAccount) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            let replaced = state.accounts.iter_mut().any(|existing| {
                if (!account.email.is_empty() && existing.email == account.email)
                    || existing.refresh_token == account.refresh_token
                {
                    let id = existing.id.clone();
                    *existing = account.clone();
                    existing.id = id;
                    true
                } else {
                    false
                }
            });
            if !replaced {
                state.accounts.push(account);
            }
        }
        self.save().await
    }

    pub async fn delete(&self, account_id: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            let before = state.accounts.len();
            state.accounts.retain(|a| a.id != account_id);
            if state.accounts.len() == before {
                return Err(anyhow!("账号不存在: {account_id}"));
            }
        }
        self.save().await
    }

    pub async fn set_enabled(&self, account_id: &str, enabled: bool) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            let account = state
                .accounts
                .iter_mut()
                .find(|a| a.id == account_id)
                .ok_or_else(|| anyhow!("账号不存在: {account_id}"))?;
            account.enabled = enabled;
        }
        self.save().await
    }

    /// 刷新指定账号的 access token（单飞：同账号并发刷新只放行一个）。
    pub async fn refresh(&self, account_id: &str) -> anyhow::Result<RefreshOutcome> {
        let account = {
            let mut state = self.state.write().await;
            if state.refreshing.contains(account_id) {
                return Ok(RefreshOutcome::AlreadyRefreshing);
            }
            let account = state
                .accounts
                .iter()
                .find(|a| a.id == account_id)
                .cloned()
                .ok_or_else(|| anyhow!("账号不存在: {account_id}"))?;
            state.refreshing.insert(account_id.to_string());
            account
        };

        // HTTP 调用不持锁。
        let result = self.do_refresh(&account).await;

        let mut state = self.state.write().await;
        state.refreshing.remove(account_id);
        let refreshed = result?;
        if let Some(existing) = state.accounts.iter_mut().find(|a| a.id == account_id) {
            *existing = refreshed;
        }
        drop(state);

        self.save().await?;
        Ok(RefreshOutcome::Refreshed)
    }

    /// 仅在临近过期时刷新。
    pub async fn ensure_fresh(
        &self,
        account_id: &str,
        margin_secs: i64,
    ) -> anyhow::Result<RefreshOutcome> {
        let now = Utc::now().timestamp();
        let needs_refresh = {
            let state = self.state.read().await;
            let account = state
                .accounts
                .iter()
                .find(|a| a.id == account_id)
                .ok_or_else(|| anyhow!("账号不存在: {account_id}"))?;
            account.expires_within(now, margin_secs)
        };
        if !needs_refresh {
            return Ok(RefreshOutcome::StillValid);
        }
        self.refresh(account_id).await
    }

    async fn do_refresh(&self, account: &CredentialAccount) -> anyhow::Result<CredentialAccount> {
        if account.refresh_token.is_empty() {
            return Err(anyhow!("账号 {} 缺少 refresh token", account.id));
        }

        let response = self
            .http
            .post(REFRESH_URL)
            .json(&RefreshRequest {
                refresh_token: &account.refresh_token,
            })
            .send()
            .await
            .context("刷新 token 请求失败")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("刷新 token 失败 {status}: {body}"));
        }

        let refreshed: RefreshResponse =
            response.json().await.context("解析刷新响应失败")?;

        let mut updated = account.clone();
        updated.access_token = refreshed.access_token;
        if let Some(rt) = refreshed.refresh_token
            && !rt.is_empty()
        {
            updated.refresh_token = rt;
        }
        updated.expires_at = Utc::now().timestamp() + refreshed.expires_in;
        Ok(updated)
    }
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}
