//! 令牌生命周期后台任务：定期巡检即将过期的账号并提前刷新。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::credential::store::RefreshOutcome;
use crate::service::ProxyService;

const CHECK_INTERVAL_SECS: u64 = 60;

/// 启动刷新巡检循环。shutdown 置位后循环退出，任务不残留。
pub fn spawn(service: Arc<ProxyService>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CHECK_INTERVAL_SECS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    run_cycle(&service).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("令牌刷新任务已退出");
    })
}

/// 单轮巡检：逐个刷新临近过期的启用账号。
/// 刷新失败只标记账号状态，不中断本轮其余账号。
async fn run_cycle(service: &ProxyService) {
    let margin = service.config_snapshot().await.token_refresh_before_expiry_sec as i64;
    let now = Utc::now().timestamp();

    for account in service.store().get_all().await {
        if !account.enabled || !account.expires_within(now, margin) {
            continue;
        }
        match service.store().refresh(&account.id).await {
            Ok(RefreshOutcome::Refreshed) => {
                tracing::info!(account_id = %account.id, "定时刷新 access token 成功");
                service.mark_refresh_ok(&account.id).await;
            }
            Ok(RefreshOutcome::AlreadyRefreshing) => {
                tracing::debug!(account_id = %account.id, "账号正在刷新，本轮跳过");
            }
            Ok(RefreshOutcome::StillValid) => {}
            Err(e) => {
                tracing::warn!(account_id = %account.id, error = ?e, "定时刷新失败");
                service.mark_refresh_failed(&account.id, &e.to_string()).await;
            }
        }
    }
}
