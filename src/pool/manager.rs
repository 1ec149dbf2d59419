//! 账号池：同步结构体，由上层的服务锁保证选择与回报的原子性。

use std::collections::HashMap;

use crate::error::truncate_error;
use crate::pool::types::{AccountStatus, Outcome, PoolAccount};
use crate::types::AccountView;

/// 配额耗尽冷却：min(60 * 2^(n-1), 3600) 秒。
fn quota_cooldown_secs(consecutive_failures: u32) -> i64 {
    let n = consecutive_failures.max(1);
    let base = 60i64.saturating_mul(1i64 << (n - 1).min(10));
    base.min(3600)
}

/// 认证/暂时性错误冷却：min(30 * 2^(n-1), 600) 秒。
fn error_cooldown_secs(consecutive_failures: u32) -> i64 {
    let n = consecutive_failures.max(1);
    let base = 30i64.saturating_mul(1i64 << (n - 1).min(10));
    base.min(600)
}

/// 同步后的账号种子（来自凭据仓库，不含 token）。
#[derive(Debug, Clone)]
pub struct AccountSeed {
    pub id: String,
    pub email: String,
    pub enabled: bool,
    pub profile_arn: Option<String>,
}

#[derive(Debug, Default)]
pub struct AccountPool {
    /// 声明顺序，同分时作为最终决胜。
    order: Vec<String>,
    accounts: HashMap<String, PoolAccount>,
}

impl AccountPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从凭据仓库全量同步：新账号插入，消失的移除，既有账号保留运行时状态。
    pub fn sync_accounts(&mut self, seeds: Vec<AccountSeed>) {
        let mut next_order = Vec::with_capacity(seeds.len());
        let mut next = HashMap::with_capacity(seeds.len());

        for seed in seeds {
            let account = match self.accounts.remove(&seed.id) {
                Some(mut existing) => {
                    existing.email = seed.email;
                    existing.enabled = seed.enabled;
                    existing.profile_arn = seed.profile_arn;
                    if !existing.enabled {
                        existing.status = AccountStatus::Disabled;
                    } else if existing.status == AccountStatus::Disabled {
                        existing.status = AccountStatus::Active;
                    }
                    existing
                }
                None => PoolAccount {
                    id: seed.id.clone(),
                    email: seed.email,
                    enabled: seed.enabled,
                    status: if seed.enabled {
                        AccountStatus::Active
                    } else {
                        AccountStatus::Disabled
                    },
                    last_used: 0,
                    last_picked: 0,
                    request_count: 0,
                    error_count: 0,
                    consecutive_failures: 0,
                    cooldown_until: None,
                    last_error: None,
                    profile_arn: seed.profile_arn,
                },
            };
            next_order.push(seed.id.clone());
            next.insert(seed.id, account);
        }

        self.order = next_order;
        self.accounts = next;
    }

    fn eligible(account: &PoolAccount, now: i64) -> bool {
        if !account.enabled || account.status == AccountStatus::Disabled {
            return false;
        }
        match account.cooldown_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// 选出下一个账号并立刻更新其 last_picked。
    ///
    /// candidate_ids 非空时限定候选集合；multi_account=false 时严格固定到
    /// 指定账号（候选集合第一个，否则声明顺序第一个），该账号不可用即失败，
    /// 不做静默回退。
    pub fn select_account(
        &mut self,
        candidate_ids: &[String],
        multi_account: bool,
        now: i64,
    ) -> Option<String> {
        if !multi_account {
            let pinned = candidate_ids
                .first()
                .cloned()
                .or_else(|| self.order.first().cloned())?;
            let account = self.accounts.get_mut(&pinned)?;
            if !Self::eligible(account, now) {
                return None;
            }
            account.last_picked = now;
            return Some(pinned);
        }

        let mut best: Option<(&String, i64, u64)> = None;
        for id in &self.order {
            if !candidate_ids.is_empty() && !candidate_ids.contains(id) {
                continue;
            }
            let Some(account) = self.accounts.get(id) else {
                continue;
            };
            if !Self::eligible(account, now) {
                continue;
            }
            // 有效最近使用时间取 last_used 与 last_picked 的较大者。
            let effective = account.last_used.max(account.last_picked);
            let better = match &best {
                None => true,
                Some((_, best_effective, best_errors)) => {
                    effective < *best_effective
                        || (effective == *best_effective && account.error_count < *best_errors)
                }
            };
            if better {
                best = Some((id, effective, account.error_count));
            }
        }

        let chosen = best.map(|(id, _, _)| id.clone())?;
        if let Some(account) = self.accounts.get_mut(&chosen) {
            account.last_picked = now;
        }
        Some(chosen)
    }

    pub fn report_outcome(&mut self, account_id: &str, outcome: &Outcome, now: i64) {
        let Some(account) = self.accounts.get_mut(account_id) else {
            return;
        };

        match outcome {
            Outcome::Success => {
                account.consecutive_failures = 0;
                account.last_used = now;
                account.request_count += 1;
                account.last_error = None;
                account.cooldown_until = None;
                if account.status != AccountStatus::Disabled {
                    account.status = AccountStatus::Active;
                }
            }
            Outcome::QuotaExhausted { message } => {
                account.error_count += 1;
                account.consecutive_failures += 1;
                account.last_error = Some(truncate_error(message));
                account.cooldown_until =
                    Some(now + quota_cooldown_secs(account.consecutive_failures));
                account.status = AccountStatus::Cooldown;
            }
            Outcome::AuthFailure { message } | Outcome::Transient { message } => {
                account.error_count += 1;
                account.consecutive_failures += 1;
                account.last_error = Some(truncate_error(message));
                account.cooldown_until =
                    Some(now + error_cooldown_secs(account.consecutive_failures));
                account.status = AccountStatus::Error;
            }
            Outcome::Fatal { message } => {
                account.error_count += 1;
                account.last_error = Some(truncate_error(message));
            }
        }
    }

    /// 供令牌刷新任务直接标记失败，不走调度回报。
    pub fn mark_refresh_failed(&mut self, account_id: &str, message: &str) {
        if let Some(account) = self.accounts.get_mut(account_id) {
            account.status = AccountStatus::Error;
            account.last_error = Some(truncate_error(message));
        }
    }

    pub fn mark_refresh_ok(&mut self, account_id: &str) {
        if let Some(account) = self.accounts.get_mut(account_id)
            && account.status == AccountStatus::Error
            && account.enabled
        {
            account.status = AccountStatus::Active;
            account.last_error = None;
        }
    }

    pub fn account_email(&self, account_id: &str) -> Option<String> {
        self.accounts.get(account_id).map(|a| a.email.clone())
    }

    pub fn views(&self) -> Vec<AccountView> {
        self.order
            .iter()
            .filter_map(|id| self.accounts.get(id))
            .map(PoolAccount::view)
            .collect()
    }

    /// 统计重置：清零计数器与错误状态，保留账号身份。
    pub fn reset_counters(&mut self) {
        for account in self.accounts.values_mut() {
            account.request_count = 0;
            account.error_count = 0;
            account.consecutive_failures = 0;
            account.cooldown_until = None;
            account.last_error = None;
            if account.enabled {
                account.status = AccountStatus::Active;
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(id: &str) -> AccountSeed {
        AccountSeed {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            enabled: true,
            profile_arn: None,
        }
    }

    fn pool_with(ids: &[&str]) -> AccountPool {
        let mut pool = AccountPool::new();
        pool.sync_accounts(ids.iter().map(|id| seed(id)).collect());
        pool
    }

    #[test]
    fn cooldown_boundary_is_inclusive() {
        let mut pool = pool_with(&["a"]);
        pool.report_outcome(
            "a",
            &Outcome::QuotaExhausted {
                message: "quota".to_string(),
            },
            100,
        );
        // n=1 → 60s 冷却，截止时刻本身视为已过期。
        assert_eq!(pool.select_account(&[], true, 159), None);
        assert_eq!(pool.select_account(&[], true, 160), Some("a".to_string()));
    }

    #[test]
    fn quota_backoff_doubles_and_caps() {
        let mut pool = pool_with(&["a"]);
        let quota = Outcome::QuotaExhausted {
            message: "q".to_string(),
        };
        pool.report_outcome("a", &quota, 0);
        let mut prev = 60;
        for _ in 0..10 {
            pool.report_outcome("a", &quota, 0);
            let until = pool.views()[0].cooldown_until.expect("cooldown");
            assert!(until >= prev);
            assert!(until <= 3600);
            prev = until;
        }
        assert_eq!(prev, 3600);
    }

    #[test]
    fn error_backoff_caps_at_600() {
        let mut pool = pool_with(&["a"]);
        let err = Outcome::Transient {
            message: "x".to_string(),
        };
        for _ in 0..8 {
            pool.report_outcome("a", &err, 0);
        }
        assert_eq!(pool.views()[0].cooldown_until, Some(600));
    }

    #[test]
    fn selection_prefers_least_recently_used_then_fewest_errors() {
        let mut pool = pool_with(&["a", "b", "c"]);
        pool.report_outcome("a", &Outcome::Success, 100);
        pool.report_outcome("b", &Outcome::Success, 50);
        // c 从未使用，应首先命中。
        assert_eq!(pool.select_account(&[], true, 200), Some("c".to_string()));
        // c 的 last_picked 已更新，下一次轮到 b。
        assert_eq!(pool.select_account(&[], true, 200), Some("b".to_string()));
    }

    #[test]
    fn tie_break_falls_to_error_count() {
        let mut pool = pool_with(&["a", "b"]);
        pool.report_outcome(
            "a",
            &Outcome::Fatal {
                message: "boom".to_string(),
            },
            0,
        );
        // last_used 相同（均为 0），error_count 少的 b 优先。
        assert_eq!(pool.select_account(&[], true, 10), Some("b".to_string()));
    }

    #[test]
    fn single_account_mode_pins_without_fallback() {
        let mut pool = pool_with(&["a", "b"]);
        let selected = vec!["b".to_string()];
        assert_eq!(
            pool.select_account(&selected, false, 10),
            Some("b".to_string())
        );
        pool.report_outcome(
            "b",
            &Outcome::QuotaExhausted {
                message: "q".to_string(),
            },
            10,
        );
        // b 冷却期间不回退到 a。
        assert_eq!(pool.select_account(&selected, false, 20), None);
    }

    #[test]
    fn candidate_filter_restricts_selection() {
        let mut pool = pool_with(&["a", "b", "c"]);
        let only_b = vec!["b".to_string()];
        assert_eq!(
            pool.select_account(&only_b, true, 10),
            Some("b".to_string())
        );
    }

    #[test]
    fn success_clears_failure_streak() {
        let mut pool = pool_with(&["a"]);
        pool.report_outcome(
            "a",
            &Outcome::Transient {
                message: "x".to_string(),
            },
            0,
        );
        pool.report_outcome("a", &Outcome::Success, 100);
        let view = &pool.views()[0];
        assert_eq!(view.status, "active");
        assert_eq!(view.cooldown_until, None);
        assert_eq!(view.last_error, None);
        assert_eq!(view.request_count, 1);
        // 失败计数保留为历史统计。
        assert_eq!(view.error_count, 1);
    }

    #[test]
    fn fatal_records_error_without_cooldown() {
        let mut pool = pool_with(&["a"]);
        pool.report_outcome(
            "a",
            &Outcome::Fatal {
                message: "bad request".to_string(),
            },
            0,
        );
        let view = &pool.views()[0];
        assert_eq!(view.cooldown_until, None);
        assert_eq!(view.error_count, 1);
        assert!(view.last_error.is_some());
        assert_eq!(pool.select_account(&[], true, 1), Some("a".to_string()));
    }

    #[test]
    fn sync_preserves_runtime_state() {
        let mut pool = pool_with(&["a", "b"]);
        pool.report_outcome("a", &Outcome::Success, 42);
        pool.sync_accounts(vec![seed("a"), seed("c")]);
        let views = pool.views();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].id, "a");
        assert_eq!(views[0].request_count, 1);
        assert_eq!(views[0].last_used, 42);
        assert_eq!(views[1].id, "c");
        assert_eq!(views[1].request_count, 0);
    }

    #[test]
    fn reset_counters_keeps_identity() {
        let mut pool = pool_with(&["a"]);
        pool.report_outcome(
            "a",
            &Outcome::Transient {
                message: "x".to_string(),
            },
            0,
        );
        pool.reset_counters();
        let view = &pool.views()[0];
        assert_eq!(view.error_count, 0);
        assert_eq!(view.status, "active");
        assert_eq!(view.email, "a@example.com");
    }
}
