//! 模型映射路由：按优先级匹配规则，把入站模型名改写为上游目标模型。

use std::collections::HashSet;

use crate::config::ModelMappingRule;
use crate::util::rand;

/// 解析入站模型应使用的上游目标。
///
/// 规则集内按 priority 降序、同分按声明顺序取第一条匹配规则；
/// tried 中的目标视为本轮已失败而跳过。规则耗尽或无规则命中时
/// 恒等映射（原样返回请求的模型名）。
pub fn resolve(
    rules: &[ModelMappingRule],
    requested: &str,
    api_key_id: Option<&str>,
    tried: &HashSet<String>,
) -> String {
    let mut matched: Vec<&ModelMappingRule> = rules
        .iter()
        .filter(|rule| rule.enabled)
        .filter(|rule| match api_key_id {
            // 带作用域的规则只对名单内的 key 生效。
            _ if rule.api_key_ids.is_empty() => true,
            Some(id) => rule.api_key_ids.iter().any(|k| k == id),
            None => false,
        })
        .filter(|rule| rule.source_model == requested || rule.source_model == "*")
        .collect();
    matched.sort_by(|a, b| b.priority.cmp(&a.priority));

    let Some(rule) = matched.first() else {
        return requested.to_string();
    };

    match rule.mapping_type.as_str() {
        "loadbalance" => weighted_draw(rule, tried).unwrap_or_else(|| requested.to_string()),
        // replace 与未知类型一致：按声明顺序取第一个未尝试的目标。
        _ => rule
            .target_models
            .iter()
            .find(|t| !tried.contains(*t))
            .cloned()
            .unwrap_or_else(|| requested.to_string()),
    }
}

/// 在未尝试的目标里按权重抽一个；weights 与目标等长时加权，否则等概率。
fn weighted_draw(rule: &ModelMappingRule, tried: &HashSet<String>) -> Option<String> {
    let use_weights = rule.weights.len() == rule.target_models.len();
    let candidates: Vec<(usize, &String)> = rule
        .target_models
        .iter()
        .enumerate()
        .filter(|(_, t)| !tried.contains(*t))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0].1.clone());
    }

    let total: f64 = if use_weights {
        candidates.iter().map(|(i, _)| rule.weights[*i]).sum()
    } else {
        candidates.len() as f64
    };
    if !(total.is_finite() && total > 0.0) {
        let idx = (rand::next_u64() as usize) % candidates.len();
        return Some(candidates[idx].1.clone());
    }

    let mut point = rand::next_f64() * total;
    for (i, target) in &candidates {
        let weight = if use_weights { rule.weights[*i] } else { 1.0 };
        point -= weight;
        if point <= 0.0 {
            return Some((*target).clone());
        }
    }
    Some(candidates[candidates.len() - 1].1.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rule(
        id: &str,
        mapping_type: &str,
        source: &str,
        targets: &[&str],
        weights: &[f64],
        priority: i32,
    ) -> ModelMappingRule {
        ModelMappingRule {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            mapping_type: mapping_type.to_string(),
            source_model: source.to_string(),
            target_models: targets.iter().map(|s| s.to_string()).collect(),
            weights: weights.to_vec(),
            priority,
            api_key_ids: Vec::new(),
        }
    }

    #[test]
    fn no_rule_is_identity() {
        let tried = HashSet::new();
        assert_eq!(resolve(&[], "gpt-4o", None, &tried), "gpt-4o");
    }

    #[test]
    fn exact_match_beats_wildcard_by_priority() {
        let rules = vec![
            rule("wild", "replace", "*", &["fallback"], &[], 1),
            rule("exact", "replace", "gpt-4o", &["claude-sonnet-4.5"], &[], 10),
        ];
        let tried = HashSet::new();
        assert_eq!(
            resolve(&rules, "gpt-4o", None, &tried),
            "claude-sonnet-4.5"
        );
        assert_eq!(resolve(&rules, "gpt-4.1", None, &tried), "fallback");
    }

    #[test]
    fn equal_priority_uses_declaration_order() {
        let rules = vec![
            rule("first", "replace", "*", &["a"], &[], 5),
            rule("second", "replace", "*", &["b"], &[], 5),
        ];
        let tried = HashSet::new();
        assert_eq!(resolve(&rules, "m", None, &tried), "a");
    }

    #[test]
    fn disabled_rule_is_skipped() {
        let mut disabled = rule("d", "replace", "*", &["a"], &[], 10);
        disabled.enabled = false;
        let rules = vec![disabled, rule("e", "replace", "*", &["b"], &[], 1)];
        let tried = HashSet::new();
        assert_eq!(resolve(&rules, "m", None, &tried), "b");
    }

    #[test]
    fn scoped_rule_only_applies_to_listed_keys() {
        let mut scoped = rule("s", "replace", "*", &["scoped-target"], &[], 10);
        scoped.api_key_ids = vec!["key-1".to_string()];
        let rules = vec![scoped];
        let tried = HashSet::new();
        assert_eq!(
            resolve(&rules, "m", Some("key-1"), &tried),
            "scoped-target"
        );
        assert_eq!(resolve(&rules, "m", Some("key-2"), &tried), "m");
        assert_eq!(resolve(&rules, "m", None, &tried), "m");
    }

    #[test]
    fn replace_skips_tried_targets() {
        let rules = vec![rule("r", "replace", "*", &["a", "b"], &[], 1)];
        let mut tried = HashSet::new();
        tried.insert("a".to_string());
        assert_eq!(resolve(&rules, "m", None, &tried), "b");
    }

    #[test]
    fn exhausted_rule_falls_back_to_identity() {
        let rules = vec![rule("r", "loadbalance", "*", &["a", "b"], &[], 1)];
        let tried: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(resolve(&rules, "m", None, &tried), "m");
    }

    #[test]
    fn weighted_draw_converges_to_weights() {
        let rules = vec![rule("lb", "loadbalance", "*", &["a", "b"], &[9.0, 1.0], 1)];
        let tried = HashSet::new();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..10_000 {
            *counts.entry(resolve(&rules, "m", None, &tried)).or_default() += 1;
        }
        let a = *counts.get("a").unwrap_or(&0) as f64;
        let b = *counts.get("b").unwrap_or(&0) as f64;
        // 期望 9:1，允许较宽的统计波动。
        assert!(a / (a + b) > 0.85, "a={a} b={b}");
        assert!(b > 0.0);
    }

    #[test]
    fn uniform_draw_when_weights_mismatch() {
        let rules = vec![rule("lb", "loadbalance", "*", &["a", "b"], &[1.0], 1)];
        let tried = HashSet::new();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..10_000 {
            *counts.entry(resolve(&rules, "m", None, &tried)).or_default() += 1;
        }
        let a = *counts.get("a").unwrap_or(&0) as f64;
        let ratio = a / 10_000.0;
        assert!((0.4..0.6).contains(&ratio), "ratio={ratio}");
    }
}
