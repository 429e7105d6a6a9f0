use std::collections::HashMap;

use serde::Serialize;

use crate::config::BudgetPolicy;

/// Per-session action and token counters. A session belongs to one task, so
/// callers never share a `SessionBudget` across jobs.
#[derive(Debug, Clone, Default)]
pub struct SessionBudget {
    total_actions: u32,
    per_type: HashMap<String, u32>,
    tokens_used: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BudgetCheck {
    Within,
    Exceeded { reason: String },
}

impl SessionBudget {
    /// Count one action of `category` against the session. Counters are
    /// updated exactly once per authorize call, before the limit comparison,
    /// so the deny reason reports the attempted count.
    pub fn record_action(&mut self, category: &str, policy: &BudgetPolicy) -> BudgetCheck {
        self.total_actions = self.total_actions.saturating_add(1);
        let typed = self
            .per_type
            .entry(category.to_string())
            .and_modify(|n| *n += 1)
            .or_insert(1);

        if let Some(&limit) = policy.max_actions_per_type.get(category) {
            if *typed > limit {
                return BudgetCheck::Exceeded {
                    reason: format!("Action budget exceeded for {category}: {typed}/{limit}"),
                };
            }
        }
        if policy.max_actions_per_session > 0 && self.total_actions > policy.max_actions_per_session
        {
            return BudgetCheck::Exceeded {
                reason: format!(
                    "Session action budget exceeded: {}/{}",
                    self.total_actions, policy.max_actions_per_session
                ),
            };
        }
        BudgetCheck::Within
    }

    pub fn record_tokens(&mut self, n: u64) {
        self.tokens_used = self.tokens_used.saturating_add(n);
    }

    pub fn tokens_exceeded(&self, policy: &BudgetPolicy) -> bool {
        policy.token_budget > 0 && self.tokens_used > policy.token_budget
    }

    pub fn status(&self, policy: &BudgetPolicy) -> BudgetStatus {
        BudgetStatus {
            actions_used: self.total_actions,
            max_actions_per_session: policy.max_actions_per_session,
            tokens_used: self.tokens_used,
            token_budget: policy.token_budget,
            per_type: self.per_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub actions_used: u32,
    pub max_actions_per_session: u32,
    pub tokens_used: u64,
    pub token_budget: u64,
    pub per_type: HashMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(session_max: u32, typed: &[(&str, u32)]) -> BudgetPolicy {
        BudgetPolicy {
            max_actions_per_session: session_max,
            max_actions_per_type: typed
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            token_budget: 0,
            on_exceed: crate::config::OnExceed::Block,
        }
    }

    #[test]
    fn third_action_over_a_two_action_session_reports_three_of_two() {
        let policy = policy(2, &[]);
        let mut budget = SessionBudget::default();
        assert_eq!(budget.record_action("write_file", &policy), BudgetCheck::Within);
        assert_eq!(budget.record_action("write_file", &policy), BudgetCheck::Within);
        match budget.record_action("write_file", &policy) {
            BudgetCheck::Exceeded { reason } => {
                assert!(reason.contains("Session action budget exceeded: 3/2"));
            }
            other => panic!("expected exceeded, got {other:?}"),
        }
    }

    #[test]
    fn per_type_limit_trips_before_session_limit() {
        let policy = policy(100, &[("git_push", 1)]);
        let mut budget = SessionBudget::default();
        assert_eq!(budget.record_action("git_push", &policy), BudgetCheck::Within);
        match budget.record_action("git_push", &policy) {
            BudgetCheck::Exceeded { reason } => assert!(reason.contains("git_push: 2/1")),
            other => panic!("expected exceeded, got {other:?}"),
        }
        // Other categories are unaffected.
        assert_eq!(budget.record_action("read_file", &policy), BudgetCheck::Within);
    }

    #[test]
    fn token_budget_is_post_hoc() {
        let mut policy = policy(10, &[]);
        policy.token_budget = 1_000;
        let mut budget = SessionBudget::default();
        budget.record_tokens(600);
        assert!(!budget.tokens_exceeded(&policy));
        budget.record_tokens(600);
        assert!(budget.tokens_exceeded(&policy));
    }
}
