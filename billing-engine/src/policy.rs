//! Billing policy: decides whether a request is skipped, logged only, or charged.
//!
//! Classification is a pure function of path, method and caller role over
//! a set of path tables. Tables match exactly or on a path-segment prefix
//! (`/admin` matches `/admin/users` but not `/administrator`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// What the gateway should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingBehavior {
    /// No billing, no usage log.
    Skip,
    /// Usage log only, never charged.
    LogOnly,
    /// Pre-check and charge.
    Normal,
}

impl BillingBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::LogOnly => "log_only",
            Self::Normal => "normal",
        }
    }
}

impl std::fmt::Display for BillingBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    #[default]
    User,
    Admin,
    /// Internal service-to-service call.
    System,
}

/// Transport-independent view of an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    pub path: String,
    pub method: String,
    pub caller_role: CallerRole,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            caller_role: CallerRole::User,
        }
    }

    pub fn with_role(mut self, caller_role: CallerRole) -> Self {
        self.caller_role = caller_role;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialRuleType {
    Skip,
    Admin,
    Free,
    Internal,
    Monitor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialRule {
    pub rule_type: SpecialRuleType,
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl SpecialRule {
    pub fn new(rule_type: SpecialRuleType, description: impl Into<String>) -> Self {
        Self {
            rule_type,
            description: description.into(),
            config: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingPolicy {
    skip_paths: BTreeSet<String>,
    admin_paths: BTreeSet<String>,
    free_paths: BTreeSet<String>,
    special_rules: HashMap<String, SpecialRule>,
}

fn paths(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|p| p.to_string()).collect()
}

fn path_matches(path: &str, pattern: &str) -> bool {
    if path == pattern {
        return true;
    }
    if pattern.ends_with('/') {
        return path.starts_with(pattern);
    }
    path.strip_prefix(pattern)
        .is_some_and(|rest| rest.starts_with('/'))
}

impl Default for BillingPolicy {
    fn default() -> Self {
        let mut special_rules = HashMap::new();
        special_rules.insert(
            "/api/v1/auth".to_string(),
            SpecialRule::new(SpecialRuleType::Skip, "Authentication endpoints are not billed"),
        );
        let mut test_rule = SpecialRule::new(SpecialRuleType::Free, "Test endpoints are free");
        test_rule
            .config
            .insert("max_requests_per_day".to_string(), 100.into());
        special_rules.insert("/api/v1/test".to_string(), test_rule);

        Self {
            skip_paths: paths(&[
                "/health",
                "/metrics",
                "/swagger",
                "/favicon.ico",
                "/robots.txt",
            ]),
            admin_paths: paths(&[
                "/admin",
                "/api/v1/admin",
                "/api/admin",
                "/dashboard",
                "/api/v1/users",
                "/api/v1/api-keys",
                "/api/v1/models",
                "/api/v1/quotas",
                "/api/v1/billing/records",
                "/api/v1/stats",
                "/api/v1/system",
            ]),
            free_paths: paths(&[
                "/api/v1/models/list",
                "/api/v1/user/profile",
                "/api/v1/user/balance",
                "/api/v1/usage/stats",
            ]),
            special_rules,
        }
    }
}

impl BillingPolicy {
    /// A policy with empty tables. Every API request is billed.
    pub fn empty() -> Self {
        Self {
            skip_paths: BTreeSet::new(),
            admin_paths: BTreeSet::new(),
            free_paths: BTreeSet::new(),
            special_rules: HashMap::new(),
        }
    }

    pub fn classify(&self, request: &RequestDescriptor) -> BillingBehavior {
        let path = request.path.as_str();

        if Self::matches_any(path, &self.skip_paths) {
            return BillingBehavior::Skip;
        }

        if request.method.eq_ignore_ascii_case("GET") && !is_api_call(path) {
            return BillingBehavior::Skip;
        }

        let special = self.special_rule(path);
        if matches!(special, Some(rule) if rule.rule_type == SpecialRuleType::Skip) {
            return BillingBehavior::Skip;
        }

        if Self::matches_any(path, &self.admin_paths) || Self::matches_any(path, &self.free_paths)
        {
            return BillingBehavior::LogOnly;
        }

        if let Some(rule) = special {
            match rule.rule_type {
                SpecialRuleType::Admin
                | SpecialRuleType::Free
                | SpecialRuleType::Internal
                | SpecialRuleType::Monitor => return BillingBehavior::LogOnly,
                SpecialRuleType::Skip => {}
            }
        }

        match request.caller_role {
            CallerRole::Admin | CallerRole::System => BillingBehavior::LogOnly,
            CallerRole::User => BillingBehavior::Normal,
        }
    }

    pub fn is_admin_path(&self, path: &str) -> bool {
        Self::matches_any(path, &self.admin_paths)
    }

    /// Longest matching special rule for `path`.
    pub fn special_rule(&self, path: &str) -> Option<&SpecialRule> {
        self.special_rules
            .iter()
            .filter(|(pattern, _)| path_matches(path, pattern))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, rule)| rule)
    }

    pub fn add_skip_path(&mut self, path: impl Into<String>) {
        self.skip_paths.insert(path.into());
    }

    pub fn add_admin_path(&mut self, path: impl Into<String>) {
        self.admin_paths.insert(path.into());
    }

    pub fn add_free_path(&mut self, path: impl Into<String>) {
        self.free_paths.insert(path.into());
    }

    pub fn add_special_rule(&mut self, path: impl Into<String>, rule: SpecialRule) {
        self.special_rules.insert(path.into(), rule);
    }

    fn matches_any(path: &str, table: &BTreeSet<String>) -> bool {
        table.contains(path) || table.iter().any(|pattern| path_matches(path, pattern))
    }
}

fn is_api_call(path: &str) -> bool {
    path.starts_with("/api/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(method: &str, path: &str) -> BillingBehavior {
        BillingPolicy::default().classify(&RequestDescriptor::new(method, path))
    }

    #[test]
    fn skip_paths_win_over_everything() {
        assert_eq!(classify("POST", "/health"), BillingBehavior::Skip);
        assert_eq!(classify("GET", "/swagger/index.html"), BillingBehavior::Skip);

        let request = RequestDescriptor::new("POST", "/metrics").with_role(CallerRole::Admin);
        assert_eq!(
            BillingPolicy::default().classify(&request),
            BillingBehavior::Skip
        );
    }

    #[test]
    fn get_outside_api_is_skipped() {
        assert_eq!(classify("GET", "/"), BillingBehavior::Skip);
        assert_eq!(classify("GET", "/static/app.js"), BillingBehavior::Skip);
        assert_eq!(classify("POST", "/upload"), BillingBehavior::Normal);
    }

    #[test]
    fn admin_and_free_paths_are_log_only() {
        assert_eq!(classify("POST", "/api/v1/users/42"), BillingBehavior::LogOnly);
        assert_eq!(classify("GET", "/api/v1/user/balance"), BillingBehavior::LogOnly);
        assert_eq!(classify("GET", "/api/v1/models/list"), BillingBehavior::LogOnly);
    }

    #[test]
    fn special_rules_apply() {
        assert_eq!(classify("POST", "/api/v1/auth/login"), BillingBehavior::Skip);
        assert_eq!(classify("POST", "/api/v1/test/echo"), BillingBehavior::LogOnly);
    }

    #[test]
    fn prefix_match_respects_segments() {
        assert_eq!(classify("POST", "/administrator"), BillingBehavior::Normal);
        assert_eq!(classify("POST", "/admin/settings"), BillingBehavior::LogOnly);
    }

    #[test]
    fn model_calls_are_billed() {
        assert_eq!(classify("POST", "/v1/chat/completions"), BillingBehavior::Normal);
        assert_eq!(classify("POST", "/api/v1/chat/completions"), BillingBehavior::Normal);
        assert_eq!(classify("GET", "/api/v1/images/jobs/7"), BillingBehavior::Normal);
    }

    #[test]
    fn admin_and_internal_callers_are_not_charged() {
        let policy = BillingPolicy::default();
        let admin =
            RequestDescriptor::new("POST", "/v1/chat/completions").with_role(CallerRole::Admin);
        let system =
            RequestDescriptor::new("POST", "/v1/chat/completions").with_role(CallerRole::System);

        assert_eq!(policy.classify(&admin), BillingBehavior::LogOnly);
        assert_eq!(policy.classify(&system), BillingBehavior::LogOnly);
    }

    #[test]
    fn dynamic_rules() {
        let mut policy = BillingPolicy::empty();
        let request = RequestDescriptor::new("POST", "/v1/embeddings");
        assert_eq!(policy.classify(&request), BillingBehavior::Normal);

        policy.add_free_path("/v1/embeddings");
        assert_eq!(policy.classify(&request), BillingBehavior::LogOnly);

        policy.add_special_rule(
            "/v1",
            SpecialRule::new(SpecialRuleType::Skip, "maintenance window"),
        );
        assert_eq!(policy.classify(&request), BillingBehavior::Skip);

        policy.add_skip_path("/v2");
        assert_eq!(
            policy.classify(&RequestDescriptor::new("POST", "/v2/x")),
            BillingBehavior::Skip
        );
    }

    #[test]
    fn monitor_rule_logs_only() {
        let mut policy = BillingPolicy::empty();
        policy.add_special_rule(
            "/api/v1/probe",
            SpecialRule::new(SpecialRuleType::Monitor, "synthetic probes"),
        );
        policy.add_admin_path("/api/v1/ops");

        assert_eq!(
            policy.classify(&RequestDescriptor::new("POST", "/api/v1/probe")),
            BillingBehavior::LogOnly
        );
        assert!(policy.is_admin_path("/api/v1/ops/restart"));
    }
}
