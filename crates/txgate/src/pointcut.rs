//! Pointcut matching: which calls get a transaction boundary.
//!
//! A [`Pointcut`] is an immutable rule set built once at startup. Matching is
//! a pure function of `(type name, method name, type markers)`, so a single
//! pointcut can be shared across every calling task without locking.
//!
//! Matching happens in two stages:
//!
//! - [`MethodMatcher::matches_type`]: could any method of this type be
//!   transactional? Types that fail this check are never wrapped.
//! - [`MethodMatcher::matches`]: should *this* call run in a transaction?

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::core::simple_type_name;
use crate::error::{TxError, TxResult};

/// Method-name prefixes that imply a read-only transaction.
pub const READ_ONLY_PREFIXES: &[&str] = &["get", "find"];

/// Infer the read-only flag from a method name.
pub fn infer_read_only(method: &str) -> bool {
    READ_ONLY_PREFIXES
        .iter()
        .any(|prefix| method.starts_with(prefix))
}

/// Strategy deciding which calls are transactional.
///
/// [`Pointcut`] is the configurable implementation; custom strategies can be
/// plugged into [`crate::ProxyFactory`] directly.
pub trait MethodMatcher: Send + Sync {
    /// Type-level stage: should instances of this type be proxied at all?
    fn matches_type(&self, type_name: &str, markers: &[&str]) -> bool;

    /// Call-level stage: should this call run inside a transaction?
    fn matches(&self, type_name: &str, method: &str, markers: &[&str]) -> bool;

    /// Read-only flag for a matched call. An explicit flag always wins.
    fn read_only(&self, method: &str, explicit: Option<bool>) -> bool {
        explicit.unwrap_or_else(|| infer_read_only(method))
    }
}

/// One compiled pointcut rule.
#[derive(Debug, Clone)]
pub enum PointcutRule {
    /// Type's simple name ends with `type_suffix` and the method name starts
    /// with one of `method_prefixes`.
    NamePattern {
        type_suffix: String,
        method_prefixes: Vec<String>,
    },
    /// Type carries `marker`; every method matches.
    Marker { marker: String },
    /// Type's simple name equals `target_type` and the whole method name
    /// matches `method_pattern`.
    Regex {
        target_type: String,
        method_pattern: Regex,
    },
}

impl PointcutRule {
    pub fn name_pattern<I, S>(type_suffix: impl Into<String>, method_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::NamePattern {
            type_suffix: type_suffix.into(),
            method_prefixes: method_prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn marker(marker: impl Into<String>) -> Self {
        Self::Marker {
            marker: marker.into(),
        }
    }

    /// Compile a regex rule. The pattern must match the entire method name.
    pub fn regex(target_type: impl Into<String>, pattern: &str) -> TxResult<Self> {
        let anchored = format!("^(?:{pattern})$");
        let method_pattern = Regex::new(&anchored)
            .map_err(|e| TxError::config(format!("invalid method pattern {pattern:?}: {e}")))?;
        Ok(Self::Regex {
            target_type: target_type.into(),
            method_pattern,
        })
    }

    /// Build and validate a rule from its configuration form.
    pub fn compile(config: &PointcutRuleConfig) -> TxResult<Self> {
        match config {
            PointcutRuleConfig::NamePattern {
                type_suffix,
                method_prefixes,
            } => {
                if type_suffix.is_empty() {
                    return Err(TxError::config("name_pattern rule needs a type_suffix"));
                }
                if method_prefixes.is_empty() || method_prefixes.iter().any(String::is_empty) {
                    return Err(TxError::config(
                        "name_pattern rule needs at least one non-empty method prefix",
                    ));
                }
                Ok(Self::name_pattern(type_suffix.clone(), method_prefixes.clone()))
            }
            PointcutRuleConfig::Marker { marker } => {
                if marker.is_empty() {
                    return Err(TxError::config("marker rule needs a marker name"));
                }
                Ok(Self::marker(marker.clone()))
            }
            PointcutRuleConfig::Regex {
                target_type,
                method_pattern,
            } => {
                if target_type.is_empty() {
                    return Err(TxError::config("regex rule needs a target_type"));
                }
                Self::regex(target_type.clone(), method_pattern)
            }
        }
    }

    fn matches_type(&self, type_name: &str, markers: &[&str]) -> bool {
        let simple = simple_type_name(type_name);
        match self {
            Self::NamePattern { type_suffix, .. } => simple.ends_with(type_suffix.as_str()),
            Self::Marker { marker } => markers.iter().any(|m| *m == marker.as_str()),
            Self::Regex { target_type, .. } => simple == simple_type_name(target_type),
        }
    }

    fn matches(&self, type_name: &str, method: &str, markers: &[&str]) -> bool {
        if !self.matches_type(type_name, markers) {
            return false;
        }
        match self {
            Self::NamePattern {
                method_prefixes, ..
            } => method_prefixes
                .iter()
                .any(|prefix| method.starts_with(prefix.as_str())),
            Self::Marker { .. } => true,
            Self::Regex { method_pattern, .. } => method_pattern.is_match(method),
        }
    }
}

/// Serializable form of a [`PointcutRule`], as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PointcutRuleConfig {
    NamePattern {
        type_suffix: String,
        method_prefixes: Vec<String>,
    },
    Marker {
        marker: String,
    },
    Regex {
        target_type: String,
        method_pattern: String,
    },
}

impl PointcutRuleConfig {
    /// `*Service` types, methods starting with save/update/delete/upgrade.
    pub fn service_naming() -> Self {
        Self::NamePattern {
            type_suffix: "Service".to_string(),
            method_prefixes: ["save", "update", "delete", "upgrade"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// An immutable set of pointcut rules. A call matches if any rule matches.
#[derive(Debug, Clone)]
pub struct Pointcut {
    rules: Vec<PointcutRule>,
}

impl Pointcut {
    pub fn new(rules: Vec<PointcutRule>) -> Self {
        Self { rules }
    }

    /// The conventional rule set: `*Service` + save/update/delete/upgrade.
    pub fn service_naming() -> Self {
        Self::new(vec![PointcutRule::name_pattern(
            "Service",
            ["save", "update", "delete", "upgrade"],
        )])
    }

    /// Compile every configured rule, failing on the first malformed one.
    pub fn from_configs(configs: &[PointcutRuleConfig]) -> TxResult<Self> {
        if configs.is_empty() {
            return Err(TxError::config("at least one pointcut rule is required"));
        }
        let rules = configs
            .iter()
            .map(PointcutRule::compile)
            .collect::<TxResult<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[PointcutRule] {
        &self.rules
    }
}

impl MethodMatcher for Pointcut {
    fn matches_type(&self, type_name: &str, markers: &[&str]) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.matches_type(type_name, markers))
    }

    fn matches(&self, type_name: &str, method: &str, markers: &[&str]) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.matches(type_name, method, markers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_naming_matches_write_methods() {
        let pointcut = Pointcut::service_naming();

        assert!(pointcut.matches("UserService", "upgradeLevels", &[]));
        assert!(pointcut.matches("app::users::UserService", "save_user", &[]));
        assert!(pointcut.matches("UserService", "delete_all", &[]));
        assert!(pointcut.matches("UserService", "updateUser", &[]));
    }

    #[test]
    fn test_service_naming_rejects_other_types_and_methods() {
        let pointcut = Pointcut::service_naming();

        assert!(!pointcut.matches("UserHelper", "upgradeLevels", &[]));
        assert!(!pointcut.matches("UserService", "getData", &[]));
        assert!(!pointcut.matches("UserService", "add", &[]));
        assert!(!pointcut.matches("ServiceUser", "save", &[]));
    }

    #[test]
    fn test_type_stage_is_independent_of_method() {
        let pointcut = Pointcut::service_naming();

        assert!(pointcut.matches_type("UserService", &[]));
        assert!(!pointcut.matches_type("UserHelper", &[]));
    }

    #[test]
    fn test_marker_rule_matches_every_method() {
        let pointcut = Pointcut::new(vec![PointcutRule::marker("transactional")]);

        assert!(pointcut.matches("Billing", "anything", &["transactional"]));
        assert!(pointcut.matches("Billing", "get_invoice", &["audited", "transactional"]));
        assert!(!pointcut.matches("Billing", "anything", &["audited"]));
        assert!(!pointcut.matches_type("Billing", &[]));
    }

    #[test]
    fn test_regex_rule_requires_full_match_on_target() {
        let rule = PointcutRule::regex("UserService", "upgrade.*|save").unwrap();
        let pointcut = Pointcut::new(vec![rule]);

        assert!(pointcut.matches("UserService", "upgradeLevels", &[]));
        assert!(pointcut.matches("UserService", "save", &[]));
        assert!(!pointcut.matches("UserService", "save_all", &[]));
        assert!(!pointcut.matches("OrderService", "upgradeLevels", &[]));
    }

    #[test]
    fn test_any_rule_matching_is_enough() {
        let pointcut = Pointcut::new(vec![
            PointcutRule::name_pattern("Service", ["save"]),
            PointcutRule::marker("transactional"),
        ]);

        assert!(pointcut.matches("UserService", "save", &[]));
        assert!(pointcut.matches("Ledger", "post", &["transactional"]));
        assert!(!pointcut.matches("Ledger", "post", &[]));
    }

    #[test]
    fn test_read_only_inference() {
        assert!(infer_read_only("getUser"));
        assert!(infer_read_only("find_by_email"));
        assert!(!infer_read_only("save"));
        assert!(!infer_read_only("upgrade_levels"));

        let pointcut = Pointcut::service_naming();
        assert!(!pointcut.read_only("getUser", Some(false)));
        assert!(pointcut.read_only("save", Some(true)));
    }

    #[test]
    fn test_malformed_rules_are_rejected() {
        let bad_regex = PointcutRuleConfig::Regex {
            target_type: "UserService".into(),
            method_pattern: "upgrade(".into(),
        };
        assert!(matches!(
            Pointcut::from_configs(&[bad_regex]),
            Err(TxError::Config(_))
        ));

        let no_prefixes = PointcutRuleConfig::NamePattern {
            type_suffix: "Service".into(),
            method_prefixes: vec![],
        };
        assert!(Pointcut::from_configs(&[no_prefixes]).is_err());

        let empty_marker = PointcutRuleConfig::Marker { marker: "".into() };
        assert!(Pointcut::from_configs(&[empty_marker]).is_err());

        assert!(Pointcut::from_configs(&[]).is_err());
    }

    #[test]
    fn test_rule_config_deserializes_from_tagged_json() {
        let json = r#"[
            {"kind": "name_pattern", "type_suffix": "Service", "method_prefixes": ["save"]},
            {"kind": "marker", "marker": "transactional"},
            {"kind": "regex", "target_type": "UserService", "method_pattern": "upgrade.*"}
        ]"#;
        let configs: Vec<PointcutRuleConfig> = serde_json::from_str(json).unwrap();
        let pointcut = Pointcut::from_configs(&configs).unwrap();

        assert_eq!(pointcut.rules().len(), 3);
        assert!(pointcut.matches("UserService", "upgradeAll", &[]));
    }
}
