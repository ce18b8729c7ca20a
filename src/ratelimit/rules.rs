//! Limit rules configuration and matching.
//!
//! Rules decide the initial `limit` and `burst` of a key that has no
//! persisted state yet. A rule's `key` is either an exact key or a prefix
//! ending in `*`:
//!
//! ```yaml
//! limits:
//!   - key: "checkout"
//!     limit: 5
//!     burst: 10
//!   - key: "user:*"
//!     limit: 0.5
//!     burst: 3
//!   - key: "internal:*"
//!     limit: inf
//! ```
//!
//! An exact match wins over any prefix; among prefixes the longest wins.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::bucket::Limit;
use crate::error::{Result, TollgateError};

/// A complete set of limit rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitRules {
    #[serde(default)]
    pub limits: Vec<LimitRule>,
}

/// Initial settings for keys matching `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Exact key, or a prefix followed by `*`
    pub key: String,
    /// Permits per second, or `inf`
    pub limit: LimitSpec,
    /// Bucket capacity
    #[serde(default)]
    pub burst: u32,
}

/// A limit as written in YAML: a number or a keyword such as `inf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitSpec {
    Rate(f64),
    Keyword(String),
}

impl LimitSpec {
    pub fn to_limit(&self) -> Result<Limit> {
        match self {
            LimitSpec::Rate(rate) if rate.is_finite() => Ok(Limit::PerSecond(*rate)),
            LimitSpec::Rate(rate) if *rate > 0.0 => Ok(Limit::Infinite),
            LimitSpec::Rate(rate) => Err(TollgateError::Config(format!(
                "limit must be finite or 'inf', got {}",
                rate
            ))),
            LimitSpec::Keyword(s) => s
                .parse()
                .map_err(|e: TollgateError| TollgateError::Config(e.to_string())),
        }
    }
}

impl LimitRule {
    /// The prefix this rule matches, if it is a prefix rule.
    fn prefix(&self) -> Option<&str> {
        self.key.strip_suffix('*')
    }

    fn matches(&self, key: &str) -> bool {
        match self.prefix() {
            Some(prefix) => key.starts_with(prefix),
            None => self.key == key,
        }
    }
}

impl LimitRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a top-level `limits:` map or a bare list of rules.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules = match serde_yaml::from_str::<Vec<LimitRule>>(yaml) {
            Ok(limits) => LimitRules { limits },
            Err(_) => serde_yaml::from_str(yaml).map_err(|e| {
                TollgateError::Config(format!("Failed to parse limit rules: {}", e))
            })?,
        };
        rules.validate()?;
        Ok(rules)
    }

    fn validate(&self) -> Result<()> {
        for rule in &self.limits {
            if rule.key.is_empty() {
                return Err(TollgateError::Config("rule with empty key".to_string()));
            }
            rule.limit.to_limit()?;
        }
        Ok(())
    }

    /// Find the most specific rule for `key`.
    pub fn find(&self, key: &str) -> Option<&LimitRule> {
        let mut best: Option<&LimitRule> = None;

        for rule in self.limits.iter().filter(|r| r.matches(key)) {
            let Some(prefix) = rule.prefix() else {
                // Exact matches beat every prefix
                return Some(rule);
            };
            let better = match best.and_then(|b| b.prefix()) {
                Some(best_prefix) => prefix.len() > best_prefix.len(),
                None => true,
            };
            if better {
                best = Some(rule);
            }
        }

        best
    }

    /// The `(limit, burst)` seeded for `key`, if any rule matches.
    pub fn settings_for(&self, key: &str) -> Option<(Limit, u32)> {
        let rule = self.find(key)?;
        // validated on load
        let limit = rule.limit.to_limit().ok()?;
        Some((limit, rule.burst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
limits:
  - key: checkout
    limit: 5
    burst: 10
  - key: "internal:*"
    limit: inf
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.limits.len(), 2);
        assert_eq!(rules.limits[0].limit, LimitSpec::Rate(5.0));
        assert_eq!(rules.limits[1].burst, 0);
        assert_eq!(
            rules.settings_for("internal:jobs"),
            Some((Limit::Infinite, 0))
        );
    }

    #[test]
    fn test_parse_bare_list() {
        let yaml = r#"
- key: api
  limit: 0.5
  burst: 2
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.settings_for("api"), Some((Limit::PerSecond(0.5), 2)));
    }

    #[test]
    fn test_invalid_limit_rejected() {
        let yaml = r#"
limits:
  - key: api
    limit: fast
"#;
        assert!(matches!(
            LimitRules::from_yaml(yaml),
            Err(TollgateError::Config(_))
        ));
    }

    #[test]
    fn test_empty_key_rejected() {
        let yaml = r#"
limits:
  - key: ""
    limit: 1
"#;
        assert!(LimitRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_exact_beats_prefix() {
        let yaml = r#"
limits:
  - key: "user:*"
    limit: 1
    burst: 1
  - key: "user:admin"
    limit: 100
    burst: 50
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert_eq!(
            rules.settings_for("user:admin"),
            Some((Limit::PerSecond(100.0), 50))
        );
        assert_eq!(
            rules.settings_for("user:bob"),
            Some((Limit::PerSecond(1.0), 1))
        );
    }

    #[test]
    fn test_longest_prefix_wins() {
        let yaml = r#"
limits:
  - key: "*"
    limit: 1
  - key: "api:v2:*"
    limit: 20
  - key: "api:*"
    limit: 10
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.find("api:v2:orders").unwrap().key, "api:v2:*");
        assert_eq!(rules.find("api:v1:orders").unwrap().key, "api:*");
        assert_eq!(rules.find("other").unwrap().key, "*");
    }

    #[test]
    fn test_no_match() {
        let yaml = r#"
limits:
  - key: checkout
    limit: 5
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert!(rules.find("checkout2").is_none());
        assert!(rules.settings_for("other").is_none());
        assert!(LimitRules::new().find("anything").is_none());
    }
}
