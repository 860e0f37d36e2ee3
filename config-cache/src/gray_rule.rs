//! Release rules deciding which clients receive a gray variant.
//!
//! A rule is persisted next to the gray row as a small JSON document:
//!
//! ```json
//! {"type": "label", "version": "1.0.0", "expr": "tag=beta", "priority": 10}
//! ```
//!
//! `expire_at` (epoch millis) may be added to retire a rule without deleting
//! the variant; an expired rule stays in the cache but never matches.
use crate::types::{CLIENT_IP_LABEL, VIPSERVER_TAG_LABEL, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub const RULE_VERSION: &str = "1.0.0";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum GrayRuleError {
    #[error("invalid rule document: {0}")]
    Malformed(String),
    #[error("unsupported rule type: {0}")]
    UnknownType(String),
    #[error("unsupported rule version: {0}")]
    UnsupportedVersion(String),
    #[error("invalid {rule_type} expression: {expr:?}")]
    InvalidExpression { rule_type: String, expr: String },
}

#[derive(Debug, Deserialize, Serialize)]
struct RuleDocument {
    #[serde(rename = "type")]
    rule_type: String,
    #[serde(default = "default_version")]
    version: String,
    expr: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    expire_at: Option<i64>,
}

fn default_version() -> String {
    RULE_VERSION.to_string()
}

#[derive(Clone, Debug, PartialEq)]
enum Matcher {
    /// Client address must be one of the listed IPs.
    Beta(BTreeSet<String>),
    /// Client routing tag must equal the value.
    Tag(String),
    /// Every pair must be present in the client labels.
    Labels(Vec<(String, String)>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GrayRule {
    matcher: Matcher,
    priority: i32,
    expire_at: Option<i64>,
    raw: String,
}

impl GrayRule {
    pub fn parse(raw: &str) -> Result<Self, GrayRuleError> {
        let doc: RuleDocument =
            serde_json::from_str(raw).map_err(|e| GrayRuleError::Malformed(e.to_string()))?;

        if doc.version != RULE_VERSION {
            return Err(GrayRuleError::UnsupportedVersion(doc.version));
        }

        let invalid = || GrayRuleError::InvalidExpression {
            rule_type: doc.rule_type.clone(),
            expr: doc.expr.clone(),
        };

        let matcher = match doc.rule_type.as_str() {
            "beta" => {
                let ips: BTreeSet<String> = doc
                    .expr
                    .split(',')
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
                    .map(String::from)
                    .collect();
                if ips.is_empty() {
                    return Err(invalid());
                }
                Matcher::Beta(ips)
            }
            "tag" => {
                let tag = doc.expr.trim();
                if tag.is_empty() {
                    return Err(invalid());
                }
                Matcher::Tag(tag.to_string())
            }
            "label" => {
                let mut pairs = Vec::new();
                for pair in doc.expr.split(',') {
                    let (k, v) = pair.split_once('=').ok_or_else(invalid)?;
                    let (k, v) = (k.trim(), v.trim());
                    if k.is_empty() {
                        return Err(invalid());
                    }
                    pairs.push((k.to_string(), v.to_string()));
                }
                Matcher::Labels(pairs)
            }
            other => return Err(GrayRuleError::UnknownType(other.to_string())),
        };

        Ok(GrayRule {
            matcher,
            priority: doc.priority,
            expire_at: doc.expire_at,
            raw: raw.to_string(),
        })
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        match &self.matcher {
            Matcher::Beta(ips) => labels
                .get(CLIENT_IP_LABEL)
                .is_some_and(|ip| ips.contains(ip)),
            Matcher::Tag(tag) => labels.get(VIPSERVER_TAG_LABEL) == Some(tag),
            Matcher::Labels(pairs) => pairs
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v)),
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_millis())
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        self.expire_at.is_none_or(|expire_at| now < expire_at)
    }

    /// The expression exactly as it was persisted.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Builds the persisted form of a rule.
pub fn rule_document(rule_type: &str, expr: &str, priority: i32) -> String {
    let doc = RuleDocument {
        rule_type: rule_type.to_string(),
        version: RULE_VERSION.to_string(),
        expr: expr.to_string(),
        priority,
        expire_at: None,
    };
    serde_json::to_string(&doc).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_label_rule() {
        let rule = GrayRule::parse(&rule_document("label", "tag=beta", 10)).unwrap();
        assert_eq!(rule.priority(), 10);
        assert!(rule.matches(&labels(&[("tag", "beta")])));
        assert!(!rule.matches(&labels(&[("tag", "prod")])));
        assert!(!rule.matches(&labels(&[])));

        let rule = GrayRule::parse(&rule_document("label", "env=prod, zone=a", 1)).unwrap();
        assert!(rule.matches(&labels(&[("env", "prod"), ("zone", "a"), ("x", "y")])));
        assert!(!rule.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn test_beta_rule() {
        let rule = GrayRule::parse(&rule_document("beta", "10.0.0.1,10.0.0.2", 0)).unwrap();
        assert!(rule.matches(&labels(&[(CLIENT_IP_LABEL, "10.0.0.2")])));
        assert!(!rule.matches(&labels(&[(CLIENT_IP_LABEL, "10.0.0.3")])));
    }

    #[test]
    fn test_tag_rule() {
        let rule = GrayRule::parse(&rule_document("tag", "blue", 0)).unwrap();
        assert!(rule.matches(&labels(&[(VIPSERVER_TAG_LABEL, "blue")])));
        assert!(!rule.matches(&labels(&[("tag", "blue")])));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            GrayRule::parse("{tag=beta}"),
            Err(GrayRuleError::Malformed(_))
        ));
        assert_eq!(
            GrayRule::parse(&rule_document("regex", ".*", 0)),
            Err(GrayRuleError::UnknownType("regex".into()))
        );
        assert!(matches!(
            GrayRule::parse(&rule_document("label", "novalue", 0)),
            Err(GrayRuleError::InvalidExpression { .. })
        ));
        assert!(matches!(
            GrayRule::parse(&rule_document("beta", " , ", 0)),
            Err(GrayRuleError::InvalidExpression { .. })
        ));
        assert_eq!(
            GrayRule::parse(r#"{"type":"tag","version":"2.0.0","expr":"a"}"#),
            Err(GrayRuleError::UnsupportedVersion("2.0.0".into()))
        );
    }

    #[test]
    fn test_expiry() {
        let raw = r#"{"type":"tag","expr":"a","priority":1,"expire_at":1000}"#;
        let rule = GrayRule::parse(raw).unwrap();
        assert!(rule.is_valid_at(999));
        assert!(!rule.is_valid_at(1000));
        assert!(!rule.is_valid());
        assert_eq!(rule.raw(), raw);
    }
}
