use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel fingerprint of a variant that was never populated or was cleared.
pub const NULL_FINGERPRINT: &str = "null";

/// Sentinel timestamp of a variant that was never populated or was cleared.
pub const NULL_TIMESTAMP: i64 = -1;

/// Label carrying the client address, used by beta rules and the legacy beta channel.
pub const CLIENT_IP_LABEL: &str = "ClientIp";

/// Label carrying the client's routing tag, used by tag rules.
pub const VIPSERVER_TAG_LABEL: &str = "Vipserver-Tag";

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub namespace: String,
    pub group: String,
    pub data_id: String,
}

impl ConfigKey {
    pub fn new<N, G, D>(namespace: N, group: G, data_id: D) -> Self
    where
        N: Into<String>,
        G: Into<String>,
        D: Into<String>,
    {
        ConfigKey {
            namespace: namespace.into(),
            group: group.into(),
            data_id: data_id.into(),
        }
    }

    /// Rejects keys that cannot be stored, either because a component is
    /// missing or because it would escape the local cache directory.
    pub fn validate(&self) -> Result<(), KeyError> {
        if self.group.is_empty() {
            return Err(KeyError::Empty("group"));
        }
        if self.data_id.is_empty() {
            return Err(KeyError::Empty("data_id"));
        }
        for (field, value) in [
            ("namespace", &self.namespace),
            ("group", &self.group),
            ("data_id", &self.data_id),
        ] {
            if !is_safe_component(value) {
                return Err(KeyError::Unsafe(field, value.clone()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}+{}", self.data_id, self.group)
        } else {
            write!(f, "{}+{}+{}", self.data_id, self.group, self.namespace)
        }
    }
}

/// Empty is allowed here: the namespace may be blank.
pub(crate) fn is_safe_component(value: &str) -> bool {
    value != "." && value != ".." && !value.contains(['/', '\\', '\0'])
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum KeyError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} contains an illegal path component: {1}")]
    Unsafe(&'static str, String),
}

/// The release channel of a configuration key that a row or a task refers to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantTarget {
    Formal,
    Gray(String),
    Tag(String),
    Beta,
}

impl VariantTarget {
    pub fn is_formal(&self) -> bool {
        matches!(self, VariantTarget::Formal)
    }

    /// Gray and tag names become file names in the local cache.
    pub fn validate(&self) -> Result<(), KeyError> {
        let (field, name) = match self {
            VariantTarget::Gray(name) => ("gray_name", name),
            VariantTarget::Tag(tag) => ("tag", tag),
            VariantTarget::Formal | VariantTarget::Beta => return Ok(()),
        };
        if name.is_empty() {
            return Err(KeyError::Empty(field));
        }
        if !is_safe_component(name) {
            return Err(KeyError::Unsafe(field, name.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for VariantTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantTarget::Formal => write!(f, "formal"),
            VariantTarget::Gray(name) => write!(f, "gray:{name}"),
            VariantTarget::Tag(tag) => write!(f, "tag:{tag}"),
            VariantTarget::Beta => write!(f, "beta"),
        }
    }
}

/// A full row of the durable store, as returned by lookups and bulk paging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub id: u64,
    pub key: ConfigKey,
    pub target: VariantTarget,
    pub content: String,
    /// UTF-8 fingerprint recorded by the writer, if any.
    pub md5: Option<String>,
    pub encrypted_data_key: Option<String>,
    pub last_modified: i64,
    /// Raw gray rule expression, only for gray rows.
    pub gray_rule: Option<String>,
    /// Comma separated client addresses, only for beta rows.
    pub beta_ips: Option<String>,
}

/// The change-tracking projection of a row: enough to decide whether the
/// cache is stale without fetching the content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigState {
    pub id: u64,
    pub key: ConfigKey,
    pub target: VariantTarget,
    pub md5: Option<String>,
    pub last_modified: i64,
}

impl From<&ConfigRow> for ConfigState {
    fn from(row: &ConfigRow) -> Self {
        ConfigState {
            id: row.id,
            key: row.key.clone(),
            target: row.target.clone(),
            md5: row.md5.clone(),
            last_modified: row.last_modified,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Beta,
    Tag,
    TagNotFound,
    Formal,
    GrayConflict,
    NotFound,
}

impl QueryStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Beta => "beta",
            QueryStatus::Tag => "tag",
            QueryStatus::TagNotFound => "tag_not_found",
            QueryStatus::Formal => "formal",
            QueryStatus::GrayConflict => "gray_conflict",
            QueryStatus::NotFound => "not_found",
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, QueryStatus::Beta | QueryStatus::Tag | QueryStatus::Formal)
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
