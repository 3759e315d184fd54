//! Core data models shared by the parsers, the storage engine, and the daemon.
//!
//! These types are plain values: an [`ExecutionRecord`] describes one observed
//! tool invocation, a [`PackageInfo`] aggregates usage of one package under one
//! tool, and a [`StorageDocument`] is the complete persisted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Format version written into new storage documents.
pub const DOCUMENT_VERSION: &str = "1.0.0";

/// Metadata key holding the raw subcommand (`argv[1]` of the tool).
pub const META_SUBCOMMAND: &str = "subcommand";
/// Metadata key holding the classified intent (`install`, `uninstall`, ...).
pub const META_ACTION: &str = "action";
/// Metadata key listing `name@version` specs seen on the command line.
pub const META_VERSIONS: &str = "versions";

/// A single metadata value. Restricted to a closed set of kinds so that
/// serialization stays deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(value: Vec<String>) -> Self {
        MetaValue::List(value)
    }
}

/// Tool-specific facts about an invocation.
pub type Metadata = BTreeMap<String, MetaValue>;

/// One observed invocation of a package manager or developer tool.
///
/// This is also the wire format accepted on the Unix socket and by
/// `POST /api/v1/executions`. Only `tool` is mandatory on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(default)]
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<String>,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages_affected: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl ExecutionRecord {
    /// A fresh record for `tool`, stamped with the current time.
    pub fn new(tool: impl Into<String>, command: impl Into<String>, args: &[String]) -> Self {
        Self {
            id: String::new(),
            tool: tool.into(),
            command: command.into(),
            args: args.to_vec(),
            timestamp: Utc::now(),
            duration_ms: 0,
            exit_code: 0,
            working_dir: String::new(),
            user: String::new(),
            environment: None,
            packages_affected: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Set a metadata entry, replacing any previous value.
    pub fn set(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Checks the invariants a record must satisfy before it is queued.
    pub fn validate(&self) -> Result<(), String> {
        if self.tool.trim().is_empty() {
            return Err("tool must not be empty".to_string());
        }
        Ok(())
    }

    /// Version requested for `package` on the command line, if the parser
    /// recorded one under [`META_VERSIONS`].
    pub fn requested_version(&self, package: &str) -> Option<&str> {
        let MetaValue::List(specs) = self.metadata.get(META_VERSIONS)? else {
            return None;
        };
        specs.iter().find_map(|spec| match split_version(spec) {
            (name, Some(version)) if name == package => Some(version),
            _ => None,
        })
    }

    /// Arguments to classify: the explicit list, or the command text after
    /// the binary name when the producer sent no list.
    pub fn effective_args(&self) -> Vec<String> {
        if !self.args.is_empty() {
            return self.args.clone();
        }
        self.command
            .split_whitespace()
            .skip(1)
            .map(str::to_string)
            .collect()
    }
}

/// Split `name@version` into its parts. A leading `@` is a scope marker
/// (`@types/node@20`), not a version separator.
pub fn split_version(spec: &str) -> (&str, Option<&str>) {
    let search_from = usize::from(spec.starts_with('@'));
    match spec[search_from..].rfind('@') {
        Some(offset) => {
            let at = search_from + offset;
            let version = &spec[at + 1..];
            if version.is_empty() {
                (&spec[..at], None)
            } else {
                (&spec[..at], Some(version))
            }
        }
        None => (spec, None),
    }
}

/// Older wrapper scripts send `"args": "$@"` as one string.
fn deserialize_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireArgs {
        List(Vec<String>),
        Line(String),
    }

    Ok(match Option::<WireArgs>::deserialize(deserializer)? {
        Some(WireArgs::List(args)) => args,
        Some(WireArgs::Line(line)) => line.split_whitespace().map(str::to_string).collect(),
        None => Vec::new(),
    })
}

/// Aggregate usage of one package under one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub tool: String,
    pub install_date: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl PackageInfo {
    /// First observation of `(tool, name)`.
    pub fn first_seen(tool: &str, name: &str, at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            version: String::new(),
            tool: tool.to_string(),
            install_date: at,
            last_used: at,
            usage_count: 1,
            path: None,
            dependencies: Vec::new(),
        }
    }

    /// Entry found by a live inventory rather than an observed execution.
    pub fn discovered(tool: &str, name: &str, installed: DateTime<Utc>) -> Self {
        Self {
            usage_count: 0,
            ..Self::first_seen(tool, name, installed)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub diu_version: String,
}

/// Aggregates derived from the execution list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_executions: u64,
    /// Every tool ever recorded, in first-seen order.
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Busiest calendar day (`YYYY-MM-DD`), empty until computed.
    #[serde(default)]
    pub most_active_day: String,
    #[serde(default)]
    pub execution_frequency: BTreeMap<String, u64>,
}

/// The complete persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDocument {
    pub version: String,
    pub metadata: DocumentMetadata,
    /// Append-only, oldest first.
    #[serde(default)]
    pub executions: Vec<ExecutionRecord>,
    /// tool → package name → aggregate.
    #[serde(default)]
    pub packages: BTreeMap<String, BTreeMap<String, PackageInfo>>,
    #[serde(default)]
    pub statistics: Statistics,
}

impl StorageDocument {
    pub fn new(hostname: impl Into<String>, user: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: DOCUMENT_VERSION.to_string(),
            metadata: DocumentMetadata {
                created: now,
                last_updated: now,
                hostname: hostname.into(),
                user: user.into(),
                diu_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            executions: Vec::new(),
            packages: BTreeMap::new(),
            statistics: Statistics::default(),
        }
    }
}

/// Parses an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, String> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("'{input}' is not an RFC 3339 timestamp or YYYY-MM-DD date"))
}

/// Filters for execution queries. `since` is inclusive, `until` exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub tool: Option<String>,
    pub package: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(tool) = &self.tool {
            if &record.tool != tool {
                return false;
            }
        }
        if let Some(package) = &self.package {
            if !record.packages_affected.iter().any(|p| p == package) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp >= until {
                return false;
            }
        }
        true
    }
}
