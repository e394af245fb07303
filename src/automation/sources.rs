//! Variable producers.
//!
//! An `operation` source polls a read-only operation and copies fields of
//! its result into variables; a `push` source is fed by hardware providers
//! through `push_sample`.  Both use the same `{path, variable}` mappings.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const DEFAULT_SOURCE_INTERVAL_MS: u64 = 1000;

fn default_interval() -> u64 {
    DEFAULT_SOURCE_INTERVAL_MS
}

fn yes() -> bool {
    true
}

/// Copy `path` of the sampled document into `variable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Dotted path such as `cores[0].usage`; empty maps the whole document.
    #[serde(default)]
    pub path: String,
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    Operation {
        operation: String,
        #[serde(default)]
        params: Option<Value>,
    },
    Push,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default = "default_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Clone)]
pub struct Source {
    pub cfg: SourceConfig,
    pub last_sample_ms: Option<u64>,
    pub sample_count: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl Source {
    pub fn new(cfg: SourceConfig) -> Self {
        Self {
            cfg,
            last_sample_ms: None,
            sample_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    /// Polled sources that are enabled and whose interval has elapsed.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.cfg.enabled
            && matches!(self.cfg.kind, SourceKind::Operation { .. })
            && self
                .last_sample_ms
                .is_none_or(|t| now_ms.saturating_sub(t) >= self.cfg.poll_interval_ms)
    }

    pub fn to_json(&self) -> Value {
        let (kind, operation) = match &self.cfg.kind {
            SourceKind::Operation { operation, .. } => ("operation", Some(operation.as_str())),
            SourceKind::Push => ("push", None),
        };
        json!({
            "id": self.cfg.id,
            "type": kind,
            "operation": operation,
            "enabled": self.cfg.enabled,
            "poll_interval_ms": self.cfg.poll_interval_ms,
            "last_sample_ms": self.last_sample_ms,
            "sample_count": self.sample_count,
            "error_count": self.error_count,
            "last_error": self.last_error,
        })
    }
}

/// Resolve a dotted path with optional indices: `a.b[0].c`, `items[1][2]`.
pub fn extract_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }
    let mut cur = doc;
    for segment in path.split('.') {
        let (name, mut rest) = match segment.find('[') {
            Some(i) => (&segment[..i], &segment[i..]),
            None => (segment, ""),
        };
        if !name.is_empty() {
            cur = cur.get(name)?;
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let idx: usize = stripped[..close].parse().ok()?;
            cur = cur.get(idx)?;
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(cur)
}
