//! Automation document persisted in the `automation` config module.
//!
//! ```json
//! {
//!   "poll_interval_ms": 100,
//!   "variables": [{"id": "temp", "type": "float", "initial": 25}],
//!   "sources":   [{"id": "cpu", "type": "operation", "operation": "system.cpu",
//!                  "mappings": [{"path": "total_usage", "variable": "cpu.load"}]}],
//!   "rules":     [{"id": "hot", "conditions": [{"var": "temp", "op": ">", "value": 50}],
//!                  "cooldown_ms": 1000, "actions": [{"operation": "led.red"}]}]
//! }
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::rules::RuleConfig;
use super::sources::SourceConfig;
use super::value::VarType;
use super::variables::{MAX_VARIABLES, valid_id};
use crate::error::{Error, Result};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

fn default_poll() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: VarType,
    #[serde(default)]
    pub initial: Option<Value>,
    #[serde(default)]
    pub readonly: bool,
    /// Owning source; set automatically for mapping targets.
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_poll")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            variables: Vec::new(),
            sources: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl AutomationConfig {
    pub fn from_json(doc: &Value) -> Result<Self> {
        let cfg: Self = serde_json::from_value(doc.clone()).map_err(|_| Error::InvalidArg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(Error::InvalidArg);
        }
        if self.variables.len() > MAX_VARIABLES {
            return Err(Error::NoMem);
        }

        let mut seen = BTreeSet::new();
        for v in &self.variables {
            if !valid_id(&v.id) || !seen.insert(v.id.as_str()) {
                return Err(Error::InvalidArg);
            }
        }

        let mut source_ids = BTreeSet::new();
        for s in &self.sources {
            if !valid_id(&s.id) || !source_ids.insert(s.id.as_str()) {
                return Err(Error::InvalidArg);
            }
            if s.mappings.iter().any(|m| !seen.contains(m.variable.as_str())) {
                return Err(Error::InvalidArg);
            }
        }

        let mut rule_ids = BTreeSet::new();
        for r in &self.rules {
            if !valid_id(&r.id) || !rule_ids.insert(r.id.as_str()) {
                return Err(Error::InvalidArg);
            }
            if r.actions.iter().any(|a| a.operation.is_empty()) {
                return Err(Error::InvalidArg);
            }
        }
        Ok(())
    }
}
