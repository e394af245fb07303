//! Action templating and dispatch bookkeeping.

use serde_json::{Map, Value};

use super::variables::VariableStore;

/// Expand `${var}` references in every string of `template`.
///
/// A string that is exactly one known reference becomes the variable's
/// typed value.  Unknown references are left as written.
pub fn expand(template: &Value, vars: &VariableStore) -> Value {
    match template {
        Value::String(s) => expand_str(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| expand(v, vars)).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), expand(v, vars)))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

fn expand_str(s: &str, vars: &VariableStore) -> Value {
    if let Some(name) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        if !name.contains("${") {
            if let Some(v) = vars.value(name) {
                return v.to_json();
            }
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match vars.value(name) {
                    Some(v) => out.push_str(&v.to_string()),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Partial,
    Failed,
    Skipped,
}

impl ExecStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_counts(total: usize, failed: usize) -> Self {
        match (total, failed) {
            (0, _) => Self::Skipped,
            (_, 0) => Self::Success,
            (t, f) if f >= t => Self::Failed,
            _ => Self::Partial,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Condition,
    Manual,
    Timer,
    Startup,
}

impl TriggerSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Condition => "CONDITION",
            Self::Manual => "MANUAL",
            Self::Timer => "TIMER",
            Self::Startup => "STARTUP",
        }
    }
}
