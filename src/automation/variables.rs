//! Variable table shared by sources, rules and operations.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::value::{VarType, VarValue};
use crate::error::{Error, Result};

pub const MAX_VARIABLES: usize = 128;
/// Identifiers must be strictly shorter than this.
pub const MAX_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub id: String,
    pub value: VarValue,
    pub timestamp_ms: u64,
    /// Source that owns this variable, if any.
    pub source: Option<String>,
    /// External writes are refused; sources may still write.
    pub readonly: bool,
}

impl Variable {
    pub fn var_type(&self) -> VarType {
        self.value.var_type()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.var_type().as_str(),
            "value": self.value.to_json(),
            "timestamp_ms": self.timestamp_ms,
            "source": self.source,
            "readonly": self.readonly,
        })
    }
}

/// Who is writing.  Only `External` is subject to the read-only flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    Source,
    External,
}

#[derive(Debug, Default)]
pub struct VariableStore {
    vars: BTreeMap<String, Variable>,
}

pub fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() < MAX_ID_LEN
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: &str,
        initial: VarValue,
        readonly: bool,
        source: Option<&str>,
        now_ms: u64,
    ) -> Result<()> {
        if !valid_id(id) {
            return Err(Error::InvalidArg);
        }
        if self.vars.contains_key(id) {
            return Err(Error::InvalidState);
        }
        if self.vars.len() >= MAX_VARIABLES {
            return Err(Error::NoMem);
        }
        self.vars.insert(
            id.to_owned(),
            Variable {
                id: id.to_owned(),
                value: initial,
                timestamp_ms: now_ms,
                source: source.map(str::to_owned),
                readonly,
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, id: &str) -> Result<()> {
        self.vars.remove(id).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Drop every variable bound to `source`.  Returns how many went.
    pub fn unregister_by_source(&mut self, source: &str) -> usize {
        let before = self.vars.len();
        self.vars.retain(|_, v| v.source.as_deref() != Some(source));
        before - self.vars.len()
    }

    pub fn get(&self, id: &str) -> Option<&Variable> {
        self.vars.get(id)
    }

    pub fn value(&self, id: &str) -> Option<&VarValue> {
        self.vars.get(id).map(|v| &v.value)
    }

    /// Write `raw`, coerced to the variable's declared type.
    /// Returns whether the value changed.
    pub fn set(&mut self, id: &str, raw: &Value, writer: Writer, now_ms: u64) -> Result<bool> {
        let var = self.vars.get_mut(id).ok_or(Error::NotFound)?;
        if var.readonly && writer == Writer::External {
            return Err(Error::NoPermission);
        }
        let value = VarValue::coerce(var.var_type(), raw).ok_or(Error::InvalidArg)?;
        let changed = var.value != value;
        var.value = value;
        var.timestamp_ms = now_ms;
        Ok(changed)
    }

    /// Variables whose id starts with `prefix`, in id order.
    pub fn list(&self, prefix: Option<&str>) -> Vec<&Variable> {
        self.vars
            .values()
            .filter(|v| prefix.is_none_or(|p| v.id.starts_with(p)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn clear(&mut self) {
        self.vars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> VariableStore {
        let mut s = VariableStore::new();
        s.register("temp", VarValue::Float(25.0), false, None, 0).unwrap();
        s.register("cpu.load", VarValue::Int(0), true, Some("cpu"), 0).unwrap();
        s.register("cpu.name", VarValue::Str(String::new()), true, Some("cpu"), 0)
            .unwrap();
        s
    }

    #[test]
    fn readonly_blocks_external_writers_only() {
        let mut s = store();
        assert_eq!(
            s.set("cpu.load", &Value::from(5), Writer::External, 1),
            Err(Error::NoPermission)
        );
        assert_eq!(s.set("cpu.load", &Value::from(5), Writer::Source, 1), Ok(true));
        assert_eq!(s.value("cpu.load"), Some(&VarValue::Int(5)));
    }

    #[test]
    fn writes_coerce_to_declared_type() {
        let mut s = store();
        s.set("temp", &Value::from(60), Writer::External, 5).unwrap();
        assert_eq!(s.value("temp"), Some(&VarValue::Float(60.0)));
        assert_eq!(s.get("temp").unwrap().timestamp_ms, 5);
        assert_eq!(
            s.set("temp", &Value::from("hot"), Writer::External, 6),
            Err(Error::InvalidArg)
        );
        assert_eq!(s.set("nope", &Value::from(1), Writer::External, 6), Err(Error::NotFound));
    }

    #[test]
    fn unchanged_write_reports_false() {
        let mut s = store();
        assert_eq!(s.set("temp", &Value::from(25.0), Writer::External, 1), Ok(false));
    }

    #[test]
    fn unregister_by_source_and_prefix_listing() {
        let mut s = store();
        assert_eq!(s.list(Some("cpu.")).len(), 2);
        assert_eq!(s.unregister_by_source("cpu"), 2);
        assert_eq!(s.len(), 1);
        assert!(s.list(Some("cpu.")).is_empty());
    }

    #[test]
    fn duplicate_and_capacity() {
        let mut s = VariableStore::new();
        for i in 0..MAX_VARIABLES {
            s.register(&format!("v{i}"), VarValue::Int(0), false, None, 0).unwrap();
        }
        assert_eq!(
            s.register("extra", VarValue::Int(0), false, None, 0),
            Err(Error::NoMem)
        );
        assert_eq!(s.register("v0", VarValue::Int(0), false, None, 0), Err(Error::InvalidState));
    }
}
