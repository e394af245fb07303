//! Typed variable values and the comparison rules conditions use.

use core::cmp::Ordering;
use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Bool,
    Int,
    Float,
    String,
    Json,
}

impl VarType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Json(Value),
}

impl VarValue {
    pub fn var_type(&self) -> VarType {
        match self {
            Self::Bool(_) => VarType::Bool,
            Self::Int(_) => VarType::Int,
            Self::Float(_) => VarType::Float,
            Self::Str(_) => VarType::String,
            Self::Json(_) => VarType::Json,
        }
    }

    /// Natural mapping of a JSON scalar; containers stay JSON.
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Convert `v` into a value of type `ty`.  `None` if the shapes are
    /// incompatible (a string into an int slot, say).
    pub fn coerce(ty: VarType, v: &Value) -> Option<Self> {
        match (ty, v) {
            (VarType::Json, _) => Some(Self::Json(v.clone())),
            (VarType::Bool, Value::Bool(b)) => Some(Self::Bool(*b)),
            (VarType::Bool, Value::Number(n)) => n.as_f64().map(|f| Self::Bool(f != 0.0)),
            (VarType::Int, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.round() as i64))
                .map(Self::Int),
            (VarType::Int, Value::Bool(b)) => Some(Self::Int(i64::from(*b))),
            (VarType::Float, Value::Number(n)) => n.as_f64().map(Self::Float),
            (VarType::Float, Value::Bool(b)) => Some(Self::Float(if *b { 1.0 } else { 0.0 })),
            (VarType::String, Value::String(s)) => Some(Self::Str(s.clone())),
            (VarType::String, Value::Number(_) | Value::Bool(_)) => Some(Self::Str(v.to_string())),
            _ => None,
        }
    }

    pub fn default_for(ty: VarType) -> Self {
        match ty {
            VarType::Bool => Self::Bool(false),
            VarType::Int => Self::Int(0),
            VarType::Float => Self::Float(0.0),
            VarType::String => Self::Str(String::new()),
            VarType::Json => Self::Json(Value::Null),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
            Self::Json(v) => v.clone(),
        }
    }

    /// Numeric view for `Bool`, `Int` and `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    /// Apply `op` with `self` on the left.
    pub fn compare(&self, op: CompareOp, rhs: &Self) -> bool {
        if op == CompareOp::Contains {
            return self.contains(rhs);
        }
        let ord = match (self.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => match a.partial_cmp(&b) {
                Some(o) => o,
                None => return op == CompareOp::Ne,
            },
            _ => self.to_string().cmp(&rhs.to_string()),
        };
        match op {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Contains => false,
        }
    }

    fn contains(&self, needle: &Self) -> bool {
        match self {
            Self::Json(Value::Array(items)) => items
                .iter()
                .any(|item| Self::from_json(item).compare(CompareOp::Eq, needle)),
            Self::Str(s) => s.contains(&needle.to_string()),
            Self::Json(Value::String(s)) => s.contains(&needle.to_string()),
            _ => false,
        }
    }
}

/// Template rendering: floats with two decimals, strings unquoted.
impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:.2}"),
            Self::Str(s) => f.write_str(s),
            Self::Json(Value::String(s)) => f.write_str(s),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "contains")]
    Contains,
}

impl CompareOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
        }
    }
}
