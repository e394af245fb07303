//! Typed accessors over the untyped `params` document.
//!
//! Every accessor fills the envelope with `INVALID_ARG` and a message naming
//! the field before returning the error, so handlers validate with `?` and
//! never touch state on a bad shape.

use serde_json::{Map, Value};

use super::ApiResult;
use crate::error::{Error, Result};

fn field<'a>(params: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    params.and_then(|p| p.get(key)).filter(|v| !v.is_null())
}

/// The params object itself; absent or non-object is rejected.
pub fn require_object<'a>(
    params: Option<&'a Value>,
    out: &mut ApiResult,
) -> Result<&'a Map<String, Value>> {
    match params.and_then(Value::as_object) {
        Some(obj) => Ok(obj),
        None => Err(reject(out, "Missing parameters")),
    }
}

pub fn require_str<'a>(params: Option<&'a Value>, key: &str, out: &mut ApiResult) -> Result<&'a str> {
    match field(params, key) {
        None => Err(reject(out, &format!("Missing '{key}' parameter"))),
        Some(v) => v
            .as_str()
            .ok_or_else(|| reject(out, &format!("'{key}' must be a string"))),
    }
}

pub fn optional_str<'a>(
    params: Option<&'a Value>,
    key: &str,
    out: &mut ApiResult,
) -> Result<Option<&'a str>> {
    match field(params, key) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| reject(out, &format!("'{key}' must be a string"))),
    }
}

pub fn require_f64(params: Option<&Value>, key: &str, out: &mut ApiResult) -> Result<f64> {
    match field(params, key) {
        None => Err(reject(out, &format!("Missing '{key}' parameter"))),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| reject(out, &format!("'{key}' must be a number"))),
    }
}

pub fn optional_f64(params: Option<&Value>, key: &str, out: &mut ApiResult) -> Result<Option<f64>> {
    match field(params, key) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| reject(out, &format!("'{key}' must be a number"))),
    }
}

pub fn optional_u64(params: Option<&Value>, key: &str, out: &mut ApiResult) -> Result<Option<u64>> {
    match field(params, key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| reject(out, &format!("'{key}' must be a non-negative integer"))),
    }
}

pub fn require_bool(params: Option<&Value>, key: &str, out: &mut ApiResult) -> Result<bool> {
    match field(params, key) {
        None => Err(reject(out, &format!("Missing '{key}' parameter"))),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| reject(out, &format!("'{key}' must be a boolean"))),
    }
}

pub fn optional_bool(params: Option<&Value>, key: &str, out: &mut ApiResult) -> Result<Option<bool>> {
    match field(params, key) {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| reject(out, &format!("'{key}' must be a boolean"))),
    }
}

pub fn require_array<'a>(
    params: Option<&'a Value>,
    key: &str,
    out: &mut ApiResult,
) -> Result<&'a Vec<Value>> {
    match field(params, key) {
        None => Err(reject(out, &format!("Missing '{key}' parameter"))),
        Some(v) => v
            .as_array()
            .ok_or_else(|| reject(out, &format!("'{key}' must be an array"))),
    }
}

fn reject(out: &mut ApiResult, msg: &str) -> Error {
    out.error(Error::InvalidArg.code(), msg);
    Error::InvalidArg
}
