//! Result envelope returned by every operation.
//!
//! The envelope owns its message and data.  `code == OK` is the only case
//! in which callers may depend on `data`; every error path clears it.

use serde_json::{Map, Value, json};

use crate::error::{Error, ResultCode};

/// Longest user-visible message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResult {
    pub code: ResultCode,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl Default for ApiResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiResult {
    /// Fresh envelope, `OK` with no payload.
    pub fn new() -> Self {
        Self {
            code: ResultCode::Ok,
            message: None,
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Mark success and attach `data`.
    pub fn ok(&mut self, data: Value) {
        self.code = ResultCode::Ok;
        self.message = None;
        self.data = Some(data);
    }

    /// Mark failure.  Drops any data a handler attached earlier.
    pub fn error(&mut self, code: ResultCode, message: &str) {
        self.code = code;
        self.message = Some(truncate(message));
        self.data = None;
    }

    /// Fill the envelope from `err` and hand the error back so handlers
    /// can `return out.fail(..)`.
    pub fn fail(&mut self, err: Error, message: &str) -> crate::error::Result<()> {
        self.error(err.code(), message);
        Err(err)
    }

    /// Wire shape: `{success, code, message?, data?}`.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("success".into(), Value::Bool(self.is_ok()));
        obj.insert("code".into(), json!(self.code.as_str()));
        if let Some(msg) = &self.message {
            obj.insert("message".into(), json!(msg));
        }
        if let Some(data) = &self.data {
            obj.insert("data".into(), data.clone());
        }
        Value::Object(obj)
    }

    /// Take the payload of a successful call, `None` otherwise.
    pub fn into_data(self) -> Option<Value> {
        if self.code.is_ok() { self.data } else { None }
    }
}

/// Cut `msg` to [`MAX_MESSAGE_LEN`] bytes on a char boundary.
pub fn truncate(msg: &str) -> String {
    if msg.len() <= MAX_MESSAGE_LEN {
        return msg.to_owned();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_owned()
}
