//! Operation registry and dispatcher.
//!
//! One runtime-extensible table maps `name → handler` for every surface
//! (CLI, WebSocket, HTTP, automation actions).
//!
//! ```text
//!  surface ──call(name, params)──▶ ┌──────────────┐
//!                                  │  lock table   │  clone Arc<handler>
//!                                  │  unlock       │
//!                                  └──────┬───────┘
//!                                         ▼
//!                               handler(params, &mut out)
//!                                         │
//!                    Err(_) && out.code == OK  ──▶ INTERNAL "Handler error"
//! ```
//!
//! Handlers run with no registry lock held, so they may dispatch or
//! register further operations.

pub mod params;
pub mod result;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde_json::{Value, json};

pub use result::ApiResult;

use crate::error::{Error, Result, ResultCode, relock};

/// Names must be strictly shorter than this.
pub const MAX_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    System,
    Config,
    Hal,
    Led,
    Fan,
    Power,
    Network,
    Device,
    Storage,
}

impl Category {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Config => "config",
            Self::Hal => "hal",
            Self::Led => "led",
            Self::Fan => "fan",
            Self::Power => "power",
            Self::Network => "network",
            Self::Device => "device",
            Self::Storage => "storage",
        }
    }
}

/// Handler signature: read `params`, fill `out`, report success.
pub type Handler = Arc<dyn Fn(Option<&Value>, &mut ApiResult) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct OperationDescriptor {
    pub name: String,
    pub description: Option<&'static str>,
    pub category: Category,
    pub handler: Handler,
    pub requires_auth: bool,
    pub permission: Option<&'static str>,
}

impl OperationDescriptor {
    pub fn new<F>(name: impl Into<String>, category: Category, handler: F) -> Self
    where
        F: Fn(Option<&Value>, &mut ApiResult) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            category,
            handler: Arc::new(handler),
            requires_auth: false,
            permission: None,
        }
    }

    #[must_use]
    pub fn describe(mut self, text: &'static str) -> Self {
        self.description = Some(text);
        self
    }

    #[must_use]
    pub fn auth(mut self, permission: &'static str) -> Self {
        self.requires_auth = true;
        self.permission = Some(permission);
        self
    }
}

impl core::fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("requires_auth", &self.requires_auth)
            .finish_non_exhaustive()
    }
}

/// Snapshot returned by [`OperationRegistry::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationInfo {
    pub name: String,
    pub description: Option<&'static str>,
    pub category: Category,
    pub requires_auth: bool,
    pub permission: Option<&'static str>,
}

impl OperationInfo {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "category": self.category.as_str(),
            "requires_auth": self.requires_auth,
            "permission": self.permission,
        })
    }
}

/// Identity of whoever is calling through an external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub authenticated: bool,
}

impl Caller {
    pub const fn anonymous() -> Self {
        Self { authenticated: false }
    }

    pub const fn authenticated() -> Self {
        Self { authenticated: true }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct OperationRegistry {
    table: Mutex<BTreeMap<String, OperationDescriptor>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation.  Duplicate names are rejected with `InvalidState`.
    pub fn register(&self, desc: OperationDescriptor) -> Result<()> {
        if desc.name.is_empty() || desc.name.len() >= MAX_NAME_LEN {
            warn!("API: rejected operation name of {} bytes", desc.name.len());
            return Err(Error::InvalidArg);
        }
        let mut table = relock(self.table.lock());
        if table.contains_key(&desc.name) {
            warn!("API: '{}' already registered", desc.name);
            return Err(Error::InvalidState);
        }
        debug!("API: registered '{}' ({})", desc.name, desc.category.as_str());
        table.insert(desc.name.clone(), desc);
        Ok(())
    }

    /// Register a batch; stops at the first failure.
    pub fn register_multiple(&self, descs: impl IntoIterator<Item = OperationDescriptor>) -> Result<()> {
        let mut n = 0usize;
        for d in descs {
            self.register(d)?;
            n += 1;
        }
        info!("API: registered {} operations", n);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        relock(self.table.lock())
            .remove(name)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    /// Drop every operation.  Breaks handler → owner reference cycles at teardown.
    pub fn clear(&self) {
        relock(self.table.lock()).clear();
    }

    pub fn count(&self) -> usize {
        relock(self.table.lock()).len()
    }

    /// Sorted names, optionally filtered by category.
    pub fn list(&self, category: Option<Category>) -> Vec<String> {
        relock(self.table.lock())
            .values()
            .filter(|d| category.is_none_or(|c| d.category == c))
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn info(&self, name: &str) -> Option<OperationInfo> {
        relock(self.table.lock()).get(name).map(|d| OperationInfo {
            name: d.name.clone(),
            description: d.description,
            category: d.category,
            requires_auth: d.requires_auth,
            permission: d.permission,
        })
    }

    /// Trusted in-process dispatch (automation, fan-out).
    pub fn call(&self, name: &str, params: Option<&Value>) -> ApiResult {
        self.dispatch(name, params, None)
    }

    /// Dispatch on behalf of an external caller; auth-gated operations
    /// reject unauthenticated callers before the handler runs.
    pub fn call_as(&self, name: &str, params: Option<&Value>, caller: Caller) -> ApiResult {
        self.dispatch(name, params, Some(caller))
    }

    /// Parse `params_text` and dispatch.  Empty text means no params.
    pub fn call_str(&self, name: &str, params_text: Option<&str>) -> ApiResult {
        let parsed = match params_text.map(str::trim) {
            None | Some("") => None,
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(v) => Some(v),
                Err(_) => {
                    let mut out = ApiResult::new();
                    out.error(ResultCode::InvalidArg, "Invalid JSON");
                    return out;
                }
            },
        };
        self.dispatch(name, parsed.as_ref(), None)
    }

    /// Request wire handler: `{name, params?}` in, `{success, code, ...}` out.
    pub fn handle_request(&self, text: &str, caller: Caller) -> Value {
        let Ok(req) = serde_json::from_str::<Value>(text) else {
            let mut out = ApiResult::new();
            out.error(ResultCode::InvalidArg, "Invalid JSON");
            return out.to_json();
        };
        let Some(name) = req.get("name").and_then(Value::as_str) else {
            let mut out = ApiResult::new();
            out.error(ResultCode::InvalidArg, "Missing 'name' field");
            return out.to_json();
        };
        let params = req.get("params").filter(|p| !p.is_null());
        self.call_as(name, params, caller).to_json()
    }

    fn dispatch(&self, name: &str, params: Option<&Value>, caller: Option<Caller>) -> ApiResult {
        let mut out = ApiResult::new();

        let (handler, requires_auth) = {
            let table = relock(self.table.lock());
            match table.get(name) {
                Some(d) => (Arc::clone(&d.handler), d.requires_auth),
                None => {
                    out.error(ResultCode::NotFound, "API not found");
                    return out;
                }
            }
        };

        if requires_auth && caller.is_some_and(|c| !c.authenticated) {
            out.error(ResultCode::NoPermission, "Authentication required");
            return out;
        }

        if let Err(e) = handler(params, &mut out) {
            if out.code.is_ok() {
                debug!("API: '{}' failed ({}) without filling result", name, e);
                out.error(ResultCode::Internal, "Handler error");
            }
        }
        out
    }
}
