//! `ui.widgets.get` / `ui.widgets.set`: dashboard layout persisted in the
//! `ui` configuration module.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::OpsContext;
use crate::api::{Category, OperationDescriptor, params};
use crate::config::ConfigModule;
use crate::error::Error;

pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetsConfig {
    pub widgets: Vec<Value>,
    pub refresh_interval: u64,
}

impl Default for WidgetsConfig {
    fn default() -> Self {
        Self {
            widgets: Vec::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL_MS,
        }
    }
}

pub fn descriptors(ctx: &OpsContext) -> Vec<OperationDescriptor> {
    let store = Arc::clone(&ctx.config);
    let get = OperationDescriptor::new("ui.widgets.get", Category::Config, move |_, out| {
        let (cfg, source) = store.load_typed::<WidgetsConfig>(ConfigModule::Ui);
        out.ok(json!({
            "widgets": cfg.widgets,
            "refresh_interval": cfg.refresh_interval,
            "source": source.as_str(),
        }));
        Ok(())
    })
    .describe("Dashboard widget layout");

    let store = Arc::clone(&ctx.config);
    let set = OperationDescriptor::new("ui.widgets.set", Category::Config, move |p, out| {
        let widgets = params::require_array(p, "widgets", out)?;
        let refresh_interval =
            params::optional_u64(p, "refresh_interval", out)?.unwrap_or(DEFAULT_REFRESH_INTERVAL_MS);
        let cfg = WidgetsConfig {
            widgets: widgets.clone(),
            refresh_interval,
        };
        match store.save_typed(ConfigModule::Ui, &cfg) {
            Ok(outcome) => {
                out.ok(outcome.to_json());
                Ok(())
            }
            Err(Error::InvalidSize) => out.fail(Error::InvalidSize, "Layout too large"),
            Err(_) => out.fail(Error::Internal, "Failed to save config"),
        }
    })
    .describe("Replace the widget layout");

    vec![get, set]
}
