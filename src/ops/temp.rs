//! `temp.*` operations.

use std::sync::Arc;

use serde_json::{Value, json};

use super::OpsContext;
use crate::api::{ApiResult, Category, OperationDescriptor, params};
use crate::error::{Error, Result};
use crate::thermal::{self, TempSource, TemperatureManager};

fn mode_json(t: &TemperatureManager) -> Value {
    json!({
        "mode": if t.manual_mode() { "manual" } else { "auto" },
        "preferred": t.preferred().map_or("auto", TempSource::as_str),
        "active_source": t.active_source().as_str(),
    })
}

pub fn descriptors(ctx: &OpsContext) -> Vec<OperationDescriptor> {
    let tm = || Arc::clone(&ctx.temp);

    let t = tm();
    let status = OperationDescriptor::new("temp.status", Category::Device, move |_, out| {
        out.ok(t.status_json());
        Ok(())
    })
    .describe("Effective temperature");

    let t = tm();
    let providers = OperationDescriptor::new("temp.providers", Category::Device, move |_, out| {
        out.ok(t.providers_json());
        Ok(())
    })
    .describe("Registered temperature providers");

    let t = tm();
    let set = OperationDescriptor::new("temp.set", Category::Device, move |p, out| {
        let c = params::require_f64(p, "temperature_c", out)? as f32;
        if !thermal::in_range(c) {
            return out.fail(Error::InvalidArg, "Temperature out of range");
        }
        match t.set_manual(c) {
            Ok(r) => {
                out.ok(json!({
                    "manual_mode": true,
                    "temperature_c": r.temperature_c,
                    "active_source": r.source.as_str(),
                }));
                Ok(())
            }
            Err(e) => out.fail(e, "Temperature manager not ready"),
        }
    })
    .describe("Pin a manual temperature");

    let t = tm();
    let mode = OperationDescriptor::new("temp.mode", Category::Device, move |p, out| {
        set_mode(&t, p, out)
    })
    .describe("Select manual or automatic source");

    vec![status, providers, set, mode]
}

fn set_mode(t: &TemperatureManager, p: Option<&Value>, out: &mut ApiResult) -> Result<()> {
    let manual = match params::optional_str(p, "mode", out)? {
        None => None,
        Some("auto") => Some(false),
        Some("manual") => Some(true),
        Some(_) => return out.fail(Error::InvalidArg, "mode must be 'auto' or 'manual'"),
    };
    let preferred = match params::optional_str(p, "preferred", out)? {
        None => None,
        Some("auto") => Some(None),
        Some(name) => match TempSource::from_name(name) {
            Some(TempSource::Manual) | None => {
                return out.fail(Error::InvalidArg, "Unknown preferred provider");
            }
            Some(src) => Some(Some(src)),
        },
    };
    let variable = params::optional_str(p, "variable", out)?;

    if let Some(name) = variable {
        let bind = (!name.is_empty()).then_some(name);
        if let Err(e) = t.bind_variable(bind) {
            return out.fail(e, "Temperature manager not ready");
        }
    }
    if let Some(pref) = preferred {
        if let Err(e) = t.set_preferred(pref) {
            return out.fail(e, "Temperature manager not ready");
        }
    }
    if let Some(on) = manual {
        if let Err(e) = t.set_manual_mode(on) {
            return out.fail(e, "Temperature manager not ready");
        }
    }
    out.ok(mode_json(t));
    Ok(())
}
