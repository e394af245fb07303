//! `power.*` operations over the voltage protection.

use std::sync::Arc;

use serde_json::json;

use super::{ADMIN, OpsContext};
use crate::api::{ApiResult, Category, OperationDescriptor, params};
use crate::error::{Error, Result};
use crate::power::VoltageProtection;

fn not_ready(out: &mut ApiResult) -> Result<()> {
    out.fail(Error::InvalidState, "Protection not initialized")
}

pub fn descriptors(ctx: &OpsContext) -> Vec<OperationDescriptor> {
    let vp = || Arc::clone(&ctx.power);

    let p = vp();
    let status = OperationDescriptor::new("power.status", Category::Power, move |_, out| {
        out.ok(p.summary_json());
        Ok(())
    })
    .describe("Supply voltage and rail summary");

    let p = vp();
    let protection_status =
        OperationDescriptor::new("power.protection_status", Category::Power, move |_, out| {
            out.ok(p.status_json());
            Ok(())
        })
        .describe("Full protection state");

    let p = vp();
    let test = OperationDescriptor::new("power.protection.test", Category::Power, move |_, out| {
        if !p.is_initialized() {
            return not_ready(out);
        }
        if p.trigger_test().is_err() {
            return out.fail(Error::InvalidState, "Test only allowed from NORMAL");
        }
        out.ok(p.status_json());
        Ok(())
    })
    .describe("Simulate a low-voltage event")
    .auth(ADMIN);

    let p = vp();
    let reset = OperationDescriptor::new("power.protection.reset", Category::Power, move |_, out| {
        if p.reset().is_err() {
            return not_ready(out);
        }
        out.ok(p.status_json());
        Ok(())
    })
    .describe("Force NORMAL and restore rails")
    .auth(ADMIN);

    let p = vp();
    let config = OperationDescriptor::new("power.protection.config", Category::Power, move |prm, out| {
        configure(&p, prm, out)
    })
    .describe("Change thresholds and timings")
    .auth(ADMIN);

    let p = vp();
    let debug = OperationDescriptor::new("power.protection.debug", Category::Power, move |prm, out| {
        let enable = params::require_bool(prm, "enable", out)?;
        let duration = params::optional_u64(prm, "duration", out)?;
        let duration = match duration.map(u32::try_from) {
            None => None,
            Some(Ok(d)) => Some(d),
            Some(Err(_)) => return out.fail(Error::InvalidArg, "Invalid duration"),
        };
        match p.set_debug(enable, duration) {
            Ok(until) => {
                out.ok(json!({"debug_mode": until.is_some(), "until_ms": until}));
                Ok(())
            }
            Err(e) => out.fail(e, "Invalid duration"),
        }
    })
    .describe("Per-sample debug events")
    .auth(ADMIN);

    vec![status, protection_status, test, reset, config, debug]
}

fn configure(
    p: &VoltageProtection,
    prm: Option<&serde_json::Value>,
    out: &mut ApiResult,
) -> Result<()> {
    let low = params::optional_f64(prm, "low", out)?;
    let recovery = params::optional_f64(prm, "recovery", out)?;
    let delay = params::optional_u64(prm, "shutdown_delay", out)?;
    let hold = params::optional_u64(prm, "recovery_hold", out)?;
    let auto_recovery = params::optional_bool(prm, "auto_recovery", out)?;

    let secs = |v: Option<u64>| v.map(|s| u32::try_from(s).unwrap_or(u32::MAX));
    if p.configure(
        low.map(|v| v as f32),
        recovery.map(|v| v as f32),
        secs(delay),
        secs(hold),
    )
    .is_err()
    {
        return out.fail(Error::InvalidArg, "Invalid protection config");
    }
    if let Some(enabled) = auto_recovery {
        p.set_auto_recovery(enabled)?;
    }
    out.ok(p.status_json());
    Ok(())
}
