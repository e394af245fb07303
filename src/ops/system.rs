//! `system.*` operations.

use std::sync::Arc;

use serde_json::{Value, json};

use super::{ADMIN, OpsContext};
use crate::api::{ApiResult, Category, OperationDescriptor, params};
use crate::app::ports::{HeapRegion, LogLevel, SystemPort};
use crate::error::Error;

pub const DEFAULT_REBOOT_DELAY_MS: u64 = 500;
pub const MIN_REBOOT_DELAY_MS: u64 = 100;
pub const MAX_REBOOT_DELAY_MS: u64 = 10_000;

fn region_json(r: &HeapRegion) -> Value {
    json!({"total": r.total, "free": r.free, "largest_block": r.largest_block})
}

pub fn descriptors(ctx: &OpsContext) -> Vec<OperationDescriptor> {
    let sys = || Arc::clone(&ctx.system);

    let s = sys();
    let info = OperationDescriptor::new("system.info", Category::System, move |_, out| {
        let chip = s.chip_info();
        out.ok(json!({
            "app": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
            "chip": {
                "model": chip.model,
                "cores": chip.cores,
                "revision": chip.revision,
                "features": chip.features,
            },
            "flash_size": chip.flash_size,
            "uptime_ms": s.uptime_ms(),
        }));
        Ok(())
    })
    .describe("Firmware and chip identity");

    let s = sys();
    let memory = OperationDescriptor::new("system.memory", Category::System, move |_, out| {
        let m = s.memory();
        let mut data = json!({
            "free_heap": m.free_heap,
            "min_free_heap": m.min_free_heap,
            "internal": region_json(&m.internal),
        });
        if let Some(psram) = &m.psram {
            data["psram"] = region_json(psram);
        }
        out.ok(data);
        Ok(())
    })
    .describe("Heap statistics");

    let s = sys();
    let cpu = OperationDescriptor::new("system.cpu", Category::System, move |_, out| {
        let c = s.cpu();
        let cores: Vec<Value> = c
            .core_usage
            .iter()
            .enumerate()
            .map(|(id, usage)| json!({"id": id, "usage": usage}))
            .collect();
        let total = if c.core_usage.is_empty() {
            0.0
        } else {
            c.core_usage.iter().sum::<f32>() / c.core_usage.len() as f32
        };
        out.ok(json!({"cores": cores, "total_usage": total, "task_count": c.task_count}));
        Ok(())
    })
    .describe("Per-core load");

    let s = sys();
    let tasks = OperationDescriptor::new("system.tasks", Category::System, move |_, out| {
        let list: Vec<Value> = s
            .tasks()
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "priority": t.priority,
                    "stack_hwm": t.stack_hwm,
                    "core": t.core,
                    "state": t.state,
                })
            })
            .collect();
        let count = list.len();
        out.ok(json!({"tasks": list, "count": count}));
        Ok(())
    })
    .describe("Task list");

    let s = sys();
    let reboot = OperationDescriptor::new("system.reboot", Category::System, move |p, out| {
        let delay = params::optional_u64(p, "delay", out)?
            .unwrap_or(DEFAULT_REBOOT_DELAY_MS)
            .clamp(MIN_REBOOT_DELAY_MS, MAX_REBOOT_DELAY_MS);
        if s.schedule_reboot(delay as u32).is_err() {
            return out.fail(Error::Hardware, "Failed to schedule reboot");
        }
        out.ok(json!({"status": "rebooting", "delay_ms": delay}));
        Ok(())
    })
    .describe("Restart after a delay")
    .auth(ADMIN);

    let s = sys();
    let log_level = OperationDescriptor::new("system.log.level", Category::System, move |p, out| {
        log_level(s.as_ref(), p, out)
    })
    .describe("Get or set log verbosity")
    .auth(ADMIN);

    vec![info, memory, cpu, tasks, reboot, log_level]
}

fn log_level(sys: &dyn SystemPort, p: Option<&Value>, out: &mut ApiResult) -> crate::error::Result<()> {
    let level = params::optional_u64(p, "level", out)?;
    let tag = params::optional_str(p, "tag", out)?;
    let Some(level) = level else {
        out.ok(json!({"level": sys.log_level() as u8, "status": "get"}));
        return Ok(());
    };
    let Some(lvl) = u8::try_from(level).ok().and_then(LogLevel::from_u8) else {
        return out.fail(Error::InvalidArg, "Invalid log level");
    };
    sys.set_log_level(tag, lvl);
    let mut data = json!({"level": lvl as u8, "status": "set"});
    if let Some(tag) = tag {
        data["tag"] = json!(tag);
    }
    out.ok(data);
    Ok(())
}
