//! `automation.*` operations: engine control, variables, rules, history.

use std::sync::Arc;

use serde_json::{Value, json};

use super::{ADMIN, OpsContext};
use crate::api::{ApiResult, Category, OperationDescriptor, params};
use crate::automation::{AutomationEngine, HISTORY_CAPACITY};
use crate::error::{Error, Result};

pub const DEFAULT_HISTORY_COUNT: u64 = 16;

type Engine = Arc<AutomationEngine>;

fn engine_error(out: &mut ApiResult, e: Error) -> Result<()> {
    let msg = match e {
        Error::InvalidState => "Engine state does not allow this",
        Error::NotFound => "Not found",
        Error::NoPermission => "Variable is read-only",
        Error::InvalidArg => "Invalid value",
        Error::NotSupported => "No configuration store",
        _ => "Automation error",
    };
    out.fail(e, msg)
}

/// Operation that takes no params and returns the status on success.
fn control(
    name: &'static str,
    engine: &Engine,
    describe: &'static str,
    f: fn(&AutomationEngine) -> Result<()>,
) -> OperationDescriptor {
    let e = Arc::clone(engine);
    OperationDescriptor::new(name, Category::System, move |_, out| {
        if let Err(err) = f(&e) {
            return engine_error(out, err);
        }
        out.ok(e.status_json());
        Ok(())
    })
    .describe(describe)
    .auth(ADMIN)
}

/// Operation keyed by a rule `id`.
fn rule_op(
    name: &'static str,
    engine: &Engine,
    describe: &'static str,
    f: fn(&AutomationEngine, &str, &mut ApiResult) -> Result<()>,
) -> OperationDescriptor {
    let e = Arc::clone(engine);
    OperationDescriptor::new(name, Category::System, move |p, out| {
        let id = params::require_str(p, "id", out)?;
        f(&e, id, out)
    })
    .describe(describe)
}

pub fn descriptors(ctx: &OpsContext) -> Vec<OperationDescriptor> {
    let engine = &ctx.automation;

    let e = Arc::clone(engine);
    let status = OperationDescriptor::new("automation.status", Category::System, move |_, out| {
        out.ok(e.status_json());
        Ok(())
    })
    .describe("Engine state and counters");

    let e = Arc::clone(engine);
    let vars_list =
        OperationDescriptor::new("automation.variables.list", Category::System, move |p, out| {
            let prefix = params::optional_str(p, "prefix", out)?;
            let vars: Vec<Value> = e.list_variables(prefix).iter().map(|v| v.to_json()).collect();
            let count = vars.len();
            out.ok(json!({"variables": vars, "count": count}));
            Ok(())
        })
        .describe("List variables");

    let e = Arc::clone(engine);
    let vars_get =
        OperationDescriptor::new("automation.variables.get", Category::System, move |p, out| {
            let id = params::require_str(p, "id", out)?;
            match e.get_variable(id) {
                Some(v) => {
                    out.ok(v.to_json());
                    Ok(())
                }
                None => out.fail(Error::NotFound, "Variable not found"),
            }
        })
        .describe("Read one variable");

    let e = Arc::clone(engine);
    let vars_set =
        OperationDescriptor::new("automation.variables.set", Category::System, move |p, out| {
            let id = params::require_str(p, "id", out)?;
            let Some(value) = p.and_then(|p| p.get("value")) else {
                return out.fail(Error::InvalidArg, "Missing 'value' parameter");
            };
            match e.set_variable(id, value) {
                Ok(changed) => {
                    out.ok(json!({"id": id, "changed": changed}));
                    Ok(())
                }
                Err(err) => engine_error(out, err),
            }
        })
        .describe("Write one variable")
        .auth(ADMIN);

    let e = Arc::clone(engine);
    let rules_list =
        OperationDescriptor::new("automation.rules.list", Category::System, move |_, out| {
            let rules = e.rules_json();
            let count = rules.len();
            out.ok(json!({"rules": rules, "count": count}));
            Ok(())
        })
        .describe("List rules");

    let rules_get = rule_op("automation.rules.get", engine, "Read one rule", |e, id, out| {
        match e.rule_json(id) {
            Some(r) => {
                out.ok(r);
                Ok(())
            }
            None => out.fail(Error::NotFound, "Rule not found"),
        }
    });

    let rules_enable = rule_op("automation.rules.enable", engine, "Enable a rule", |e, id, out| {
        set_enabled(e, id, true, out)
    })
    .auth(ADMIN);

    let rules_disable = rule_op("automation.rules.disable", engine, "Disable a rule", |e, id, out| {
        set_enabled(e, id, false, out)
    })
    .auth(ADMIN);

    let rules_trigger = rule_op(
        "automation.rules.trigger",
        engine,
        "Fire a rule now, ignoring cooldown",
        |e, id, out| match e.trigger(id) {
            Ok(rec) => {
                out.ok(rec.to_json());
                Ok(())
            }
            Err(Error::NotFound) => out.fail(Error::NotFound, "Rule not found"),
            Err(err) => engine_error(out, err),
        },
    )
    .auth(ADMIN);

    let e = Arc::clone(engine);
    let history = OperationDescriptor::new("automation.history", Category::System, move |p, out| {
        let n = params::optional_u64(p, "count", out)?
            .unwrap_or(DEFAULT_HISTORY_COUNT)
            .min(HISTORY_CAPACITY as u64) as usize;
        let records: Vec<Value> = e.history(n).iter().map(|r| r.to_json()).collect();
        let count = records.len();
        out.ok(json!({"records": records, "count": count}));
        Ok(())
    })
    .describe("Recent rule executions, newest first");

    let e = Arc::clone(engine);
    let stats_reset =
        OperationDescriptor::new("automation.stats.reset", Category::System, move |_, out| {
            e.reset_stats();
            out.ok(e.stats().to_json());
            Ok(())
        })
        .describe("Zero the engine counters")
        .auth(ADMIN);

    vec![
        status,
        control("automation.start", engine, "Start rule evaluation", AutomationEngine::start),
        control("automation.stop", engine, "Stop rule evaluation", AutomationEngine::stop),
        control("automation.pause", engine, "Pause rule evaluation", AutomationEngine::pause),
        control("automation.resume", engine, "Resume rule evaluation", AutomationEngine::resume),
        control("automation.reload", engine, "Reload the stored rules", AutomationEngine::reload),
        vars_list,
        vars_get,
        vars_set,
        rules_list,
        rules_get,
        rules_enable,
        rules_disable,
        rules_trigger,
        history,
        stats_reset,
    ]
}

fn set_enabled(e: &AutomationEngine, id: &str, enabled: bool, out: &mut ApiResult) -> Result<()> {
    match e.set_rule_enabled(id, enabled) {
        Ok(()) => {
            out.ok(json!({"id": id, "enabled": enabled}));
            Ok(())
        }
        Err(_) => out.fail(Error::NotFound, "Rule not found"),
    }
}
