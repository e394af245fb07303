//! Canonical operations driven through the request wire handler, the way
//! an HTTP or socket surface would call them.

use std::sync::Arc;

use serde_json::{Value, json};
use tianshan::api::Caller;
use tianshan::app::ports::{LogLevel, NetworkPort};
use tianshan::runtime::Runtime;

use crate::mock_hw::{CONFIG_DIR, SimBoard, sim_platform};

struct Rig {
    rt: Arc<Runtime>,
    board: SimBoard,
}

impl Drop for Rig {
    fn drop(&mut self) {
        let _ = self.rt.stop();
    }
}

fn rig() -> Rig {
    let (platform, board) = sim_platform();
    // Keep the background sampler from feeding the FSM during a test.
    board.vsense.set_failing(true);
    let rt = Runtime::build(platform).unwrap();
    rt.start().unwrap();
    Rig { rt, board }
}

impl Rig {
    fn call(&self, name: &str, params: Value) -> Value {
        self.request(name, params, Caller::authenticated())
    }

    fn anon(&self, name: &str, params: Value) -> Value {
        self.request(name, params, Caller::anonymous())
    }

    fn request(&self, name: &str, params: Value, caller: Caller) -> Value {
        let text = json!({"name": name, "params": params}).to_string();
        self.rt.registry.handle_request(&text, caller)
    }
}

fn assert_rejected(out: &Value, code: &str, message: &str) {
    assert_eq!(out["success"], false, "{out}");
    assert_eq!(out["code"], code, "{out}");
    assert_eq!(out["message"], message, "{out}");
    assert!(out.get("data").is_none(), "{out}");
}

// ── Envelope ─────────────────────────────────────────────────

#[test]
fn unknown_operation_and_malformed_requests() {
    let r = rig();
    assert_rejected(&r.anon("nope.nothing", Value::Null), "NOT_FOUND", "API not found");
    let out = r.rt.registry.handle_request("{not json", Caller::anonymous());
    assert_eq!(out["code"], "INVALID_ARG");
    let out = r.rt.registry.handle_request(r#"{"params":{}}"#, Caller::anonymous());
    assert_eq!(out["message"], "Missing 'name' field");
}

#[test]
fn guarded_operations_refuse_anonymous_callers_before_running() {
    let r = rig();
    for name in [
        "system.reboot",
        "system.log.level",
        "wifi.connect",
        "power.protection.test",
        "power.protection.reset",
        "power.protection.config",
        "power.protection.debug",
        "automation.variables.set",
        "automation.rules.trigger",
        "automation.stop",
    ] {
        assert_rejected(&r.anon(name, json!({})), "NO_PERMISSION", "Authentication required");
    }
    assert_eq!(r.board.system.reboot_requested(), None);
    assert_eq!(r.rt.power.state().as_str(), "NORMAL");
}

// ── system.* ─────────────────────────────────────────────────

#[test]
fn system_introspection_shapes() {
    let r = rig();
    let info = r.anon("system.info", Value::Null);
    assert_eq!(info["code"], "OK");
    assert_eq!(info["data"]["app"]["name"], "tianshan");
    assert_eq!(info["data"]["chip"]["cores"], 2);
    assert!(info["data"]["flash_size"].as_u64().unwrap() > 0);

    let mem = r.anon("system.memory", Value::Null);
    assert!(mem["data"]["internal"]["largest_block"].is_u64());
    assert!(mem["data"]["psram"].is_object());

    let cpu = r.anon("system.cpu", Value::Null);
    assert_eq!(cpu["data"]["cores"].as_array().unwrap().len(), 2);
    assert_eq!(cpu["data"]["total_usage"], 25.0);

    let tasks = r.anon("system.tasks", Value::Null);
    let names: Vec<&str> = tasks["data"]["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    for expected in ["evt-bus", "volt-mon", "ctl"] {
        assert!(names.contains(&expected), "{names:?}");
    }
    assert_eq!(tasks["data"]["count"], names.len());
}

#[test]
fn reboot_delay_is_clamped() {
    let r = rig();
    let out = r.call("system.reboot", json!({"delay": 5}));
    assert_eq!(out["data"], json!({"status": "rebooting", "delay_ms": 100}));
    assert_eq!(r.board.system.reboot_requested(), Some(100));

    let out = r.call("system.reboot", json!({"delay": "soon"}));
    assert_eq!(out["code"], "INVALID_ARG");
}

#[test]
fn log_level_get_and_per_tag_set() {
    let r = rig();
    assert_eq!(r.call("system.log.level", Value::Null)["data"]["status"], "get");

    let out = r.call("system.log.level", json!({"level": 2, "tag": "wifi"}));
    assert_eq!(out["data"], json!({"level": 2, "status": "set", "tag": "wifi"}));
    assert_eq!(r.board.system.tag_level("wifi"), Some(LogLevel::Warn));

    assert_rejected(
        &r.call("system.log.level", json!({"level": 6})),
        "INVALID_ARG",
        "Invalid log level",
    );
}

// ── network / wifi ───────────────────────────────────────────

#[test]
fn wifi_connect_validates_then_associates() {
    let r = rig();
    let st = r.anon("network.status", Value::Null);
    assert_eq!(st["data"]["connected"], false);
    assert_eq!(st["data"]["state"], "disconnected");

    let scan = r.anon("wifi.scan", Value::Null);
    assert_eq!(scan["data"]["count"], 1);
    assert_eq!(scan["data"]["networks"][0]["ssid"], "bench");

    assert_rejected(&r.call("wifi.connect", json!({"ssid": ""})), "INVALID_ARG", "Invalid SSID");
    assert_rejected(
        &r.call("wifi.connect", json!({"ssid": "bench", "password": "short"})),
        "INVALID_ARG",
        "Invalid password",
    );
    assert_rejected(&r.call("wifi.connect", json!({})), "INVALID_ARG", "Missing 'ssid' parameter");

    let out = r.call("wifi.connect", json!({"ssid": "bench", "password": "correct-horse"}));
    assert_eq!(out["data"], json!({"status": "connecting", "ssid": "bench"}));

    r.board.wifi.poll();
    let st = r.anon("network.status", Value::Null);
    assert_eq!(st["data"]["connected"], true);
    assert_eq!(st["data"]["ssid"], "bench");
    assert!(st["data"]["ip"].is_string());
}

#[test]
fn wifi_connect_out_of_range_reports_failure() {
    let r = rig();
    let out = r.call("wifi.connect", json!({"ssid": "elsewhere", "password": ""}));
    assert_rejected(&out, "HARDWARE", "WiFi connection failed");
    assert_eq!(r.anon("network.status", Value::Null)["data"]["state"], "reconnecting");
}

// ── power.* ──────────────────────────────────────────────────

#[test]
fn protection_test_then_reset() {
    let r = rig();
    let out = r.call("power.protection.test", Value::Null);
    assert_eq!(out["data"]["state"], "LOW_VOLTAGE");

    assert_rejected(
        &r.call("power.protection.test", Value::Null),
        "BUSY",
        "Test only allowed from NORMAL",
    );

    let out = r.call("power.protection.reset", Value::Null);
    assert_eq!(out["data"]["state"], "NORMAL");
    assert_eq!(r.anon("power.status", Value::Null)["data"]["devices"]["compute_powered"], true);
}

#[test]
fn protection_config_is_validated_and_persisted() {
    let r = rig();
    assert_rejected(
        &r.call("power.protection.config", json!({"low": 20.0, "recovery": 18.0})),
        "INVALID_ARG",
        "Invalid protection config",
    );
    assert_rejected(
        &r.call("power.protection.config", json!({"shutdown_delay": 2})),
        "INVALID_ARG",
        "Invalid protection config",
    );

    let out = r.call(
        "power.protection.config",
        json!({"low": 11.5, "recovery": 17.0, "shutdown_delay": 30, "auto_recovery": false}),
    );
    assert_eq!(out["code"], "OK");
    assert_eq!(out["data"]["low_threshold"], 11.5);
    assert_eq!(out["data"]["shutdown_delay_s"], 30);

    let saved = r.board.files.get(&format!("{CONFIG_DIR}/power.json")).unwrap();
    let doc: Value = serde_json::from_slice(&saved).unwrap();
    assert_eq!(doc["low_threshold"], 11.5);
    assert_eq!(doc["auto_recovery_enabled"], false);
}

#[test]
fn protection_debug_needs_enable_flag() {
    let r = rig();
    assert_rejected(
        &r.call("power.protection.debug", json!({"duration": 10})),
        "INVALID_ARG",
        "Missing 'enable' parameter",
    );
    let out = r.call("power.protection.debug", json!({"enable": true, "duration": 10}));
    assert_eq!(out["data"]["debug_mode"], true);
    assert!(out["data"]["until_ms"].as_u64().unwrap() >= 10_000);
    let out = r.call("power.protection.debug", json!({"enable": false}));
    assert_eq!(out["data"], json!({"debug_mode": false, "until_ms": null}));
}

// ── temp.* ───────────────────────────────────────────────────

#[test]
fn manual_temperature_and_mode_switching() {
    let r = rig();
    let st = r.anon("temp.status", Value::Null);
    assert_eq!(st["data"]["active_source"], "default");
    assert_eq!(st["data"]["temperature_c"], 25.0);

    assert_rejected(
        &r.anon("temp.set", json!({"temperature_c": 200})),
        "INVALID_ARG",
        "Temperature out of range",
    );
    let out = r.anon("temp.set", json!({"temperature_c": 30.5}));
    assert_eq!(
        out["data"],
        json!({"manual_mode": true, "temperature_c": 30.5, "active_source": "manual"})
    );

    assert_rejected(
        &r.anon("temp.mode", json!({"preferred": "manual"})),
        "INVALID_ARG",
        "Unknown preferred provider",
    );
    assert_eq!(
        r.anon("temp.mode", json!({"mode": "sideways"}))["code"],
        "INVALID_ARG"
    );

    let out = r.anon("temp.mode", json!({"mode": "auto", "preferred": "sensor"}));
    assert_eq!(out["data"]["mode"], "auto");
    assert_eq!(out["data"]["preferred"], "sensor");
    // The sensor provider is registered but has never reported.
    assert_eq!(out["data"]["active_source"], "default");

    let providers = r.anon("temp.providers", Value::Null);
    assert!(providers["data"]["count"].as_u64().unwrap() >= 2);
}

// ── ui.widgets.* ─────────────────────────────────────────────

#[test]
fn widget_layout_round_trips_through_storage() {
    let r = rig();
    let out = r.anon("ui.widgets.get", Value::Null);
    assert_eq!(out["data"]["source"], "default");
    assert_eq!(out["data"]["refresh_interval"], 5000);

    let widgets = json!([{"type": "gauge", "topic": "power.status"}]);
    let out = r.anon("ui.widgets.set", json!({"widgets": widgets, "refresh_interval": 2000}));
    assert_eq!(
        out["data"],
        json!({"file_saved": true, "blob_saved": true, "pending_sync": false})
    );

    let out = r.anon("ui.widgets.get", Value::Null);
    assert_eq!(out["data"]["source"], "file");
    assert_eq!(out["data"]["widgets"], widgets);
    assert_eq!(out["data"]["refresh_interval"], 2000);

    assert_rejected(
        &r.anon("ui.widgets.set", json!({"widgets": {"not": "an array"}})),
        "INVALID_ARG",
        "'widgets' must be an array",
    );
}

#[test]
fn oversized_layout_writes_nothing() {
    let r = rig();
    let files_before = r.board.files.write_count();
    let huge = json!([{"label": "x".repeat(5000)}]);
    assert_rejected(
        &r.anon("ui.widgets.set", json!({"widgets": huge})),
        "INVALID_ARG",
        "Layout too large",
    );
    assert_eq!(r.board.files.write_count(), files_before);
    assert_eq!(r.board.nvs.write_count("ts_ui"), 0);
}

// ── service.list / automation.* ──────────────────────────────

#[test]
fn service_list_reports_every_service() {
    let r = rig();
    let out = r.anon("service.list", Value::Null);
    let services = out["data"]["services"].as_array().unwrap();
    assert_eq!(services.len(), 9);
    assert!(services.iter().all(|s| s["state"] == "RUNNING"));
    assert_eq!(out["data"]["stats"]["error"], 0);
}

#[test]
fn automation_surface_with_empty_configuration() {
    let r = rig();
    let st = r.anon("automation.status", Value::Null);
    assert_eq!(st["data"]["state"], "running");
    assert_eq!(st["data"]["rules"], 0);

    assert_eq!(r.anon("automation.rules.list", Value::Null)["data"]["count"], 0);
    assert_rejected(
        &r.call("automation.rules.trigger", json!({"id": "ghost"})),
        "NOT_FOUND",
        "Rule not found",
    );
    assert_rejected(
        &r.anon("automation.variables.get", json!({"id": "ghost"})),
        "NOT_FOUND",
        "Variable not found",
    );

    let out = r.call("automation.pause", Value::Null);
    assert_eq!(out["data"]["state"], "paused");
    let out = r.call("automation.resume", Value::Null);
    assert_eq!(out["data"]["state"], "running");

    let h = r.anon("automation.history", json!({"count": 500}));
    assert_eq!(h["data"]["count"], 0);
}
