//! Whole-runtime bring-up and teardown on the simulated board.

use std::sync::Arc;

use tianshan::api::Caller;
use tianshan::runtime::{self, Runtime};
use tianshan::service::{Phase, ServiceState};

use crate::mock_hw::sim_platform;

const SERVICES: [&str; 9] = [
    "event_bus",
    "config",
    "power_protection",
    "network",
    "api",
    "temperature",
    "automation",
    "subscriptions",
    "ctl_loop",
];

fn state_of(rt: &Runtime, name: &str) -> ServiceState {
    let h = rt.services.find(name).unwrap();
    rt.services.state(h).unwrap()
}

#[test]
fn every_service_comes_up_in_phase_order() {
    let (platform, _board) = sim_platform();
    let rt = Runtime::build(platform).unwrap();
    rt.start().unwrap();

    for name in SERVICES {
        assert_eq!(state_of(&rt, name), ServiceState::Running, "{name}");
    }
    let stats = rt.services.stats();
    assert_eq!(stats.total, SERVICES.len());
    assert_eq!(stats.running, SERVICES.len());

    // Snapshot order follows the phases.
    let phases: Vec<Phase> = rt.services.snapshot().iter().map(|i| i.phase).collect();
    let mut sorted = phases.clone();
    sorted.sort();
    assert_eq!(phases, sorted);

    assert!(rt.registry.count() > 30);
    assert!(rt.bus.is_worker_running());
    assert!(rt.power.is_sampling());
    assert!(rt.services.health_check_all().is_empty());

    rt.stop().unwrap();
}

#[test]
fn stop_then_start_returns_everything_to_running() {
    let (platform, _board) = sim_platform();
    let rt = Runtime::build(platform).unwrap();
    rt.start().unwrap();
    rt.stop().unwrap();

    assert_eq!(rt.registry.count(), 0);
    assert!(!rt.power.is_sampling());
    assert!(!rt.bus.is_worker_running());
    for name in ["ctl_loop", "subscriptions", "automation", "api", "power_protection", "event_bus"] {
        assert_eq!(state_of(&rt, name), ServiceState::Stopped, "{name}");
    }

    rt.start().unwrap();
    for name in SERVICES {
        assert_eq!(state_of(&rt, name), ServiceState::Running, "{name}");
    }
    let r = rt.registry.call("automation.status", None);
    assert!(r.is_ok());
    assert_eq!(r.data.unwrap()["state"], "running");

    rt.stop().unwrap();
}

#[test]
fn second_bring_up_without_teardown_is_refused() {
    let (platform, _board) = sim_platform();
    let rt = Runtime::build(platform).unwrap();
    rt.start().unwrap();
    assert!(rt.start().is_err());
    rt.stop().unwrap();
}

#[test]
fn temperature_can_follow_an_automation_variable() {
    let (platform, board) = sim_platform();
    let rt = Runtime::build(platform).unwrap();
    rt.start().unwrap();

    rt.automation
        .register_variable("room.temp", tianshan::automation::VarValue::Float(31.5), false)
        .unwrap();
    rt.temp.bind_variable(Some("room.temp")).unwrap();
    board.clock.advance_ms(10);
    let reading = rt.temp.effective();
    assert_eq!(reading.source.as_str(), "variable");
    assert!((reading.temperature_c - 31.5).abs() < 1e-3);

    rt.stop().unwrap();
}

#[test]
fn process_wide_instance_guards_reinit() {
    let (platform, _board) = sim_platform();
    let rt = runtime::init(platform).unwrap();
    assert!(Arc::ptr_eq(&rt, &runtime::get().unwrap()));

    let (again, _b2) = sim_platform();
    assert!(runtime::init(again).is_err());

    let out = rt
        .registry
        .handle_request(r#"{"name":"service.list"}"#, Caller::anonymous());
    assert_eq!(out["code"], "OK");
    assert_eq!(out["data"]["stats"]["running"], SERVICES.len());

    drop(rt);
    runtime::deinit().unwrap();
    assert!(runtime::get().is_none());
    assert!(runtime::deinit().is_err());
}
