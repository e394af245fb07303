//! End-to-end behaviour of the subsystems wired together over the mock
//! ports, plus the boundary cases each one promises.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use tianshan::adapters::time::SimClock;
use tianshan::adapters::voltage::raw_to_volts;
use tianshan::api::{Category, MAX_NAME_LEN, OperationDescriptor, OperationRegistry};
use tianshan::app::ports::{Clock, Device, DevicePowerPort};
use tianshan::automation::{AutomationEngine, HISTORY_CAPACITY};
use tianshan::config::{BLOB_MAX_SIZE, ConfigModule, ConfigStore, Source, event_id as cfg_event};
use tianshan::error::Error;
use tianshan::events::{EventBase, EventBus};
use tianshan::power::{ProtectionConfig, ProtectionState, VoltageProtection};
use tianshan::service::{Phase, ServiceDescriptor, ServiceManager, ServiceState};
use tianshan::ws::SubscriptionManager;

use crate::mock_hw::{CONFIG_DIR, MemFs, MockBlobStore, MockDevices, RecordingSink};

fn counting_op(registry: &OperationRegistry, name: &str) -> Arc<AtomicU32> {
    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    registry
        .register(OperationDescriptor::new(name, Category::Led, move |_, out| {
            h.fetch_add(1, Ordering::SeqCst);
            out.ok(Value::Null);
            Ok(())
        }))
        .unwrap();
    hits
}

// ── Service bring-up ─────────────────────────────────────────

#[test]
fn services_start_in_dependency_order_and_stop_in_reverse() {
    let clock = Arc::new(SimClock::new());
    let mgr = ServiceManager::new(clock, None);
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let svc = |name: &'static str, phase: Phase| {
        let (up, down) = (Arc::clone(&log), Arc::clone(&log));
        ServiceDescriptor::new(name, phase, move || {
            up.lock().unwrap().push(format!("start:{name}"));
            Ok(())
        })
        .on_stop(move || {
            down.lock().unwrap().push(format!("stop:{name}"));
            Ok(())
        })
    };

    // Registered out of order on purpose.
    mgr.register(svc("C", Phase::Driver).depends_on("B")).unwrap();
    mgr.register(svc("A", Phase::Core)).unwrap();
    mgr.register(svc("B", Phase::Hal).depends_on("A")).unwrap();

    mgr.start_all().unwrap();
    for name in ["A", "B", "C"] {
        let h = mgr.find(name).unwrap();
        assert_eq!(mgr.state(h).unwrap(), ServiceState::Running);
    }
    mgr.stop_all().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        ["start:A", "start:B", "start:C", "stop:C", "stop:B", "stop:A"]
    );
}

// ── Automation ───────────────────────────────────────────────

fn engine_with_push_rule() -> (Arc<SimClock>, Arc<OperationRegistry>, AutomationEngine) {
    let clock = Arc::new(SimClock::starting_at_ms(1_000));
    let registry = Arc::new(OperationRegistry::new());
    let files = Arc::new(MemFs::new());
    let blobs = Arc::new(MockBlobStore::new());

    let doc = json!({
        "poll_interval_ms": 50,
        "variables": [{"id": "cpu.temp", "type": "float", "initial": 25.0}],
        "sources": [{
            "id": "cpu_probe",
            "type": "push",
            "mappings": [{"path": "temp", "variable": "cpu.temp"}]
        }],
        "rules": [{
            "id": "hot_cpu",
            "conditions": [{"var": "cpu.temp", "op": ">", "value": 50}],
            "cooldown_ms": 1000,
            "actions": [{"operation": "led.red", "params": {"on": true}}]
        }]
    });
    files.put(&format!("{CONFIG_DIR}/automation.json"), doc.to_string().as_bytes());

    let store = Arc::new(ConfigStore::open(files, blobs).with_dir(CONFIG_DIR));
    let engine = AutomationEngine::new(Arc::clone(&registry), clock.clone()).with_store(store);
    engine.init().unwrap();
    engine.start().unwrap();
    (clock, registry, engine)
}

#[test]
fn rule_fires_once_per_rising_edge_and_respects_cooldown() {
    let (clock, registry, engine) = engine_with_push_rule();
    let hits = counting_op(&registry, "led.red");

    let feed = |t: f64| {
        engine.push_sample("cpu_probe", &json!({"temp": t})).unwrap();
        engine.tick();
    };

    for t in [60.0, 61.0, 62.0] {
        feed(t);
        clock.advance_ms(100);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    feed(40.0);
    clock.advance_ms(1_100);
    feed(70.0);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let recent = engine.history(10);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].rule_id.as_str(), "hot_cpu");
    assert_eq!(recent[0].source.as_str(), "CONDITION");
    assert_eq!(recent[0].status.as_str(), "SUCCESS");
}

#[test]
fn edge_inside_cooldown_is_swallowed() {
    let (clock, registry, engine) = engine_with_push_rule();
    let hits = counting_op(&registry, "led.red");

    for t in [60.0, 40.0, 60.0] {
        engine.push_sample("cpu_probe", &json!({"temp": t})).unwrap();
        engine.tick();
        clock.advance_ms(200);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn history_keeps_only_the_newest_records() {
    let (clock, registry, engine) = engine_with_push_rule();
    counting_op(&registry, "led.red");

    for _ in 0..=HISTORY_CAPACITY {
        engine.trigger("hot_cpu").unwrap();
        clock.advance_ms(1);
    }
    let all = engine.history(usize::MAX);
    assert_eq!(all.len(), HISTORY_CAPACITY);
    assert!(all.windows(2).all(|w| w[0].timestamp_ms >= w[1].timestamp_ms));
    assert_eq!(engine.trigger("ghost").map(|_| ()), Err(Error::NotFound));
}

// ── Voltage protection ───────────────────────────────────────

fn protection(low: f32) -> (Arc<MockDevices>, Arc<SimClock>, Arc<EventBus>, VoltageProtection) {
    let devices = Arc::new(MockDevices::new());
    let clock = Arc::new(SimClock::new());
    let bus = Arc::new(EventBus::new());
    let vp = VoltageProtection::new(devices.clone(), clock.clone()).with_bus(Arc::clone(&bus));
    vp.init_with(ProtectionConfig {
        low_threshold: low,
        recovery_threshold: 18.0,
        shutdown_delay_s: 60,
        ..ProtectionConfig::default()
    })
    .unwrap();
    (devices, clock, bus, vp)
}

#[test]
fn sustained_undervoltage_counts_down_then_cuts_rails() {
    let (devices, clock, bus, vp) = protection(12.0);
    let events = Arc::new(Mutex::new(Vec::new()));
    let e = Arc::clone(&events);
    bus.register(EventBase::Power, None, move |ev| e.lock().unwrap().push(ev.id));

    assert_eq!(vp.process_sample(19.0, clock.now_ms()).unwrap(), ProtectionState::Normal);
    assert_eq!(vp.process_sample(11.0, clock.now_ms()).unwrap(), ProtectionState::LowVoltage);

    // Half way through the countdown the rails are still up.
    for _ in 0..30 {
        clock.advance_ms(1_000);
        vp.process_sample(11.0, clock.now_ms()).unwrap();
        bus.drain();
    }
    assert_eq!(vp.state(), ProtectionState::LowVoltage);
    assert!(devices.switched_off().is_empty());
    let left = vp.status_json()["countdown_remaining_s"].as_u64().unwrap();
    assert!((29..=31).contains(&left), "countdown at {left}");

    for _ in 0..31 {
        clock.advance_ms(1_000);
        vp.process_sample(11.0, clock.now_ms()).unwrap();
        bus.drain();
    }
    assert_eq!(vp.state(), ProtectionState::Protected);
    assert_eq!(vp.protection_count(), 1);
    let off = devices.switched_off();
    assert!(off.contains(&Device::Compute));
    assert!(off.contains(&Device::Aux));

    // Supply back: held above recovery for the hold time.
    let hold = vp.config().recovery_hold_s;
    for _ in 0..=hold {
        clock.advance_ms(1_000);
        vp.process_sample(19.0, clock.now_ms()).unwrap();
        bus.drain();
    }
    assert_eq!(vp.state(), ProtectionState::Normal);
    assert!(devices.is_powered(Device::Compute));
    assert!(devices.is_powered(Device::Aux));
    assert_eq!(vp.protection_count(), 1);

    bus.drain();
    assert!(!events.lock().unwrap().is_empty());
}

#[test]
fn low_threshold_is_exclusive() {
    let (_, clock, _, vp) = protection(12.0);
    assert_eq!(vp.process_sample(12.0, clock.now_ms()).unwrap(), ProtectionState::Normal);

    let lsb = raw_to_volts(1);
    clock.advance_ms(1_000);
    assert_eq!(
        vp.process_sample(12.0 - lsb, clock.now_ms()).unwrap(),
        ProtectionState::LowVoltage
    );
}

#[test]
fn recovery_within_countdown_returns_to_normal() {
    let (devices, clock, _, vp) = protection(12.0);
    vp.process_sample(11.0, clock.now_ms()).unwrap();
    clock.advance_ms(10_000);
    vp.process_sample(11.0, clock.now_ms()).unwrap();
    clock.advance_ms(1_000);
    assert_eq!(vp.process_sample(18.5, clock.now_ms()).unwrap(), ProtectionState::Normal);
    assert!(devices.switched_off().is_empty());
    assert_eq!(vp.protection_count(), 0);
}

// ── Configuration layering ───────────────────────────────────

fn store() -> (Arc<MemFs>, Arc<MockBlobStore>, Arc<EventBus>, ConfigStore) {
    let files = Arc::new(MemFs::new());
    let blobs = Arc::new(MockBlobStore::new());
    let bus = Arc::new(EventBus::new());
    let store = ConfigStore::open(files.clone(), blobs.clone())
        .with_dir(CONFIG_DIR)
        .with_bus(Arc::clone(&bus));
    (files, blobs, bus, store)
}

#[test]
fn blob_copy_is_used_and_mirrored_when_file_is_missing() {
    let (files, blobs, _, store) = store();
    blobs.put("ts_net", "config", br#"{"port":443}"#);

    let loaded = store.load(ConfigModule::Net, &json!({"port": 80}));
    assert_eq!(loaded.source, Source::Blob);
    assert_eq!(loaded.value["port"], 443);

    let mirrored: Value = serde_json::from_slice(&files.get("/sdcard/config/net.json").unwrap()).unwrap();
    assert_eq!(mirrored["port"], 443);

    // Next load is served from the file.
    assert_eq!(store.load(ConfigModule::Net, &json!({})).source, Source::File);
}

#[test]
fn corrupt_copies_fall_back_to_defaults_with_an_event() {
    let (files, blobs, bus, store) = store();
    blobs.put("ts_net", "config", b"{not json");
    files.delete("/sdcard/config/net.json");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    bus.register(EventBase::Config, Some(cfg_event::LOAD_FALLBACK), move |ev| {
        s.lock().unwrap().push(ev.json().cloned());
    });

    let loaded = store.load(ConfigModule::Net, &json!({"port": 80}));
    assert_eq!(loaded.source, Source::Default);
    assert_eq!(loaded.value, json!({"port": 80}));

    bus.drain();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].as_ref().unwrap()["module"], "net");
}

#[test]
fn blob_size_limit_is_inclusive() {
    let (files, blobs, _, store) = store();
    let padded = |len: usize| json!({"pad": "x".repeat(len - r#"{"pad":""}"#.len())});

    let fits = padded(BLOB_MAX_SIZE);
    assert_eq!(serde_json::to_vec(&fits).unwrap().len(), BLOB_MAX_SIZE);
    let outcome = store.save(ConfigModule::Ui, &fits).unwrap();
    assert!(outcome.file_saved && outcome.blob_saved && !outcome.pending_sync);

    let writes_before = files.write_count();
    let blob_writes_before = blobs.write_count("ts_ui");
    assert_eq!(
        store.save(ConfigModule::Ui, &padded(BLOB_MAX_SIZE + 1)),
        Err(Error::InvalidSize)
    );
    assert_eq!(files.write_count(), writes_before);
    assert_eq!(blobs.write_count("ts_ui"), blob_writes_before);
}

#[test]
fn failed_file_write_is_repaired_by_sync() {
    let (files, _, _, store) = store();
    files.fail_writes.store(true, Ordering::SeqCst);
    let outcome = store.save(ConfigModule::Temp, &json!({"mode": "manual"})).unwrap();
    assert!(!outcome.file_saved && outcome.blob_saved && outcome.pending_sync);
    assert!(store.has_pending_sync(ConfigModule::Temp));

    // Blob-first while the file is stale.
    assert_eq!(store.load(ConfigModule::Temp, &json!({})).source, Source::Blob);

    files.fail_writes.store(false, Ordering::SeqCst);
    store.sync_pending();
    assert!(!store.has_pending_sync(ConfigModule::Temp));
    assert!(files.get("/sdcard/config/temp.json").is_some());
}

// ── Subscriptions ────────────────────────────────────────────

#[test]
fn timer_topic_honours_its_interval() {
    let clock = Arc::new(SimClock::new());
    let registry = Arc::new(OperationRegistry::new());
    registry
        .register(OperationDescriptor::new("system.cpu", Category::System, |_, out| {
            out.ok(json!({"total_usage": 12.5}));
            Ok(())
        }))
        .unwrap();
    let sink = Arc::new(RecordingSink::new());
    let subs = SubscriptionManager::new(registry, sink.clone(), clock.clone(), None);

    assert!(subs.handle_client_message(7, r#"{"type":"subscribe","topic":"system.cpu","params":{"interval":1000}}"#).is_none());
    assert!(subs.is_armed("system.cpu"));

    for _ in 0..20 {
        subs.poll_timers(clock.now_us());
        clock.advance_ms(250);
    }
    let n = sink.count_for(7, "system.cpu");
    assert!((5..=6).contains(&n), "{n} frames in 5 s");
    let frames = sink.frames.lock().unwrap().clone();
    assert_eq!(frames[0].1["type"], "data");
    assert_eq!(frames[0].1["data"]["total_usage"], 12.5);

    assert!(subs.handle_client_message(7, r#"{"type":"unsubscribe","topic":"system.cpu"}"#).is_none());
    assert!(!subs.is_armed("system.cpu"));
    sink.clear();
    clock.advance_ms(2_000);
    assert_eq!(subs.poll_timers(clock.now_us()), 0);
    assert_eq!(sink.count_for(7, "system.cpu"), 0);
}

#[test]
fn bad_client_frames_get_error_replies() {
    let clock = Arc::new(SimClock::new());
    let subs = SubscriptionManager::new(
        Arc::new(OperationRegistry::new()),
        Arc::new(RecordingSink::new()),
        clock,
        None,
    );
    let reply = |text: &str| -> Value { serde_json::from_str(&subs.handle_client_message(1, text).unwrap()).unwrap() };

    assert_eq!(reply("not json")["error"], "Invalid message");
    assert_eq!(reply(r#"{"type":"subscribe"}"#)["error"], "Missing topic");
    assert_eq!(reply(r#"{"type":"subscribe","topic":"nope.nope"}"#)["error"], "Unknown topic");
    assert_eq!(reply(r#"{"type":"poke","topic":"system.cpu"}"#)["error"], "Unknown message type");
    assert_eq!(subs.subscription_count(), 0);
}

// ── Operation registry ───────────────────────────────────────

#[test]
fn failing_handler_never_leaks_partial_data() {
    let registry = OperationRegistry::new();
    registry
        .register(OperationDescriptor::new("half.done", Category::System, |_, out| {
            out.ok(json!({"x": 1}));
            Err(Error::Internal)
        }))
        .unwrap();

    let r = registry.call("half.done", None);
    assert_eq!(r.code.as_str(), "INTERNAL");
    assert_eq!(r.message.as_deref(), Some("Handler error"));
    assert!(r.data.is_none());
}

#[test]
fn operation_name_length_limit() {
    let registry = OperationRegistry::new();
    let op = |name: String| OperationDescriptor::new(name, Category::System, |_, out| {
        out.ok(Value::Null);
        Ok(())
    });

    assert_eq!(registry.register(op("a".repeat(MAX_NAME_LEN))), Err(Error::InvalidArg));
    assert!(registry.register(op("a".repeat(MAX_NAME_LEN - 1))).is_ok());
    assert_eq!(registry.register(op(String::new())), Err(Error::InvalidArg));
    assert_eq!(registry.count(), 1);
}
