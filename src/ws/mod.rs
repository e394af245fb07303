//! Topic subscriptions pushed to WebSocket clients.
//!
//! ```text
//!  client ──{type:"subscribe", topic}──▶ handle_client_message
//!                                          │ first subscriber?
//!                                          ▼
//!                         arm: timer slot │ EventBus handler
//!                                          │
//!  poll_timers / bus event ──▶ payload (operation | aggregate | event)
//!                                          │
//!                       per-slot debounce (min_interval_ms) ──▶ FrameSink
//! ```
//!
//! The table lock is never held while an operation runs or a frame is
//! sent.  A failed send is logged; the slot stays until the transport
//! reports the disconnect.

pub mod topics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::api::OperationRegistry;
use crate::app::ports::{Clock, FrameSink};
use crate::error::{Error, Result, relock};
use crate::events::{Event, EventBus, HandlerId};
use topics::{Payload, Topic, Trigger};

pub const MAX_SUBSCRIPTIONS: usize = 32;

/// Granularity of the cooperative timer loop.
pub const TIMER_TICK: Duration = Duration::from_millis(100);

struct Subscription {
    client: u32,
    topic: &'static Topic,
    min_interval_ms: u64,
    last_broadcast_us: Option<u64>,
}

enum Source {
    Timer { next_due_us: u64 },
    Event(HandlerId),
}

struct Armed {
    topic: &'static Topic,
    source: Source,
}

#[derive(Default)]
struct Table {
    slots: Vec<Subscription>,
    armed: Vec<Armed>,
}

#[derive(Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    topic: Option<String>,
    #[serde(default)]
    params: Option<SubscribeParams>,
}

#[derive(Deserialize)]
struct SubscribeParams {
    interval: Option<u64>,
}

fn error_frame(msg: &str) -> String {
    json!({"type": "error", "error": msg}).to_string()
}

pub struct SubscriptionManager {
    table: Mutex<Table>,
    registry: Arc<OperationRegistry>,
    sink: Arc<dyn FrameSink>,
    clock: Arc<dyn Clock>,
    bus: Option<Arc<EventBus>>,
    me: Weak<Self>,
    shutdown: AtomicBool,
}

impl SubscriptionManager {
    pub fn new(
        registry: Arc<OperationRegistry>,
        sink: Arc<dyn FrameSink>,
        clock: Arc<dyn Clock>,
        bus: Option<Arc<EventBus>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            table: Mutex::new(Table::default()),
            registry,
            sink,
            clock,
            bus,
            me: me.clone(),
            shutdown: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        relock(self.table.lock())
    }

    // ── Client protocol ──────────────────────────────────────

    /// Handle one text frame from `client`.  Returns an error frame to send
    /// back, or `None` when the request was applied.
    pub fn handle_client_message(&self, client: u32, text: &str) -> Option<String> {
        let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
            return Some(error_frame("Invalid message"));
        };
        let Some(topic) = msg.topic.as_deref() else {
            return Some(error_frame("Missing topic"));
        };
        let result = match msg.kind.as_str() {
            "subscribe" => {
                let interval = msg.params.and_then(|p| p.interval);
                self.subscribe(client, topic, interval)
            }
            "unsubscribe" => self.unsubscribe(client, topic),
            _ => return Some(error_frame("Unknown message type")),
        };
        match result {
            Ok(()) => None,
            Err(Error::NotFound) => Some(error_frame("Unknown topic")),
            Err(Error::NoMem) => Some(error_frame("Subscription table full")),
            Err(Error::InvalidArg) => Some(error_frame("Invalid topic")),
            Err(e) => Some(error_frame(&e.to_string())),
        }
    }

    // ── Subscribe / unsubscribe ──────────────────────────────

    /// Add or refresh `(client, topic)`.  The first subscriber arms the
    /// topic's source.
    pub fn subscribe(&self, client: u32, topic: &str, interval_ms: Option<u64>) -> Result<()> {
        if topic.is_empty() || topic.len() > topics::MAX_TOPIC_LEN {
            return Err(Error::InvalidArg);
        }
        let entry = topics::lookup(topic).ok_or(Error::NotFound)?;
        let min_interval_ms = interval_ms.unwrap_or(entry.default_interval_ms);

        let mut t = self.lock();
        if let Some(s) = t
            .slots
            .iter_mut()
            .find(|s| s.client == client && s.topic.name == entry.name)
        {
            s.min_interval_ms = min_interval_ms;
            return Ok(());
        }
        if t.slots.len() >= MAX_SUBSCRIPTIONS {
            warn!("WS: subscription table full, client {} refused", client);
            return Err(Error::NoMem);
        }
        t.slots.push(Subscription {
            client,
            topic: entry,
            min_interval_ms,
            last_broadcast_us: None,
        });
        if !t.armed.iter().any(|a| a.topic.name == entry.name) {
            let source = self.arm(entry);
            t.armed.push(Armed { topic: entry, source });
        }
        info!("WS: client {} subscribed to {} ({} ms)", client, entry.name, min_interval_ms);
        Ok(())
    }

    pub fn unsubscribe(&self, client: u32, topic: &str) -> Result<()> {
        let mut t = self.lock();
        let before = t.slots.len();
        t.slots.retain(|s| !(s.client == client && s.topic.name == topic));
        if t.slots.len() == before {
            return Err(Error::NotFound);
        }
        self.disarm_unused(&mut t);
        debug!("WS: client {} unsubscribed from {}", client, topic);
        Ok(())
    }

    /// Drop every slot owned by `client`.  Returns how many were removed.
    pub fn client_disconnected(&self, client: u32) -> usize {
        let mut t = self.lock();
        let before = t.slots.len();
        t.slots.retain(|s| s.client != client);
        let removed = before - t.slots.len();
        self.disarm_unused(&mut t);
        if removed > 0 {
            info!("WS: client {} gone, {} subscriptions released", client, removed);
        }
        removed
    }

    fn arm(&self, topic: &'static Topic) -> Source {
        match topic.trigger {
            Trigger::Timer { .. } => Source::Timer {
                next_due_us: self.clock.now_us(),
            },
            Trigger::Event(base) => {
                let me = self.me.clone();
                let name = topic.name;
                let handler = match &self.bus {
                    Some(bus) => bus.register(base, None, move |ev: &Event| {
                        if let Some(this) = me.upgrade() {
                            this.on_event(name, ev);
                        }
                    }),
                    None => {
                        warn!("WS: no event bus, {} will stay silent", name);
                        return Source::Timer { next_due_us: u64::MAX };
                    }
                };
                Source::Event(handler)
            }
        }
    }

    fn disarm_unused(&self, t: &mut Table) {
        let Table { slots, armed } = t;
        armed.retain(|a| {
            let used = slots.iter().any(|s| s.topic.name == a.topic.name);
            if !used {
                if let (Source::Event(h), Some(bus)) = (&a.source, &self.bus) {
                    if bus.unregister(*h).is_err() {
                        debug!("WS: handler for {} already gone", a.topic.name);
                    }
                }
                debug!("WS: {} disarmed", a.topic.name);
            }
            used
        });
    }

    // ── Sources ──────────────────────────────────────────────

    /// Fire every armed timer topic that is due.  Returns frames sent.
    pub fn poll_timers(&self, now_us: u64) -> usize {
        let due: Vec<&'static Topic> = {
            let mut t = self.lock();
            t.armed
                .iter_mut()
                .filter_map(|a| match (&mut a.source, a.topic.trigger) {
                    (Source::Timer { next_due_us }, Trigger::Timer { period_ms })
                        if *next_due_us <= now_us =>
                    {
                        *next_due_us = now_us.saturating_add(period_ms * 1000);
                        Some(a.topic)
                    }
                    _ => None,
                })
                .collect()
        };
        due.into_iter()
            .map(|topic| {
                let data = self.collect(topic);
                self.broadcast_at(topic.name, &data, now_us)
            })
            .sum()
    }

    fn on_event(&self, topic: &'static str, ev: &Event) {
        let data = json!({
            "event_id": ev.id,
            "payload": ev.json().cloned().unwrap_or(Value::Null),
        });
        self.broadcast_at(topic, &data, self.clock.now_us());
    }

    /// Compute a topic's payload.  Failed parts of an aggregate become `null`.
    fn collect(&self, topic: &Topic) -> Value {
        match topic.payload {
            Payload::Operation(op) => {
                let r = self.registry.call(op, None);
                if r.is_ok() {
                    r.into_data().unwrap_or(Value::Null)
                } else {
                    debug!("WS: {} source {} failed", topic.name, op);
                    Value::Null
                }
            }
            Payload::Aggregate(parts) => {
                let mut out = Map::new();
                for (key, op) in parts {
                    let r = self.registry.call(op, None);
                    let v = if r.is_ok() {
                        r.into_data().unwrap_or(Value::Null)
                    } else {
                        Value::Null
                    };
                    out.insert((*key).to_owned(), v);
                }
                Value::Object(out)
            }
            Payload::Event => Value::Null,
        }
    }

    /// Push `data` on `topic` to every subscriber whose debounce window
    /// has elapsed.  Returns frames sent.
    pub fn publish(&self, topic: &str, data: &Value) -> usize {
        self.broadcast_at(topic, data, self.clock.now_us())
    }

    fn broadcast_at(&self, topic: &str, data: &Value, now_us: u64) -> usize {
        let targets: Vec<u32> = {
            let mut t = self.lock();
            t.slots
                .iter_mut()
                .filter(|s| s.topic.name == topic)
                .filter(|s| {
                    s.last_broadcast_us.is_none_or(|last| {
                        now_us.saturating_sub(last) >= s.min_interval_ms * 1000
                    })
                })
                .map(|s| {
                    s.last_broadcast_us = Some(now_us);
                    s.client
                })
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let frame = json!({
            "type": "data",
            "topic": topic,
            "data": data,
            "timestamp": now_us / 1000,
        })
        .to_string();

        let mut sent = 0;
        for client in targets {
            match self.sink.send(client, &frame) {
                Ok(()) => sent += 1,
                Err(e) => warn!("WS: send to client {} failed: {}", client, e),
            }
        }
        sent
    }

    // ── Timer loop ───────────────────────────────────────────

    pub async fn run_timers(&self) {
        info!("WS: timer loop started");
        while !self.shutdown.swap(false, Ordering::SeqCst) {
            self.poll_timers(self.clock.now_us());
            async_io_mini::Timer::after(TIMER_TICK).await;
        }
        info!("WS: timer loop exited");
    }

    /// Stop [`run_timers`](Self::run_timers); consumed by the loop.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    // ── Introspection ────────────────────────────────────────

    pub fn is_armed(&self, topic: &str) -> bool {
        self.lock().armed.iter().any(|a| a.topic.name == topic)
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn subscribers(&self, topic: &str) -> usize {
        self.lock().slots.iter().filter(|s| s.topic.name == topic).count()
    }

    /// Drop every slot and disarm every source.
    pub fn clear(&self) {
        let mut t = self.lock();
        t.slots.clear();
        self.disarm_unused(&mut t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::time::SimClock;
    use crate::api::{Category, OperationDescriptor};
    use crate::app::ports::SinkError;
    use crate::events::{EventBase, Priority};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(u32, Value)>>,
        fail_for: Mutex<Option<u32>>,
    }

    impl FrameSink for Recorder {
        fn send(&self, client: u32, frame: &str) -> core::result::Result<(), SinkError> {
            if *self.fail_for.lock().unwrap() == Some(client) {
                return Err(SinkError::Disconnected);
            }
            self.frames
                .lock()
                .unwrap()
                .push((client, serde_json::from_str(frame).unwrap()));
            Ok(())
        }
    }

    fn rig() -> (Arc<SimClock>, Arc<Recorder>, Arc<EventBus>, Arc<SubscriptionManager>) {
        let clock = Arc::new(SimClock::new());
        let sink = Arc::new(Recorder::default());
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(OperationRegistry::new());
        registry
            .register(OperationDescriptor::new("system.cpu", Category::System, |_, out| {
                out.ok(json!({"total_usage": 12}));
                Ok(())
            }))
            .unwrap();
        registry
            .register(OperationDescriptor::new("system.memory", Category::System, |_, out| {
                out.error(crate::error::ResultCode::Internal, "boom");
                Ok(())
            }))
            .unwrap();
        let mgr = SubscriptionManager::new(registry, sink.clone(), clock.clone(), Some(Arc::clone(&bus)));
        (clock, sink, bus, mgr)
    }

    #[test]
    fn debounce_limits_frames() {
        let (clock, sink, _, mgr) = rig();
        assert!(mgr.handle_client_message(1, r#"{"type":"subscribe","topic":"system.cpu","params":{"interval":1000}}"#).is_none());
        for _ in 0..20 {
            mgr.publish("system.cpu", &json!({}));
            clock.advance_ms(250);
        }
        let n = sink.frames.lock().unwrap().len();
        assert!((5..=6).contains(&n), "got {n} frames");

        mgr.unsubscribe(1, "system.cpu").unwrap();
        assert!(!mgr.is_armed("system.cpu"));
    }

    #[test]
    fn resubscribe_keeps_single_slot() {
        let (_, _, _, mgr) = rig();
        mgr.subscribe(1, "system.cpu", None).unwrap();
        mgr.subscribe(1, "system.cpu", Some(50)).unwrap();
        assert_eq!(mgr.subscription_count(), 1);
        mgr.unsubscribe(1, "system.cpu").unwrap();
        mgr.subscribe(1, "system.cpu", None).unwrap();
        assert_eq!(mgr.subscription_count(), 1);
        assert!(mgr.is_armed("system.cpu"));
    }

    #[test]
    fn arming_follows_subscriber_count() {
        let (_, _, bus, mgr) = rig();
        let base = bus.handler_count();
        mgr.subscribe(1, "power.protection", None).unwrap();
        mgr.subscribe(2, "power.protection", None).unwrap();
        assert_eq!(bus.handler_count(), base + 1);
        mgr.client_disconnected(1);
        assert!(mgr.is_armed("power.protection"));
        mgr.client_disconnected(2);
        assert!(!mgr.is_armed("power.protection"));
        assert_eq!(bus.handler_count(), base);
    }

    #[test]
    fn event_topic_forwards_payload() {
        let (_, sink, bus, mgr) = rig();
        mgr.subscribe(7, "power.protection", None).unwrap();
        bus.post_json(EventBase::Power, 2, json!({"voltage": 11.5}), Priority::Normal)
            .unwrap();
        bus.drain();
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1["type"], "data");
        assert_eq!(frames[0].1["data"]["payload"]["voltage"], 11.5);
    }

    #[test]
    fn timer_topic_polls_operation() {
        let (clock, sink, _, mgr) = rig();
        mgr.subscribe(1, "system.cpu", None).unwrap();
        assert_eq!(mgr.poll_timers(clock.now_us()), 1);
        assert_eq!(mgr.poll_timers(clock.now_us() + 500_000), 0);
        assert_eq!(mgr.poll_timers(clock.now_us() + 1_000_000), 1);
        assert_eq!(sink.frames.lock().unwrap()[0].1["data"]["total_usage"], 12);
    }

    #[test]
    fn dashboard_nulls_failed_parts() {
        let (clock, sink, _, mgr) = rig();
        mgr.subscribe(3, "system.dashboard", None).unwrap();
        mgr.poll_timers(clock.now_us());
        let frames = sink.frames.lock().unwrap();
        let data = &frames[0].1["data"];
        assert_eq!(data["cpu"]["total_usage"], 12);
        assert!(data["memory"].is_null());
        assert!(data["power"].is_null());
    }

    #[test]
    fn protocol_errors() {
        let (_, _, _, mgr) = rig();
        let err = |s: Option<String>| -> String {
            let v: Value = serde_json::from_str(&s.unwrap()).unwrap();
            assert_eq!(v["type"], "error");
            v["error"].as_str().unwrap().to_owned()
        };
        assert_eq!(err(mgr.handle_client_message(1, "nope")), "Invalid message");
        assert_eq!(err(mgr.handle_client_message(1, r#"{"type":"subscribe"}"#)), "Missing topic");
        assert_eq!(
            err(mgr.handle_client_message(1, r#"{"type":"poke","topic":"system.cpu"}"#)),
            "Unknown message type"
        );
        assert_eq!(
            err(mgr.handle_client_message(1, r#"{"type":"subscribe","topic":"x.y"}"#)),
            "Unknown topic"
        );
    }

    #[test]
    fn table_capacity() {
        let (_, _, _, mgr) = rig();
        for c in 0..MAX_SUBSCRIPTIONS as u32 {
            mgr.subscribe(c, "system.cpu", None).unwrap();
        }
        assert_eq!(mgr.subscribe(99, "system.cpu", None), Err(Error::NoMem));
    }

    #[test]
    fn failed_send_keeps_slot() {
        let (_, sink, _, mgr) = rig();
        mgr.subscribe(1, "system.cpu", None).unwrap();
        mgr.subscribe(2, "system.cpu", None).unwrap();
        *sink.fail_for.lock().unwrap() = Some(1);
        assert_eq!(mgr.publish("system.cpu", &json!(1)), 1);
        assert_eq!(mgr.subscribers("system.cpu"), 2);
    }
}
