//! Static topic table for the subscription fan-out.

use crate::events::EventBase;

pub const MAX_TOPIC_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Sampled on a fixed period while armed.
    Timer { period_ms: u64 },
    /// Forwarded from every event posted under `base`.
    Event(EventBase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Result data of one read-only operation.
    Operation(&'static str),
    /// Several operations stitched into one object, keyed by the first field.
    Aggregate(&'static [(&'static str, &'static str)]),
    /// The posted event's JSON body.
    Event,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Topic {
    pub name: &'static str,
    pub trigger: Trigger,
    pub default_interval_ms: u64,
    pub payload: Payload,
}

const DASHBOARD: &[(&str, &str)] = &[
    ("cpu", "system.cpu"),
    ("memory", "system.memory"),
    ("info", "system.info"),
    ("network", "network.status"),
    ("power", "power.status"),
    ("temp", "temp.status"),
    ("services", "service.list"),
];

const fn timer(name: &'static str, period_ms: u64, op: &'static str) -> Topic {
    Topic {
        name,
        trigger: Trigger::Timer { period_ms },
        default_interval_ms: period_ms,
        payload: Payload::Operation(op),
    }
}

pub static TOPICS: [Topic; 10] = [
    Topic {
        name: "system.dashboard",
        trigger: Trigger::Timer { period_ms: 1000 },
        default_interval_ms: 1000,
        payload: Payload::Aggregate(DASHBOARD),
    },
    timer("system.info", 5000, "system.info"),
    timer("system.memory", 5000, "system.memory"),
    timer("system.cpu", 1000, "system.cpu"),
    timer("network.status", 5000, "network.status"),
    timer("power.status", 5000, "power.status"),
    Topic {
        name: "power.protection",
        trigger: Trigger::Event(EventBase::Power),
        default_interval_ms: 0,
        payload: Payload::Event,
    },
    timer("temp.status", 2000, "temp.status"),
    timer("service.list", 5000, "service.list"),
    timer("automation.status", 2000, "automation.status"),
];

pub fn lookup(name: &str) -> Option<&'static Topic> {
    TOPICS.iter().find(|t| t.name == name)
}
