//! Bounded execution history.

use heapless::HistoryBuffer;
use serde_json::{Value, json};

use super::actions::{ExecStatus, TriggerSource};

pub const HISTORY_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub rule_id: heapless::String<32>,
    pub status: ExecStatus,
    pub source: TriggerSource,
    pub action_count: u8,
    pub failed_count: u8,
    pub message: heapless::String<64>,
    pub timestamp_ms: u64,
}

/// Copy as much of `s` as fits, never splitting a character.
pub fn bounded<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

impl ExecutionRecord {
    pub fn new(
        rule_id: &str,
        status: ExecStatus,
        source: TriggerSource,
        action_count: usize,
        failed_count: usize,
        message: &str,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            rule_id: bounded(rule_id),
            status,
            source,
            action_count: u8::try_from(action_count).unwrap_or(u8::MAX),
            failed_count: u8::try_from(failed_count).unwrap_or(u8::MAX),
            message: bounded(message),
            timestamp_ms,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "rule_id": self.rule_id.as_str(),
            "status": self.status.as_str(),
            "source": self.source.as_str(),
            "action_count": self.action_count,
            "failed_count": self.failed_count,
            "message": self.message.as_str(),
            "timestamp_ms": self.timestamp_ms,
        })
    }
}

/// Ring of the most recent records; appending to a full ring evicts the oldest.
pub struct History {
    ring: HistoryBuffer<ExecutionRecord, HISTORY_CAPACITY>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self {
            ring: HistoryBuffer::new(),
        }
    }

    pub fn push(&mut self, rec: ExecutionRecord) {
        self.ring.write(rec);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    /// Up to `n` most recent records, newest first.
    pub fn recent(&self, n: usize) -> Vec<ExecutionRecord> {
        let mut all: Vec<ExecutionRecord> = self.ring.oldest_ordered().cloned().collect();
        all.reverse();
        all.truncate(n);
        all
    }

    pub fn clear(&mut self) {
        self.ring = HistoryBuffer::new();
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ring_keeps_last_min_n_capacity(n in 0usize..200, ask in 0usize..100) {
            let mut h = History::new();
            for i in 0..n {
                h.push(ExecutionRecord::new("r", ExecStatus::Success, TriggerSource::Timer, 0, 0, "", i as u64));
            }
            prop_assert_eq!(h.len(), n.min(HISTORY_CAPACITY));
            let got = h.recent(ask);
            prop_assert_eq!(got.len(), ask.min(n).min(HISTORY_CAPACITY));
            for (k, r) in got.iter().enumerate() {
                prop_assert_eq!(r.timestamp_ms, (n - 1 - k) as u64);
            }
        }
    }
}
