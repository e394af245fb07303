//! Property tests for the core data structures.
//!
//! Runs on host (x86_64) only; proptest is not built for ESP32 targets.

#![cfg(not(target_os = "espidf"))]

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{Value, json};

use tianshan::adapters::time::SimClock;
use tianshan::api::{Category, MAX_NAME_LEN, OperationDescriptor, OperationRegistry};
use tianshan::automation::history::{History, bounded};
use tianshan::automation::sources::extract_path;
use tianshan::automation::{ExecStatus, ExecutionRecord, HISTORY_CAPACITY, TriggerSource};
use tianshan::config::pack::{self, KEY_LEN, PackError};
use tianshan::ws::{MAX_SUBSCRIPTIONS, SubscriptionManager};
use tianshan::app::ports::{FrameSink, SinkError};

// ── .tscfg envelope ──────────────────────────────────────────

proptest! {
    #[test]
    fn sealed_frames_open_with_the_same_key(
        device_key in proptest::collection::vec(any::<u8>(), KEY_LEN),
        seq in any::<u32>(),
        body in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let key = pack::derive_key(&device_key);
        let nonce = pack::nonce_for(&key, seq, "/sdcard/config/net.tscfg");
        let frame = pack::seal(&key, &nonce, &body).unwrap();
        prop_assert!(pack::is_sealed(&frame));
        prop_assert_eq!(frame.len(), pack::HEADER_LEN + body.len() + pack::TAG_LEN);
        prop_assert_eq!(pack::unseal(&key, &frame).unwrap(), body);
    }

    /// Any single flipped bit is caught before plaintext is returned.
    #[test]
    fn tampered_frames_never_open(
        body in proptest::collection::vec(any::<u8>(), 1..256),
        pos in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let key = pack::derive_key(&[7u8; KEY_LEN]);
        let nonce = pack::nonce_for(&key, 1, "x");
        let mut frame = pack::seal(&key, &nonce, &body).unwrap();
        let i = pos.index(frame.len());
        frame[i] ^= 1 << bit;
        prop_assert!(pack::unseal(&key, &frame).is_err());
    }

    #[test]
    fn garbage_is_rejected_without_panic(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
        let key = pack::derive_key(&[1u8; KEY_LEN]);
        let r = pack::unseal(&key, &bytes);
        prop_assert!(r.is_err());
        if bytes.len() < pack::HEADER_LEN + pack::TAG_LEN {
            prop_assert_eq!(r, Err(PackError::TooShort));
        }
    }

    #[test]
    fn distinct_save_counters_give_distinct_nonces(a in any::<u32>(), b in any::<u32>()) {
        prop_assume!(a != b);
        let key = pack::derive_key(&[3u8; KEY_LEN]);
        prop_assert_ne!(pack::nonce_for(&key, a, "p"), pack::nonce_for(&key, b, "p"));
    }
}

// ── Operation registry ───────────────────────────────────────

fn noop(name: String) -> OperationDescriptor {
    OperationDescriptor::new(name, Category::System, |_, out| {
        out.ok(Value::Null);
        Ok(())
    })
}

proptest! {
    #[test]
    fn registry_names_stay_unique(names in proptest::collection::vec("[a-z]{1,6}(\\.[a-z]{1,6})?", 1..40)) {
        let reg = OperationRegistry::new();
        let mut expected = std::collections::BTreeSet::new();
        for n in &names {
            let fresh = expected.insert(n.clone());
            prop_assert_eq!(reg.register(noop(n.clone())).is_ok(), fresh);
        }
        prop_assert_eq!(reg.count(), expected.len());
        prop_assert_eq!(reg.list(None), expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn name_limit_is_enforced(len in 1usize..(MAX_NAME_LEN * 2)) {
        let reg = OperationRegistry::new();
        prop_assert_eq!(reg.register(noop("n".repeat(len))).is_ok(), len < MAX_NAME_LEN);
    }

    /// Arbitrary request text always yields a well-formed response.
    #[test]
    fn request_handler_always_answers(text in ".{0,200}") {
        let reg = OperationRegistry::new();
        reg.register(noop("system.ping".into())).unwrap();
        let out = reg.handle_request(&text, tianshan::api::Caller::anonymous());
        prop_assert!(out["success"].is_boolean());
        prop_assert!(out["code"].is_string());
        if out["success"] == false {
            prop_assert!(out.get("data").is_none_or(Value::is_null));
        }
    }
}

// ── Execution history ────────────────────────────────────────

fn record(i: usize) -> ExecutionRecord {
    ExecutionRecord::new(
        &format!("rule_{i}"),
        ExecStatus::Success,
        TriggerSource::Manual,
        1,
        0,
        "ok",
        i as u64,
    )
}

proptest! {
    #[test]
    fn history_is_bounded_and_newest_first(pushes in 0usize..(HISTORY_CAPACITY * 3), ask in 0usize..200) {
        let mut h = History::new();
        for i in 0..pushes {
            h.push(record(i));
        }
        prop_assert_eq!(h.len(), pushes.min(HISTORY_CAPACITY));

        let recent = h.recent(ask);
        prop_assert_eq!(recent.len(), ask.min(h.len()));
        if let Some(first) = recent.first() {
            prop_assert_eq!(first.timestamp_ms, (pushes - 1) as u64);
        }
        prop_assert!(recent.windows(2).all(|w| w[0].timestamp_ms > w[1].timestamp_ms));
    }

    #[test]
    fn bounded_strings_keep_whole_characters(s in "\\PC{0,80}") {
        let b = bounded::<32>(&s);
        prop_assert!(b.len() <= 32);
        prop_assert!(s.starts_with(b.as_str()));
    }
}

// ── Path extraction ──────────────────────────────────────────

proptest! {
    #[test]
    fn array_paths_index_in_bounds_only(values in proptest::collection::vec(any::<i32>(), 0..8), idx in 0usize..12) {
        let doc = json!({"cores": values.iter().map(|v| json!({"usage": v})).collect::<Vec<_>>()});
        let got = extract_path(&doc, &format!("cores[{idx}].usage"));
        match values.get(idx) {
            Some(v) => prop_assert_eq!(got, Some(&json!(v))),
            None => prop_assert!(got.is_none()),
        }
    }
}

// ── Subscription table ───────────────────────────────────────

struct Discard;

impl FrameSink for Discard {
    fn send(&self, _client: u32, _frame: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

proptest! {
    #[test]
    fn subscription_table_never_overflows(
        ops in proptest::collection::vec((0u32..6, 0usize..4, any::<bool>()), 0..120),
    ) {
        const TOPICS: [&str; 4] = ["system.cpu", "system.memory", "temp.status", "power.status"];
        let subs = SubscriptionManager::new(
            Arc::new(OperationRegistry::new()),
            Arc::new(Discard),
            Arc::new(SimClock::new()),
            None,
        );
        for (client, t, add) in ops {
            if add {
                let _ = subs.subscribe(client, TOPICS[t], None);
            } else {
                let _ = subs.unsubscribe(client, TOPICS[t]);
            }
            prop_assert!(subs.subscription_count() <= MAX_SUBSCRIPTIONS);
            for topic in TOPICS {
                prop_assert_eq!(subs.is_armed(topic), subs.subscribers(topic) > 0);
            }
        }
        for client in 0..6 {
            subs.client_disconnected(client);
        }
        prop_assert_eq!(subs.subscription_count(), 0);
        prop_assert!(TOPICS.iter().all(|t| !subs.is_armed(t)));
    }
}
