//! Fuzz target: `SubscriptionManager::handle_client_message`
//!
//! Client frames are untrusted.  Whatever arrives, the reply is either
//! nothing or a JSON error frame, and the table stays within bounds.
//!
//! cargo fuzz run fuzz_ws_client_message

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use tianshan::adapters::time::SimClock;
use tianshan::api::OperationRegistry;
use tianshan::app::ports::{FrameSink, SinkError};
use tianshan::ws::{MAX_SUBSCRIPTIONS, SubscriptionManager};

struct Discard;

impl FrameSink for Discard {
    fn send(&self, _client: u32, _frame: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };
    let clock = Arc::new(SimClock::new());
    let subs = SubscriptionManager::new(
        Arc::new(OperationRegistry::new()),
        Arc::new(Discard),
        clock.clone(),
        None,
    );

    for client in 0..3 {
        if let Some(reply) = subs.handle_client_message(client, text) {
            let v: serde_json::Value = serde_json::from_str(&reply).expect("error frame is JSON");
            assert_eq!(v["type"], "error");
        }
    }
    assert!(subs.subscription_count() <= MAX_SUBSCRIPTIONS);

    clock.advance_ms(10_000);
    subs.poll_timers(10_000_000);
    let held = subs.subscription_count();
    let released: usize = (0..3).map(|c| subs.client_disconnected(c)).sum();
    assert_eq!(released, held);
    assert_eq!(subs.subscription_count(), 0);
});
