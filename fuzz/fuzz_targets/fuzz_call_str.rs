//! Fuzz target: `OperationRegistry::handle_request`
//!
//! Arbitrary request text must always produce a well-formed response
//! object and never panic inside parameter handling.
//!
//! cargo fuzz run fuzz_call_str

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use tianshan::api::{Caller, Category, OperationDescriptor, OperationRegistry, params};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };

    let reg = OperationRegistry::new();
    let _ = reg.register(OperationDescriptor::new("echo.level", Category::System, |p, out| {
        let tag = params::require_str(p, "tag", out)?;
        let level = params::optional_u64(p, "level", out)?.unwrap_or(3);
        out.ok(serde_json::json!({"tag": tag, "level": level}));
        Ok(())
    }));

    let out = reg.handle_request(text, Caller::authenticated());
    assert!(out["success"].is_boolean());
    assert!(out["code"].is_string());
    if out["success"] == Value::Bool(false) {
        assert!(out.get("data").is_none());
    }

    // The params string alone through the text entry point.
    let r = reg.call_str("echo.level", Some(text));
    assert_eq!(r.is_ok(), r.data.is_some());
});
