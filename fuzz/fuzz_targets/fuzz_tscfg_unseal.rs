//! Fuzz target: `.tscfg` envelope parser
//!
//! Any byte string handed to `unseal` must be rejected cleanly unless it
//! is an authentic frame; a frame we sealed ourselves must reopen.
//!
//! cargo fuzz run fuzz_tscfg_unseal

#![no_main]

use libfuzzer_sys::fuzz_target;
use tianshan::config::pack;

fuzz_target!(|data: &[u8]| {
    let key = pack::derive_key(&[0x42u8; pack::KEY_LEN]);

    if let Ok(plain) = pack::unseal(&key, data) {
        // Only reachable with a valid tag; the length field must agree.
        assert_eq!(data.len(), pack::HEADER_LEN + plain.len() + pack::TAG_LEN);
    }

    let nonce = pack::nonce_for(&key, data.len() as u32, "fuzz");
    let frame = pack::seal(&key, &nonce, data).expect("seal");
    assert_eq!(pack::unseal(&key, &frame).expect("reopen"), data);
});
