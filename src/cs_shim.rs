//! `critical-section` 1.x provider for the firmware build.
//!
//! embassy-sync's event queue takes a critical section around every
//! send/receive.  On ESP-IDF the section is a process-wide mutex with a
//! per-thread nesting depth, so a thread may re-enter while it already
//! holds it.  Host builds get the `std` provider from dev-dependencies.

use core::cell::{Cell, RefCell};
use std::sync::{Mutex, MutexGuard};

use crate::error::relock;

static SECTION: Mutex<()> = Mutex::new(());

thread_local! {
    static DEPTH: Cell<u8> = const { Cell::new(0) };
    static HELD: RefCell<Option<MutexGuard<'static, ()>>> = const { RefCell::new(None) };
}

#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_acquire() -> u8 {
    let depth = DEPTH.get();
    if depth == 0 {
        let guard = relock(SECTION.lock());
        HELD.with(|held| *held.borrow_mut() = Some(guard));
    }
    DEPTH.set(depth.saturating_add(1));
    depth
}

#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_release(outer_depth: u8) {
    DEPTH.set(outer_depth);
    if outer_depth == 0 {
        HELD.with(|held| held.borrow_mut().take());
    }
}
