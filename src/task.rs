//! Core-pinned thread spawning for ESP32-S3 dual-core.
//!
//! Wraps `esp_pthread_set_cfg()` so that `std::thread` creates a FreeRTOS
//! task pinned to a specific CPU core with explicit priority and stack
//! size.  On non-ESP targets, falls back to a plain named thread.
//!
//! Task placement used by the supervisor:
//!
//! | Task       | Core | Prio | Owner                        |
//! |------------|------|------|------------------------------|
//! | `evt-bus`  | Pro  | 6    | event delivery worker        |
//! | `volt-mon` | App  | 10   | voltage protection sampling  |
//! | `ctl`      | App  | 5    | automation + subscription timers |
//!
//! `esp_pthread_set_cfg()` applies to the *next* `pthread_create()` from
//! the calling thread, so the config→spawn pair must not interleave with
//! other thread creation on the same thread.

use std::io;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::error::relock;

/// CPU core identifiers for the ESP32-S3 Xtensa LX7 dual-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 (PRO_CPU): protocol stacks (WiFi, lwIP) and event delivery.
    Pro = 0,
    /// Core 1 (APP_CPU): sampling and control loops.
    App = 1,
}

/// Placement of a thread started through [`spawn_on_core`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedTask {
    pub name: &'static str,
    pub core: Core,
    pub priority: u8,
    pub stack_kb: usize,
}

static SPAWNED: Mutex<Vec<SpawnedTask>> = Mutex::new(Vec::new());

fn record(core: Core, priority: u8, stack_kb: usize, name: &'static str) {
    let name = name.trim_end_matches('\0');
    let mut list = relock(SPAWNED.lock());
    if !list.iter().any(|t| t.name == name) {
        list.push(SpawnedTask {
            name,
            core,
            priority,
            stack_kb,
        });
    }
}

/// Every distinct task name spawned so far, in spawn order.
pub fn spawned() -> Vec<SpawnedTask> {
    relock(SPAWNED.lock()).clone()
}

/// Spawn a thread pinned to `core` with explicit priority and stack.
///
/// `name` must be NUL-terminated (e.g. `"volt-mon\0"`).
#[cfg(target_os = "espidf")]
pub fn spawn_on_core<F>(
    core: Core,
    priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    // SAFETY: `name` is a 'static NUL-terminated string and the config is
    // consumed by the very next pthread_create on this thread.
    let ret = unsafe {
        let mut cfg = esp_idf_sys::esp_create_default_pthread_config();
        cfg.pin_to_core = core as i32;
        cfg.prio = priority as i32;
        cfg.stack_size = (stack_kb * 1024) as _;
        cfg.thread_name = name.as_ptr().cast();
        esp_idf_sys::esp_pthread_set_cfg(&cfg)
    };
    if ret != esp_idf_sys::ESP_OK as i32 {
        return Err(io::Error::other(format!("esp_pthread_set_cfg failed: {ret}")));
    }

    record(core, priority, stack_kb, name);
    let display_name = name.trim_end_matches('\0');
    log::info!(
        "Spawning '{}' on {:?} (pri={}, stack={}KB)",
        display_name,
        core,
        priority,
        stack_kb
    );

    std::thread::Builder::new().name(display_name.into()).spawn(f)
}

/// Simulation fallback: records but ignores core affinity and priority.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core<F>(
    core: Core,
    priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    record(core, priority, stack_kb, name);
    let display_name = name.trim_end_matches('\0');
    log::debug!("Spawning '{}' (sim, stack={}KB)", display_name, stack_kb);

    // Host debug builds need more headroom than the firmware budget.
    std::thread::Builder::new()
        .name(display_name.into())
        .stack_size((stack_kb * 1024).max(64 * 1024))
        .spawn(f)
}
