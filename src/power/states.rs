//! State handlers and table builder for the voltage protection.
//!
//! ```text
//!  NORMAL ──[V < low]──▶ LOW_VOLTAGE ──[countdown = 0]──▶ SHUTDOWN
//!    ▲                       │                               │
//!    │               [V ≥ recovery]                    (power-off)
//!    │◀──────────────────────┘                               ▼
//!    │                                     ┌───────────▶ PROTECTED
//!    │                          [V < recovery]               │
//!    │                                     │          [V ≥ recovery,
//!    │                                     │           auto recovery]
//!    └──────[hold elapsed, restore]──── RECOVERY ◀───────────┘
//! ```

use log::{info, warn};
use serde_json::json;

use super::context::ProtectionContext;
use super::event_id;
use super::fsm::{StateDescriptor, StateId};
use crate::app::ports::Device;

pub fn build_state_table() -> [StateDescriptor; StateId::COUNT] {
    [
        StateDescriptor {
            id: StateId::Normal,
            on_enter: Some(normal_enter),
            on_exit: None,
            on_update: normal_update,
            transient: false,
        },
        StateDescriptor {
            id: StateId::LowVoltage,
            on_enter: Some(low_enter),
            on_exit: Some(low_exit),
            on_update: low_update,
            transient: false,
        },
        StateDescriptor {
            id: StateId::Shutdown,
            on_enter: Some(shutdown_enter),
            on_exit: None,
            on_update: shutdown_update,
            transient: true,
        },
        StateDescriptor {
            id: StateId::Protected,
            on_enter: Some(protected_enter),
            on_exit: None,
            on_update: protected_update,
            transient: false,
        },
        StateDescriptor {
            id: StateId::Recovery,
            on_enter: Some(recovery_enter),
            on_exit: Some(recovery_exit),
            on_update: recovery_update,
            transient: false,
        },
    ]
}

// ── NORMAL ─────────────────────────────────────────────────────

fn normal_enter(ctx: &mut ProtectionContext) {
    ctx.countdown_remaining_s = 0;
    ctx.recovery_timer_s = 0;
}

fn normal_update(ctx: &mut ProtectionContext) -> Option<StateId> {
    // Exactly at the threshold is still healthy.
    (ctx.voltage < ctx.config.low_threshold).then_some(StateId::LowVoltage)
}

// ── LOW_VOLTAGE ────────────────────────────────────────────────

fn low_enter(ctx: &mut ProtectionContext) {
    ctx.countdown_remaining_s = ctx.config.shutdown_delay_s;
    warn!(
        "Power: low voltage {:.2} V < {:.2} V, shutdown in {}s",
        ctx.voltage, ctx.config.low_threshold, ctx.countdown_remaining_s
    );
    ctx.emit(
        event_id::LOW_VOLTAGE,
        json!({"voltage": ctx.voltage, "countdown_s": ctx.countdown_remaining_s}),
    );
}

fn low_exit(ctx: &mut ProtectionContext) {
    ctx.countdown_remaining_s = 0;
}

fn low_update(ctx: &mut ProtectionContext) -> Option<StateId> {
    if ctx.voltage >= ctx.config.recovery_threshold {
        info!("Power: supply back at {:.2} V, countdown cancelled", ctx.voltage);
        return Some(StateId::Normal);
    }

    ctx.countdown_remaining_s = ctx
        .config
        .shutdown_delay_s
        .saturating_sub(ctx.secs_in_state());
    if ctx.countdown_remaining_s == 0 {
        return Some(StateId::Shutdown);
    }

    ctx.emit(
        event_id::COUNTDOWN_TICK,
        json!({"remaining_s": ctx.countdown_remaining_s, "voltage": ctx.voltage}),
    );
    None
}

// ── SHUTDOWN (transient) ───────────────────────────────────────

fn shutdown_enter(ctx: &mut ProtectionContext) {
    ctx.protection_count = ctx.protection_count.saturating_add(1);
    ctx.snapshot = Some(ctx.devices);

    if ctx.config.enable_device_shutdown {
        ctx.command(Device::Compute, false);
        ctx.command(Device::Aux, false);
    } else {
        warn!("Power: device shutdown disabled, rails left on");
    }
    if ctx.config.enable_fan_control && ctx.devices.fan {
        ctx.fan_stop_at_ms = Some(ctx.now_ms + u64::from(ctx.config.fan_stop_delay_s) * 1000);
    }

    warn!(
        "Power: protective shutdown #{} at {:.2} V",
        ctx.protection_count, ctx.voltage
    );
    ctx.emit(
        event_id::SHUTDOWN_START,
        json!({"voltage": ctx.voltage, "protection_count": ctx.protection_count}),
    );
}

fn shutdown_update(_ctx: &mut ProtectionContext) -> Option<StateId> {
    Some(StateId::Protected)
}

// ── PROTECTED ──────────────────────────────────────────────────

fn protected_enter(ctx: &mut ProtectionContext) {
    ctx.emit(
        event_id::PROTECTED,
        json!({"voltage": ctx.voltage, "auto_recovery": ctx.config.auto_recovery_enabled}),
    );
}

fn protected_update(ctx: &mut ProtectionContext) -> Option<StateId> {
    ctx.service_fan_timer();
    (ctx.config.auto_recovery_enabled && ctx.voltage >= ctx.config.recovery_threshold)
        .then_some(StateId::Recovery)
}

// ── RECOVERY ───────────────────────────────────────────────────

fn recovery_enter(ctx: &mut ProtectionContext) {
    ctx.recovery_timer_s = ctx.config.recovery_hold_s;
    info!(
        "Power: recovery started at {:.2} V, holding {}s",
        ctx.voltage, ctx.recovery_timer_s
    );
    ctx.emit(
        event_id::RECOVERY_START,
        json!({"voltage": ctx.voltage, "hold_s": ctx.recovery_timer_s}),
    );
}

fn recovery_exit(ctx: &mut ProtectionContext) {
    ctx.recovery_timer_s = 0;
}

fn recovery_update(ctx: &mut ProtectionContext) -> Option<StateId> {
    ctx.service_fan_timer();
    if ctx.voltage < ctx.config.recovery_threshold {
        info!("Power: recovery aborted at {:.2} V", ctx.voltage);
        return Some(StateId::Protected);
    }

    ctx.recovery_timer_s = ctx
        .config
        .recovery_hold_s
        .saturating_sub(ctx.secs_in_state());
    if ctx.recovery_timer_s > 0 {
        return None;
    }

    ctx.restore_snapshot();
    ctx.emit(
        event_id::RECOVERY_COMPLETE,
        json!({"voltage": ctx.voltage, "protection_count": ctx.protection_count}),
    );
    Some(StateId::Normal)
}
