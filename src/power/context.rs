//! Blackboard shared by every protection state handler.
//!
//! Handlers read the latest sample and device levels, update timers, and
//! queue side effects.  The owning [`VoltageProtection`](super::VoltageProtection)
//! applies the queued device commands and posts the queued events after
//! each step, so handlers never touch hardware or the bus directly.

use serde_json::{Value, json};

use super::config::ProtectionConfig;
use crate::app::ports::Device;

/// Power level of each protected rail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceLevels {
    pub compute: bool,
    pub aux: bool,
    pub fan: bool,
}

impl DeviceLevels {
    pub fn get(&self, device: Device) -> bool {
        match device {
            Device::Compute => self.compute,
            Device::Aux => self.aux,
            Device::Fan => self.fan,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "compute_powered": self.compute,
            "aux_powered": self.aux,
            "fan_running": self.fan,
        })
    }
}

pub struct ProtectionContext {
    pub config: ProtectionConfig,

    // -- Input --
    pub voltage: f32,
    pub now_ms: u64,
    pub devices: DeviceLevels,

    // -- Timing --
    pub state_entered_ms: u64,
    pub countdown_remaining_s: u32,
    pub recovery_timer_s: u32,
    /// Deadline for the delayed fan stop after a shutdown.
    pub fan_stop_at_ms: Option<u64>,

    // -- Bookkeeping --
    pub protection_count: u32,
    /// Rail levels captured on entry to shutdown, restored after recovery.
    pub snapshot: Option<DeviceLevels>,

    // -- Outputs --
    pub device_commands: Vec<(Device, bool)>,
    pub events: Vec<(u16, Value)>,
}

impl ProtectionContext {
    pub fn new(config: ProtectionConfig) -> Self {
        Self {
            config,
            voltage: 0.0,
            now_ms: 0,
            devices: DeviceLevels::default(),
            state_entered_ms: 0,
            countdown_remaining_s: 0,
            recovery_timer_s: 0,
            fan_stop_at_ms: None,
            protection_count: 0,
            snapshot: None,
            device_commands: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Whole seconds spent in the current state.
    pub fn secs_in_state(&self) -> u32 {
        let ms = self.now_ms.saturating_sub(self.state_entered_ms);
        u32::try_from(ms / 1000).unwrap_or(u32::MAX)
    }

    pub fn command(&mut self, device: Device, on: bool) {
        self.device_commands.push((device, on));
    }

    pub fn emit(&mut self, id: u16, data: Value) {
        self.events.push((id, data));
    }

    /// Queue the delayed fan stop once its deadline has passed.
    pub fn service_fan_timer(&mut self) {
        if self.fan_stop_at_ms.is_some_and(|at| self.now_ms >= at) {
            self.fan_stop_at_ms = None;
            self.command(Device::Fan, false);
        }
    }

    /// Queue power-on for every rail that was on when the snapshot was taken.
    pub fn restore_snapshot(&mut self) {
        let Some(snap) = self.snapshot.take() else {
            return;
        };
        self.fan_stop_at_ms = None;
        for device in Device::ALL {
            if snap.get(device) {
                self.command(device, true);
            }
        }
    }
}
