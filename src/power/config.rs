//! Protection thresholds and timing, persisted in the `power` module.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Readings below this are treated as a disconnected divider, not a brown-out.
pub const MIN_VALID_VOLTAGE: f32 = 5.0;

pub const SHUTDOWN_DELAY_RANGE_S: core::ops::RangeInclusive<u32> = 5..=300;
pub const RECOVERY_HOLD_RANGE_S: core::ops::RangeInclusive<u32> = 1..=300;

/// Longest debug window accepted by `set_debug`.
pub const MAX_DEBUG_DURATION_S: u32 = 3600;
pub const DEFAULT_DEBUG_DURATION_S: u32 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub low_threshold: f32,
    pub recovery_threshold: f32,
    pub shutdown_delay_s: u32,
    pub recovery_hold_s: u32,
    pub fan_stop_delay_s: u32,
    pub sample_interval_ms: u32,
    pub auto_recovery_enabled: bool,
    pub enable_device_shutdown: bool,
    pub enable_fan_control: bool,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            low_threshold: 12.6,
            recovery_threshold: 18.0,
            shutdown_delay_s: 60,
            recovery_hold_s: 5,
            fan_stop_delay_s: 60,
            sample_interval_ms: 5000,
            auto_recovery_enabled: true,
            enable_device_shutdown: true,
            enable_fan_control: true,
        }
    }
}

impl ProtectionConfig {
    pub fn check_thresholds(low: f32, recovery: f32) -> Result<()> {
        if !(low > 0.0 && recovery > 0.0 && recovery > low) {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Self::check_thresholds(self.low_threshold, self.recovery_threshold)?;
        if !SHUTDOWN_DELAY_RANGE_S.contains(&self.shutdown_delay_s)
            || !RECOVERY_HOLD_RANGE_S.contains(&self.recovery_hold_s)
            || self.sample_interval_ms == 0
        {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }
}
