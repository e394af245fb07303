//! Supply-voltage sense adapter.
//!
//! ## Dual-target design
//!
//! On ESP-IDF: ADC1 oneshot read of the divider tap, averaged over a short
//! burst and scaled back to bus volts.
//! On host/test: a shared `AtomicU32` holding the f32 bits, for injection.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::app::ports::{HardwareError, VoltageSensor};
use crate::pins;

/// Raw ADC code → bus volts.
pub fn raw_to_volts(raw: u16) -> f32 {
    let tap_mv = f32::from(raw) * pins::ADC_FULL_SCALE_MV / pins::ADC_MAX_RAW;
    tap_mv / 1000.0 * pins::VSUPPLY_DIVIDER_RATIO
}

// ── ESP-IDF ───────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub use esp::AdcVoltageSensor;

#[cfg(target_os = "espidf")]
mod esp {
    use esp_idf_svc::sys::*;
    use log::info;

    use super::raw_to_volts;
    use crate::app::ports::{HardwareError, VoltageSensor};
    use crate::pins;

    const BURST: usize = 8;

    pub struct AdcVoltageSensor {
        handle: adc_oneshot_unit_handle_t,
    }

    // SAFETY: the oneshot handle is owned exclusively by this sensor and only
    // used from whichever single thread currently holds it.
    unsafe impl Send for AdcVoltageSensor {}

    impl AdcVoltageSensor {
        pub fn new() -> Result<Self, HardwareError> {
            let mut handle: adc_oneshot_unit_handle_t = core::ptr::null_mut();
            let init_cfg = adc_oneshot_unit_init_cfg_t {
                unit_id: adc_unit_t_ADC_UNIT_1,
                ulp_mode: adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
                ..Default::default()
            };
            // SAFETY: `handle` is a valid out-pointer; the unit is claimed once.
            let ret = unsafe { adc_oneshot_new_unit(&init_cfg, &mut handle) };
            if ret != ESP_OK as i32 {
                return Err(HardwareError::ReadFailed);
            }
            let chan_cfg = adc_oneshot_chan_cfg_t {
                atten: adc_atten_t_ADC_ATTEN_DB_12,
                bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
            };
            // SAFETY: `handle` was just created by adc_oneshot_new_unit.
            let ret = unsafe { adc_oneshot_config_channel(handle, pins::VSUPPLY_ADC_CHANNEL, &chan_cfg) };
            if ret != ESP_OK as i32 {
                return Err(HardwareError::ReadFailed);
            }
            info!("VSense: ADC1 CH{} configured", pins::VSUPPLY_ADC_CHANNEL);
            Ok(Self { handle })
        }
    }

    impl VoltageSensor for AdcVoltageSensor {
        fn read_voltage(&mut self) -> Result<f32, HardwareError> {
            let mut sum: u32 = 0;
            for _ in 0..BURST {
                let mut raw: i32 = 0;
                // SAFETY: handle is valid for the life of `self`.
                let ret = unsafe { adc_oneshot_read(self.handle, pins::VSUPPLY_ADC_CHANNEL, &mut raw) };
                if ret != ESP_OK as i32 {
                    return Err(HardwareError::ReadFailed);
                }
                sum += raw.max(0) as u32;
            }
            Ok(raw_to_volts((sum / BURST as u32) as u16))
        }
    }

    impl Drop for AdcVoltageSensor {
        fn drop(&mut self) {
            // SAFETY: releasing the unit we created.
            unsafe { adc_oneshot_del_unit(self.handle) };
        }
    }
}

// ── Simulation ────────────────────────────────────────────────

/// Injectable sensor.  Clones share the same reading.
#[derive(Debug, Clone)]
pub struct SimVoltageSensor {
    bits: Arc<AtomicU32>,
    failing: Arc<AtomicBool>,
}

impl SimVoltageSensor {
    pub fn new(volts: f32) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(volts.to_bits())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set(&self, volts: f32) {
        self.bits.store(volts.to_bits(), Ordering::Relaxed);
    }

    /// Make subsequent reads fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl VoltageSensor for SimVoltageSensor {
    fn read_voltage(&mut self) -> Result<f32, HardwareError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(HardwareError::ReadFailed);
        }
        Ok(f32::from_bits(self.bits.load(Ordering::Relaxed)))
    }
}
