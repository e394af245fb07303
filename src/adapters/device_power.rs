//! Power-rail adapter: three load-switch enables behind [`DevicePowerPort`].
//!
//! Generic over any `embedded_hal::digital::OutputPin`, so the same code
//! drives `esp_idf_hal::gpio::PinDriver` on the board and [`SimPin`] on the
//! host.  The last commanded level is mirrored in an atomic so
//! `is_powered` never needs the pin lock.

use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use embedded_hal::digital::{ErrorType, OutputPin};
use log::{info, warn};

use crate::app::ports::{Device, DevicePowerPort, HardwareError};
use crate::error::relock;

const fn slot(device: Device) -> usize {
    match device {
        Device::Compute => 0,
        Device::Aux => 1,
        Device::Fan => 2,
    }
}

pub struct RailSwitches<P> {
    pins: Mutex<[P; 3]>,
    levels: [AtomicBool; 3],
}

impl<P: OutputPin + Send> RailSwitches<P> {
    /// Rails start in `initial` (every rail on or every rail off).
    pub fn new(compute: P, aux: P, fan: P, initial: bool) -> Result<Self, HardwareError> {
        let rails = Self {
            pins: Mutex::new([compute, aux, fan]),
            levels: [
                AtomicBool::new(!initial),
                AtomicBool::new(!initial),
                AtomicBool::new(!initial),
            ],
        };
        for d in Device::ALL {
            rails.set_power(d, initial)?;
        }
        Ok(rails)
    }
}

impl<P: OutputPin + Send> DevicePowerPort for RailSwitches<P> {
    fn set_power(&self, device: Device, on: bool) -> Result<(), HardwareError> {
        let i = slot(device);
        let mut pins = relock(self.pins.lock());
        let res = if on { pins[i].set_high() } else { pins[i].set_low() };
        if res.is_err() {
            warn!("Rails: failed to switch {} {}", device.as_str(), if on { "on" } else { "off" });
            return Err(HardwareError::WriteFailed);
        }
        if self.levels[i].swap(on, Ordering::AcqRel) != on {
            info!("Rails: {} {}", device.as_str(), if on { "ON" } else { "OFF" });
        }
        Ok(())
    }

    fn is_powered(&self, device: Device) -> bool {
        self.levels[slot(device)].load(Ordering::Acquire)
    }
}

// ── Simulated pin ─────────────────────────────────────────────

/// Host stand-in for a GPIO output.  Clones share the same level.
#[derive(Debug, Clone, Default)]
pub struct SimPin {
    level: Arc<AtomicBool>,
}

impl SimPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_high(&self) -> bool {
        self.level.load(Ordering::Acquire)
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.level.store(false, Ordering::Release);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.level.store(true, Ordering::Release);
        Ok(())
    }
}
