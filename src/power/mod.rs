//! Supply-voltage protection.
//!
//! ```text
//!   volt-mon thread (App core)
//!   ┌──────────────────────────────────────────────────────────┐
//!   │ loop every sample_interval_ms:                           │
//!   │   VoltageSensor::read_voltage()  (errors skipped)        │
//!   │   └─▶ process_sample(v)                                  │
//!   │         lock: refresh rail levels → Fsm::step → outputs  │
//!   │         unlock: DevicePowerPort::set_power(..)           │
//!   │                 EventBus::post_json(Power, ..)           │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Samples below [`MIN_VALID_VOLTAGE`](config::MIN_VALID_VOLTAGE) are
//! dropped before they reach the state machine.

pub mod config;
pub mod context;
pub mod fsm;
pub mod states;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Value, json};

pub use config::ProtectionConfig;
pub use context::DeviceLevels;
pub use fsm::StateId as ProtectionState;

use crate::app::ports::{Clock, Device, DevicePowerPort, VoltageSensor};
use crate::config::{ConfigModule, ConfigStore};
use crate::error::{Error, Result, relock};
use crate::events::{EventBase, EventBus, Priority};
use crate::task::{self, Core};
use context::ProtectionContext;
use fsm::{Fsm, StateId};

/// Event ids on [`EventBase::Power`].
pub mod event_id {
    pub const STATE_CHANGED: u16 = 0;
    pub const LOW_VOLTAGE: u16 = 1;
    pub const SHUTDOWN_START: u16 = 2;
    pub const PROTECTED: u16 = 3;
    pub const RECOVERY_START: u16 = 4;
    pub const RECOVERY_COMPLETE: u16 = 5;
    pub const COUNTDOWN_TICK: u16 = 6;
    pub const DEBUG_TICK: u16 = 7;
}

/// Sleep granularity of the sampling thread, bounds stop latency.
const SAMPLER_SLICE: Duration = Duration::from_millis(50);

struct Machine {
    fsm: Fsm,
    ctx: ProtectionContext,
    initialized: bool,
    started_ms: u64,
    debug_until_ms: Option<u64>,
    ignored_samples: u32,
}

impl Machine {
    fn new(cfg: ProtectionConfig) -> Self {
        Self {
            fsm: Fsm::new(states::build_state_table(), StateId::Normal),
            ctx: ProtectionContext::new(cfg),
            initialized: false,
            started_ms: 0,
            debug_until_ms: None,
            ignored_samples: 0,
        }
    }
}

/// Side effects collected under the lock and applied after it is released.
#[derive(Default)]
struct Outputs {
    commands: Vec<(Device, bool)>,
    events: Vec<(u16, Value)>,
}

pub struct VoltageProtection {
    machine: Mutex<Machine>,
    devices: Arc<dyn DevicePowerPort>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<ConfigStore>>,
    bus: Option<Arc<EventBus>>,
    running: AtomicBool,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl VoltageProtection {
    pub fn new(devices: Arc<dyn DevicePowerPort>, clock: Arc<dyn Clock>) -> Self {
        Self {
            machine: Mutex::new(Machine::new(ProtectionConfig::default())),
            devices,
            clock,
            store: None,
            bus: None,
            running: AtomicBool::new(false),
            sampler: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        relock(self.machine.lock())
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Load the persisted thresholds and enter `NORMAL`.
    pub fn init(&self) -> Result<()> {
        let cfg = match &self.store {
            Some(store) => {
                let (cfg, source) = store.load_typed::<ProtectionConfig>(ConfigModule::Power);
                if cfg.validate().is_err() {
                    warn!("Power: stored config out of range, using defaults");
                    ProtectionConfig::default()
                } else {
                    debug!("Power: config from {}", source.as_str());
                    cfg
                }
            }
            None => ProtectionConfig::default(),
        };
        self.init_with(cfg)
    }

    pub fn init_with(&self, cfg: ProtectionConfig) -> Result<()> {
        cfg.validate()?;
        let now = self.clock.now_ms();
        let levels = self.read_levels();
        let mut m = self.lock();
        if m.initialized {
            return Err(Error::InvalidState);
        }
        info!(
            "Power: init (low {:.2} V, recovery {:.2} V, delay {}s, hold {}s)",
            cfg.low_threshold, cfg.recovery_threshold, cfg.shutdown_delay_s, cfg.recovery_hold_s
        );
        *m = Machine::new(cfg);
        m.ctx.now_ms = now;
        m.ctx.devices = levels;
        let Machine { fsm, ctx, .. } = &mut *m;
        fsm.start(ctx);
        m.ctx.events.clear();
        m.initialized = true;
        m.started_ms = now;
        Ok(())
    }

    pub fn deinit(&self) {
        self.stop_sampler();
        let mut m = self.lock();
        let cfg = m.ctx.config.clone();
        *m = Machine::new(cfg);
        info!("Power: deinit");
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    // ── Sampling ─────────────────────────────────────────────

    /// Feed one reading.  Readings below the validity floor are ignored and
    /// the current state is returned unchanged.
    pub fn process_sample(&self, voltage: f32, now_ms: u64) -> Result<ProtectionState> {
        let levels = self.read_levels();
        let (state, out) = {
            let mut m = self.lock();
            if !m.initialized {
                return Err(Error::InvalidState);
            }
            if !voltage.is_finite() || voltage < config::MIN_VALID_VOLTAGE {
                m.ignored_samples = m.ignored_samples.saturating_add(1);
                debug!("Power: ignoring implausible sample {:.2} V", voltage);
                return Ok(m.fsm.current_state());
            }
            m.ctx.devices = levels;
            let out = step(&mut m, voltage, now_ms);
            (m.fsm.current_state(), out)
        };
        self.apply(out);
        Ok(state)
    }

    /// Read the sensor once.  Read errors are skipped without surfacing.
    pub fn sample_once(&self, sensor: &mut dyn VoltageSensor) -> Option<ProtectionState> {
        match sensor.read_voltage() {
            Ok(v) => self.process_sample(v, self.clock.now_ms()).ok(),
            Err(e) => {
                debug!("Power: sensor read failed: {}", e);
                None
            }
        }
    }

    /// Spawn the sampling thread.  `InvalidState` if it is already running.
    pub fn start_sampler(self: &Arc<Self>, mut sensor: Box<dyn VoltageSensor>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState);
        }
        let this = Arc::clone(self);
        let spawned = task::spawn_on_core(Core::App, 10, 4, "volt-mon\0", move || {
            info!("Power: sampler running");
            while this.running.load(Ordering::SeqCst) {
                this.sample_once(sensor.as_mut());
                this.sleep_interval();
            }
            info!("Power: sampler exited");
        });
        match spawned {
            Ok(handle) => {
                *relock(self.sampler.lock()) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                warn!("Power: sampler spawn failed: {}", e);
                Err(Error::NoMem)
            }
        }
    }

    pub fn stop_sampler(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = relock(self.sampler.lock()).take() {
            if handle.join().is_err() {
                warn!("Power: sampler panicked");
            }
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn sleep_interval(&self) {
        let total = Duration::from_millis(u64::from(self.lock().ctx.config.sample_interval_ms));
        let mut slept = Duration::ZERO;
        while slept < total && self.running.load(Ordering::SeqCst) {
            let slice = SAMPLER_SLICE.min(total - slept);
            std::thread::sleep(slice);
            slept += slice;
        }
    }

    // ── Manual control ───────────────────────────────────────

    /// Simulate a brown-out: feed `low - 0.5` V.  Only valid from `NORMAL`.
    pub fn trigger_test(&self) -> Result<ProtectionState> {
        let now = self.clock.now_ms();
        let levels = self.read_levels();
        let (state, out) = {
            let mut m = self.lock();
            if !m.initialized || m.fsm.current_state() != StateId::Normal {
                return Err(Error::InvalidState);
            }
            let synthetic = m.ctx.config.low_threshold - 0.5;
            warn!("Power: test trigger with synthetic {:.2} V", synthetic);
            m.ctx.devices = levels;
            let out = step(&mut m, synthetic, now);
            (m.fsm.current_state(), out)
        };
        self.apply(out);
        Ok(state)
    }

    /// Latch back to `NORMAL` and power the rails that were on before the
    /// last shutdown.
    pub fn reset(&self) -> Result<()> {
        let now = self.clock.now_ms();
        let out = {
            let mut m = self.lock();
            if !m.initialized {
                return Err(Error::InvalidState);
            }
            warn!("Power: manual reset from {}", m.fsm.current_state().as_str());
            let Machine { fsm, ctx, .. } = &mut *m;
            ctx.now_ms = now;
            ctx.restore_snapshot();
            fsm.force_transition(StateId::Normal, ctx);
            take_outputs(ctx)
        };
        self.apply(out);
        Ok(())
    }

    // ── Configuration ────────────────────────────────────────

    pub fn config(&self) -> ProtectionConfig {
        self.lock().ctx.config.clone()
    }

    pub fn set_thresholds(&self, low: f32, recovery: f32) -> Result<()> {
        self.configure(Some(low), Some(recovery), None, None)
    }

    pub fn set_shutdown_delay(&self, secs: u32) -> Result<()> {
        self.configure(None, None, Some(secs), None)
    }

    pub fn set_recovery_hold(&self, secs: u32) -> Result<()> {
        self.configure(None, None, None, Some(secs))
    }

    pub fn set_auto_recovery(&self, enabled: bool) -> Result<()> {
        self.update_config(|c| c.auto_recovery_enabled = enabled)
    }

    /// Apply several changes at once; nothing changes unless all are valid.
    pub fn configure(
        &self,
        low: Option<f32>,
        recovery: Option<f32>,
        shutdown_delay_s: Option<u32>,
        recovery_hold_s: Option<u32>,
    ) -> Result<()> {
        self.update_config(|c| {
            if let Some(v) = low {
                c.low_threshold = v;
            }
            if let Some(v) = recovery {
                c.recovery_threshold = v;
            }
            if let Some(v) = shutdown_delay_s {
                c.shutdown_delay_s = v;
            }
            if let Some(v) = recovery_hold_s {
                c.recovery_hold_s = v;
            }
        })
    }

    fn update_config(&self, edit: impl FnOnce(&mut ProtectionConfig)) -> Result<()> {
        let cfg = {
            let mut m = self.lock();
            let mut cfg = m.ctx.config.clone();
            edit(&mut cfg);
            cfg.validate()?;
            m.ctx.config = cfg.clone();
            cfg
        };
        info!(
            "Power: config low {:.2} V, recovery {:.2} V, delay {}s, hold {}s",
            cfg.low_threshold, cfg.recovery_threshold, cfg.shutdown_delay_s, cfg.recovery_hold_s
        );
        if let Some(store) = &self.store {
            if let Err(e) = store.save_typed(ConfigModule::Power, &cfg) {
                warn!("Power: config not persisted: {}", e);
            }
        }
        Ok(())
    }

    /// Enable per-sample debug events for `duration_s` (default 60 s).
    /// Returns the deadline, `None` when disabling.
    pub fn set_debug(&self, enable: bool, duration_s: Option<u32>) -> Result<Option<u64>> {
        let mut m = self.lock();
        if !enable {
            m.debug_until_ms = None;
            info!("Power: debug mode off");
            return Ok(None);
        }
        let secs = duration_s.unwrap_or(config::DEFAULT_DEBUG_DURATION_S);
        if secs == 0 || secs > config::MAX_DEBUG_DURATION_S {
            return Err(Error::InvalidArg);
        }
        let until = self.clock.now_ms() + u64::from(secs) * 1000;
        m.debug_until_ms = Some(until);
        info!("Power: debug mode on for {}s", secs);
        Ok(Some(until))
    }

    // ── Introspection ────────────────────────────────────────

    pub fn state(&self) -> ProtectionState {
        self.lock().fsm.current_state()
    }

    pub fn current_voltage(&self) -> f32 {
        self.lock().ctx.voltage
    }

    pub fn protection_count(&self) -> u32 {
        self.lock().ctx.protection_count
    }

    pub fn status_json(&self) -> Value {
        let now = self.clock.now_ms();
        let levels = self.read_levels();
        let m = self.lock();
        let c = &m.ctx;
        let mut status = json!({
            "initialized": m.initialized,
            "running": self.is_sampling(),
            "state": m.fsm.current_state().as_str(),
            "current_voltage": c.voltage,
            "low_threshold": c.config.low_threshold,
            "recovery_threshold": c.config.recovery_threshold,
            "shutdown_delay_s": c.config.shutdown_delay_s,
            "recovery_hold_s": c.config.recovery_hold_s,
            "countdown_remaining_s": c.countdown_remaining_s,
            "recovery_timer_s": c.recovery_timer_s,
            "protection_count": c.protection_count,
            "uptime_ms": now.saturating_sub(m.started_ms),
            "debug_mode": m.debug_until_ms.is_some(),
            "devices": levels.to_json(),
        });
        if let Some(snap) = &c.snapshot {
            status["snapshot"] = snap.to_json();
        }
        status
    }

    /// Compact view used by `power.status` and the dashboard.
    pub fn summary_json(&self) -> Value {
        let levels = self.read_levels();
        let m = self.lock();
        json!({
            "voltage": m.ctx.voltage,
            "state": m.fsm.current_state().as_str(),
            "protection_count": m.ctx.protection_count,
            "devices": levels.to_json(),
        })
    }

    // ── Internal ─────────────────────────────────────────────

    fn read_levels(&self) -> DeviceLevels {
        DeviceLevels {
            compute: self.devices.is_powered(Device::Compute),
            aux: self.devices.is_powered(Device::Aux),
            fan: self.devices.is_powered(Device::Fan),
        }
    }

    fn apply(&self, out: Outputs) {
        for (device, on) in out.commands {
            match self.devices.set_power(device, on) {
                Ok(()) => info!("Power: {} {}", device.as_str(), if on { "on" } else { "off" }),
                Err(e) => warn!("Power: switching {} failed: {}", device.as_str(), e),
            }
        }
        let Some(bus) = &self.bus else { return };
        for (id, data) in out.events {
            let priority = match id {
                event_id::LOW_VOLTAGE | event_id::SHUTDOWN_START | event_id::PROTECTED => {
                    Priority::High
                }
                _ => Priority::Normal,
            };
            if let Err(e) = bus.post_json(EventBase::Power, id, data, priority) {
                debug!("Power: event {} dropped ({})", id, e);
            }
        }
    }
}

fn step(m: &mut Machine, voltage: f32, now_ms: u64) -> Outputs {
    m.ctx.voltage = voltage;
    m.ctx.now_ms = now_ms;
    let Machine { fsm, ctx, .. } = &mut *m;
    fsm.step(ctx);

    if let Some(until) = m.debug_until_ms {
        if now_ms >= until {
            m.debug_until_ms = None;
            info!("Power: debug mode expired");
        } else {
            let tick = json!({
                "voltage": voltage,
                "state": m.fsm.current_state().as_str(),
                "countdown_remaining_s": m.ctx.countdown_remaining_s,
                "recovery_timer_s": m.ctx.recovery_timer_s,
            });
            m.ctx.emit(event_id::DEBUG_TICK, tick);
        }
    }
    take_outputs(&mut m.ctx)
}

fn take_outputs(ctx: &mut ProtectionContext) -> Outputs {
    Outputs {
        commands: core::mem::take(&mut ctx.device_commands),
        events: core::mem::take(&mut ctx.events),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::time::SimClock;
    use crate::app::ports::HardwareError;

    #[derive(Default)]
    struct Rails(Mutex<[bool; 3]>);

    impl Rails {
        fn idx(d: Device) -> usize {
            match d {
                Device::Compute => 0,
                Device::Aux => 1,
                Device::Fan => 2,
            }
        }
    }

    impl DevicePowerPort for Rails {
        fn set_power(&self, device: Device, on: bool) -> core::result::Result<(), HardwareError> {
            self.0.lock().unwrap()[Self::idx(device)] = on;
            Ok(())
        }

        fn is_powered(&self, device: Device) -> bool {
            self.0.lock().unwrap()[Self::idx(device)]
        }
    }

    fn rig(low: f32) -> (Arc<Rails>, Arc<SimClock>, Arc<EventBus>, VoltageProtection) {
        let rails = Arc::new(Rails(Mutex::new([true, true, true])));
        let clock = Arc::new(SimClock::new());
        let bus = Arc::new(EventBus::new());
        let vp = VoltageProtection::new(rails.clone(), clock.clone()).with_bus(Arc::clone(&bus));
        vp.init_with(ProtectionConfig {
            low_threshold: low,
            ..ProtectionConfig::default()
        })
        .unwrap();
        (rails, clock, bus, vp)
    }

    #[test]
    fn countdown_shutdown_and_recovery() {
        let (rails, clock, bus, vp) = rig(12.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.register(EventBase::Power, None, move |e| s.lock().unwrap().push(e.id));

        vp.process_sample(19.0, clock.now_ms()).unwrap();
        assert_eq!(vp.process_sample(11.0, clock.now_ms()).unwrap(), ProtectionState::LowVoltage);
        assert_eq!(vp.status_json()["countdown_remaining_s"], 60);

        let mut state = ProtectionState::LowVoltage;
        for _ in 0..61 {
            clock.advance_ms(1000);
            state = vp.process_sample(11.0, clock.now_ms()).unwrap();
            bus.drain();
        }
        assert_eq!(state, ProtectionState::Protected);
        assert_eq!(vp.protection_count(), 1);
        assert!(!rails.is_powered(Device::Compute));
        assert!(!rails.is_powered(Device::Aux));
        assert!(vp.status_json().get("snapshot").is_some());

        for _ in 0..=5 {
            clock.advance_ms(1000);
            state = vp.process_sample(19.0, clock.now_ms()).unwrap();
        }
        bus.drain();
        assert_eq!(state, ProtectionState::Normal);
        assert!(rails.is_powered(Device::Compute));
        assert!(rails.is_powered(Device::Aux));

        let ids = seen.lock().unwrap().clone();
        for id in [
            event_id::LOW_VOLTAGE,
            event_id::SHUTDOWN_START,
            event_id::PROTECTED,
            event_id::RECOVERY_START,
            event_id::RECOVERY_COMPLETE,
        ] {
            assert!(ids.contains(&id), "missing event {id}");
        }
    }

    #[test]
    fn implausible_samples_are_ignored() {
        let (_, clock, _, vp) = rig(12.0);
        assert_eq!(vp.process_sample(4.9, clock.now_ms()).unwrap(), ProtectionState::Normal);
        assert_eq!(vp.process_sample(f32::NAN, clock.now_ms()).unwrap(), ProtectionState::Normal);
        assert_eq!(vp.current_voltage(), 0.0);
    }

    #[test]
    fn test_trigger_only_from_normal() {
        let (_, clock, _, vp) = rig(12.6);
        assert_eq!(vp.trigger_test().unwrap(), ProtectionState::LowVoltage);
        assert!((vp.current_voltage() - 12.1).abs() < 1e-4);
        assert_eq!(vp.trigger_test(), Err(Error::InvalidState));
        clock.advance_ms(1000);
        vp.reset().unwrap();
        assert_eq!(vp.state(), ProtectionState::Normal);
    }

    #[test]
    fn reset_restores_rails() {
        let (rails, _, _, vp) = rig(12.0);
        vp.set_shutdown_delay(5).unwrap();
        vp.process_sample(11.0, 0).unwrap();
        vp.process_sample(11.0, 5000).unwrap();
        assert_eq!(vp.state(), ProtectionState::Protected);
        assert!(!rails.is_powered(Device::Compute));
        vp.reset().unwrap();
        assert_eq!(vp.state(), ProtectionState::Normal);
        assert!(rails.is_powered(Device::Compute));
    }

    #[test]
    fn config_bounds() {
        let (_, _, _, vp) = rig(12.0);
        assert_eq!(vp.set_thresholds(18.0, 12.0), Err(Error::InvalidArg));
        assert_eq!(vp.set_shutdown_delay(4), Err(Error::InvalidArg));
        assert_eq!(vp.set_shutdown_delay(301), Err(Error::InvalidArg));
        assert_eq!(vp.set_recovery_hold(0), Err(Error::InvalidArg));
        assert!(vp.set_recovery_hold(300).is_ok());
        assert_eq!(
            vp.configure(Some(11.0), None, Some(1), None),
            Err(Error::InvalidArg)
        );
        assert_eq!(vp.config().low_threshold, 12.0);
    }

    #[test]
    fn debug_mode_expires() {
        let (_, clock, bus, vp) = rig(12.0);
        let ticks = Arc::new(Mutex::new(0));
        let t = Arc::clone(&ticks);
        bus.register(EventBase::Power, Some(event_id::DEBUG_TICK), move |_| {
            *t.lock().unwrap() += 1;
        });
        assert_eq!(vp.set_debug(true, Some(0)), Err(Error::InvalidArg));
        let until = vp.set_debug(true, Some(2)).unwrap();
        assert_eq!(until, Some(2000));
        for _ in 0..4 {
            vp.process_sample(24.0, clock.now_ms()).unwrap();
            clock.advance_ms(1000);
        }
        bus.drain();
        assert_eq!(*ticks.lock().unwrap(), 2);
        assert_eq!(vp.status_json()["debug_mode"], false);
    }

    #[test]
    fn double_init_rejected() {
        let (_, _, _, vp) = rig(12.0);
        assert_eq!(vp.init_with(ProtectionConfig::default()), Err(Error::InvalidState));
        vp.deinit();
        assert!(!vp.is_initialized());
        assert_eq!(vp.process_sample(20.0, 0), Err(Error::InvalidState));
    }
}
