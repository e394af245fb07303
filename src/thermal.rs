//! Effective temperature arbitration across several providers.
//!
//! ```text
//!   manual mode ──▶ MANUAL
//!        │ no
//!   preferred valid? ──▶ preferred
//!        │ no
//!   VARIABLE ▶ COMPUTE ▶ SENSOR ▶ DEFAULT (25.0 °C, always valid)
//! ```
//!
//! A provider is valid while it is registered, active and fresh
//! (updated within [`DATA_TIMEOUT_MS`]).  The variable provider reads an
//! automation variable through a late-bound reader instead of being pushed.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::app::ports::Clock;
use crate::config::{ConfigModule, ConfigStore};
use crate::error::{Error, Result, relock};
use crate::events::{EventBase, EventBus, Priority};

pub const DATA_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TEMP_C: f32 = 25.0;
pub const MIN_VALID_C: f32 = -40.0;
pub const MAX_VALID_C: f32 = 125.0;

/// Event ids on [`EventBase::Temp`].
pub mod event_id {
    pub const UPDATED: u16 = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempSource {
    Default,
    Sensor,
    Compute,
    Variable,
    Manual,
}

impl TempSource {
    pub const ALL: [Self; 5] = [
        Self::Default,
        Self::Sensor,
        Self::Compute,
        Self::Variable,
        Self::Manual,
    ];

    /// Automatic fallback order, best first.
    const PRIORITY: [Self; 3] = [Self::Variable, Self::Compute, Self::Sensor];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Sensor => "sensor",
            Self::Compute => "compute",
            Self::Variable => "variable",
            Self::Manual => "manual",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    const fn idx(self) -> usize {
        self as usize
    }
}

pub fn in_range(temp_c: f32) -> bool {
    temp_c.is_finite() && (MIN_VALID_C..=MAX_VALID_C).contains(&temp_c)
}

/// Persisted selection preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempConfig {
    pub preferred: Option<TempSource>,
    pub bound_variable: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub source: TempSource,
    pub temperature_c: f32,
    pub valid: bool,
    pub timestamp_ms: u64,
}

/// Resolves an automation variable to a number.
pub type VariableReader = Arc<dyn Fn(&str) -> Option<f64> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
struct Provider {
    registered: bool,
    active: bool,
    value_c: f32,
    last_update_ms: u64,
    update_count: u32,
}

struct Inner {
    initialized: bool,
    providers: [Provider; 5],
    manual_mode: bool,
    config: TempConfig,
    current: (TempSource, f32),
}

impl Inner {
    fn new() -> Self {
        Self {
            initialized: false,
            providers: [Provider::default(); 5],
            manual_mode: false,
            config: TempConfig::default(),
            current: (TempSource::Default, DEFAULT_TEMP_C),
        }
    }

    fn is_valid(&self, src: TempSource, now_ms: u64, variable: Option<f32>) -> bool {
        match src {
            TempSource::Default => true,
            TempSource::Variable => variable.is_some(),
            _ => {
                let p = &self.providers[src.idx()];
                p.registered
                    && p.active
                    && now_ms.saturating_sub(p.last_update_ms) < DATA_TIMEOUT_MS
            }
        }
    }

    fn value_of(&self, src: TempSource, variable: Option<f32>) -> f32 {
        match src {
            TempSource::Default => DEFAULT_TEMP_C,
            TempSource::Variable => variable.unwrap_or(DEFAULT_TEMP_C),
            _ => self.providers[src.idx()].value_c,
        }
    }

    fn select(&self, now_ms: u64, variable: Option<f32>) -> (TempSource, f32) {
        if self.manual_mode && self.providers[TempSource::Manual.idx()].registered {
            return (TempSource::Manual, self.providers[TempSource::Manual.idx()].value_c);
        }
        if let Some(pref) = self.config.preferred {
            if self.is_valid(pref, now_ms, variable) {
                return (pref, self.value_of(pref, variable));
            }
        }
        TempSource::PRIORITY
            .into_iter()
            .find(|s| self.is_valid(*s, now_ms, variable))
            .map_or((TempSource::Default, DEFAULT_TEMP_C), |s| {
                (s, self.value_of(s, variable))
            })
    }
}

pub struct TemperatureManager {
    inner: Mutex<Inner>,
    reader: Mutex<Option<VariableReader>>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<ConfigStore>>,
    bus: Option<Arc<EventBus>>,
}

impl TemperatureManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            reader: Mutex::new(None),
            clock,
            store: None,
            bus: None,
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

    fn lock(&self) -> MutexGuard<'_, Inner> {
        relock(self.inner.lock())
    }

    pub fn init(&self) -> Result<()> {
        let cfg = self
            .store
            .as_ref()
            .map(|s| s.load_typed::<TempConfig>(ConfigModule::Temp).0)
            .unwrap_or_default();
        let mut g = self.lock();
        if g.initialized {
            return Err(Error::InvalidState);
        }
        *g = Inner::new();
        let d = &mut g.providers[TempSource::Default.idx()];
        d.registered = true;
        d.active = true;
        d.value_c = DEFAULT_TEMP_C;
        if cfg.preferred == Some(TempSource::Manual) {
            warn!("Temp: stored preference 'manual' ignored");
        } else {
            g.config = cfg;
        }
        g.initialized = true;
        info!(
            "Temp: init (preferred {})",
            g.config.preferred.map_or("auto", TempSource::as_str)
        );
        Ok(())
    }

    pub fn deinit(&self) {
        *self.lock() = Inner::new();
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Late-bind the automation variable lookup.
    pub fn set_variable_reader(&self, reader: VariableReader) {
        *relock(self.reader.lock()) = Some(reader);
    }

    // ── Providers ────────────────────────────────────────────

    pub fn register_provider(&self, src: TempSource) -> Result<()> {
        let mut g = self.lock();
        if !g.initialized {
            return Err(Error::InvalidState);
        }
        if matches!(src, TempSource::Default | TempSource::Variable) {
            return Err(Error::InvalidArg);
        }
        let p = &mut g.providers[src.idx()];
        p.registered = true;
        p.active = true;
        info!("Temp: provider {} registered", src.as_str());
        Ok(())
    }

    pub fn unregister_provider(&self, src: TempSource) -> Result<()> {
        {
            let mut g = self.lock();
            if src == TempSource::Default {
                return Err(Error::InvalidArg);
            }
            if !g.providers[src.idx()].registered {
                return Err(Error::NotFound);
            }
            g.providers[src.idx()] = Provider::default();
        }
        self.evaluate();
        Ok(())
    }

    /// Push a reading from a registered provider.
    pub fn update(&self, src: TempSource, temp_c: f32) -> Result<()> {
        if !in_range(temp_c) {
            warn!("Temp: rejecting {:.1} °C from {}", temp_c, src.as_str());
            return Err(Error::InvalidArg);
        }
        let now = self.clock.now_ms();
        {
            let mut g = self.lock();
            if !g.initialized {
                return Err(Error::InvalidState);
            }
            let p = &mut g.providers[src.idx()];
            if !p.registered || matches!(src, TempSource::Default | TempSource::Variable) {
                return Err(Error::InvalidState);
            }
            p.value_c = temp_c;
            p.last_update_ms = now;
            p.update_count = p.update_count.saturating_add(1);
            p.active = true;
        }
        self.evaluate();
        Ok(())
    }

    // ── Manual mode and preference ───────────────────────────

    /// Pin the temperature and switch to manual mode.
    pub fn set_manual(&self, temp_c: f32) -> Result<Reading> {
        if !in_range(temp_c) {
            return Err(Error::InvalidArg);
        }
        let now = self.clock.now_ms();
        {
            let mut g = self.lock();
            if !g.initialized {
                return Err(Error::InvalidState);
            }
            g.manual_mode = true;
            let p = &mut g.providers[TempSource::Manual.idx()];
            p.registered = true;
            p.active = true;
            p.value_c = temp_c;
            p.last_update_ms = now;
            p.update_count = p.update_count.saturating_add(1);
        }
        info!("Temp: manual {:.1} °C", temp_c);
        Ok(self.evaluate())
    }

    pub fn set_manual_mode(&self, enable: bool) -> Result<Reading> {
        let now = self.clock.now_ms();
        {
            let mut g = self.lock();
            if !g.initialized {
                return Err(Error::InvalidState);
            }
            g.manual_mode = enable;
            let p = &mut g.providers[TempSource::Manual.idx()];
            if enable && !p.registered {
                p.registered = true;
                p.active = true;
                p.value_c = DEFAULT_TEMP_C;
                p.last_update_ms = now;
            }
        }
        info!("Temp: manual mode {}", if enable { "on" } else { "off" });
        Ok(self.evaluate())
    }

    /// `None` restores automatic selection.  Leaves manual mode.
    pub fn set_preferred(&self, src: Option<TempSource>) -> Result<Reading> {
        if src == Some(TempSource::Manual) {
            return Err(Error::InvalidArg);
        }
        let cfg = {
            let mut g = self.lock();
            if !g.initialized {
                return Err(Error::InvalidState);
            }
            g.config.preferred = src;
            g.manual_mode = false;
            g.config.clone()
        };
        info!("Temp: preferred {}", src.map_or("auto", TempSource::as_str));
        self.persist(&cfg);
        Ok(self.evaluate())
    }

    /// Bind the variable provider to an automation variable, or unbind.
    pub fn bind_variable(&self, name: Option<&str>) -> Result<()> {
        let cfg = {
            let mut g = self.lock();
            if !g.initialized {
                return Err(Error::InvalidState);
            }
            g.config.bound_variable = name.map(str::to_owned);
            g.config.clone()
        };
        self.persist(&cfg);
        self.evaluate();
        Ok(())
    }

    fn persist(&self, cfg: &TempConfig) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_typed(ConfigModule::Temp, cfg) {
                warn!("Temp: preference not persisted: {}", e);
            }
        }
    }

    // ── Consumer side ────────────────────────────────────────

    pub fn manual_mode(&self) -> bool {
        self.lock().manual_mode
    }

    pub fn preferred(&self) -> Option<TempSource> {
        self.lock().config.preferred
    }

    pub fn active_source(&self) -> TempSource {
        self.evaluate().source
    }

    /// Re-run selection and return the effective reading.
    pub fn effective(&self) -> Reading {
        self.evaluate()
    }

    fn read_variable(&self) -> Option<f32> {
        let name = self.lock().config.bound_variable.clone()?;
        let reader = relock(self.reader.lock()).clone()?;
        let v = reader(&name)? as f32;
        if in_range(v) {
            Some(v)
        } else {
            debug!("Temp: variable '{}' out of range ({:.1})", name, v);
            None
        }
    }

    fn evaluate(&self) -> Reading {
        let variable = self.read_variable();
        let now = self.clock.now_ms();
        let (reading, changed) = {
            let mut g = self.lock();
            if !g.initialized {
                return Reading {
                    source: TempSource::Default,
                    temperature_c: DEFAULT_TEMP_C,
                    valid: false,
                    timestamp_ms: 0,
                };
            }
            let (source, temp) = g.select(now, variable);
            let prev = g.current;
            g.current = (source, temp);
            let timestamp_ms = match source {
                TempSource::Variable => now,
                _ => g.providers[source.idx()].last_update_ms,
            };
            let reading = Reading {
                source,
                temperature_c: temp,
                valid: true,
                timestamp_ms,
            };
            let changed = (prev.0 != source || prev.1 != temp).then_some(prev);
            (reading, changed)
        };

        if let Some((prev_source, prev_temp)) = changed {
            debug!(
                "Temp: {:.1} °C ({}) -> {:.1} °C ({})",
                prev_temp,
                prev_source.as_str(),
                reading.temperature_c,
                reading.source.as_str()
            );
            if let Some(bus) = &self.bus {
                let payload = json!({
                    "temperature_c": reading.temperature_c,
                    "source": reading.source.as_str(),
                    "prev_temperature_c": prev_temp,
                    "prev_source": prev_source.as_str(),
                });
                if bus
                    .post_json(EventBase::Temp, event_id::UPDATED, payload, Priority::Normal)
                    .is_err()
                {
                    debug!("Temp: update event dropped");
                }
            }
        }
        reading
    }

    pub fn status_json(&self) -> Value {
        let r = self.evaluate();
        let g = self.lock();
        json!({
            "initialized": g.initialized,
            "manual_mode": g.manual_mode,
            "preferred": g.config.preferred.map_or("auto", TempSource::as_str),
            "bound_variable": g.config.bound_variable,
            "active_source": r.source.as_str(),
            "temperature_c": r.temperature_c,
            "valid": r.valid && g.initialized,
            "timestamp_ms": r.timestamp_ms,
        })
    }

    pub fn providers_json(&self) -> Value {
        let variable = self.read_variable();
        let now = self.clock.now_ms();
        let g = self.lock();
        let mut list: Vec<Value> = TempSource::ALL
            .into_iter()
            .filter(|s| *s != TempSource::Variable && g.providers[s.idx()].registered)
            .map(|s| {
                let p = &g.providers[s.idx()];
                json!({
                    "name": s.as_str(),
                    "active": p.active,
                    "valid": g.is_valid(s, now, variable),
                    "last_value_c": p.value_c,
                    "last_update_ms": p.last_update_ms,
                    "update_count": p.update_count,
                })
            })
            .collect();
        if let Some(name) = &g.config.bound_variable {
            list.push(json!({
                "name": TempSource::Variable.as_str(),
                "variable": name,
                "active": true,
                "valid": variable.is_some(),
                "last_value_c": variable,
                "last_update_ms": now,
                "update_count": 0,
            }));
        }
        let count = list.len();
        json!({"providers": list, "count": count})
    }
}
