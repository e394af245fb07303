//! Supervisor composition root.
//!
//! Wires the platform adapters into the core subsystems and registers each
//! subsystem with the [`ServiceManager`] so bring-up and teardown follow the
//! phase order.
//!
//! ```text
//!  CORE      event_bus ─▶ config
//!  HAL       power_protection            (volt-mon thread)
//!  NETWORK   network
//!  SERVICE   api ─▶ temperature ─▶ automation
//!  UI        subscriptions ─▶ ctl_loop   (ctl thread: automation + ws timers + wifi poll)
//! ```
//!
//! One process-wide instance lives behind [`init`] / [`get`] / [`deinit`];
//! tests may also hold a private [`Runtime`] from [`Runtime::build`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::api::OperationRegistry;
use crate::app::ports::{
    BlobStore, Clock, DevicePowerPort, FileStore, FrameSink, HardwareError, NetworkPort, SystemPort,
    VoltageSensor,
};
use crate::automation::{AutomationEngine, EngineState};
use crate::config::ConfigStore;
use crate::error::{Error, Result, relock};
use crate::events::EventBus;
use crate::ops::{self, OpsContext};
use crate::power::VoltageProtection;
use crate::service::{Capabilities, Phase, ServiceDescriptor, ServiceManager};
use crate::task::{self, Core};
use crate::thermal::{TempSource, TemperatureManager};
use crate::ws::SubscriptionManager;

const NETWORK_POLL_TICKS: u32 = 10;
const CTL_TICK: Duration = Duration::from_millis(100);

/// Adapters the supervisor runs on.
pub struct Platform {
    pub clock: Arc<dyn Clock>,
    pub files: Arc<dyn FileStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub system: Arc<dyn SystemPort>,
    pub network: Arc<dyn NetworkPort>,
    pub devices: Arc<dyn DevicePowerPort>,
    pub voltage: Box<dyn VoltageSensor>,
    pub sink: Arc<dyn FrameSink>,
    pub config_dir: String,
}

/// Voltage sensor shared between sampler restarts.
#[derive(Clone)]
struct SharedSensor(Arc<Mutex<Box<dyn VoltageSensor>>>);

impl VoltageSensor for SharedSensor {
    fn read_voltage(&mut self) -> core::result::Result<f32, HardwareError> {
        relock(self.0.lock()).read_voltage()
    }
}

pub struct Runtime {
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<EventBus>,
    pub services: Arc<ServiceManager>,
    pub registry: Arc<OperationRegistry>,
    pub config: Arc<ConfigStore>,
    pub power: Arc<VoltageProtection>,
    pub temp: Arc<TemperatureManager>,
    pub automation: Arc<AutomationEngine>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub system: Arc<dyn SystemPort>,
    pub network: Arc<dyn NetworkPort>,
}

impl Runtime {
    /// Construct every subsystem and register its service.  Nothing starts
    /// until [`start`](Self::start).
    pub fn build(platform: Platform) -> Result<Arc<Self>> {
        let Platform {
            clock,
            files,
            blobs,
            system,
            network,
            devices,
            voltage,
            sink,
            config_dir,
        } = platform;

        let bus = Arc::new(EventBus::new());
        let services = Arc::new(ServiceManager::new(Arc::clone(&clock), Some(Arc::clone(&bus))));
        let registry = Arc::new(OperationRegistry::new());
        let config = Arc::new(
            ConfigStore::open(files, blobs)
                .with_dir(config_dir)
                .with_bus(Arc::clone(&bus)),
        );
        let power = Arc::new(
            VoltageProtection::new(devices, Arc::clone(&clock))
                .with_store(Arc::clone(&config))
                .with_bus(Arc::clone(&bus)),
        );
        let temp = Arc::new(
            TemperatureManager::new(Arc::clone(&clock))
                .with_store(Arc::clone(&config))
                .with_bus(Arc::clone(&bus)),
        );
        let automation = Arc::new(
            AutomationEngine::new(Arc::clone(&registry), Arc::clone(&clock))
                .with_store(Arc::clone(&config))
                .with_bus(Arc::clone(&bus)),
        );
        let subscriptions = SubscriptionManager::new(
            Arc::clone(&registry),
            sink,
            Arc::clone(&clock),
            Some(Arc::clone(&bus)),
        );

        let rt = Arc::new(Self {
            clock,
            bus,
            services,
            registry,
            config,
            power,
            temp,
            automation,
            subscriptions,
            system,
            network,
        });
        rt.register_services(SharedSensor(Arc::new(Mutex::new(voltage))))?;
        Ok(rt)
    }

    pub fn start(&self) -> Result<()> {
        self.services.start_all()
    }

    pub fn stop(&self) -> Result<()> {
        self.services.stop_all()
    }

    /// Operation handlers' view of the runtime.
    pub fn ops_context(&self) -> OpsContext {
        OpsContext {
            system: Arc::clone(&self.system),
            network: Arc::clone(&self.network),
            power: Arc::clone(&self.power),
            temp: Arc::clone(&self.temp),
            config: Arc::clone(&self.config),
            services: Arc::clone(&self.services),
            automation: Arc::clone(&self.automation),
        }
    }

    fn register_services(&self, sensor: SharedSensor) -> Result<()> {
        let sm = &self.services;

        // ── CORE ─────────────────────────────────────────────
        let bus = Arc::clone(&self.bus);
        let bus_stop = Arc::clone(&self.bus);
        let bus_health = Arc::clone(&self.bus);
        sm.register(
            ServiceDescriptor::new("event_bus", Phase::Core, move || {
                if bus.is_worker_running() {
                    return Ok(());
                }
                bus.start_worker()
            })
            .on_stop(move || bus_stop.stop_worker())
            .on_health(move || bus_health.is_worker_running())
            .capabilities(Capabilities::STOPPABLE | Capabilities::HEALTHCHECKABLE)
            .with_api(Arc::clone(&self.bus) as _),
        )?;

        let cfg = Arc::clone(&self.config);
        sm.register(
            ServiceDescriptor::new("config", Phase::Core, move || {
                let synced = cfg.sync_pending();
                if synced > 0 {
                    info!("Runtime: reconciled {} config module(s)", synced);
                }
                Ok(())
            })
            .depends_on("event_bus")
            .capabilities(Capabilities::RESTARTABLE)
            .with_api(Arc::clone(&self.config) as _),
        )?;

        // ── HAL ──────────────────────────────────────────────
        let vp_init = Arc::clone(&self.power);
        let vp = Arc::clone(&self.power);
        let vp_stop = Arc::clone(&self.power);
        let vp_health = Arc::clone(&self.power);
        sm.register(
            ServiceDescriptor::new("power_protection", Phase::Hal, move || {
                vp.start_sampler(Box::new(sensor.clone()))
            })
            .on_init(move || {
                if vp_init.is_initialized() {
                    return Ok(());
                }
                vp_init.init()
            })
            .on_stop(move || {
                vp_stop.stop_sampler();
                Ok(())
            })
            .on_health(move || vp_health.is_sampling())
            .depends_on("config")
            .capabilities(
                Capabilities::RESTARTABLE | Capabilities::STOPPABLE | Capabilities::HEALTHCHECKABLE,
            )
            .with_api(Arc::clone(&self.power) as _),
        )?;

        // ── NETWORK ──────────────────────────────────────────
        let net = Arc::clone(&self.network);
        sm.register(
            ServiceDescriptor::new("network", Phase::Network, move || {
                let s = net.status();
                info!("Runtime: network {}", s.state);
                Ok(())
            })
            .capabilities(Capabilities::RESTARTABLE),
        )?;

        // ── SERVICE ──────────────────────────────────────────
        let registry = Arc::clone(&self.registry);
        let registry_stop = Arc::clone(&self.registry);
        let ctx = self.ops_context();
        sm.register(
            ServiceDescriptor::new("api", Phase::Service, move || {
                if registry.count() > 0 {
                    return Ok(());
                }
                ops::register_all(&registry, &ctx)
            })
            .on_stop(move || {
                // Handlers hold the subsystems; dropping them breaks the
                // engine ↔ registry reference cycle.
                registry_stop.clear();
                Ok(())
            })
            .depends_on("config")
            .capabilities(Capabilities::RESTARTABLE | Capabilities::STOPPABLE)
            .with_api(Arc::clone(&self.registry) as _),
        )?;

        let temp = Arc::clone(&self.temp);
        let engine: Weak<AutomationEngine> = Arc::downgrade(&self.automation);
        sm.register(
            ServiceDescriptor::new("temperature", Phase::Service, move || {
                if !temp.is_initialized() {
                    temp.init()?;
                    if let Err(e) = temp.register_provider(TempSource::Sensor) {
                        warn!("Runtime: sensor provider not registered: {}", e);
                    }
                }
                let engine = engine.clone();
                temp.set_variable_reader(Arc::new(move |name: &str| {
                    engine
                        .upgrade()
                        .and_then(|e| e.get_variable(name))
                        .and_then(|v| v.value.as_f64())
                }));
                Ok(())
            })
            .depends_on("config")
            .capabilities(Capabilities::RESTARTABLE)
            .with_api(Arc::clone(&self.temp) as _),
        )?;

        let auto_init = Arc::clone(&self.automation);
        let auto = Arc::clone(&self.automation);
        let auto_stop = Arc::clone(&self.automation);
        sm.register(
            ServiceDescriptor::new("automation", Phase::Service, move || auto.start())
                .on_init(move || {
                    if auto_init.state() != EngineState::Uninitialized {
                        return Ok(());
                    }
                    auto_init.init()
                })
                .on_stop(move || match auto_stop.stop() {
                    Ok(()) | Err(Error::InvalidState) => Ok(()),
                    Err(e) => Err(e),
                })
                .depends_on("api")
                .depends_on("temperature")
                .capabilities(Capabilities::RESTARTABLE | Capabilities::STOPPABLE)
                .with_api(Arc::clone(&self.automation) as _),
        )?;

        // ── UI ───────────────────────────────────────────────
        let subs = Arc::clone(&self.subscriptions);
        sm.register(
            ServiceDescriptor::new("subscriptions", Phase::Ui, || Ok(()))
                .on_stop(move || {
                    subs.clear();
                    Ok(())
                })
                .depends_on("api")
                .capabilities(Capabilities::STOPPABLE)
                .with_api(Arc::clone(&self.subscriptions) as _),
        )?;

        let ctl = Arc::new(CtlLoop {
            automation: Arc::clone(&self.automation),
            subscriptions: Arc::clone(&self.subscriptions),
            network: Arc::clone(&self.network),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        });
        let ctl_start = Arc::clone(&ctl);
        let ctl_stop = Arc::clone(&ctl);
        sm.register(
            ServiceDescriptor::new("ctl_loop", Phase::Ui, move || ctl_start.start())
                .on_stop(move || {
                    ctl_stop.stop();
                    Ok(())
                })
                .on_health(move || ctl.is_running())
                .depends_on("automation")
                .depends_on("subscriptions")
                .capabilities(
                    Capabilities::RESTARTABLE | Capabilities::STOPPABLE | Capabilities::HEALTHCHECKABLE,
                ),
        )?;

        Ok(())
    }
}

// ── Control loop thread ──────────────────────────────────────

/// One thread, one executor: the automation loop, the subscription timers
/// and the network housekeeping tick run as cooperative tasks.
struct CtlLoop {
    automation: Arc<AutomationEngine>,
    subscriptions: Arc<SubscriptionManager>,
    network: Arc<dyn NetworkPort>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CtlLoop {
    fn start(&self) -> Result<()> {
        let mut handle = relock(self.handle.lock());
        if handle.is_some() {
            return Err(Error::InvalidState);
        }
        self.stop.store(false, Ordering::SeqCst);
        let automation = Arc::clone(&self.automation);
        let subs = Arc::clone(&self.subscriptions);
        let network = Arc::clone(&self.network);
        let stop = Arc::clone(&self.stop);
        let spawned = task::spawn_on_core(Core::App, 5, 8, "ctl\0", move || {
            let executor: edge_executor::LocalExecutor<'_, 8> = edge_executor::LocalExecutor::new();
            let a = executor.spawn(async { automation.run().await });
            let w = executor.spawn(async { subs.run_timers().await });
            let n = executor.spawn(async {
                let mut ticks = 0u32;
                while !stop.load(Ordering::SeqCst) {
                    ticks += 1;
                    if ticks >= NETWORK_POLL_TICKS {
                        ticks = 0;
                        network.poll();
                    }
                    async_io_mini::Timer::after(CTL_TICK).await;
                }
            });
            futures_lite::future::block_on(executor.run(async {
                a.await;
                w.await;
                n.await;
            }));
        });
        match spawned {
            Ok(h) => {
                *handle = Some(h);
                info!("Runtime: ctl loop started");
                Ok(())
            }
            Err(e) => {
                warn!("Runtime: ctl loop spawn failed: {}", e);
                Err(Error::NoMem)
            }
        }
    }

    fn stop(&self) {
        let Some(h) = relock(self.handle.lock()).take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        self.automation.request_shutdown();
        self.subscriptions.request_shutdown();
        if h.join().is_err() {
            warn!("Runtime: ctl loop panicked");
        }
        info!("Runtime: ctl loop stopped");
    }

    fn is_running(&self) -> bool {
        relock(self.handle.lock())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

// ── Process-wide instance ────────────────────────────────────

static INSTANCE: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);

/// Build and start the process-wide runtime.  `InvalidState` if one exists.
pub fn init(platform: Platform) -> Result<Arc<Runtime>> {
    let mut slot = relock(INSTANCE.lock());
    if slot.is_some() {
        return Err(Error::InvalidState);
    }
    let rt = Runtime::build(platform)?;
    if let Err(e) = rt.start() {
        // Partial bring-up still serves whatever came up.
        warn!("Runtime: bring-up finished with errors: {}", e);
    }
    *slot = Some(Arc::clone(&rt));
    Ok(rt)
}

pub fn get() -> Option<Arc<Runtime>> {
    relock(INSTANCE.lock()).clone()
}

/// Stop every service and drop the process-wide runtime.
pub fn deinit() -> Result<()> {
    let rt = relock(INSTANCE.lock()).take().ok_or(Error::InvalidState)?;
    let res = rt.stop();
    rt.registry.clear();
    rt.automation.deinit();
    rt.temp.deinit();
    rt.power.deinit();
    info!("Runtime: deinit");
    res
}
