//! TianShan firmware: main entry point.
//!
//! Builds the ESP-IDF adapters, hands them to the supervisor runtime and
//! parks.  Everything after bring-up runs on the service threads.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  NvsAdapter   SdCard      MonotonicClock   EspSystem           │
//! │  (BlobStore)  (FileStore) (Clock)          (SystemPort)        │
//! │  WifiAdapter  RailSwitches  AdcVoltageSensor  LogFrameSink     │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  ServiceManager · OperationRegistry · ConfigStore      │    │
//! │  │  EventBus · Automation · VoltageProtection · Temp · WS │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::gpio::PinDriver;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::wifi::EspWifi;
use log::{error, info, warn};

use tianshan::adapters::device_power::RailSwitches;
use tianshan::adapters::log_sink::LogFrameSink;
use tianshan::adapters::nvs::NvsAdapter;
use tianshan::adapters::sdcard::SdCard;
use tianshan::adapters::system::EspSystem;
use tianshan::adapters::time::MonotonicClock;
use tianshan::adapters::voltage::AdcVoltageSensor;
use tianshan::adapters::wifi::WifiAdapter;
use tianshan::config::DEFAULT_CONFIG_DIR;
use tianshan::runtime::{self, Platform};

const SD_MOUNT_POINT: &str = "/sdcard";

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  TianShan v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;

    // ── 2. Storage ────────────────────────────────────────────
    // NVS failure is fatal: without a blob store there is no key and no
    // fallback copy of any module.
    let blobs = NvsAdapter::new().map_err(|e| anyhow::anyhow!("NVS init failed: {}", e))?;
    let files = SdCard::new(SD_MOUNT_POINT);
    if !tianshan::app::ports::FileStore::is_available(&files) {
        warn!("SD card not mounted; configuration falls back to NVS only");
    }

    // ── 3. Power rails and supply sense ───────────────────────
    let rails = RailSwitches::new(
        PinDriver::output(peripherals.pins.gpio38.downgrade_output())?,
        PinDriver::output(peripherals.pins.gpio39.downgrade_output())?,
        PinDriver::output(peripherals.pins.gpio40.downgrade_output())?,
        true,
    )
    .map_err(|e| anyhow::anyhow!("rail GPIO init failed: {}", e))?;
    let vsense = AdcVoltageSensor::new().map_err(|e| anyhow::anyhow!("ADC init failed: {}", e))?;

    // ── 4. Radio ──────────────────────────────────────────────
    let wifi = WifiAdapter::new(EspWifi::new(peripherals.modem, sysloop, None)?)?;

    // ── 5. Supervisor ─────────────────────────────────────────
    let platform = Platform {
        clock: Arc::new(MonotonicClock::new()),
        files: Arc::new(files),
        blobs: Arc::new(blobs),
        system: Arc::new(EspSystem::new()),
        network: Arc::new(wifi),
        devices: Arc::new(rails),
        voltage: Box::new(vsense),
        sink: Arc::new(LogFrameSink::new()),
        config_dir: DEFAULT_CONFIG_DIR.into(),
    };
    let rt = runtime::init(platform).map_err(|e| anyhow::anyhow!("runtime init failed: {}", e))?;

    let stats = rt.services.stats();
    info!(
        "System ready: {}/{} services running in {} ms",
        stats.running, stats.total, stats.startup_time_ms
    );

    // ── 6. Park; report unhealthy services once a minute ─────
    loop {
        std::thread::sleep(Duration::from_secs(60));
        for name in rt.services.health_check_all() {
            error!("Health: service '{}' unhealthy", name);
        }
    }
}
