//! WiFi station-mode adapter.
//!
//! Implements [`NetworkPort`], the boundary behind `network.status`,
//! `wifi.scan` and `wifi.connect`.
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: `esp_idf_svc::wifi::EspWifi`, non-blocking connect.
//! - **all other targets**: in-memory simulation with a fixed scan list.
//!
//! ## Reconnection policy
//!
//! On disconnect the adapter waits an exponential backoff (2 s → 4 s →
//! 8 s … capped at 60 s) before retrying.  [`WifiAdapter::poll`] drives it.

use std::sync::{Mutex, MutexGuard};

use log::{info, warn};

use crate::app::ports::{AccessPoint, NetworkError, NetworkPort, NetworkStatus};
use crate::error::relock;

#[cfg(target_os = "espidf")]
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};

// ───────────────────────────────────────────────────────────────
// Connection state
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl WifiState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

const INITIAL_BACKOFF_SECS: u32 = 2;
const MAX_BACKOFF_SECS: u32 = 60;

// ───────────────────────────────────────────────────────────────
// Validation
// ───────────────────────────────────────────────────────────────

fn is_printable_ascii(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

pub fn validate_ssid(ssid: &str) -> Result<(), NetworkError> {
    if ssid.is_empty() || ssid.len() > 32 || !is_printable_ascii(ssid) {
        return Err(NetworkError::InvalidSsid);
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), NetworkError> {
    if password.is_empty() {
        return Ok(());
    }
    if password.len() < 8 || password.len() > 64 {
        return Err(NetworkError::InvalidPassword);
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────
// WiFi adapter
// ───────────────────────────────────────────────────────────────

struct Inner {
    state: WifiState,
    ssid: heapless::String<32>,
    password: heapless::String<64>,
    backoff_secs: u32,
    /// Seconds left before the next reconnect attempt.
    wait_secs: u32,
    #[cfg(target_os = "espidf")]
    driver: EspWifi<'static>,
    #[cfg(not(target_os = "espidf"))]
    sim: SimRadio,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
struct SimRadio {
    /// SSIDs that accept association.
    reachable: Vec<AccessPoint>,
    link_up: bool,
}

pub struct WifiAdapter {
    inner: Mutex<Inner>,
}

impl WifiAdapter {
    #[cfg(target_os = "espidf")]
    pub fn new(mut driver: EspWifi<'static>) -> anyhow::Result<Self> {
        driver.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        driver.start()?;
        info!("WiFi: station started");
        Ok(Self::with_inner(Inner {
            state: WifiState::Disconnected,
            ssid: heapless::String::new(),
            password: heapless::String::new(),
            backoff_secs: INITIAL_BACKOFF_SECS,
            wait_secs: 0,
            driver,
        }))
    }

    /// Simulated radio that can see `reachable`.
    #[cfg(not(target_os = "espidf"))]
    pub fn new_sim(reachable: Vec<AccessPoint>) -> Self {
        Self::with_inner(Inner {
            state: WifiState::Disconnected,
            ssid: heapless::String::new(),
            password: heapless::String::new(),
            backoff_secs: INITIAL_BACKOFF_SECS,
            wait_secs: 0,
            sim: SimRadio {
                reachable,
                link_up: false,
            },
        })
    }

    fn with_inner(inner: Inner) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        relock(self.inner.lock())
    }

    pub fn state(&self) -> WifiState {
        self.lock().state
    }

    /// Drop the simulated link, as if the AP went away.
    #[cfg(not(target_os = "espidf"))]
    pub fn sim_drop_link(&self) {
        self.lock().sim.link_up = false;
    }
}

// ── Platform-specific ─────────────────────────────────────────

#[cfg(target_os = "espidf")]
fn platform_connect(g: &mut Inner) -> Result<(), NetworkError> {
    let auth_method = if g.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    let cfg = ClientConfiguration {
        ssid: g.ssid.as_str().try_into().map_err(|_| NetworkError::InvalidSsid)?,
        password: g
            .password
            .as_str()
            .try_into()
            .map_err(|_| NetworkError::InvalidPassword)?,
        auth_method,
        ..Default::default()
    };
    g.driver
        .set_configuration(&Configuration::Client(cfg))
        .map_err(|_| NetworkError::ConnectionFailed)?;
    g.driver.connect().map_err(|e| {
        warn!("WiFi: connect failed: {}", e);
        NetworkError::ConnectionFailed
    })
}

#[cfg(not(target_os = "espidf"))]
fn platform_connect(g: &mut Inner) -> Result<(), NetworkError> {
    if g.sim.reachable.iter().any(|ap| ap.ssid == g.ssid.as_str()) {
        g.sim.link_up = true;
        info!("WiFi(sim): associated with '{}'", g.ssid);
        Ok(())
    } else {
        warn!("WiFi(sim): '{}' not in range", g.ssid);
        Err(NetworkError::ConnectionFailed)
    }
}

#[cfg(target_os = "espidf")]
fn platform_is_connected(g: &Inner) -> bool {
    g.driver.is_connected().unwrap_or(false)
}

#[cfg(not(target_os = "espidf"))]
fn platform_is_connected(g: &Inner) -> bool {
    g.sim.link_up
}

#[cfg(target_os = "espidf")]
fn platform_ip(g: &Inner) -> Option<String> {
    g.driver
        .sta_netif()
        .get_ip_info()
        .ok()
        .map(|info| info.ip.to_string())
}

#[cfg(not(target_os = "espidf"))]
fn platform_ip(g: &Inner) -> Option<String> {
    g.sim.link_up.then(|| "192.168.4.2".to_owned())
}

#[cfg(target_os = "espidf")]
fn platform_rssi(_g: &Inner) -> Option<i8> {
    use esp_idf_svc::sys::*;
    // SAFETY: all-zero is a valid wifi_ap_record_t; the call fills it in.
    let mut info: wifi_ap_record_t = unsafe { core::mem::zeroed() };
    let ret = unsafe { esp_wifi_sta_get_ap_info(&mut info) };
    (ret == ESP_OK).then_some(info.rssi)
}

#[cfg(not(target_os = "espidf"))]
fn platform_rssi(g: &Inner) -> Option<i8> {
    if !g.sim.link_up {
        return None;
    }
    g.sim
        .reachable
        .iter()
        .find(|ap| ap.ssid == g.ssid.as_str())
        .map(|ap| ap.rssi)
}

#[cfg(target_os = "espidf")]
fn platform_scan(g: &mut Inner) -> Result<Vec<AccessPoint>, NetworkError> {
    let found = g.driver.scan().map_err(|e| {
        warn!("WiFi: scan failed: {}", e);
        NetworkError::ScanFailed
    })?;
    Ok(found
        .into_iter()
        .map(|ap| AccessPoint {
            ssid: ap.ssid.as_str().to_owned(),
            rssi: ap.signal_strength,
            channel: ap.channel,
            auth: match ap.auth_method {
                None | Some(AuthMethod::None) => "open",
                Some(AuthMethod::WEP) => "wep",
                Some(AuthMethod::WPA) => "wpa",
                Some(AuthMethod::WPA2Personal) => "wpa2",
                Some(AuthMethod::WPA3Personal) => "wpa3",
                Some(_) => "other",
            },
        })
        .collect())
}

#[cfg(not(target_os = "espidf"))]
fn platform_scan(g: &mut Inner) -> Result<Vec<AccessPoint>, NetworkError> {
    Ok(g.sim.reachable.clone())
}

// ───────────────────────────────────────────────────────────────
// NetworkPort
// ───────────────────────────────────────────────────────────────

impl NetworkPort for WifiAdapter {
    fn status(&self) -> NetworkStatus {
        let g = self.lock();
        let connected = g.state == WifiState::Connected && platform_is_connected(&g);
        NetworkStatus {
            connected,
            state: g.state.as_str(),
            ssid: (!g.ssid.is_empty()).then(|| g.ssid.as_str().to_owned()),
            ip: if connected { platform_ip(&g) } else { None },
            rssi: if connected { platform_rssi(&g) } else { None },
        }
    }

    fn scan(&self) -> Result<Vec<AccessPoint>, NetworkError> {
        let mut g = self.lock();
        let mut aps = platform_scan(&mut g)?;
        aps.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        info!("WiFi: scan found {} networks", aps.len());
        Ok(aps)
    }

    fn connect(&self, ssid: &str, password: &str) -> Result<(), NetworkError> {
        validate_ssid(ssid)?;
        validate_password(password)?;
        let mut g = self.lock();
        g.ssid.clear();
        g.ssid.push_str(ssid).map_err(|()| NetworkError::InvalidSsid)?;
        g.password.clear();
        g.password
            .push_str(password)
            .map_err(|()| NetworkError::InvalidPassword)?;

        info!("WiFi: connecting to '{}'", g.ssid);
        g.state = WifiState::Connecting;
        match platform_connect(&mut g) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("WiFi: connection failed: {}", e);
                g.state = WifiState::Reconnecting { attempt: 0 };
                g.wait_secs = g.backoff_secs;
                Err(e)
            }
        }
    }

    /// Detect link loss and retry with backoff.
    fn poll(&self) {
        let mut g = self.lock();
        match g.state {
            WifiState::Connecting | WifiState::Connected => {
                if platform_is_connected(&g) {
                    if g.state == WifiState::Connecting {
                        info!("WiFi: associated with '{}'", g.ssid);
                    }
                    g.state = WifiState::Connected;
                    g.backoff_secs = INITIAL_BACKOFF_SECS;
                } else if g.state == WifiState::Connected {
                    warn!("WiFi: connection lost, entering reconnect");
                    g.state = WifiState::Reconnecting { attempt: 0 };
                    g.wait_secs = g.backoff_secs;
                }
            }
            WifiState::Reconnecting { attempt } => {
                if g.wait_secs > 0 {
                    g.wait_secs -= 1;
                    return;
                }
                info!("WiFi: reconnect attempt {} (backoff {}s)", attempt, g.backoff_secs);
                match platform_connect(&mut g) {
                    Ok(()) if platform_is_connected(&g) => {
                        g.state = WifiState::Connected;
                        g.backoff_secs = INITIAL_BACKOFF_SECS;
                        info!("WiFi: reconnected");
                    }
                    Ok(()) => g.state = WifiState::Connecting,
                    Err(_) => {
                        g.backoff_secs = (g.backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        g.wait_secs = g.backoff_secs;
                        g.state = WifiState::Reconnecting { attempt: attempt + 1 };
                    }
                }
            }
            WifiState::Disconnected => {}
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────
