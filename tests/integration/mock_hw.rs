//! In-memory doubles for every platform port, plus a simulated
//! [`Platform`] so whole-runtime tests run on the host.
//!
//! Every double records what it was asked to do so tests can assert on
//! the full history without touching flash, GPIO or sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tianshan::adapters::system::SimSystem;
use tianshan::adapters::time::SimClock;
use tianshan::adapters::voltage::SimVoltageSensor;
use tianshan::adapters::wifi::WifiAdapter;
use tianshan::app::ports::{
    AccessPoint, BlobStore, Device, DevicePowerPort, FileError, FileStore, FrameSink, HardwareError,
    SinkError, StorageError,
};
use tianshan::config::BLOB_MAX_SIZE;
use tianshan::runtime::Platform;

// ── Blob store ───────────────────────────────────────────────

#[derive(Default)]
pub struct MockBlobStore {
    map: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub fail_writes: AtomicBool,
    pub writes: Mutex<Vec<(String, String, usize)>>,
}

#[allow(dead_code)]
impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ns: &str, key: &str) -> Option<Vec<u8>> {
        self.map.lock().unwrap().get(&(ns.into(), key.into())).cloned()
    }

    pub fn put(&self, ns: &str, key: &str, data: &[u8]) {
        self.map.lock().unwrap().insert((ns.into(), key.into()), data.to_vec());
    }

    pub fn write_count(&self, ns: &str) -> usize {
        self.writes.lock().unwrap().iter().filter(|(n, _, _)| n == ns).count()
    }
}

impl BlobStore for MockBlobStore {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.get(namespace, key).ok_or(StorageError::NotFound)
    }

    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > BLOB_MAX_SIZE {
            return Err(StorageError::TooLarge);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::IoError);
        }
        self.writes
            .lock()
            .unwrap()
            .push((namespace.into(), key.into(), data.len()));
        self.put(namespace, key, data);
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.map.lock().unwrap().remove(&(namespace.into(), key.into()));
        Ok(())
    }
}

// ── File store ───────────────────────────────────────────────

pub struct MemFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    pub available: AtomicBool,
    pub fail_writes: AtomicBool,
    pub writes: Mutex<Vec<String>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }
}

#[allow(dead_code)]
impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn put(&self, path: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(path.into(), data.to_vec());
    }

    pub fn delete(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

impl FileStore for MemFs {
    fn read(&self, path: &str) -> Result<Vec<u8>, FileError> {
        if !self.is_available() {
            return Err(FileError::Unavailable);
        }
        self.get(path).ok_or(FileError::NotFound)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), FileError> {
        if !self.is_available() {
            return Err(FileError::Unavailable);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FileError::IoError);
        }
        self.writes.lock().unwrap().push(path.into());
        self.put(path, data);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), FileError> {
        self.delete(path);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

// ── Power rails ──────────────────────────────────────────────

pub struct MockDevices {
    levels: Mutex<HashMap<Device, bool>>,
    pub calls: Mutex<Vec<(Device, bool)>>,
}

impl Default for MockDevices {
    fn default() -> Self {
        Self {
            levels: Mutex::new(Device::ALL.iter().map(|d| (*d, true)).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[allow(dead_code)]
impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn switched_off(&self) -> Vec<Device> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, on)| !on)
            .map(|(d, _)| *d)
            .collect()
    }
}

impl DevicePowerPort for MockDevices {
    fn set_power(&self, device: Device, on: bool) -> Result<(), HardwareError> {
        self.calls.lock().unwrap().push((device, on));
        self.levels.lock().unwrap().insert(device, on);
        Ok(())
    }

    fn is_powered(&self, device: Device) -> bool {
        self.levels.lock().unwrap().get(&device).copied().unwrap_or(false)
    }
}

// ── Frame sink ───────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<(u32, serde_json::Value)>>,
    pub refuse: AtomicBool,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_for(&self, client: u32, topic: &str) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, f)| *c == client && f["topic"] == topic)
            .count()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

impl FrameSink for RecordingSink {
    fn send(&self, client: u32, frame: &str) -> Result<(), SinkError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SinkError::Disconnected);
        }
        let v = serde_json::from_str(frame).unwrap();
        self.frames.lock().unwrap().push((client, v));
        Ok(())
    }
}

// ── Simulated platform ───────────────────────────────────────

/// Handles to the doubles behind a [`Platform`].
#[allow(dead_code)]
pub struct SimBoard {
    pub clock: Arc<SimClock>,
    pub files: Arc<MemFs>,
    pub nvs: Arc<MockBlobStore>,
    pub system: Arc<SimSystem>,
    pub wifi: Arc<WifiAdapter>,
    pub devices: Arc<MockDevices>,
    pub vsense: SimVoltageSensor,
    pub sink: Arc<RecordingSink>,
}

pub const CONFIG_DIR: &str = "/sdcard/config";

pub fn sim_platform() -> (Platform, SimBoard) {
    let clock = Arc::new(SimClock::starting_at_ms(1_000));
    let files = Arc::new(MemFs::new());
    let nvs = Arc::new(MockBlobStore::new());
    let system = Arc::new(SimSystem::new(clock.clone()));
    let wifi = Arc::new(WifiAdapter::new_sim(vec![AccessPoint {
        ssid: "bench".into(),
        rssi: -48,
        channel: 6,
        auth: "WPA2_PSK",
    }]));
    let devices = Arc::new(MockDevices::new());
    // Nominal supply, so the background sampler never trips.
    let vsense = SimVoltageSensor::new(24.0);
    let sink = Arc::new(RecordingSink::new());

    let platform = Platform {
        clock: clock.clone(),
        files: files.clone(),
        blobs: nvs.clone(),
        system: system.clone(),
        network: wifi.clone(),
        devices: devices.clone(),
        voltage: Box::new(vsense.clone()),
        sink: sink.clone(),
        config_dir: CONFIG_DIR.into(),
    };
    let board = SimBoard {
        clock,
        files,
        nvs,
        system,
        wifi,
        devices,
        vsense,
        sink,
    };
    (platform, board)
}
