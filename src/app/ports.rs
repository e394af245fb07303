//! Port traits: the hexagonal boundary between the supervisor core and
//! the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ core (registry, persistence, protection, fan-out)
//! ```
//!
//! Driven adapters (storage, clocks, radios, power rails, sockets) implement
//! these traits.  The core holds them as `Arc<dyn Port>` so every subsystem
//! can be exercised on the host with in-memory doubles.
//!
//! All ports take `&self`: implementations own their interior locking
//! because the same adapter is shared by the sampling, automation and
//! request-handling tasks.

use crate::error::Error;
use core::fmt;

// ───────────────────────────────────────────────────────────────
// Clock
// ───────────────────────────────────────────────────────────────

/// Monotonic time since boot.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;

    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }
}

// ───────────────────────────────────────────────────────────────
// Blob store (embedded key-value, power-safe)
// ───────────────────────────────────────────────────────────────

/// Small namespaced blob store (NVS on the device).
///
/// Writes MUST be atomic: a reader sees either the previous or the new blob.
pub trait BlobStore: Send + Sync {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Returns `Ok(())` even if the key didn't exist.
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Largest blob accepted per key.
    fn max_blob_size(&self) -> usize {
        crate::config::BLOB_MAX_SIZE
    }
}

// ───────────────────────────────────────────────────────────────
// File store (removable media)
// ───────────────────────────────────────────────────────────────

/// Human-editable file storage on removable media.
pub trait FileStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, FileError>;

    /// Write the whole file, creating intermediate directories.
    fn write(&self, path: &str, data: &[u8]) -> Result<(), FileError>;

    /// Returns `Ok(())` even if the file didn't exist.
    fn remove(&self, path: &str) -> Result<(), FileError>;

    fn exists(&self, path: &str) -> bool;

    /// `false` while the card is absent or unmounted.
    fn is_available(&self) -> bool {
        true
    }
}

// ───────────────────────────────────────────────────────────────
// System introspection
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    pub model: &'static str,
    pub cores: u8,
    pub revision: u16,
    pub features: Vec<&'static str>,
    pub flash_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapRegion {
    pub total: u32,
    pub free: u32,
    pub largest_block: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub free_heap: u32,
    pub min_free_heap: u32,
    pub internal: HeapRegion,
    /// `None` on boards without external RAM.
    pub psram: Option<HeapRegion>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuStats {
    /// Per-core busy percentage (0–100).
    pub core_usage: Vec<f32>,
    pub task_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub priority: u32,
    pub stack_hwm: u32,
    /// `None` when the task is not pinned.
    pub core: Option<u8>,
    pub state: &'static str,
}

/// Runtime log verbosity, numbered as on the wire (0 = none … 5 = verbose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Debug,
            5 => Self::Verbose,
            _ => return None,
        })
    }

    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::None => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Verbose => log::LevelFilter::Trace,
        }
    }

    pub fn from_filter(f: log::LevelFilter) -> Self {
        match f {
            log::LevelFilter::Off => Self::None,
            log::LevelFilter::Error => Self::Error,
            log::LevelFilter::Warn => Self::Warn,
            log::LevelFilter::Info => Self::Info,
            log::LevelFilter::Debug => Self::Debug,
            log::LevelFilter::Trace => Self::Verbose,
        }
    }
}

/// Chip-level queries and controls backing the `system.*` operations.
pub trait SystemPort: Send + Sync {
    fn chip_info(&self) -> ChipInfo;
    fn memory(&self) -> MemoryStats;
    fn cpu(&self) -> CpuStats;
    fn tasks(&self) -> Vec<TaskInfo>;
    fn uptime_ms(&self) -> u64;

    /// Arrange a restart after `delay_ms`; returns immediately.
    fn schedule_reboot(&self, delay_ms: u32) -> Result<(), HardwareError>;

    fn set_log_level(&self, tag: Option<&str>, level: LogLevel);
    fn log_level(&self) -> LogLevel;
}

// ───────────────────────────────────────────────────────────────
// Network
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatus {
    pub connected: bool,
    pub state: &'static str,
    pub ssid: Option<String>,
    pub ip: Option<String>,
    pub rssi: Option<i8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub rssi: i8,
    pub channel: u8,
    pub auth: &'static str,
}

/// Station-mode connectivity.
pub trait NetworkPort: Send + Sync {
    fn status(&self) -> NetworkStatus;
    fn scan(&self) -> Result<Vec<AccessPoint>, NetworkError>;

    /// Validate credentials and begin an association.  Completion is
    /// observed through [`status`](Self::status).
    fn connect(&self, ssid: &str, password: &str) -> Result<(), NetworkError>;

    /// Once-a-second housekeeping (link supervision, reconnect backoff).
    fn poll(&self) {}
}

// ───────────────────────────────────────────────────────────────
// Protected device power rails
// ───────────────────────────────────────────────────────────────

/// Devices the voltage protection may switch off and later restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// The attached compute node.
    Compute,
    /// Auxiliary 12 V rail.
    Aux,
    Fan,
}

impl Device {
    pub const ALL: [Self; 3] = [Self::Compute, Self::Aux, Self::Fan];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Aux => "aux",
            Self::Fan => "fan",
        }
    }
}

pub trait DevicePowerPort: Send + Sync {
    fn set_power(&self, device: Device, on: bool) -> Result<(), HardwareError>;
    fn is_powered(&self, device: Device) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Supply voltage sensor
// ───────────────────────────────────────────────────────────────

pub trait VoltageSensor: Send {
    /// Supply voltage in volts.
    fn read_voltage(&mut self) -> Result<f32, HardwareError>;
}

// ───────────────────────────────────────────────────────────────
// Subscription frame sink (driven adapter: core → websocket clients)
// ───────────────────────────────────────────────────────────────

/// Outbound text frames, addressed by transport client id.
pub trait FrameSink: Send + Sync {
    fn send(&self, client: u32, frame: &str) -> Result<(), SinkError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`BlobStore`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Blob exceeds the per-key limit.
    TooLarge,
    /// Generic I/O error.
    IoError,
}

/// Errors from [`FileStore`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    NotFound,
    /// Card absent or unmounted.
    Unavailable,
    IoError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    InvalidSsid,
    InvalidPassword,
    ScanFailed,
    ConnectionFailed,
    /// Radio not started yet.
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareError {
    ReadFailed,
    WriteFailed,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// Client already gone.
    Disconnected,
    /// Transport buffer full; the frame was dropped.
    Backpressure,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::TooLarge => write!(f, "blob too large"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "file not found"),
            Self::Unavailable => write!(f, "media unavailable"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "SSID invalid (must be 1-32 printable ASCII bytes)"),
            Self::InvalidPassword => write!(f, "password must be 8-64 bytes or empty"),
            Self::ScanFailed => write!(f, "WiFi scan failed"),
            Self::ConnectionFailed => write!(f, "WiFi connection failed"),
            Self::NotReady => write!(f, "WiFi not started"),
        }
    }
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed => write!(f, "hardware read failed"),
            Self::WriteFailed => write!(f, "hardware write failed"),
            Self::Unsupported => write!(f, "not supported on this board"),
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "client disconnected"),
            Self::Backpressure => write!(f, "send buffer full"),
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => Self::NotFound,
            StorageError::Full => Self::NoMem,
            StorageError::TooLarge => Self::InvalidSize,
            StorageError::IoError => Self::Internal,
        }
    }
}

impl From<FileError> for Error {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound => Self::NotFound,
            FileError::Unavailable | FileError::IoError => Self::Internal,
        }
    }
}

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::InvalidSsid | NetworkError::InvalidPassword => Self::InvalidArg,
            NetworkError::NotReady => Self::InvalidState,
            NetworkError::ScanFailed | NetworkError::ConnectionFailed => Self::Hardware,
        }
    }
}

impl From<HardwareError> for Error {
    fn from(e: HardwareError) -> Self {
        match e {
            HardwareError::Unsupported => Self::NotSupported,
            HardwareError::ReadFailed | HardwareError::WriteFailed => Self::Hardware,
        }
    }
}
