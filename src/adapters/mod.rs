//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter        | Implements         | Connects to                    |
//! |----------------|--------------------|--------------------------------|
//! | `nvs`          | BlobStore          | NVS / in-memory map            |
//! | `sdcard`       | FileStore          | FAT on SD card / host dir      |
//! | `time`         | Clock              | ESP32 system timer / Instant   |
//! | `system`       | SystemPort         | chip info, heap, FreeRTOS      |
//! | `wifi`         | NetworkPort        | ESP-IDF WiFi STA               |
//! | `device_power` | DevicePowerPort    | load-switch GPIOs (embedded-hal)|
//! | `voltage`      | VoltageSensor      | ADC1 oneshot + divider         |
//! | `log_sink`     | FrameSink          | console log (bench units)      |

pub mod device_power;
pub mod log_sink;
pub mod nvs;
pub mod sdcard;
pub mod system;
pub mod time;
pub mod voltage;
pub mod wifi;
