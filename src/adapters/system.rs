//! Chip introspection and control behind [`SystemPort`].
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: `esp_chip_info`, `heap_caps_*`, FreeRTOS
//!   task queries and `esp_restart`.
//! - **all other targets**: [`SimSystem`], fixed figures plus a recorded
//!   reboot request.
//!
//! Task listings come from [`crate::task::spawned`], so only threads started
//! through `spawn_on_core` appear.

use std::sync::Arc;

use crate::app::ports::{
    ChipInfo, Clock, CpuStats, HardwareError, LogLevel, MemoryStats, SystemPort, TaskInfo,
};

/// Apply a global level to the `log` facade.
fn set_global_level(level: LogLevel) {
    log::set_max_level(level.to_filter());
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub use esp::EspSystem;

#[cfg(target_os = "espidf")]
mod esp {
    use std::ffi::CString;
    use std::time::Duration;

    use esp_idf_svc::sys::*;
    use log::{info, warn};

    use super::set_global_level;
    use crate::app::ports::{
        ChipInfo, CpuStats, HardwareError, HeapRegion, LogLevel, MemoryStats, SystemPort, TaskInfo,
    };
    use crate::task::{self, Core};

    #[derive(Default)]
    pub struct EspSystem;

    impl EspSystem {
        pub fn new() -> Self {
            Self
        }
    }

    fn region(caps: u32) -> HeapRegion {
        // SAFETY: heap_caps queries are thread-safe and side-effect free.
        unsafe {
            HeapRegion {
                total: heap_caps_get_total_size(caps) as u32,
                free: heap_caps_get_free_size(caps) as u32,
                largest_block: heap_caps_get_largest_free_block(caps) as u32,
            }
        }
    }

    impl SystemPort for EspSystem {
        fn chip_info(&self) -> ChipInfo {
            // SAFETY: all-zero is a valid esp_chip_info_t; the call fills it in.
            let mut info: esp_chip_info_t = unsafe { core::mem::zeroed() };
            unsafe { esp_chip_info(&mut info) };

            let model = match info.model {
                esp_chip_model_t_CHIP_ESP32 => "ESP32",
                esp_chip_model_t_CHIP_ESP32S2 => "ESP32-S2",
                esp_chip_model_t_CHIP_ESP32S3 => "ESP32-S3",
                esp_chip_model_t_CHIP_ESP32C3 => "ESP32-C3",
                esp_chip_model_t_CHIP_ESP32C6 => "ESP32-C6",
                _ => "unknown",
            };
            let mut features = Vec::new();
            for (bit, name) in [
                (CHIP_FEATURE_WIFI_BGN, "wifi"),
                (CHIP_FEATURE_BLE, "ble"),
                (CHIP_FEATURE_BT, "bt"),
                (CHIP_FEATURE_EMB_FLASH, "embedded_flash"),
                (CHIP_FEATURE_EMB_PSRAM, "embedded_psram"),
            ] {
                if info.features & bit != 0 {
                    features.push(name);
                }
            }

            let mut flash_size: u32 = 0;
            // SAFETY: a null chip selects the default flash; out-pointer is valid.
            let ret = unsafe { esp_flash_get_size(core::ptr::null_mut(), &mut flash_size) };
            if ret != ESP_OK {
                flash_size = 0;
            }

            ChipInfo {
                model,
                cores: info.cores,
                revision: info.revision,
                features,
                flash_size,
            }
        }

        fn memory(&self) -> MemoryStats {
            let psram = region(MALLOC_CAP_SPIRAM);
            // SAFETY: heap statistics are read-only queries.
            let (free_heap, min_free_heap) =
                unsafe { (esp_get_free_heap_size(), esp_get_minimum_free_heap_size()) };
            MemoryStats {
                free_heap,
                min_free_heap,
                internal: region(MALLOC_CAP_INTERNAL),
                psram: (psram.total > 0).then_some(psram),
            }
        }

        fn cpu(&self) -> CpuStats {
            // TODO: derive per-core load from idle-task run time once
            // CONFIG_FREERTOS_GENERATE_RUN_TIME_STATS is enabled in sdkconfig.
            // SAFETY: read-only scheduler query.
            let task_count = unsafe { uxTaskGetNumberOfTasks() };
            CpuStats {
                core_usage: vec![0.0; 2],
                task_count,
            }
        }

        fn tasks(&self) -> Vec<TaskInfo> {
            task::spawned()
                .into_iter()
                .map(|t| {
                    let Ok(cname) = CString::new(t.name) else {
                        return TaskInfo {
                            name: t.name.to_owned(),
                            priority: u32::from(t.priority),
                            stack_hwm: 0,
                            core: Some(t.core as u8),
                            state: "unknown",
                        };
                    };
                    // SAFETY: `cname` outlives the lookup; a null handle is checked.
                    let handle = unsafe { xTaskGetHandle(cname.as_ptr()) };
                    let (stack_hwm, state) = if handle.is_null() {
                        (0, "finished")
                    } else {
                        // SAFETY: handle refers to a live task.
                        (unsafe { uxTaskGetStackHighWaterMark(handle) }, "running")
                    };
                    TaskInfo {
                        name: t.name.to_owned(),
                        priority: u32::from(t.priority),
                        stack_hwm,
                        core: Some(t.core as u8),
                        state,
                    }
                })
                .collect()
        }

        fn uptime_ms(&self) -> u64 {
            // SAFETY: esp_timer_get_time is callable from any task.
            (unsafe { esp_timer_get_time() } / 1000) as u64
        }

        fn schedule_reboot(&self, delay_ms: u32) -> Result<(), HardwareError> {
            info!("System: reboot in {} ms", delay_ms);
            task::spawn_on_core(Core::Pro, 5, 3, "reboot\0", move || {
                std::thread::sleep(Duration::from_millis(u64::from(delay_ms)));
                // SAFETY: esp_restart never returns.
                unsafe { esp_restart() };
            })
            .map(|_| ())
            .map_err(|e| {
                warn!("System: reboot task spawn failed: {}", e);
                HardwareError::WriteFailed
            })
        }

        fn set_log_level(&self, tag: Option<&str>, level: LogLevel) {
            match tag.map(CString::new) {
                None => {
                    set_global_level(level);
                    // SAFETY: "*" is a static NUL-terminated string.
                    unsafe { esp_log_level_set(c"*".as_ptr(), level as esp_log_level_t) };
                }
                Some(Ok(ctag)) => {
                    // SAFETY: `ctag` outlives the call; IDF copies the tag.
                    unsafe { esp_log_level_set(ctag.as_ptr(), level as esp_log_level_t) };
                }
                Some(Err(_)) => warn!("System: log tag contains NUL, ignored"),
            }
        }

        fn log_level(&self) -> LogLevel {
            LogLevel::from_filter(log::max_level())
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation
// ───────────────────────────────────────────────────────────────

pub struct SimSystem {
    clock: Arc<dyn Clock>,
    reboot_requested: std::sync::Mutex<Option<u32>>,
    tag_levels: std::sync::Mutex<Vec<(String, LogLevel)>>,
}

impl SimSystem {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            reboot_requested: std::sync::Mutex::new(None),
            tag_levels: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Delay passed to the last `schedule_reboot`, if any.
    pub fn reboot_requested(&self) -> Option<u32> {
        *crate::error::relock(self.reboot_requested.lock())
    }

    pub fn tag_level(&self, tag: &str) -> Option<LogLevel> {
        crate::error::relock(self.tag_levels.lock())
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, l)| *l)
    }
}

impl SystemPort for SimSystem {
    fn chip_info(&self) -> ChipInfo {
        ChipInfo {
            model: "ESP32-S3 (sim)",
            cores: 2,
            revision: 2,
            features: vec!["wifi", "ble"],
            flash_size: 16 * 1024 * 1024,
        }
    }

    fn memory(&self) -> MemoryStats {
        use crate::app::ports::HeapRegion;
        MemoryStats {
            free_heap: 245_760,
            min_free_heap: 198_656,
            internal: HeapRegion {
                total: 327_680,
                free: 180_224,
                largest_block: 110_592,
            },
            psram: Some(HeapRegion {
                total: 8 * 1024 * 1024,
                free: 7 * 1024 * 1024,
                largest_block: 4 * 1024 * 1024,
            }),
        }
    }

    fn cpu(&self) -> CpuStats {
        CpuStats {
            core_usage: vec![12.5, 37.5],
            task_count: crate::task::spawned().len() as u32,
        }
    }

    fn tasks(&self) -> Vec<TaskInfo> {
        crate::task::spawned()
            .into_iter()
            .map(|t| TaskInfo {
                name: t.name.to_owned(),
                priority: u32::from(t.priority),
                stack_hwm: (t.stack_kb * 1024) as u32,
                core: Some(t.core as u8),
                state: "running",
            })
            .collect()
    }

    fn uptime_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn schedule_reboot(&self, delay_ms: u32) -> Result<(), HardwareError> {
        log::info!("System(sim): reboot requested in {} ms", delay_ms);
        *crate::error::relock(self.reboot_requested.lock()) = Some(delay_ms);
        Ok(())
    }

    fn set_log_level(&self, tag: Option<&str>, level: LogLevel) {
        match tag {
            None => set_global_level(level),
            Some(tag) => {
                let mut levels = crate::error::relock(self.tag_levels.lock());
                levels.retain(|(t, _)| t != tag);
                levels.push((tag.to_owned(), level));
            }
        }
    }

    fn log_level(&self) -> LogLevel {
        LogLevel::from_filter(log::max_level())
    }
}
