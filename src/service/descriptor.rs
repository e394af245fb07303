//! Service descriptors, lifecycle states, and the per-service transition table.
//!
//! ```text
//!  REGISTERED ──▶ STARTING ──▶ RUNNING ──▶ STOPPING ──▶ STOPPED
//!       │             │                                     │
//!       └──▶ ERROR ◀──┘                 STARTING ◀──────────┘
//!              │
//!              └──▶ STARTING   (explicit retry)
//! ```

use core::any::Any;
use core::ops::BitOr;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::error::Result;

/// Service names must be strictly shorter than this.
pub const MAX_SERVICE_NAME_LEN: usize = 32;
pub const MAX_DEPENDENCIES: usize = 8;

// ── Phase ────────────────────────────────────────────────────

/// Coarse bring-up band; every service in phase N starts before any in N+1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    Platform = 0,
    Core = 1,
    Hal = 2,
    Driver = 3,
    Network = 4,
    Security = 5,
    Service = 6,
    Ui = 7,
}

impl Phase {
    pub const COUNT: usize = 8;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Platform,
        Self::Core,
        Self::Hal,
        Self::Driver,
        Self::Network,
        Self::Security,
        Self::Service,
        Self::Ui,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Platform => "PLATFORM",
            Self::Core => "CORE",
            Self::Hal => "HAL",
            Self::Driver => "DRIVER",
            Self::Network => "NETWORK",
            Self::Security => "SECURITY",
            Self::Service => "SERVICE",
            Self::Ui => "UI",
        }
    }
}

// ── State ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Unregistered,
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ServiceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "UNREGISTERED",
            Self::Registered => "REGISTERED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        }
    }

    /// Legal lifecycle edges.  Everything else is `InvalidState`.
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Registered, Self::Starting | Self::Error)
                | (Self::Starting, Self::Running | Self::Error)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopped | Self::Error, Self::Starting)
        )
    }
}

// ── Capabilities ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const RESTARTABLE: Self = Self(0b0000_0001);
    pub const STOPPABLE: Self = Self(0b0000_0010);
    pub const HEALTHCHECKABLE: Self = Self(0b0000_0100);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn names(self) -> Vec<&'static str> {
        let mut v = Vec::new();
        if self.contains(Self::RESTARTABLE) {
            v.push("RESTARTABLE");
        }
        if self.contains(Self::STOPPABLE) {
            v.push("STOPPABLE");
        }
        if self.contains(Self::HEALTHCHECKABLE) {
            v.push("HEALTHCHECKABLE");
        }
        v
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ── Hooks ────────────────────────────────────────────────────

pub type HookFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;
pub type HealthFn = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ServiceHooks {
    pub init: Option<HookFn>,
    pub start: HookFn,
    pub stop: Option<HookFn>,
    pub health: Option<HealthFn>,
}

// ── Descriptor ───────────────────────────────────────────────

/// A long-lived subsystem: plain record plus hook closures.  State the
/// hooks need is captured by the closures themselves.
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub phase: Phase,
    pub dependencies: Vec<String>,
    pub capabilities: Capabilities,
    pub hooks: ServiceHooks,
    /// Opaque public interface other services may look up.
    pub api: Option<Arc<dyn Any + Send + Sync>>,
}

impl ServiceDescriptor {
    pub fn new<F>(name: impl Into<String>, phase: Phase, start: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            phase,
            dependencies: Vec::new(),
            capabilities: Capabilities::NONE,
            hooks: ServiceHooks {
                init: None,
                start: Arc::new(start),
                stop: None,
                health: None,
            },
            api: None,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    #[must_use]
    pub fn capabilities(mut self, caps: Capabilities) -> Self {
        self.capabilities = caps;
        self
    }

    #[must_use]
    pub fn on_init<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.init = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.stop = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_health<F>(mut self, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.hooks.health = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_api(mut self, api: Arc<dyn Any + Send + Sync>) -> Self {
        self.api = Some(api);
        self
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub phase: Phase,
    pub state: ServiceState,
    pub capabilities: Capabilities,
    pub dependencies: Vec<String>,
    pub start_time_ms: u64,
    pub start_duration_ms: u64,
    pub last_health_check_ms: u64,
    pub healthy: bool,
    pub last_error: Option<String>,
}

impl ServiceInfo {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "phase": self.phase.as_str(),
            "state": self.state.as_str(),
            "capabilities": self.capabilities.names(),
            "dependencies": self.dependencies,
            "start_time_ms": self.start_time_ms,
            "start_duration_ms": self.start_duration_ms,
            "last_health_check_ms": self.last_health_check_ms,
            "healthy": self.healthy,
            "last_error": self.last_error,
        })
    }
}
