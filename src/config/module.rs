//! Persisted configuration modules and where each one lives.
//!
//! | Module       | Namespace  | Key       | File               |
//! |--------------|------------|-----------|--------------------|
//! | `net`        | `ts_net`   | `config`  | `net.json`         |
//! | `ui`         | `ts_ui`    | `widgets` | `ui_widgets.json`  |
//! | `power`      | `ts_power` | `config`  | `power.json`       |
//! | `automation` | `ts_auto`  | `config`  | `automation.json`  |
//! | `temp`       | `ts_temp`  | `config`  | `temp.json`        |

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigModule {
    Net,
    Ui,
    Power,
    Automation,
    Temp,
}

impl ConfigModule {
    pub const ALL: [Self; 5] = [Self::Net, Self::Ui, Self::Power, Self::Automation, Self::Temp];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Net => "net",
            Self::Ui => "ui",
            Self::Power => "power",
            Self::Automation => "automation",
            Self::Temp => "temp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    pub const fn namespace(self) -> &'static str {
        match self {
            Self::Net => "ts_net",
            Self::Ui => "ts_ui",
            Self::Power => "ts_power",
            Self::Automation => "ts_auto",
            Self::Temp => "ts_temp",
        }
    }

    pub const fn key(self) -> &'static str {
        match self {
            Self::Ui => "widgets",
            _ => "config",
        }
    }

    /// Plain JSON file name under the config directory.
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Net => "net.json",
            Self::Ui => "ui_widgets.json",
            Self::Power => "power.json",
            Self::Automation => "automation.json",
            Self::Temp => "temp.json",
        }
    }

    /// Encrypted variant of [`file_name`](Self::file_name).
    pub const fn sealed_name(self) -> &'static str {
        match self {
            Self::Net => "net.tscfg",
            Self::Ui => "ui_widgets.tscfg",
            Self::Power => "power.tscfg",
            Self::Automation => "automation.tscfg",
            Self::Temp => "temp.tscfg",
        }
    }

    /// Bit in the pending-sync masks.
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}
