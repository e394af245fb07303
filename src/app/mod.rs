//! Application boundary.
//!
//! The core subsystems touch storage, radios, rails and the clock only
//! through the **port traits** in [`ports`]; `adapters` supplies the ESP-IDF
//! and simulation implementations.

pub mod ports;
