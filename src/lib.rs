//! TianShan appliance supervisor.
//!
//! Exposes the core modules for integration testing and for the firmware
//! binary.  All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module, so everything here
//! builds and tests on the host.

#![deny(unused_must_use)]

pub mod error;

pub mod api;
pub mod automation;
pub mod config;
pub mod events;
pub mod power;
pub mod service;
pub mod thermal;
pub mod ws;

pub mod adapters;
pub mod app;
pub mod ops;
pub mod pins;
pub mod runtime;
pub mod task;

#[cfg(target_os = "espidf")]
mod cs_shim;
