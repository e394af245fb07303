//! Canonical operations.
//!
//! Each submodule turns one subsystem into a list of
//! [`OperationDescriptor`]s; [`register_all`] installs them into the
//! registry in one pass.
//!
//! ```text
//!   OpsContext ──▶ system::descriptors()     system.*
//!              ──▶ network::descriptors()    network.status, wifi.*
//!              ──▶ power::descriptors()      power.*
//!              ──▶ temp::descriptors()       temp.*
//!              ──▶ ui::descriptors()         ui.widgets.*
//!              ──▶ service::descriptors()    service.list
//!              ──▶ automation::descriptors() automation.*
//! ```
//!
//! Handlers validate their parameter shape before touching any state.

pub mod automation;
pub mod network;
pub mod power;
pub mod service;
pub mod system;
pub mod temp;
pub mod ui;

use std::sync::Arc;

use log::info;

use crate::api::{OperationDescriptor, OperationRegistry};
use crate::app::ports::{NetworkPort, SystemPort};
use crate::automation::AutomationEngine;
use crate::config::ConfigStore;
use crate::error::Result;
use crate::power::VoltageProtection;
use crate::service::ServiceManager;
use crate::thermal::TemperatureManager;

/// Permission tag carried by mutating operations.
pub const ADMIN: &str = "admin";

/// Everything the handlers reach into.
#[derive(Clone)]
pub struct OpsContext {
    pub system: Arc<dyn SystemPort>,
    pub network: Arc<dyn NetworkPort>,
    pub power: Arc<VoltageProtection>,
    pub temp: Arc<TemperatureManager>,
    pub config: Arc<ConfigStore>,
    pub services: Arc<ServiceManager>,
    pub automation: Arc<AutomationEngine>,
}

pub fn descriptors(ctx: &OpsContext) -> Vec<OperationDescriptor> {
    let mut all = Vec::new();
    all.extend(system::descriptors(ctx));
    all.extend(network::descriptors(ctx));
    all.extend(power::descriptors(ctx));
    all.extend(temp::descriptors(ctx));
    all.extend(ui::descriptors(ctx));
    all.extend(service::descriptors(ctx));
    all.extend(automation::descriptors(ctx));
    all
}

/// Install every canonical operation.  Stops at the first duplicate.
pub fn register_all(registry: &OperationRegistry, ctx: &OpsContext) -> Result<()> {
    let before = registry.count();
    registry.register_multiple(descriptors(ctx))?;
    info!("Ops: {} operations registered", registry.count() - before);
    Ok(())
}
