//! `service.list`.

use std::sync::Arc;

use serde_json::{Value, json};

use super::OpsContext;
use crate::api::{Category, OperationDescriptor};

pub fn descriptors(ctx: &OpsContext) -> Vec<OperationDescriptor> {
    let services = Arc::clone(&ctx.services);
    let list = OperationDescriptor::new("service.list", Category::System, move |_, out| {
        let infos: Vec<Value> = services.snapshot().iter().map(|i| i.to_json()).collect();
        out.ok(json!({"services": infos, "stats": services.stats().to_json()}));
        Ok(())
    })
    .describe("Registered services and their states");

    vec![list]
}
