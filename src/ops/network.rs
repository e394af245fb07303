//! `network.status`, `wifi.scan`, `wifi.connect`.

use std::sync::Arc;

use log::info;
use serde_json::{Value, json};

use super::{ADMIN, OpsContext};
use crate::api::{Category, OperationDescriptor, params};
use crate::app::ports::NetworkError;
use crate::error::Error;

pub fn descriptors(ctx: &OpsContext) -> Vec<OperationDescriptor> {
    let net = Arc::clone(&ctx.network);
    let status = OperationDescriptor::new("network.status", Category::Network, move |_, out| {
        let s = net.status();
        let mut data = json!({"connected": s.connected, "state": s.state});
        if let Some(ssid) = s.ssid {
            data["ssid"] = json!(ssid);
        }
        if let Some(ip) = s.ip {
            data["ip"] = json!(ip);
        }
        if let Some(rssi) = s.rssi {
            data["rssi"] = json!(rssi);
        }
        out.ok(data);
        Ok(())
    })
    .describe("Station link state");

    let net = Arc::clone(&ctx.network);
    let scan = OperationDescriptor::new("wifi.scan", Category::Network, move |_, out| {
        let aps = match net.scan() {
            Ok(aps) => aps,
            Err(e) => return out.fail(e.into(), "WiFi scan failed"),
        };
        let networks: Vec<Value> = aps
            .iter()
            .map(|ap| json!({"ssid": ap.ssid, "rssi": ap.rssi, "channel": ap.channel, "auth": ap.auth}))
            .collect();
        let count = networks.len();
        out.ok(json!({"networks": networks, "count": count}));
        Ok(())
    })
    .describe("Scan for access points");

    let net = Arc::clone(&ctx.network);
    let connect = OperationDescriptor::new("wifi.connect", Category::Network, move |p, out| {
        let ssid = params::require_str(p, "ssid", out)?;
        let password = params::optional_str(p, "password", out)?.unwrap_or("");
        if let Err(e) = net.connect(ssid, password) {
            let msg = match e {
                NetworkError::InvalidSsid => "Invalid SSID",
                NetworkError::InvalidPassword => "Invalid password",
                _ => "WiFi connection failed",
            };
            return out.fail(Error::from(e), msg);
        }
        info!("Ops: wifi.connect '{}'", ssid);
        out.ok(json!({"status": "connecting", "ssid": ssid}));
        Ok(())
    })
    .describe("Join an access point")
    .auth(ADMIN);

    vec![status, scan, connect]
}
