//! Persistence bookkeeping kept in the blob store.
//!
//! Stored as a `postcard` record at `ts_meta/state`:
//!
//! ```text
//!  seq         u32   strictly increasing save counter (nonce input)
//!  file_stale  u8    modules whose file copy missed the last save
//!  blob_stale  u8    modules whose blob copy missed the last save
//! ```

use serde::{Deserialize, Serialize};

use super::module::ConfigModule;

pub const META_NAMESPACE: &str = "ts_meta";
pub const META_KEY: &str = "state";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMeta {
    pub seq: u32,
    pub file_stale: u8,
    pub blob_stale: u8,
}

impl ConfigMeta {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        postcard::from_bytes(bytes).ok()
    }

    pub fn encode(&self) -> Option<Vec<u8>> {
        postcard::to_allocvec(self).ok()
    }

    pub fn is_pending(&self, module: ConfigModule) -> bool {
        (self.file_stale | self.blob_stale) & module.bit() != 0
    }

    /// Record the outcome of a dual write.
    pub fn mark(&mut self, module: ConfigModule, file_ok: bool, blob_ok: bool) {
        let bit = module.bit();
        if file_ok {
            self.file_stale &= !bit;
        } else {
            self.file_stale |= bit;
        }
        if blob_ok {
            self.blob_stale &= !bit;
        } else {
            self.blob_stale |= bit;
        }
    }

    pub fn clear(&mut self, module: ConfigModule) {
        self.file_stale &= !module.bit();
        self.blob_stale &= !module.bit();
    }

    pub fn pending(&self) -> Vec<ConfigModule> {
        ConfigModule::ALL
            .into_iter()
            .filter(|m| self.is_pending(*m))
            .collect()
    }
}
