//! Layered configuration persistence.
//!
//! Every module document lives in two places: a human-editable JSON file on
//! removable media and a power-safe blob in the embedded store.
//!
//! ```text
//!  load(module):
//!    file (.tscfg if a key is provisioned, else .json) ── ok ──▶ source=file
//!      │ absent / corrupt
//!      ▼
//!    blob ── ok ──▶ copy to file ──▶ source=blob
//!      │ absent / corrupt
//!      ▼
//!    defaults ──▶ source=default  (+ CONFIG/LOAD_FALLBACK if something was corrupt)
//!
//!  save(module, doc):
//!    size check ─▶ seq += 1 ─▶ file ─▶ blob ─▶ pending_sync if exactly one failed
//! ```
//!
//! Every `.tscfg` frame is sealed under a sequence number reserved and
//! persisted just before sealing, whichever path writes it (save, blob
//! mirror, reconciliation).  A nonce is never used twice under one key.
//!
//! A module whose file copy missed the last save is read blob-first until
//! [`ConfigStore::sync_pending`] repairs it.

pub mod meta;
pub mod module;
pub mod pack;

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

pub use meta::ConfigMeta;
pub use module::ConfigModule;

use crate::app::ports::{BlobStore, FileError, FileStore, StorageError};
use crate::error::{Error, Result, relock};
use crate::events::{EventBase, EventBus, Priority};

/// Per-key limit of the embedded blob store.
pub const BLOB_MAX_SIZE: usize = 4000;

pub const DEFAULT_CONFIG_DIR: &str = "/sdcard/config";

pub const KEY_NAMESPACE: &str = "ts_keys";
pub const KEY_NAME: &str = "cfg_key";

/// Event ids on [`EventBase::Config`].
pub mod event_id {
    pub const LOAD_FALLBACK: u16 = 0;
    pub const SAVED: u16 = 1;
    pub const SYNCED: u16 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    File,
    Blob,
    Default,
}

impl Source {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Blob => "blob",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub value: Value,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    pub file_saved: bool,
    pub blob_saved: bool,
    pub pending_sync: bool,
}

impl SaveOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "file_saved": self.file_saved,
            "blob_saved": self.blob_saved,
            "pending_sync": self.pending_sync,
        })
    }
}

/// Why a store could not supply a document.
enum Miss {
    Absent,
    Corrupt(&'static str),
}

struct State {
    meta: ConfigMeta,
    key: Option<[u8; pack::KEY_LEN]>,
    encrypt: bool,
}

pub struct ConfigStore {
    files: Arc<dyn FileStore>,
    blobs: Arc<dyn BlobStore>,
    dir: String,
    bus: Option<Arc<EventBus>>,
    state: Mutex<State>,
}

impl ConfigStore {
    /// Open the store, reading persisted bookkeeping and any provisioned key.
    pub fn open(files: Arc<dyn FileStore>, blobs: Arc<dyn BlobStore>) -> Self {
        let meta = blobs
            .read(meta::META_NAMESPACE, meta::META_KEY)
            .ok()
            .and_then(|b| ConfigMeta::decode(&b))
            .unwrap_or_default();
        let key = blobs
            .read(KEY_NAMESPACE, KEY_NAME)
            .ok()
            .filter(|k| k.len() == pack::KEY_LEN)
            .map(|k| pack::derive_key(&k));
        info!(
            "Config: opened (seq={}, pending=0x{:02x}, key={})",
            meta.seq,
            meta.file_stale | meta.blob_stale,
            key.is_some()
        );
        Self {
            files,
            blobs,
            dir: DEFAULT_CONFIG_DIR.into(),
            bus: None,
            state: Mutex::new(State {
                meta,
                key,
                encrypt: false,
            }),
        }
    }

    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        relock(self.state.lock())
    }

    pub fn file_path(&self, module: ConfigModule) -> String {
        format!("{}/{}", self.dir, module.file_name())
    }

    pub fn sealed_path(&self, module: ConfigModule) -> String {
        format!("{}/{}", self.dir, module.sealed_name())
    }

    // ── Load ─────────────────────────────────────────────────

    pub fn load(&self, module: ConfigModule, defaults: &Value) -> Loaded {
        let (key, file_stale) = {
            let st = self.lock();
            (st.key, st.meta.file_stale & module.bit() != 0)
        };
        let mut corrupt: Option<&'static str> = None;

        if !file_stale {
            match self.read_file(module, key.as_ref()) {
                Ok(value) => {
                    debug!("Config: {} loaded from file", module.as_str());
                    return Loaded {
                        value,
                        source: Source::File,
                    };
                }
                Err(Miss::Corrupt(why)) => {
                    warn!("Config: {} file unusable ({})", module.as_str(), why);
                    corrupt = Some(why);
                }
                Err(Miss::Absent) => {}
            }
        }

        match self.read_blob(module) {
            Ok((value, raw)) => {
                debug!("Config: {} loaded from blob", module.as_str());
                self.copy_blob_to_file(module, &raw, key.as_ref());
                return Loaded {
                    value,
                    source: Source::Blob,
                };
            }
            Err(Miss::Corrupt(why)) => {
                warn!("Config: {} blob unusable ({})", module.as_str(), why);
                corrupt = Some(why);
            }
            Err(Miss::Absent) => {}
        }

        // A stale file still beats defaults when the blob is gone.
        if file_stale {
            if let Ok(value) = self.read_file(module, key.as_ref()) {
                warn!("Config: {} using stale file copy", module.as_str());
                return Loaded {
                    value,
                    source: Source::File,
                };
            }
        }

        if let Some(reason) = corrupt {
            self.fallback_event(module, reason);
        }
        info!("Config: {} using defaults", module.as_str());
        Loaded {
            value: defaults.clone(),
            source: Source::Default,
        }
    }

    /// Load into a typed record.  A document that parses as JSON but not
    /// as `T` is treated like a corrupt one.
    pub fn load_typed<T>(&self, module: ConfigModule) -> (T, Source)
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let defaults = serde_json::to_value(T::default()).unwrap_or(Value::Null);
        let loaded = self.load(module, &defaults);
        if loaded.source == Source::Default {
            return (T::default(), Source::Default);
        }
        match serde_json::from_value::<T>(loaded.value) {
            Ok(v) => (v, loaded.source),
            Err(_) => {
                warn!("Config: {} has the wrong shape, using defaults", module.as_str());
                self.fallback_event(module, "schema mismatch");
                (T::default(), Source::Default)
            }
        }
    }

    fn read_file(&self, module: ConfigModule, key: Option<&[u8; pack::KEY_LEN]>) -> core::result::Result<Value, Miss> {
        if !self.files.is_available() {
            return Err(Miss::Absent);
        }
        if let Some(key) = key {
            match self.files.read(&self.sealed_path(module)) {
                Ok(frame) => {
                    let plain = pack::unseal(key, &frame).map_err(|_| Miss::Corrupt("tag verification failed"))?;
                    return serde_json::from_slice(&plain).map_err(|_| Miss::Corrupt("invalid JSON"));
                }
                Err(FileError::NotFound) => {}
                Err(_) => return Err(Miss::Corrupt("read error")),
            }
        }
        match self.files.read(&self.file_path(module)) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|_| Miss::Corrupt("invalid JSON")),
            Err(FileError::NotFound | FileError::Unavailable) => Err(Miss::Absent),
            Err(FileError::IoError) => Err(Miss::Corrupt("read error")),
        }
    }

    fn read_blob(&self, module: ConfigModule) -> core::result::Result<(Value, Vec<u8>), Miss> {
        match self.blobs.read(module.namespace(), module.key()) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(|v| (v, raw))
                .map_err(|_| Miss::Corrupt("invalid JSON")),
            Err(StorageError::NotFound) => Err(Miss::Absent),
            Err(_) => Err(Miss::Corrupt("read error")),
        }
    }

    fn copy_blob_to_file(&self, module: ConfigModule, raw: &[u8], key: Option<&[u8; pack::KEY_LEN]>) {
        if !self.files.is_available() {
            return;
        }
        let mut st = self.lock();
        let sealed = st.encrypt && key.is_some();
        if self.write_file(module, raw, sealed, key, &mut st.meta).is_ok() {
            debug!("Config: {} copied blob → file", module.as_str());
            if st.meta.file_stale & module.bit() != 0 {
                st.meta.file_stale &= !module.bit();
                self.persist_meta(&st.meta);
            }
        }
    }

    // ── Save ─────────────────────────────────────────────────

    pub fn save(&self, module: ConfigModule, doc: &Value) -> Result<SaveOutcome> {
        let encrypt = self.lock().encrypt;
        self.save_with(module, doc, encrypt)
    }

    /// Save, writing the file copy as `.tscfg`.  `InvalidState` without a key.
    pub fn save_encrypted(&self, module: ConfigModule, doc: &Value) -> Result<SaveOutcome> {
        if self.lock().key.is_none() {
            return Err(Error::InvalidState);
        }
        self.save_with(module, doc, true)
    }

    pub fn save_typed<T: Serialize>(&self, module: ConfigModule, cfg: &T) -> Result<SaveOutcome> {
        let doc = serde_json::to_value(cfg).map_err(|_| Error::InvalidArg)?;
        self.save(module, &doc)
    }

    fn save_with(&self, module: ConfigModule, doc: &Value, sealed: bool) -> Result<SaveOutcome> {
        let bytes = serde_json::to_vec(doc).map_err(|_| Error::InvalidArg)?;
        if bytes.len() > self.blobs.max_blob_size() {
            warn!(
                "Config: {} document is {} bytes (limit {})",
                module.as_str(),
                bytes.len(),
                self.blobs.max_blob_size()
            );
            return Err(Error::InvalidSize);
        }

        let mut st = self.lock();
        let key = st.key;
        // Sealed writes reserve their own sequence number.
        if !(sealed && key.is_some() && self.files.is_available()) {
            st.meta.seq = st.meta.seq.saturating_add(1);
        }

        let file_saved = self.files.is_available()
            && self
                .write_file(module, &bytes, sealed, key.as_ref(), &mut st.meta)
                .inspect_err(|e| warn!("Config: {} file write failed: {}", module.as_str(), e))
                .is_ok();
        let blob_saved = self
            .blobs
            .write(module.namespace(), module.key(), &bytes)
            .inspect_err(|e| warn!("Config: {} blob write failed: {}", module.as_str(), e))
            .is_ok();

        st.meta.mark(module, file_saved, blob_saved);
        let pending_sync = st.meta.is_pending(module);
        self.persist_meta(&st.meta);
        drop(st);

        if !file_saved && !blob_saved {
            return Err(Error::Internal);
        }
        info!(
            "Config: {} saved (file={}, blob={})",
            module.as_str(),
            file_saved,
            blob_saved
        );
        self.post(event_id::SAVED, json!({"module": module.as_str(), "pending_sync": pending_sync}));
        Ok(SaveOutcome {
            file_saved,
            blob_saved,
            pending_sync,
        })
    }

    /// Write one variant and delete the other so loads never see both.
    /// Once the primary write lands the call succeeds; a leftover copy of
    /// the other variant is only logged.
    fn write_file(
        &self,
        module: ConfigModule,
        plain: &[u8],
        sealed: bool,
        key: Option<&[u8; pack::KEY_LEN]>,
        meta: &mut ConfigMeta,
    ) -> Result<()> {
        let stale = match (sealed, key) {
            (true, Some(key)) => {
                let path = self.sealed_path(module);
                let seq = self.next_seq(meta)?;
                let nonce = pack::nonce_for(key, seq, &path);
                let frame = pack::seal(key, &nonce, plain)?;
                self.files.write(&path, &frame)?;
                self.file_path(module)
            }
            (true, None) => return Err(Error::InvalidState),
            (false, _) => {
                self.files.write(&self.file_path(module), plain)?;
                self.sealed_path(module)
            }
        };
        if let Err(e) = self.files.remove(&stale) {
            warn!("Config: {} left behind ({})", stale, e);
        }
        Ok(())
    }

    /// Reserve the next sequence number and make it durable before use.
    fn next_seq(&self, meta: &mut ConfigMeta) -> Result<u32> {
        let seq = meta.seq.checked_add(1).ok_or(Error::InvalidState)?;
        meta.seq = seq;
        let bytes = meta.encode().ok_or(Error::Internal)?;
        self.blobs.write(meta::META_NAMESPACE, meta::META_KEY, &bytes)?;
        Ok(seq)
    }

    // ── Reconciliation ───────────────────────────────────────

    pub fn has_pending_sync(&self, module: ConfigModule) -> bool {
        self.lock().meta.is_pending(module)
    }

    pub fn pending_modules(&self) -> Vec<ConfigModule> {
        self.lock().meta.pending()
    }

    /// Copy each pending module's surviving side onto the missing one.
    /// Returns how many modules were fully repaired.
    pub fn sync_pending(&self) -> usize {
        let mut st = self.lock();
        let key = st.key;
        let mut repaired = 0;

        for module in st.meta.pending() {
            let bit = module.bit();
            if st.meta.file_stale & bit != 0 && self.files.is_available() {
                if let Ok(raw) = self.blobs.read(module.namespace(), module.key()) {
                    let sealed = st.encrypt && key.is_some();
                    if self.write_file(module, &raw, sealed, key.as_ref(), &mut st.meta).is_ok() {
                        st.meta.file_stale &= !bit;
                    }
                }
            }
            if st.meta.blob_stale & bit != 0 {
                let plain = match self.read_file(module, key.as_ref()) {
                    Ok(v) => serde_json::to_vec(&v).ok(),
                    Err(_) => None,
                };
                if let Some(bytes) = plain {
                    if bytes.len() <= self.blobs.max_blob_size()
                        && self.blobs.write(module.namespace(), module.key(), &bytes).is_ok()
                    {
                        st.meta.blob_stale &= !bit;
                    }
                }
            }
            if !st.meta.is_pending(module) {
                info!("Config: {} reconciled", module.as_str());
                repaired += 1;
            }
        }
        self.persist_meta(&st.meta);
        drop(st);

        if repaired > 0 {
            self.post(event_id::SYNCED, json!({"repaired": repaired}));
        }
        repaired
    }

    /// Delete both copies of a module.
    pub fn reset(&self, module: ConfigModule) -> Result<()> {
        let mut st = self.lock();
        self.blobs.delete(module.namespace(), module.key())?;
        if self.files.is_available() {
            self.files.remove(&self.file_path(module))?;
            self.files.remove(&self.sealed_path(module))?;
        }
        st.meta.clear(module);
        self.persist_meta(&st.meta);
        info!("Config: {} reset", module.as_str());
        Ok(())
    }

    // ── Encryption ───────────────────────────────────────────

    /// Store the 32-byte device key and derive the file key from it.
    pub fn provision_key(&self, device_key: &[u8]) -> Result<()> {
        if device_key.len() != pack::KEY_LEN {
            return Err(Error::InvalidSize);
        }
        self.blobs.write(KEY_NAMESPACE, KEY_NAME, device_key)?;
        self.lock().key = Some(pack::derive_key(device_key));
        info!("Config: device key provisioned");
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        self.lock().key.is_some()
    }

    /// Write future file copies as `.tscfg`.  `InvalidState` without a key.
    pub fn enable_encryption(&self, on: bool) -> Result<()> {
        let mut st = self.lock();
        if on && st.key.is_none() {
            return Err(Error::InvalidState);
        }
        st.encrypt = on;
        Ok(())
    }

    pub fn seq(&self) -> u32 {
        self.lock().meta.seq
    }

    // ── Internal ─────────────────────────────────────────────

    fn persist_meta(&self, meta: &ConfigMeta) {
        let Some(bytes) = meta.encode() else {
            return;
        };
        if let Err(e) = self.blobs.write(meta::META_NAMESPACE, meta::META_KEY, &bytes) {
            warn!("Config: bookkeeping write failed: {}", e);
        }
    }

    fn fallback_event(&self, module: ConfigModule, reason: &str) {
        self.post(
            event_id::LOAD_FALLBACK,
            json!({"module": module.as_str(), "reason": reason}),
        );
    }

    fn post(&self, id: u16, data: Value) {
        if let Some(bus) = &self.bus {
            if bus.post_json(EventBase::Config, id, data, Priority::Normal).is_err() {
                debug!("Config: event {} dropped", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::NvsAdapter;
    use crate::adapters::sdcard::SdCard;

    struct Fixture {
        _dir: tempdir::Dir,
        files: Arc<SdCard>,
        blobs: Arc<NvsAdapter>,
        store: ConfigStore,
    }

    mod tempdir {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU32, Ordering};

        pub struct Dir(pub PathBuf);

        impl Dir {
            pub fn new() -> Self {
                static N: AtomicU32 = AtomicU32::new(0);
                let p = std::env::temp_dir().join(format!(
                    "tianshan-cfg-{}-{}",
                    std::process::id(),
                    N.fetch_add(1, Ordering::SeqCst)
                ));
                let _ = std::fs::remove_dir_all(&p);
                std::fs::create_dir_all(&p).unwrap();
                Self(p)
            }
        }

        impl Drop for Dir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    fn fixture() -> Fixture {
        let dir = tempdir::Dir::new();
        let files = Arc::new(SdCard::new(dir.0.to_string_lossy().into_owned()));
        let blobs = Arc::new(NvsAdapter::new().unwrap());
        let store = ConfigStore::open(files.clone(), blobs.clone()).with_dir("config");
        Fixture {
            _dir: dir,
            files,
            blobs,
            store,
        }
    }

    #[test]
    fn save_then_load_reads_file() {
        let f = fixture();
        let doc = json!({"port": 443});
        let out = f.store.save(ConfigModule::Net, &doc).unwrap();
        assert!(out.file_saved && out.blob_saved && !out.pending_sync);
        let l = f.store.load(ConfigModule::Net, &json!({}));
        assert_eq!(l, Loaded { value: doc, source: Source::File });
    }

    #[test]
    fn blob_fallback_copies_to_file() {
        let f = fixture();
        f.blobs.write("ts_net", "config", br#"{"port":443}"#).unwrap();
        let l = f.store.load(ConfigModule::Net, &json!({}));
        assert_eq!(l.source, Source::Blob);
        assert_eq!(l.value, json!({"port": 443}));
        assert!(f.files.read("config/net.json").is_ok());
    }

    #[test]
    fn corrupt_everything_falls_back_with_event() {
        let bus = Arc::new(EventBus::new());
        let f = fixture();
        let store = ConfigStore::open(f.files.clone(), f.blobs.clone())
            .with_dir("config")
            .with_bus(Arc::clone(&bus));
        f.blobs.write("ts_net", "config", b"{nope").unwrap();

        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&hits);
        bus.register(EventBase::Config, Some(event_id::LOAD_FALLBACK), move |e| {
            h.lock().unwrap().push(e.json().cloned());
        });

        let l = store.load(ConfigModule::Net, &json!({"port": 80}));
        assert_eq!(l.source, Source::Default);
        assert_eq!(l.value, json!({"port": 80}));
        bus.drain();
        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].as_ref().unwrap()["module"], "net");
    }

    #[test]
    fn oversize_document_touches_nothing() {
        let f = fixture();
        let seq = f.store.seq();
        let big = json!({"pad": "x".repeat(BLOB_MAX_SIZE)});
        assert_eq!(f.store.save(ConfigModule::Ui, &big), Err(Error::InvalidSize));
        assert!(!f.files.exists("config/ui_widgets.json"));
        assert_eq!(f.store.seq(), seq);
    }

    #[test]
    fn blob_limit_is_inclusive() {
        let f = fixture();
        // {"p":"…"} carries 8 bytes of framing.
        let exact = json!({"p": "y".repeat(BLOB_MAX_SIZE - 8)});
        assert_eq!(serde_json::to_vec(&exact).unwrap().len(), BLOB_MAX_SIZE);
        assert!(f.store.save(ConfigModule::Ui, &exact).is_ok());
        let over = json!({"p": "y".repeat(BLOB_MAX_SIZE - 7)});
        assert_eq!(f.store.save(ConfigModule::Ui, &over), Err(Error::InvalidSize));
    }

    #[test]
    fn encrypted_file_round_trips_and_replaces_plain() {
        let f = fixture();
        f.store.provision_key(&[3u8; 32]).unwrap();
        f.store.save(ConfigModule::Power, &json!({"a": 1})).unwrap();
        assert!(f.files.exists("config/power.json"));

        f.store.save_encrypted(ConfigModule::Power, &json!({"a": 2})).unwrap();
        assert!(!f.files.exists("config/power.json"));
        let raw = f.files.read("config/power.tscfg").unwrap();
        assert!(pack::is_sealed(&raw));

        let l = f.store.load(ConfigModule::Power, &json!({}));
        assert_eq!((l.value, l.source), (json!({"a": 2}), Source::File));
    }

    #[test]
    fn tampered_tscfg_falls_back_to_blob() {
        let f = fixture();
        f.store.provision_key(&[4u8; 32]).unwrap();
        f.store.save_encrypted(ConfigModule::Temp, &json!({"t": 1})).unwrap();
        let mut raw = f.files.read("config/temp.tscfg").unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        f.files.write("config/temp.tscfg", &raw).unwrap();

        let l = f.store.load(ConfigModule::Temp, &json!({}));
        assert_eq!(l.source, Source::Blob);
        assert_eq!(l.value, json!({"t": 1}));
    }

    #[test]
    fn key_survives_reopen() {
        let f = fixture();
        f.store.provision_key(&[5u8; 32]).unwrap();
        let again = ConfigStore::open(f.files.clone(), f.blobs.clone());
        assert!(again.has_key());
        assert_eq!(f.store.provision_key(&[1u8; 5]), Err(Error::InvalidSize));
    }

    #[test]
    fn encryption_requires_key() {
        let f = fixture();
        assert_eq!(f.store.enable_encryption(true), Err(Error::InvalidState));
        assert_eq!(
            f.store.save_encrypted(ConfigModule::Net, &json!({})),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn reset_removes_both_copies() {
        let f = fixture();
        f.store.save(ConfigModule::Automation, &json!({"rules": []})).unwrap();
        f.store.reset(ConfigModule::Automation).unwrap();
        let l = f.store.load(ConfigModule::Automation, &json!({"d": true}));
        assert_eq!(l.source, Source::Default);
    }

    #[test]
    fn typed_load_rejects_wrong_shape() {
        #[derive(Debug, Default, PartialEq, Serialize, serde::Deserialize)]
        struct Cfg {
            port: u16,
        }
        let f = fixture();
        f.store.save(ConfigModule::Net, &json!({"port": "eighty"})).unwrap();
        let (cfg, src) = f.store.load_typed::<Cfg>(ConfigModule::Net);
        assert_eq!((cfg, src), (Cfg::default(), Source::Default));

        f.store.save_typed(ConfigModule::Net, &Cfg { port: 8080 }).unwrap();
        let (cfg, src) = f.store.load_typed::<Cfg>(ConfigModule::Net);
        assert_eq!((cfg.port, src), (8080, Source::File));
    }

    // ── Fault injection ──────────────────────────────────────

    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyCard {
        inner: Arc<SdCard>,
        fail_writes: AtomicBool,
        fail_removes: AtomicBool,
    }

    impl FileStore for FlakyCard {
        fn read(&self, path: &str) -> core::result::Result<Vec<u8>, FileError> {
            self.inner.read(path)
        }

        fn write(&self, path: &str, data: &[u8]) -> core::result::Result<(), FileError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(FileError::IoError);
            }
            self.inner.write(path, data)
        }

        fn remove(&self, path: &str) -> core::result::Result<(), FileError> {
            if self.fail_removes.load(Ordering::SeqCst) {
                return Err(FileError::IoError);
            }
            self.inner.remove(path)
        }

        fn exists(&self, path: &str) -> bool {
            self.inner.exists(path)
        }
    }

    struct FlakyBlobs {
        inner: Arc<NvsAdapter>,
        fail_ns: Mutex<Option<&'static str>>,
    }

    impl BlobStore for FlakyBlobs {
        fn read(&self, namespace: &str, key: &str) -> core::result::Result<Vec<u8>, StorageError> {
            self.inner.read(namespace, key)
        }

        fn write(&self, namespace: &str, key: &str, data: &[u8]) -> core::result::Result<(), StorageError> {
            if *self.fail_ns.lock().unwrap() == Some(namespace) {
                return Err(StorageError::IoError);
            }
            self.inner.write(namespace, key, data)
        }

        fn delete(&self, namespace: &str, key: &str) -> core::result::Result<(), StorageError> {
            self.inner.delete(namespace, key)
        }
    }

    struct FlakyFixture {
        _f: Fixture,
        card: Arc<FlakyCard>,
        blobs: Arc<FlakyBlobs>,
        store: ConfigStore,
    }

    fn flaky() -> FlakyFixture {
        let f = fixture();
        let card = Arc::new(FlakyCard {
            inner: f.files.clone(),
            fail_writes: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
        });
        let blobs = Arc::new(FlakyBlobs {
            inner: f.blobs.clone(),
            fail_ns: Mutex::new(None),
        });
        let store = ConfigStore::open(card.clone(), blobs.clone()).with_dir("config");
        FlakyFixture {
            _f: f,
            card,
            blobs,
            store,
        }
    }

    fn nonce_of(card: &FlakyCard, path: &str) -> Vec<u8> {
        let frame = card.read(path).unwrap();
        assert!(pack::is_sealed(&frame));
        frame[6..6 + pack::NONCE_LEN].to_vec()
    }

    #[test]
    fn every_sealed_write_gets_a_fresh_nonce() {
        let f = flaky();
        let path = "config/power.tscfg";
        f.store.provision_key(&[9u8; 32]).unwrap();
        f.store.enable_encryption(true).unwrap();
        let mut nonces = Vec::new();

        // Plain save path.
        f.store.save(ConfigModule::Power, &json!({"low": 11.0})).unwrap();
        nonces.push(nonce_of(&f.card, path));

        // Blob write lost: the file alone carries the new document.
        *f.blobs.fail_ns.lock().unwrap() = Some("ts_power");
        let out = f.store.save(ConfigModule::Power, &json!({"low": 12.6})).unwrap();
        assert!(out.file_saved && out.pending_sync);
        *f.blobs.fail_ns.lock().unwrap() = None;
        nonces.push(nonce_of(&f.card, path));

        // Card copy lost: the stale blob is mirrored back onto the card.
        f.card.inner.remove(path).unwrap();
        let l = f.store.load(ConfigModule::Power, &json!({}));
        assert_eq!((l.source, l.value), (Source::Blob, json!({"low": 11.0})));
        nonces.push(nonce_of(&f.card, path));

        // File write lost, then repaired by reconciliation.
        f.card.fail_writes.store(true, Ordering::SeqCst);
        let out = f.store.save(ConfigModule::Power, &json!({"low": 13.0})).unwrap();
        assert!(!out.file_saved && out.pending_sync);
        f.card.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(f.store.sync_pending(), 1);
        nonces.push(nonce_of(&f.card, path));

        for (i, a) in nonces.iter().enumerate() {
            for b in &nonces[i + 1..] {
                assert_ne!(a, b);
            }
        }
        let l = f.store.load(ConfigModule::Power, &json!({}));
        assert_eq!((l.source, l.value), (Source::File, json!({"low": 13.0})));

        // The reserved counter is durable, so a reboot cannot hand it out again.
        let again = ConfigStore::open(f.card.clone(), f.blobs.clone());
        assert_eq!(again.seq(), f.store.seq());
    }

    #[test]
    fn leftover_plain_copy_does_not_fail_a_sealed_save() {
        let f = flaky();
        f.store.provision_key(&[2u8; 32]).unwrap();
        f.store.save(ConfigModule::Net, &json!({"ssid": "old"})).unwrap();

        f.card.fail_removes.store(true, Ordering::SeqCst);
        let out = f.store.save_encrypted(ConfigModule::Net, &json!({"ssid": "new"})).unwrap();
        assert!(out.file_saved && out.blob_saved && !out.pending_sync);
        assert!(f.card.exists("config/net.json"));

        let l = f.store.load(ConfigModule::Net, &json!({}));
        assert_eq!((l.source, l.value), (Source::File, json!({"ssid": "new"})));
    }

    #[test]
    fn seq_persists_across_reopen() {
        let f = fixture();
        f.store.save(ConfigModule::Net, &json!({})).unwrap();
        f.store.save(ConfigModule::Net, &json!({})).unwrap();
        let again = ConfigStore::open(f.files.clone(), f.blobs.clone());
        assert_eq!(again.seq(), 2);
    }
}
