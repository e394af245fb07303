//! Removable-media file adapter.
//!
//! Implements [`FileStore`] over `std::fs`.  On the device the card is
//! mounted through the ESP-IDF VFS before this adapter is built, so the
//! same code serves both targets; paths are resolved under `root`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::warn;

use crate::app::ports::{FileError, FileStore};

pub struct SdCard {
    root: PathBuf,
}

impl SdCard {
    /// `root` is prepended to every relative path.  Absolute paths pass through.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn map_err(e: &std::io::Error) -> FileError {
    match e.kind() {
        ErrorKind::NotFound => FileError::NotFound,
        _ => FileError::IoError,
    }
}

impl FileStore for SdCard {
    fn read(&self, path: &str) -> Result<Vec<u8>, FileError> {
        std::fs::read(self.resolve(path)).map_err(|e| map_err(&e))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), FileError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                warn!("SdCard: mkdir {} failed: {}", parent.display(), e);
                FileError::IoError
            })?;
        }
        // Write-then-rename keeps a half-written file from ever being read.
        let tmp = full.with_extension("tmp");
        std::fs::write(&tmp, data).map_err(|e| map_err(&e))?;
        std::fs::rename(&tmp, &full).map_err(|e| map_err(&e))
    }

    fn remove(&self, path: &str) -> Result<(), FileError> {
        match std::fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_err(&e)),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn is_available(&self) -> bool {
        Path::new(&self.root).is_dir()
    }
}
