//! Persistence of per-printer details, keyed by serial number.

use crate::context::PrinterDetails;
use crate::errors::{DaemonError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[async_trait]
pub trait PrinterDetailsStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<PrinterDetails>>;

    async fn get(&self, serial: &str) -> Result<Option<PrinterDetails>>;

    /// Insert or replace the entry for `details.serial_number`.
    async fn save(&self, details: &PrinterDetails) -> Result<()>;

    /// Returns whether an entry existed.
    async fn remove(&self, serial: &str) -> Result<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreFile {
    version: u32,
    printers: BTreeMap<String, PrinterDetails>,
}

const STORE_VERSION: u32 = 1;

/// JSON file store. Writes go to a sibling temp file and are renamed into place.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<StoreFile> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No printer store at {}", self.path.display());
                return Ok(StoreFile {
                    version: STORE_VERSION,
                    printers: BTreeMap::new(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let file: StoreFile = serde_json::from_str(&raw).map_err(|e| {
            DaemonError::Config(format!(
                "Printer store {} is malformed: {}",
                self.path.display(),
                e
            ))
        })?;
        if file.version > STORE_VERSION {
            warn!(
                "Printer store version {} is newer than supported {}",
                file.version, STORE_VERSION
            );
        }
        Ok(file)
    }

    async fn write(&self, file: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PrinterDetailsStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<PrinterDetails>> {
        Ok(self.read().await?.printers.into_values().collect())
    }

    async fn get(&self, serial: &str) -> Result<Option<PrinterDetails>> {
        Ok(self.read().await?.printers.remove(serial))
    }

    async fn save(&self, details: &PrinterDetails) -> Result<()> {
        if details.serial_number.is_empty() {
            return Err(DaemonError::Validation(
                "cannot persist a printer without a serial number".into(),
            ));
        }
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        file.version = STORE_VERSION;
        file.printers
            .insert(details.serial_number.clone(), details.clone());
        self.write(&file).await?;
        info!("Saved printer {} to store", details.serial_number);
        Ok(())
    }

    async fn remove(&self, serial: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        let existed = file.printers.remove(serial).is_some();
        if existed {
            self.write(&file).await?;
        }
        Ok(existed)
    }
}

/// Store that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    printers: Mutex<BTreeMap<String, PrinterDetails>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_printers(printers: impl IntoIterator<Item = PrinterDetails>) -> Self {
        let store = Self::new();
        {
            let mut map = store.printers.lock();
            for details in printers {
                map.insert(details.serial_number.clone(), details);
            }
        }
        store
    }
}

#[async_trait]
impl PrinterDetailsStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<PrinterDetails>> {
        Ok(self.printers.lock().values().cloned().collect())
    }

    async fn get(&self, serial: &str) -> Result<Option<PrinterDetails>> {
        Ok(self.printers.lock().get(serial).cloned())
    }

    async fn save(&self, details: &PrinterDetails) -> Result<()> {
        self.printers
            .lock()
            .insert(details.serial_number.clone(), details.clone());
        Ok(())
    }

    async fn remove(&self, serial: &str) -> Result<bool> {
        Ok(self.printers.lock().remove(serial).is_some())
    }
}
