//! Per-printer session state.

use crate::backend::{BackendKind, PrinterBackend, PrinterFamily};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Opaque context identifier. Random v4, so never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Connection state shared between a context and its backend.
///
/// Backed by a watch channel so callers can await transitions.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionHandle {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Returns the previous state.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        self.tx.send_replace(state)
    }

    /// Move to `to` only if currently in one of `from`.
    pub fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if from.contains(current) && *current != to {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

/// Settings persisted per printer (keyed by serial number).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrinterSettings {
    pub custom_camera_enabled: bool,
    pub custom_camera_url: Option<String>,
    pub custom_led_control: bool,
    pub force_legacy_mode: bool,
    /// 1-60, falls back to the configured default.
    pub camera_frame_rate: Option<u8>,
    /// 1-5 (lower is better), falls back to the configured default.
    pub camera_quality: Option<u8>,
}

/// Identity record for one printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterDetails {
    pub name: String,
    pub ip_address: IpAddr,
    pub serial_number: String,
    /// Machine type string as reported by the printer.
    pub model: String,
    pub family: PrinterFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_code: Option<String>,
    #[serde(default)]
    pub settings: PrinterSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

pub struct PrinterContext {
    id: ContextId,
    details: RwLock<PrinterDetails>,
    backend: Arc<PrinterBackend>,
    connection: ConnectionHandle,
    camera_port: Mutex<Option<u16>>,
    polling_enabled: AtomicBool,
    removed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl PrinterContext {
    pub(crate) fn new(id: ContextId, details: PrinterDetails, backend: PrinterBackend) -> Self {
        let connection = backend.connection().clone();
        Self {
            id,
            details: RwLock::new(details),
            backend: Arc::new(backend),
            connection,
            camera_port: Mutex::new(None),
            polling_enabled: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn details(&self) -> PrinterDetails {
        self.details.read().clone()
    }

    pub fn update_details<F>(&self, f: F)
    where
        F: FnOnce(&mut PrinterDetails),
    {
        f(&mut self.details.write());
    }

    pub fn backend(&self) -> &Arc<PrinterBackend> {
        &self.backend
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.get()
    }

    pub fn camera_port(&self) -> Option<u16> {
        *self.camera_port.lock()
    }

    /// Record a freshly allocated port. Returns the port it replaced, if any.
    pub fn set_camera_port(&self, port: u16) -> Option<u16> {
        self.camera_port.lock().replace(port)
    }

    /// Take the camera port out of the context. Only the first caller gets it.
    pub fn take_camera_port(&self) -> Option<u16> {
        self.camera_port.lock().take()
    }

    pub fn polling_enabled(&self) -> bool {
        self.polling_enabled.load(Ordering::Acquire)
    }

    pub fn set_polling_enabled(&self, enabled: bool) {
        self.polling_enabled.store(enabled, Ordering::Release);
    }

    /// Set once the context manager starts tearing this context down.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn info(&self, is_active: bool) -> ContextInfo {
        let details = self.details.read();
        ContextInfo {
            id: self.id,
            name: details.name.clone(),
            ip_address: details.ip_address,
            serial_number: details.serial_number.clone(),
            family: details.family,
            backend_kind: self.backend.kind(),
            connection_state: self.connection.get(),
            camera_port: self.camera_port(),
            polling_enabled: self.polling_enabled(),
            is_active,
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for PrinterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrinterContext")
            .field("id", &self.id)
            .field("serial", &self.details.read().serial_number)
            .field("backend", &self.backend.kind())
            .field("state", &self.connection.get())
            .finish()
    }
}

/// Snapshot of a context for listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub id: ContextId,
    pub name: String,
    pub ip_address: IpAddr,
    pub serial_number: String,
    pub family: PrinterFamily,
    pub backend_kind: BackendKind,
    pub connection_state: ConnectionState,
    pub camera_port: Option<u16>,
    pub polling_enabled: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
