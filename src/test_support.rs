//! Stubs shared by unit tests.

use crate::backend::{BackendVariant, PrinterBackend, PrinterFamily};
use crate::context::{ConnectionHandle, ConnectionState, PrinterDetails, PrinterSettings};
use crate::errors::{DaemonError, Result};
use crate::protocol::{
    LegacyClient, LegacyMachineStatus, LegacyPrinterInfo, LegacyProgress, LegacyTemperatures,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// G-code client that answers every command with canned data.
#[derive(Default)]
pub struct StubLegacy {
    pub status_calls: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub delay: Option<Duration>,
    pub fail_status: bool,
}

#[async_trait]
impl LegacyClient for StubLegacy {
    async fn printer_info(&self) -> Result<LegacyPrinterInfo> {
        Ok(LegacyPrinterInfo {
            machine_type: "FlashForge Adventurer 4".into(),
            machine_name: "Stub".into(),
            ..LegacyPrinterInfo::default()
        })
    }
    async fn temperatures(&self) -> Result<LegacyTemperatures> {
        Ok(LegacyTemperatures::default())
    }
    async fn machine_status(&self) -> Result<LegacyMachineStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_status {
            return Err(DaemonError::Transport("connection reset".into()));
        }
        Ok(LegacyMachineStatus {
            machine_status: "READY".into(),
            move_mode: "READY".into(),
            led_on: false,
            current_file: None,
        })
    }
    async fn print_progress(&self) -> Result<LegacyProgress> {
        Ok(LegacyProgress::default())
    }
    async fn pause(&self) -> Result<bool> {
        Ok(true)
    }
    async fn resume(&self) -> Result<bool> {
        Ok(true)
    }
    async fn cancel(&self) -> Result<bool> {
        Ok(true)
    }
    async fn start_local_job(&self, _file_name: &str) -> Result<bool> {
        Ok(true)
    }
    async fn list_local_files(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn set_led(&self, _on: bool) -> Result<bool> {
        Ok(true)
    }
    async fn send_raw(&self, _command: &str) -> Result<String> {
        Ok("ok".into())
    }
    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn details(serial: &str) -> PrinterDetails {
    PrinterDetails {
        name: format!("Printer {}", serial),
        ip_address: "192.168.1.10".parse().expect("valid ip"),
        serial_number: serial.to_string(),
        model: "FlashForge Adventurer 4".into(),
        family: PrinterFamily::Legacy,
        check_code: None,
        settings: PrinterSettings::default(),
        last_connected: None,
    }
}

pub fn legacy_backend(client: Arc<StubLegacy>) -> PrinterBackend {
    PrinterBackend::new(
        PrinterFamily::Legacy,
        BackendVariant::legacy(client),
        &PrinterSettings::default(),
        ConnectionHandle::new(ConnectionState::Connected),
    )
}
