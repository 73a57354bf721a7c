//! Printer wire-protocol clients.
//!
//! Two generations of protocol are spoken by the printers this daemon manages:
//! - the legacy G-code channel (TCP, `~Mxxx` commands terminated by `ok`)
//! - the modern HTTP/JSON API, authenticated by serial number and check code
//!
//! Backends only see the [`LegacyClient`] and [`ModernClient`] traits; the
//! network implementations live in [`legacy`] and [`modern`].

pub mod legacy;
pub mod modern;

use crate::config::ConnectionConfig;
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use legacy::TcpLegacyClient;
pub use modern::HttpModernClient;

/// Pairing material for the modern API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub serial_number: String,
    pub check_code: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TempReading {
    pub current: f64,
    pub target: f64,
}

/// M115 reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPrinterInfo {
    pub machine_type: String,
    pub machine_name: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub tool_count: u8,
    pub mac_address: Option<String>,
}

/// M105 reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyTemperatures {
    pub extruder: TempReading,
    pub secondary_extruder: Option<TempReading>,
    pub bed: TempReading,
}

/// M119 reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMachineStatus {
    pub machine_status: String,
    pub move_mode: String,
    pub led_on: bool,
    pub current_file: Option<String>,
}

/// M27 reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyProgress {
    pub percent: f64,
    pub layer: Option<(u32, u32)>,
}

/// `/detail` payload of the modern API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModernDetail {
    pub name: Option<String>,
    pub status: Option<String>,
    pub firmware_version: Option<String>,
    pub ip_addr: Option<String>,
    pub print_file_name: Option<String>,
    pub print_progress: Option<f64>,
    pub print_layer: Option<u32>,
    pub target_print_layer: Option<u32>,
    pub print_duration: Option<u64>,
    pub estimated_time: Option<f64>,
    pub left_temp: Option<f64>,
    pub left_target_temp: Option<f64>,
    pub plat_temp: Option<f64>,
    pub plat_target_temp: Option<f64>,
    pub chamber_temp: Option<f64>,
    pub chamber_target_temp: Option<f64>,
    pub light_status: Option<String>,
    pub internal_fan_status: Option<String>,
    pub external_fan_status: Option<String>,
    pub camera_stream_url: Option<String>,
    pub error_code: Option<String>,
    pub has_matl_station: Option<bool>,
    pub matl_station_info: Option<MaterialStationInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaterialStationInfo {
    pub current_slot: u8,
    pub slot_cnt: u8,
    pub state_action: i32,
    pub state_step: i32,
    pub slot_infos: Vec<SlotInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlotInfo {
    pub slot_id: u8,
    pub has_filament: bool,
    pub material_name: String,
    pub material_color: String,
}

/// Tool → material-station slot assignment sent with AD5X jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialMapping {
    /// Zero-based extruder tool index used in the G-code.
    pub tool_id: u8,
    /// One-based material station slot.
    pub slot_id: u8,
    pub material_name: String,
    pub tool_material_color: String,
    pub slot_material_color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Pause,
    Resume,
    Cancel,
}

impl JobAction {
    pub fn as_wire(&self) -> &'static str {
        match self {
            JobAction::Pause => "pause",
            JobAction::Resume => "continue",
            JobAction::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiltrationMode {
    Internal,
    External,
    Off,
}

/// Start a file already stored on the printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalJobRequest {
    pub file_name: String,
    pub leveling_before_print: bool,
    pub material_mappings: Option<Vec<MaterialMapping>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub start_now: bool,
    pub leveling_before_print: bool,
    pub material_mappings: Option<Vec<MaterialMapping>>,
}

/// G-code channel shared by every printer generation.
#[async_trait]
pub trait LegacyClient: Send + Sync {
    async fn printer_info(&self) -> Result<LegacyPrinterInfo>;
    async fn temperatures(&self) -> Result<LegacyTemperatures>;
    async fn machine_status(&self) -> Result<LegacyMachineStatus>;
    async fn print_progress(&self) -> Result<LegacyProgress>;
    async fn pause(&self) -> Result<bool>;
    async fn resume(&self) -> Result<bool>;
    async fn cancel(&self) -> Result<bool>;
    async fn start_local_job(&self, file_name: &str) -> Result<bool>;
    async fn list_local_files(&self) -> Result<Vec<String>>;
    async fn set_led(&self, on: bool) -> Result<bool>;
    /// Send a command verbatim and return the raw reply.
    async fn send_raw(&self, command: &str) -> Result<String>;
    async fn disconnect(&self) -> Result<()>;
}

/// HTTP API spoken by current-generation printers.
#[async_trait]
pub trait ModernClient: Send + Sync {
    async fn detail(&self) -> Result<ModernDetail>;
    async fn job_control(&self, action: JobAction) -> Result<bool>;
    async fn start_local_job(&self, request: &LocalJobRequest) -> Result<bool>;
    async fn upload_file(&self, path: &Path, request: &UploadRequest) -> Result<bool>;
    async fn recent_files(&self) -> Result<Vec<String>>;
    async fn local_files(&self) -> Result<Vec<String>>;
    async fn set_led(&self, on: bool) -> Result<bool>;
    async fn set_filtration(&self, mode: FiltrationMode) -> Result<bool>;
    async fn disconnect(&self) -> Result<()>;
}

/// Opens protocol clients. Abstracted so connection flows can be exercised
/// without real printers.
#[async_trait]
pub trait PrinterConnector: Send + Sync {
    async fn connect_legacy(&self, ip: IpAddr) -> Result<Arc<dyn LegacyClient>>;
    async fn connect_modern(
        &self,
        ip: IpAddr,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ModernClient>>;
}

/// Connector that talks to real printers over the LAN.
pub struct NetworkConnector {
    legacy_port: u16,
    modern_port: u16,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl NetworkConnector {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            legacy_port: config.legacy_port,
            modern_port: config.modern_port,
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        }
    }
}

#[async_trait]
impl PrinterConnector for NetworkConnector {
    async fn connect_legacy(&self, ip: IpAddr) -> Result<Arc<dyn LegacyClient>> {
        let address = SocketAddr::new(ip, self.legacy_port);
        let client =
            TcpLegacyClient::connect(address, self.connect_timeout, self.command_timeout).await?;
        Ok(Arc::new(client))
    }

    async fn connect_modern(
        &self,
        ip: IpAddr,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ModernClient>> {
        let base_url = format!("http://{}", SocketAddr::new(ip, self.modern_port));
        let client = HttpModernClient::new(base_url, credentials.clone(), self.command_timeout);
        // Validates the check code before any backend is built on top of it.
        client.detail().await?;
        Ok(Arc::new(client))
    }
}
