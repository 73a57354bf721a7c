use crate::context::PrinterSettings;
use serde::{Deserialize, Serialize};

/// Printer model classification derived from the M115 machine type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrinterFamily {
    Adventurer5MPro,
    Adventurer5M,
    Ad5x,
    Legacy,
}

impl PrinterFamily {
    pub fn detect(machine_type: &str) -> Self {
        let normalized = machine_type.to_ascii_uppercase();
        if normalized.contains("AD5X") {
            PrinterFamily::Ad5x
        } else if normalized.contains("5M PRO") {
            PrinterFamily::Adventurer5MPro
        } else if normalized.contains("5M") {
            PrinterFamily::Adventurer5M
        } else {
            PrinterFamily::Legacy
        }
    }

    /// Whether the printer speaks the HTTP API (and therefore needs a check code).
    pub fn is_modern(&self) -> bool {
        !matches!(self, PrinterFamily::Legacy)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PrinterFamily::Adventurer5MPro => "Adventurer 5M Pro",
            PrinterFamily::Adventurer5M => "Adventurer 5M",
            PrinterFamily::Ad5x => "AD5X",
            PrinterFamily::Legacy => "Legacy FlashForge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    Legacy,
    DualProtocol,
    MaterialStation,
}

impl BackendKind {
    pub fn for_family(family: PrinterFamily, force_legacy: bool) -> Self {
        if force_legacy {
            return BackendKind::Legacy;
        }
        match family {
            PrinterFamily::Ad5x => BackendKind::MaterialStation,
            PrinterFamily::Adventurer5M | PrinterFamily::Adventurer5MPro => BackendKind::DualProtocol,
            PrinterFamily::Legacy => BackendKind::Legacy,
        }
    }

    pub fn uses_modern_api(&self) -> bool {
        !matches!(self, BackendKind::Legacy)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraCapability {
    pub builtin: bool,
    pub custom_enabled: bool,
    pub custom_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedCapability {
    pub builtin: bool,
    pub custom_control_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiltrationCapability {
    pub available: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialStationCapability {
    pub available: bool,
    pub slot_count: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManagementCapability {
    pub local_jobs: bool,
    pub recent_jobs: bool,
    pub start_jobs: bool,
    pub upload_jobs: bool,
    pub job_control: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMonitoringCapability {
    #[serde(rename = "usesNewAPI")]
    pub uses_new_api: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcodeCapability {
    pub available: bool,
}

/// Feature flags for one context. Fixed once the backend is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    pub camera: CameraCapability,
    pub led: LedCapability,
    pub filtration: FiltrationCapability,
    pub material_station: MaterialStationCapability,
    pub job_management: JobManagementCapability,
    pub status_monitoring: StatusMonitoringCapability,
    pub gcode_commands: GcodeCapability,
}

impl BackendCapabilities {
    pub fn derive(
        family: PrinterFamily,
        kind: BackendKind,
        settings: &PrinterSettings,
        has_legacy_client: bool,
    ) -> Self {
        let modern = kind.uses_modern_api();

        let custom_url = settings
            .custom_camera_url
            .clone()
            .filter(|url| !url.trim().is_empty());

        Self {
            camera: CameraCapability {
                builtin: modern && family == PrinterFamily::Adventurer5MPro,
                custom_enabled: settings.custom_camera_enabled && custom_url.is_some(),
                custom_url,
            },
            led: LedCapability {
                builtin: modern,
                // Custom LED control drives M146 over the G-code channel.
                custom_control_enabled: settings.custom_led_control && has_legacy_client,
            },
            filtration: FiltrationCapability {
                available: modern && family == PrinterFamily::Adventurer5MPro,
            },
            material_station: MaterialStationCapability {
                available: kind == BackendKind::MaterialStation,
                slot_count: if kind == BackendKind::MaterialStation { 4 } else { 0 },
            },
            job_management: JobManagementCapability {
                local_jobs: true,
                recent_jobs: modern,
                start_jobs: true,
                upload_jobs: modern,
                job_control: true,
            },
            status_monitoring: StatusMonitoringCapability { uses_new_api: modern },
            gcode_commands: GcodeCapability {
                available: has_legacy_client,
            },
        }
    }

    pub fn led_available(&self) -> bool {
        self.led.builtin || self.led.custom_control_enabled
    }

    pub fn camera_available(&self) -> bool {
        self.camera.builtin || self.camera.custom_enabled
    }
}
