use crate::protocol::{
    FiltrationMode, LegacyMachineStatus, LegacyProgress, LegacyTemperatures, MaterialStationInfo,
    ModernDetail, TempReading,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Ready,
    Busy,
    Heating,
    Calibrating,
    Printing,
    Paused,
    Completed,
    Cancelled,
    Error,
    Unknown,
}

impl MachineState {
    pub fn from_modern(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "ready" => MachineState::Ready,
            "busy" => MachineState::Busy,
            "heating" => MachineState::Heating,
            "calibrate_doing" => MachineState::Calibrating,
            "printing" => MachineState::Printing,
            "paused" | "pausing" => MachineState::Paused,
            "completed" => MachineState::Completed,
            "cancel" | "cancelled" => MachineState::Cancelled,
            "error" => MachineState::Error,
            _ => MachineState::Unknown,
        }
    }

    pub fn from_legacy(machine_status: &str, move_mode: &str) -> Self {
        let move_mode = move_mode.to_ascii_uppercase();
        match machine_status.to_ascii_uppercase().as_str() {
            "READY" => MachineState::Ready,
            "BUILDING_FROM_SD" if move_mode == "PAUSED" => MachineState::Paused,
            "BUILDING_FROM_SD" => MachineState::Printing,
            "BUILDING_COMPLETED" => MachineState::Completed,
            "PAUSED" => MachineState::Paused,
            "BUSY" => MachineState::Busy,
            "HEATING" => MachineState::Heating,
            "ERROR" => MachineState::Error,
            _ => MachineState::Unknown,
        }
    }

    pub fn is_job_active(&self) -> bool {
        matches!(
            self,
            MachineState::Printing | MachineState::Paused | MachineState::Heating | MachineState::Calibrating
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Temperatures {
    pub extruder: TempReading,
    pub bed: TempReading,
    pub chamber: Option<TempReading>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub file_name: Option<String>,
    /// 0-100.
    pub progress_percent: f64,
    pub current_layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub elapsed_secs: Option<u64>,
    pub remaining_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialSlot {
    pub slot_id: u8,
    pub loaded: bool,
    pub material_name: Option<String>,
    pub material_color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialStationStatus {
    pub connected: bool,
    pub active_slot: Option<u8>,
    pub slots: Vec<MaterialSlot>,
}

impl MaterialStationStatus {
    pub fn from_info(info: &MaterialStationInfo) -> Self {
        let slots = (1..=info.slot_cnt)
            .map(|slot_id| {
                let reported = info.slot_infos.iter().find(|s| s.slot_id == slot_id);
                MaterialSlot {
                    slot_id,
                    loaded: reported.map_or(false, |s| s.has_filament),
                    material_name: reported
                        .map(|s| s.material_name.clone())
                        .filter(|n| !n.is_empty()),
                    material_color: reported
                        .map(|s| s.material_color.clone())
                        .filter(|c| !c.is_empty()),
                }
            })
            .collect();

        Self {
            connected: info.slot_cnt > 0,
            active_slot: (info.current_slot > 0).then_some(info.current_slot),
            slots,
        }
    }

    pub fn slot(&self, slot_id: u8) -> Option<&MaterialSlot> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }
}

/// Normalized status snapshot published for every context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterStatus {
    pub machine_state: MachineState,
    /// State string exactly as the printer reported it.
    pub raw_state: String,
    pub temperatures: Temperatures,
    pub job: Option<JobProgress>,
    pub material_station: Option<MaterialStationStatus>,
    pub led_on: Option<bool>,
    pub filtration: Option<FiltrationMode>,
    pub updated_at: DateTime<Utc>,
}

impl PrinterStatus {
    pub fn from_legacy(
        status: &LegacyMachineStatus,
        temps: &LegacyTemperatures,
        progress: Option<&LegacyProgress>,
    ) -> Self {
        let machine_state = MachineState::from_legacy(&status.machine_status, &status.move_mode);

        let job = if machine_state.is_job_active() || machine_state == MachineState::Completed {
            Some(JobProgress {
                file_name: status.current_file.clone(),
                progress_percent: progress.map_or(0.0, |p| p.percent),
                current_layer: progress.and_then(|p| p.layer).map(|(current, _)| current),
                total_layers: progress.and_then(|p| p.layer).map(|(_, total)| total),
                elapsed_secs: None,
                remaining_secs: None,
            })
        } else {
            None
        };

        Self {
            machine_state,
            raw_state: status.machine_status.clone(),
            temperatures: Temperatures {
                extruder: temps.extruder,
                bed: temps.bed,
                chamber: None,
            },
            job,
            material_station: None,
            led_on: Some(status.led_on),
            filtration: None,
            updated_at: Utc::now(),
        }
    }

    pub fn from_modern(detail: &ModernDetail) -> Self {
        let raw_state = detail.status.clone().unwrap_or_default();
        let machine_state = MachineState::from_modern(&raw_state);

        let job = if machine_state.is_job_active() || machine_state == MachineState::Completed {
            let elapsed = detail.print_duration;
            Some(JobProgress {
                file_name: detail.print_file_name.clone().filter(|n| !n.is_empty()),
                progress_percent: (detail.print_progress.unwrap_or(0.0) * 100.0).clamp(0.0, 100.0),
                current_layer: detail.print_layer,
                total_layers: detail.target_print_layer,
                elapsed_secs: elapsed,
                remaining_secs: detail
                    .estimated_time
                    .filter(|t| *t > 0.0)
                    .map(|t| t.round() as u64),
            })
        } else {
            None
        };

        let chamber = detail.chamber_temp.map(|current| TempReading {
            current,
            target: detail.chamber_target_temp.unwrap_or(0.0),
        });

        let filtration = match (
            detail.internal_fan_status.as_deref(),
            detail.external_fan_status.as_deref(),
        ) {
            (Some("open"), _) => Some(FiltrationMode::Internal),
            (_, Some("open")) => Some(FiltrationMode::External),
            (Some(_), _) | (_, Some(_)) => Some(FiltrationMode::Off),
            _ => None,
        };

        Self {
            machine_state,
            raw_state,
            temperatures: Temperatures {
                extruder: TempReading {
                    current: detail.left_temp.unwrap_or(0.0),
                    target: detail.left_target_temp.unwrap_or(0.0),
                },
                bed: TempReading {
                    current: detail.plat_temp.unwrap_or(0.0),
                    target: detail.plat_target_temp.unwrap_or(0.0),
                },
                chamber,
            },
            job,
            material_station: detail
                .matl_station_info
                .as_ref()
                .map(MaterialStationStatus::from_info),
            led_on: detail.light_status.as_deref().map(|s| s == "open"),
            filtration,
            updated_at: Utc::now(),
        }
    }
}
