use super::status::MaterialStationStatus;
use crate::errors::{DaemonError, Result};
use crate::protocol::MaterialMapping;
use std::collections::HashSet;

/// Extruder tools a single job may reference on the material station.
pub const MAX_TOOLS: u8 = 4;

/// Check tool → slot mappings against the station's current slots.
///
/// Fails on the first problem with a message naming the offending tool/slot.
pub fn validate_mappings(mappings: &[MaterialMapping], station: &MaterialStationStatus) -> Result<()> {
    if mappings.is_empty() {
        return Err(DaemonError::Validation(
            "Material station job requires at least one tool mapping".to_string(),
        ));
    }
    if !station.connected {
        return Err(DaemonError::Validation(
            "Material station is not connected".to_string(),
        ));
    }

    let mut tools = HashSet::new();
    for mapping in mappings {
        if mapping.tool_id >= MAX_TOOLS {
            return Err(DaemonError::Validation(format!(
                "Tool {} is out of range (0-{})",
                mapping.tool_id,
                MAX_TOOLS - 1
            )));
        }
        if !tools.insert(mapping.tool_id) {
            return Err(DaemonError::Validation(format!(
                "Tool {} is mapped more than once",
                mapping.tool_id
            )));
        }

        let slot = station.slot(mapping.slot_id).ok_or_else(|| {
            DaemonError::Validation(format!(
                "Tool {} references slot {} but the station has slots 1-{}",
                mapping.tool_id,
                mapping.slot_id,
                station.slots.len()
            ))
        })?;

        if !slot.loaded {
            return Err(DaemonError::Validation(format!(
                "Tool {} references slot {} which has no filament loaded",
                mapping.tool_id, mapping.slot_id
            )));
        }

        for color in [&mapping.tool_material_color, &mapping.slot_material_color] {
            if !is_hex_color(color) {
                return Err(DaemonError::Validation(format!(
                    "Tool {} has invalid color '{}' (expected #RRGGBB)",
                    mapping.tool_id, color
                )));
            }
        }
    }

    Ok(())
}

fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}
