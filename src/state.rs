//! The aggregate handed to publishers. Rebuilt from scratch every cycle.

use crate::alarms::{Alarm, AlarmKind};
use crate::protocol::{BmsIdentity, ModuleId, OperatingMode};
use crate::topology::PackTopology;
use serde::Serialize;

/// Lowest or highest cell voltage and where it was measured (cell is 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellExtreme {
    pub value: f32,
    pub module: ModuleId,
    pub cell: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureExtreme {
    pub value: f32,
    pub module: ModuleId,
}

/// Pack level quantities that can be missing or stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackField {
    Voltage,
    Current,
    Soc,
    CellVoltages,
    Temperatures,
    BmsStatus,
    BmsCurrent,
    BmsVoltage,
    BmsAlarms,
}

/// Why an aggregate is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "issue", rename_all = "kebab-case")]
pub enum DataQualityIssue {
    /// No fresh value for `field` from any parallel copy at this series position.
    MissingSeriesPosition { position: u8, field: PackField },
    /// No fresh value for `field` from any module of this parallel string.
    MissingString { string: u8, field: PackField },
    /// Frames for a module ID outside the configured topology.
    UnassignedModule { module: ModuleId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CurrentSource {
    Modules,
    PackFrame,
}

/// Values as reported by the BMS in its own pack frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BmsReadings {
    pub soc: Option<u8>,
    pub voltage: Option<f32>,
    pub current: Option<f32>,
    pub operating_mode: Option<OperatingMode>,
    pub charge_complete: Option<bool>,
    pub modules_balancing: Option<u8>,
    pub shutdown_reason: Option<u8>,
    pub identity: Option<BmsIdentity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackState {
    /// Sum over series positions of the averaged module voltages.
    pub voltage: Option<f32>,
    /// Positive while charging.
    pub current: Option<f32>,
    pub current_source: Option<CurrentSource>,
    pub soc: Option<f32>,
    pub installed_capacity_ah: f32,
    pub remaining_capacity_ah: Option<f32>,
    pub max_charge_voltage: f32,
    pub min_cell_voltage: Option<CellExtreme>,
    pub max_cell_voltage: Option<CellExtreme>,
    pub min_temperature: Option<TemperatureExtreme>,
    pub max_temperature: Option<TemperatureExtreme>,
    pub bms: BmsReadings,
    pub modules_expected: u8,
    pub modules_online: u8,
    pub alarms: Vec<Alarm>,
    pub stale: Vec<PackField>,
    pub issues: Vec<DataQualityIssue>,
    /// No stale field and no lost communication.
    pub fresh: bool,
}

impl PackState {
    /// Everything unknown, as before the first frame.
    pub fn empty(topology: &PackTopology) -> Self {
        Self {
            voltage: None,
            current: None,
            current_source: None,
            soc: None,
            installed_capacity_ah: topology.capacity_ah(),
            remaining_capacity_ah: None,
            max_charge_voltage: topology.max_charge_voltage(),
            min_cell_voltage: None,
            max_cell_voltage: None,
            min_temperature: None,
            max_temperature: None,
            bms: BmsReadings::default(),
            modules_expected: topology.module_count(),
            modules_online: 0,
            alarms: Vec::new(),
            stale: Vec::new(),
            issues: Vec::new(),
            fresh: false,
        }
    }

    pub fn is_stale(&self, field: PackField) -> bool {
        self.stale.contains(&field)
    }

    pub fn is_complete(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn has_alarm(&self, kind: AlarmKind) -> bool {
        self.alarms.iter().any(|alarm| alarm.kind == kind)
    }

    pub fn cell_imbalance(&self) -> Option<f32> {
        Some(self.max_cell_voltage?.value - self.min_cell_voltage?.value)
    }
}
