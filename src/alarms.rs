//! Alarm evaluation over one aggregation cycle.
//!
//! Alarms are level triggered: every cycle starts from an empty set, so an
//! alarm disappears as soon as its condition does. One alarm is kept per
//! kind and scope, at the highest level any source raised it with.

use crate::config::{AlarmThresholds, BridgeConfig, StalenessDeadlines};
use crate::protocol::{CurrentPcbFlags, ModuleId, VoltageTemperatureFlags};
use crate::registry::{FieldGroup, PackRecord, RegistrySnapshot};
use crate::state::{DataQualityIssue, PackField, PackState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlarmKind {
    LowCellVoltage,
    HighCellVoltage,
    CellImbalance,
    LowCellTemperature,
    HighCellTemperature,
    LowPackVoltage,
    HighPackVoltage,
    HighChargeCurrent,
    HighDischargeCurrent,
    HighPcbTemperature,
    InternalFailure,
    LowSoc,
    /// A field group exceeded its staleness deadline.
    DataStale(FieldGroup),
    /// No expected module delivered fresh data.
    CommunicationLost,
    /// Frames for a module ID outside the topology.
    TopologyViolation,
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlarmKind::LowCellVoltage => write!(f, "Cell voltage low"),
            AlarmKind::HighCellVoltage => write!(f, "Cell voltage high"),
            AlarmKind::CellImbalance => write!(f, "Cell imbalance"),
            AlarmKind::LowCellTemperature => write!(f, "Cell temperature low"),
            AlarmKind::HighCellTemperature => write!(f, "Cell temperature high"),
            AlarmKind::LowPackVoltage => write!(f, "Pack voltage low"),
            AlarmKind::HighPackVoltage => write!(f, "Pack voltage high"),
            AlarmKind::HighChargeCurrent => write!(f, "Charge current high"),
            AlarmKind::HighDischargeCurrent => write!(f, "Discharge current high"),
            AlarmKind::HighPcbTemperature => write!(f, "BMS board temperature high"),
            AlarmKind::InternalFailure => write!(f, "BMS internal failure"),
            AlarmKind::LowSoc => write!(f, "State of charge low"),
            AlarmKind::DataStale(group) => write!(f, "Stale data ({group:?})"),
            AlarmKind::CommunicationLost => write!(f, "Communication lost"),
            AlarmKind::TopologyViolation => write!(f, "Module outside topology"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlarmScope {
    Pack,
    Module(ModuleId),
}

impl fmt::Display for AlarmScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlarmScope::Pack => write!(f, "pack"),
            AlarmScope::Module(module) => write!(f, "module {module}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlarmLevel {
    Warning,
    Alarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Alarm {
    pub kind: AlarmKind,
    pub scope: AlarmScope,
    pub level: AlarmLevel,
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {} ({})", self.level, self.kind, self.scope)
    }
}

#[derive(Default)]
struct AlarmSet(BTreeMap<(AlarmKind, AlarmScope), AlarmLevel>);

impl AlarmSet {
    fn raise(&mut self, kind: AlarmKind, scope: AlarmScope, level: AlarmLevel) {
        let current = self.0.entry((kind, scope)).or_insert(level);
        *current = (*current).max(level);
    }

    fn raise_if(&mut self, condition: bool, kind: AlarmKind, scope: AlarmScope, level: AlarmLevel) {
        if condition {
            self.raise(kind, scope, level);
        }
    }

    fn into_alarms(self) -> Vec<Alarm> {
        self.0
            .into_iter()
            .map(|((kind, scope), level)| Alarm { kind, scope, level })
            .collect()
    }
}

/// Level 1 is a warning, anything above a full alarm.
fn overcurrent_level(level: u8) -> Option<AlarmLevel> {
    match level {
        0 => None,
        1 => Some(AlarmLevel::Warning),
        _ => Some(AlarmLevel::Alarm),
    }
}

fn raise_voltage_temperature(
    alarms: &mut AlarmSet,
    scope: AlarmScope,
    flags: VoltageTemperatureFlags,
) {
    use AlarmKind::*;
    let level = AlarmLevel::Alarm;
    alarms.raise_if(flags.cell_under_temperature(), LowCellTemperature, scope, level);
    alarms.raise_if(flags.cell_over_temperature(), HighCellTemperature, scope, level);
    alarms.raise_if(flags.cell_under_voltage(), LowCellVoltage, scope, level);
    alarms.raise_if(flags.cell_over_voltage(), HighCellVoltage, scope, level);
    alarms.raise_if(flags.pack_under_voltage(), LowPackVoltage, scope, level);
    alarms.raise_if(flags.pack_over_voltage(), HighPackVoltage, scope, level);
}

fn raise_current_pcb(alarms: &mut AlarmSet, flags: CurrentPcbFlags) {
    if let Some(level) = overcurrent_level(flags.discharge_overcurrent_level()) {
        alarms.raise(AlarmKind::HighDischargeCurrent, AlarmScope::Pack, level);
    }
    if let Some(level) = overcurrent_level(flags.charge_overcurrent_level()) {
        alarms.raise(AlarmKind::HighChargeCurrent, AlarmScope::Pack, level);
    }
    alarms.raise_if(
        flags.pcb_over_temperature(),
        AlarmKind::HighPcbTemperature,
        AlarmScope::Pack,
        AlarmLevel::Alarm,
    );
}

fn raise_threshold_alarms(alarms: &mut AlarmSet, state: &PackState, thresholds: &AlarmThresholds) {
    use AlarmKind::*;
    if let Some(min) = state.min_cell_voltage {
        alarms.raise_if(
            min.value < thresholds.min_cell_voltage,
            LowCellVoltage,
            AlarmScope::Module(min.module),
            AlarmLevel::Alarm,
        );
    }
    if let Some(max) = state.max_cell_voltage {
        alarms.raise_if(
            max.value > thresholds.max_cell_voltage,
            HighCellVoltage,
            AlarmScope::Module(max.module),
            AlarmLevel::Alarm,
        );
    }
    if let Some(imbalance) = state.cell_imbalance() {
        alarms.raise_if(
            imbalance > thresholds.cell_imbalance,
            CellImbalance,
            AlarmScope::Pack,
            AlarmLevel::Warning,
        );
    }
    if let Some(min) = state.min_temperature {
        alarms.raise_if(
            min.value < thresholds.min_cell_temperature,
            LowCellTemperature,
            AlarmScope::Module(min.module),
            AlarmLevel::Alarm,
        );
    }
    if let Some(max) = state.max_temperature {
        alarms.raise_if(
            max.value > thresholds.max_cell_temperature,
            HighCellTemperature,
            AlarmScope::Module(max.module),
            AlarmLevel::Alarm,
        );
    }
    if let Some(soc) = state.soc {
        alarms.raise_if(soc < thresholds.min_soc, LowSoc, AlarmScope::Pack, AlarmLevel::Warning);
    }
    if let Some(current) = state.current {
        alarms.raise_if(
            current > thresholds.max_charge_current,
            HighChargeCurrent,
            AlarmScope::Pack,
            AlarmLevel::Alarm,
        );
        alarms.raise_if(
            -current > thresholds.max_discharge_current,
            HighDischargeCurrent,
            AlarmScope::Pack,
            AlarmLevel::Alarm,
        );
    }
}

/// A group that was never received counts as stale.
fn is_fresh(updated: Option<Instant>, deadline: Option<Duration>, now: Instant) -> bool {
    match (updated, deadline) {
        (Some(updated), Some(deadline)) => now.saturating_duration_since(updated) <= deadline,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Pack frames are optional on the bus: only a group that was seen can go stale.
fn stale_pack_groups<'a>(
    pack: &'a PackRecord,
    deadlines: &'a StalenessDeadlines,
    now: Instant,
) -> impl Iterator<Item = FieldGroup> + 'a {
    FieldGroup::PACK.into_iter().filter(move |group| {
        let updated = pack.updated(*group);
        updated.is_some() && !is_fresh(updated, deadlines.deadline(*group), now)
    })
}

fn stale_fields(
    state: &PackState,
    pack: &PackRecord,
    deadlines: &StalenessDeadlines,
    now: Instant,
) -> Vec<PackField> {
    let mut stale = Vec::new();
    if state.voltage.is_none() {
        stale.push(PackField::Voltage);
    }
    if state.current.is_none() {
        stale.push(PackField::Current);
    }
    if state.soc.is_none() {
        stale.push(PackField::Soc);
    }
    if state.min_cell_voltage.is_none() {
        stale.push(PackField::CellVoltages);
    }
    if state.min_temperature.is_none() {
        stale.push(PackField::Temperatures);
    }
    stale.extend(stale_pack_groups(pack, deadlines, now).map(|group| match group {
        FieldGroup::PackStatus => PackField::BmsStatus,
        FieldGroup::PackCurrent => PackField::BmsCurrent,
        FieldGroup::PackVoltage => PackField::BmsVoltage,
        _ => PackField::BmsAlarms,
    }));
    stale
}

/// Fills `alarms`, `stale` and `fresh` of an aggregated state.
pub fn evaluate(
    state: &mut PackState,
    config: &BridgeConfig,
    snapshot: &RegistrySnapshot,
    now: Instant,
) {
    let topology = &config.topology;
    let deadlines = &config.staleness;
    let mut alarms = AlarmSet::default();

    for issue in &state.issues {
        if let DataQualityIssue::UnassignedModule { module } = issue {
            alarms.raise(
                AlarmKind::TopologyViolation,
                AlarmScope::Module(*module),
                AlarmLevel::Warning,
            );
        }
    }

    if let Some(flags) = snapshot
        .pack
        .alarms
        .as_ref()
        .and_then(|alarms| alarms.fresh(now, deadlines.pack_frames))
    {
        raise_voltage_temperature(&mut alarms, AlarmScope::Pack, flags.voltage_and_temperature);
        raise_current_pcb(&mut alarms, flags.current_and_pcb);
        alarms.raise_if(
            flags.internal_errors != 0,
            AlarmKind::InternalFailure,
            AlarmScope::Pack,
            AlarmLevel::Alarm,
        );
    }
    for module in snapshot.modules.values().filter(|m| topology.contains(m.id)) {
        if let Some(status) = module
            .status
            .as_ref()
            .and_then(|status| status.fresh(now, deadlines.module_status))
        {
            raise_voltage_temperature(&mut alarms, AlarmScope::Module(module.id), status.alarms);
        }
    }

    let mut stale_module_groups = Vec::new();
    let mut silent_modules = 0;
    for id in topology.module_ids() {
        let module = snapshot.modules.get(&id);
        let stale: Vec<FieldGroup> = FieldGroup::MODULE
            .into_iter()
            .filter(|group| {
                let updated = module.and_then(|module| module.updated(*group));
                !is_fresh(updated, deadlines.deadline(*group), now)
            })
            .collect();
        if stale.len() == FieldGroup::MODULE.len() {
            silent_modules += 1;
        }
        stale_module_groups.extend(stale.into_iter().map(|group| (id, group)));
    }
    // a silent bus is one alarm, not one warning per module
    let communication_lost = silent_modules == topology.module_ids().count();
    if communication_lost {
        alarms.raise(
            AlarmKind::CommunicationLost,
            AlarmScope::Pack,
            AlarmLevel::Alarm,
        );
    } else {
        for (id, group) in stale_module_groups {
            alarms.raise(
                AlarmKind::DataStale(group),
                AlarmScope::Module(id),
                AlarmLevel::Warning,
            );
        }
    }
    for group in stale_pack_groups(&snapshot.pack, deadlines, now) {
        alarms.raise(
            AlarmKind::DataStale(group),
            AlarmScope::Pack,
            AlarmLevel::Warning,
        );
    }

    raise_threshold_alarms(&mut alarms, state, &config.thresholds);

    state.stale = stale_fields(state, &snapshot.pack, deadlines, now);
    state.fresh = state.stale.is_empty() && !communication_lost;
    state.alarms = alarms.into_alarms();
}
