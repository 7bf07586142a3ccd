//! Combines per-module readings into pack quantities along the SxPy topology.
//!
//! Voltages add up along a string and are averaged across the parallel copies
//! of each series position. Currents add up across strings. Positions or
//! strings without fresh data are left out and recorded as
//! [`DataQualityIssue`]s, never counted as zero.

use crate::alarms;
use crate::config::{BridgeConfig, CurrentSourcePolicy, SocPolicy};
use crate::protocol::{CellVoltages, ModuleId, ModuleStatus};
use crate::registry::{FieldGroup, ModuleState, PackRecord, RegistrySnapshot};
use crate::state::{
    BmsReadings, CellExtreme, CurrentSource, DataQualityIssue, PackField, PackState,
    TemperatureExtreme,
};
use crate::topology::{PackTopology, Position};
use std::time::Instant;

/// Aggregate plus alarm evaluation: the full pack state at `now`.
pub fn pack_state(config: &BridgeConfig, snapshot: &RegistrySnapshot, now: Instant) -> PackState {
    let mut state = aggregate(config, snapshot, now);
    alarms::evaluate(&mut state, config, snapshot, now);
    state
}

/// Fresh data of one in-topology module.
struct ModuleView<'a> {
    id: ModuleId,
    position: Position,
    cells: Option<&'a CellVoltages>,
    status: Option<&'a ModuleStatus>,
}

fn fresh_views<'a>(
    config: &BridgeConfig,
    snapshot: &'a RegistrySnapshot,
    now: Instant,
) -> Vec<ModuleView<'a>> {
    let staleness = &config.staleness;
    snapshot
        .modules
        .values()
        .filter_map(|module| {
            let position = config.topology.position(module.id)?;
            Some(ModuleView {
                id: module.id,
                position,
                cells: module
                    .cell_voltages
                    .as_ref()
                    .and_then(|cells| cells.fresh(now, staleness.module_cell_voltages)),
                status: module
                    .status
                    .as_ref()
                    .and_then(|status| status.fresh(now, staleness.module_status)),
            })
        })
        .collect()
}

/// Whether any field group of `module` arrived within its deadline.
fn recently_heard(config: &BridgeConfig, module: &ModuleState, now: Instant) -> bool {
    FieldGroup::MODULE.iter().any(|&group| {
        match (module.updated(group), config.staleness.deadline(group)) {
            (Some(updated), Some(deadline)) => now.saturating_duration_since(updated) <= deadline,
            _ => false,
        }
    })
}

fn mean(values: impl IntoIterator<Item = f32>) -> Option<f32> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0u32), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f32)
}

fn pack_voltage(
    topology: &PackTopology,
    views: &[ModuleView],
    issues: &mut Vec<DataQualityIssue>,
) -> Option<f32> {
    let cells = topology.cells_per_module();
    let mut total = None;
    for position in 1..=topology.series() {
        let average = mean(
            views
                .iter()
                .filter(|module| module.position.series == position)
                .filter_map(|module| module.cells)
                .map(|voltages| voltages.module_voltage(cells)),
        );
        match average {
            Some(voltage) => *total.get_or_insert(0.0) += voltage,
            None => issues.push(DataQualityIssue::MissingSeriesPosition {
                position,
                field: PackField::Voltage,
            }),
        }
    }
    total
}

fn pack_current(
    config: &BridgeConfig,
    pack: &PackRecord,
    views: &[ModuleView],
    now: Instant,
    issues: &mut Vec<DataQualityIssue>,
) -> (Option<f32>, Option<CurrentSource>) {
    let modules_report_current = views
        .iter()
        .any(|module| module.status.and_then(|status| status.current).is_some());
    let source = match config.current_source {
        CurrentSourcePolicy::Auto if modules_report_current => CurrentSource::Modules,
        CurrentSourcePolicy::Auto => CurrentSource::PackFrame,
        CurrentSourcePolicy::Modules => CurrentSource::Modules,
        CurrentSourcePolicy::PackFrame => CurrentSource::PackFrame,
    };

    let current = match source {
        CurrentSource::Modules => {
            let mut total = None;
            for string in 0..config.topology.parallel() {
                // series modules carry the same current; average their sensors
                let average = mean(
                    views
                        .iter()
                        .filter(|module| module.position.string == string)
                        .filter_map(|module| module.status?.current),
                );
                match average {
                    Some(current) => *total.get_or_insert(0.0) += current,
                    None => issues.push(DataQualityIssue::MissingString {
                        string,
                        field: PackField::Current,
                    }),
                }
            }
            total
        }
        CurrentSource::PackFrame => pack
            .current
            .as_ref()
            .and_then(|current| current.fresh(now, config.staleness.pack_frames))
            .map(|current| current.current),
    };
    (current, current.map(|_| source))
}

fn pack_soc(
    config: &BridgeConfig,
    views: &[ModuleView],
    issues: &mut Vec<DataQualityIssue>,
) -> Option<f32> {
    match config.soc_policy {
        SocPolicy::MinimumModule => views
            .iter()
            .filter_map(|module| module.status)
            .map(|status| status.soc_percent)
            .reduce(f32::min),
        SocPolicy::MinimumSeriesPosition => {
            let mut lowest: Option<f32> = None;
            for position in 1..=config.topology.series() {
                let average = mean(
                    views
                        .iter()
                        .filter(|module| module.position.series == position)
                        .filter_map(|module| module.status)
                        .map(|status| status.soc_percent),
                );
                match average {
                    Some(soc) => lowest = Some(lowest.map_or(soc, |lowest| lowest.min(soc))),
                    None => issues.push(DataQualityIssue::MissingSeriesPosition {
                        position,
                        field: PackField::Soc,
                    }),
                }
            }
            lowest
        }
    }
}

/// Views are ordered by module ID, so strict comparisons keep the lowest ID on ties.
fn cell_extremes(
    topology: &PackTopology,
    views: &[ModuleView],
) -> (Option<CellExtreme>, Option<CellExtreme>) {
    let mut min: Option<CellExtreme> = None;
    let mut max: Option<CellExtreme> = None;
    for module in views {
        let Some(voltages) = module.cells else {
            continue;
        };
        for (index, value) in voltages
            .cells
            .iter()
            .take(topology.cells_per_module())
            .enumerate()
        {
            let candidate = CellExtreme {
                value: *value,
                module: module.id,
                cell: index as u8 + 1,
            };
            if min.map_or(true, |min| candidate.value < min.value) {
                min = Some(candidate);
            }
            if max.map_or(true, |max| candidate.value > max.value) {
                max = Some(candidate);
            }
        }
    }
    (min, max)
}

fn temperature_extremes(
    views: &[ModuleView],
) -> (Option<TemperatureExtreme>, Option<TemperatureExtreme>) {
    let mut min: Option<TemperatureExtreme> = None;
    let mut max: Option<TemperatureExtreme> = None;
    for module in views {
        let Some(status) = module.status else {
            continue;
        };
        let candidate = TemperatureExtreme {
            value: status.temperature,
            module: module.id,
        };
        if min.map_or(true, |min| candidate.value < min.value) {
            min = Some(candidate);
        }
        if max.map_or(true, |max| candidate.value > max.value) {
            max = Some(candidate);
        }
    }
    (min, max)
}

fn bms_readings(config: &BridgeConfig, pack: &PackRecord, now: Instant) -> BmsReadings {
    let deadline = config.staleness.pack_frames;
    let status = pack.status.as_ref().and_then(|s| s.fresh(now, deadline));
    let alarms = pack.alarms.as_ref().and_then(|s| s.fresh(now, deadline));
    BmsReadings {
        soc: status.map(|status| status.soc_percent),
        voltage: pack
            .voltage
            .as_ref()
            .and_then(|s| s.fresh(now, deadline))
            .map(|voltage| voltage.voltage),
        current: pack
            .current
            .as_ref()
            .and_then(|s| s.fresh(now, deadline))
            .map(|current| current.current),
        operating_mode: status.and_then(|status| status.mode),
        charge_complete: status.map(|status| status.charge_complete),
        modules_balancing: status.and_then(|status| status.modules_balancing),
        shutdown_reason: alarms.map(|alarms| alarms.shutdown_reason),
        identity: pack.identity.map(|identity| identity.value),
    }
}

/// Measured quantities only; alarms and staleness are left to [`alarms::evaluate`].
pub fn aggregate(config: &BridgeConfig, snapshot: &RegistrySnapshot, now: Instant) -> PackState {
    let topology = &config.topology;
    let mut state = PackState::empty(topology);

    // a stray identifier is reported while it keeps arriving, not forever
    state.issues.extend(
        snapshot
            .modules
            .values()
            .filter(|module| !topology.contains(module.id))
            .filter(|module| recently_heard(config, module, now))
            .map(|module| DataQualityIssue::UnassignedModule { module: module.id }),
    );

    let views = fresh_views(config, snapshot, now);
    state.voltage = pack_voltage(topology, &views, &mut state.issues);
    (state.current, state.current_source) =
        pack_current(config, &snapshot.pack, &views, now, &mut state.issues);
    state.soc = pack_soc(config, &views, &mut state.issues);
    state.remaining_capacity_ah = state.soc.map(|soc| topology.capacity_ah() * soc / 100.0);
    (state.min_cell_voltage, state.max_cell_voltage) = cell_extremes(topology, &views);
    (state.min_temperature, state.max_temperature) = temperature_extremes(&views);
    state.modules_online = views
        .iter()
        .filter(|module| module.cells.is_some() || module.status.is_some())
        .count() as u8;
    state.bms = bms_readings(config, &snapshot.pack, now);
    state
}
