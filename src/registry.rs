//! Last decoded value of every field group, per module and for the pack frames.
//!
//! One writer (frame ingestion) and any number of readers (aggregation).
//! A field group is replaced as a whole under the write lock, so a
//! [`RegistrySnapshot`] never holds a half-written group.

use crate::protocol::{
    BmsIdentity, CellVoltages, ModuleId, ModuleStatus, PackAlarms, PackCurrent, PackStatus,
    PackVoltage,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Data categories that age independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldGroup {
    CellVoltages,
    ModuleStatus,
    PackStatus,
    PackCurrent,
    PackVoltage,
    PackAlarms,
    Identity,
}

impl FieldGroup {
    pub const MODULE: [FieldGroup; 2] = [FieldGroup::CellVoltages, FieldGroup::ModuleStatus];
    pub const PACK: [FieldGroup; 4] = [
        FieldGroup::PackStatus,
        FieldGroup::PackCurrent,
        FieldGroup::PackVoltage,
        FieldGroup::PackAlarms,
    ];
}

/// A value together with the arrival time of the frame it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub updated: Instant,
}

impl<T> Stamped<T> {
    pub fn new(value: T, updated: Instant) -> Self {
        Self { value, updated }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.updated)
    }

    pub fn is_fresh(&self, now: Instant, deadline: Duration) -> bool {
        self.age(now) <= deadline
    }

    /// The value, if it is not older than `deadline`.
    pub fn fresh(&self, now: Instant, deadline: Duration) -> Option<&T> {
        self.is_fresh(now, deadline).then_some(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleState {
    pub id: ModuleId,
    pub cell_voltages: Option<Stamped<CellVoltages>>,
    pub status: Option<Stamped<ModuleStatus>>,
}

impl ModuleState {
    fn new(id: ModuleId) -> Self {
        Self {
            id,
            cell_voltages: None,
            status: None,
        }
    }

    /// Arrival time of the last update of `group`, `None` for pack groups.
    pub fn updated(&self, group: FieldGroup) -> Option<Instant> {
        match group {
            FieldGroup::CellVoltages => self.cell_voltages.map(|cells| cells.updated),
            FieldGroup::ModuleStatus => self.status.map(|status| status.updated),
            _ => None,
        }
    }

    pub fn last_seen(&self) -> Option<Instant> {
        FieldGroup::MODULE
            .iter()
            .filter_map(|group| self.updated(*group))
            .max()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackRecord {
    pub status: Option<Stamped<PackStatus>>,
    pub current: Option<Stamped<PackCurrent>>,
    pub voltage: Option<Stamped<PackVoltage>>,
    pub alarms: Option<Stamped<PackAlarms>>,
    pub identity: Option<Stamped<BmsIdentity>>,
}

impl PackRecord {
    pub fn updated(&self, group: FieldGroup) -> Option<Instant> {
        match group {
            FieldGroup::PackStatus => self.status.map(|s| s.updated),
            FieldGroup::PackCurrent => self.current.map(|s| s.updated),
            FieldGroup::PackVoltage => self.voltage.map(|s| s.updated),
            FieldGroup::PackAlarms => self.alarms.map(|s| s.updated),
            FieldGroup::Identity => self.identity.map(|s| s.updated),
            FieldGroup::CellVoltages | FieldGroup::ModuleStatus => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModuleUpdate {
    CellVoltages(CellVoltages),
    Status(ModuleStatus),
}

impl ModuleUpdate {
    pub fn group(&self) -> FieldGroup {
        match self {
            ModuleUpdate::CellVoltages(_) => FieldGroup::CellVoltages,
            ModuleUpdate::Status(_) => FieldGroup::ModuleStatus,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PackUpdate {
    Status(PackStatus),
    Current(PackCurrent),
    Voltage(PackVoltage),
    Alarms(PackAlarms),
    Identity(BmsIdentity),
}

/// Consistent copy of the registry at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub modules: BTreeMap<ModuleId, ModuleState>,
    pub pack: PackRecord,
}

/// Owned by one bridge instance; there is no process-wide registry.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: RwLock<BTreeMap<ModuleId, ModuleState>>,
    pack: RwLock<PackRecord>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces one field group of `module`, creating the module on first sight.
    /// Returns `true` when the module was not known before.
    pub fn update(&self, module: ModuleId, update: ModuleUpdate, timestamp: Instant) -> bool {
        let mut modules = self.modules.write();
        let mut created = false;
        let state = modules.entry(module).or_insert_with(|| {
            created = true;
            ModuleState::new(module)
        });
        match update {
            ModuleUpdate::CellVoltages(cells) => {
                state.cell_voltages = Some(Stamped::new(cells, timestamp));
            }
            ModuleUpdate::Status(status) => {
                state.status = Some(Stamped::new(status, timestamp));
            }
        }
        created
    }

    pub fn update_pack(&self, update: PackUpdate, timestamp: Instant) {
        let mut pack = self.pack.write();
        match update {
            PackUpdate::Status(status) => pack.status = Some(Stamped::new(status, timestamp)),
            PackUpdate::Current(current) => pack.current = Some(Stamped::new(current, timestamp)),
            PackUpdate::Voltage(voltage) => pack.voltage = Some(Stamped::new(voltage, timestamp)),
            PackUpdate::Alarms(alarms) => pack.alarms = Some(Stamped::new(alarms, timestamp)),
            PackUpdate::Identity(identity) => {
                pack.identity = Some(Stamped::new(identity, timestamp))
            }
        }
    }

    pub fn module(&self, module: ModuleId) -> Option<ModuleState> {
        self.modules.read().get(&module).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let modules = self.modules.read().clone();
        let pack = self.pack.read().clone();
        RegistrySnapshot { modules, pack }
    }
}
