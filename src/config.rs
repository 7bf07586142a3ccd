use crate::registry::FieldGroup;
use crate::topology::PackTopology;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum age per field group before its data counts as stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StalenessDeadlines {
    #[serde(default = "StalenessDeadlines::default_deadline", with = "humantime_serde")]
    pub module_cell_voltages: Duration,
    #[serde(default = "StalenessDeadlines::default_deadline", with = "humantime_serde")]
    pub module_status: Duration,
    #[serde(default = "StalenessDeadlines::default_deadline", with = "humantime_serde")]
    pub pack_frames: Duration,
}

impl StalenessDeadlines {
    fn default_deadline() -> Duration {
        Duration::from_secs(5)
    }

    /// `None` for groups that never go stale (the BMS identity is static).
    pub fn deadline(&self, group: FieldGroup) -> Option<Duration> {
        match group {
            FieldGroup::CellVoltages => Some(self.module_cell_voltages),
            FieldGroup::ModuleStatus => Some(self.module_status),
            FieldGroup::PackStatus
            | FieldGroup::PackCurrent
            | FieldGroup::PackVoltage
            | FieldGroup::PackAlarms => Some(self.pack_frames),
            FieldGroup::Identity => None,
        }
    }
}

impl Default for StalenessDeadlines {
    fn default() -> Self {
        Self {
            module_cell_voltages: Self::default_deadline(),
            module_status: Self::default_deadline(),
            pack_frames: Self::default_deadline(),
        }
    }
}

/// Limits for the alarms derived from the aggregate rather than from BMS flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlarmThresholds {
    pub min_cell_voltage: f32,
    pub max_cell_voltage: f32,
    pub cell_imbalance: f32,
    pub min_soc: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
    pub min_cell_temperature: f32,
    pub max_cell_temperature: f32,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            min_cell_voltage: 2.90,
            max_cell_voltage: 3.65,
            cell_imbalance: 0.15,
            min_soc: 10.0,
            max_charge_current: 100.0,
            max_discharge_current: 150.0,
            min_cell_temperature: 0.0,
            max_cell_temperature: 50.0,
        }
    }
}

/// How the pack SOC is derived from the module SOC values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SocPolicy {
    /// Lowest SOC reported by any module.
    #[default]
    MinimumModule,
    /// Average the parallel copies of every series position, then take the lowest.
    MinimumSeriesPosition,
}

/// Where the pack current comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CurrentSourcePolicy {
    /// Module currents when any module reports one, else the pack current frame.
    #[default]
    Auto,
    Modules,
    PackFrame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub topology: PackTopology,
    #[serde(default)]
    pub staleness: StalenessDeadlines,
    #[serde(default)]
    pub thresholds: AlarmThresholds,
    #[serde(default)]
    pub soc_policy: SocPolicy,
    #[serde(default)]
    pub current_source: CurrentSourcePolicy,
    /// Aggregation period.
    #[serde(default = "BridgeConfig::default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl BridgeConfig {
    fn default_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub fn new(topology: PackTopology) -> Self {
        Self {
            topology,
            staleness: StalenessDeadlines::default(),
            thresholds: AlarmThresholds::default(),
            soc_policy: SocPolicy::default(),
            current_source: CurrentSourcePolicy::default(),
            interval: Self::default_interval(),
        }
    }

    /// The field installation: 16 modules as 4 strings of 4, 4 cells each.
    pub fn reference() -> Result<Self> {
        Ok(Self::new(PackTopology::new(4, 4, 550.0, 56.8)?))
    }

    /// Checks everything the topology constructor cannot.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig(
                "aggregation interval must be greater than zero".into(),
            ));
        }
        for (name, deadline) in [
            ("module_cell_voltages", self.staleness.module_cell_voltages),
            ("module_status", self.staleness.module_status),
            ("pack_frames", self.staleness.pack_frames),
        ] {
            if deadline.is_zero() {
                return Err(Error::InvalidConfig(format!(
                    "staleness deadline {name} must be greater than zero"
                )));
            }
        }
        let thresholds = &self.thresholds;
        if thresholds.min_cell_voltage >= thresholds.max_cell_voltage {
            return Err(Error::InvalidConfig(format!(
                "min_cell_voltage ({}) must be below max_cell_voltage ({})",
                thresholds.min_cell_voltage, thresholds.max_cell_voltage
            )));
        }
        if thresholds.min_cell_temperature >= thresholds.max_cell_temperature {
            return Err(Error::InvalidConfig(format!(
                "min_cell_temperature ({}) must be below max_cell_temperature ({})",
                thresholds.min_cell_temperature, thresholds.max_cell_temperature
            )));
        }
        Ok(())
    }
}
