use crate::protocol::{ModuleId, CELLS_PER_FRAME, MAX_MODULES};
use crate::Error;
use serde::{Deserialize, Serialize};

/// Where a module sits in the pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Position {
    /// 1-based position along the series string.
    pub series: u8,
    /// 0-based index of the parallel string.
    pub string: u8,
}

/// Shape of the pack: `series` modules per string, `parallel` strings.
///
/// Validated on construction and immutable afterwards. Deserializing goes
/// through the same validation, so a bad configuration file fails at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TopologySettings")]
pub struct PackTopology {
    series: u8,
    parallel: u8,
    capacity_ah: f32,
    max_charge_voltage: f32,
    cells_per_module: u8,
}

/// Unvalidated topology as read from a configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologySettings {
    series: u8,
    parallel: u8,
    capacity_ah: f32,
    max_charge_voltage: f32,
    #[serde(default = "PackTopology::default_cells_per_module")]
    cells_per_module: u8,
}

impl TryFrom<TopologySettings> for PackTopology {
    type Error = Error;

    fn try_from(settings: TopologySettings) -> Result<Self, Self::Error> {
        PackTopology::new(
            settings.series,
            settings.parallel,
            settings.capacity_ah,
            settings.max_charge_voltage,
        )?
        .with_cells_per_module(settings.cells_per_module)
    }
}

impl PackTopology {
    fn default_cells_per_module() -> u8 {
        CELLS_PER_FRAME as u8
    }

    pub fn new(
        series: u8,
        parallel: u8,
        capacity_ah: f32,
        max_charge_voltage: f32,
    ) -> crate::Result<Self> {
        if series == 0 || parallel == 0 {
            return Err(Error::InvalidTopology(format!(
                "series ({series}) and parallel ({parallel}) counts must be at least 1"
            )));
        }
        let modules = u16::from(series) * u16::from(parallel);
        if modules > u16::from(MAX_MODULES) {
            return Err(Error::InvalidTopology(format!(
                "{series}s{parallel}p needs {modules} modules, the protocol addresses at most {MAX_MODULES}"
            )));
        }
        if !(capacity_ah.is_finite() && capacity_ah > 0.0) {
            return Err(Error::InvalidTopology(format!(
                "capacity must be positive, got {capacity_ah} Ah"
            )));
        }
        if !(max_charge_voltage.is_finite() && max_charge_voltage > 0.0) {
            return Err(Error::InvalidTopology(format!(
                "max charge voltage must be positive, got {max_charge_voltage} V"
            )));
        }
        Ok(Self {
            series,
            parallel,
            capacity_ah,
            max_charge_voltage,
            cells_per_module: Self::default_cells_per_module(),
        })
    }

    pub fn with_cells_per_module(mut self, cells: u8) -> crate::Result<Self> {
        if cells == 0 || usize::from(cells) > CELLS_PER_FRAME {
            return Err(Error::InvalidTopology(format!(
                "cells per module must be within 1..={CELLS_PER_FRAME}, got {cells}"
            )));
        }
        self.cells_per_module = cells;
        Ok(self)
    }

    pub fn series(&self) -> u8 {
        self.series
    }

    pub fn parallel(&self) -> u8 {
        self.parallel
    }

    pub fn module_count(&self) -> u8 {
        // bounded by MAX_MODULES in new()
        self.series * self.parallel
    }

    pub fn capacity_ah(&self) -> f32 {
        self.capacity_ah
    }

    pub fn max_charge_voltage(&self) -> f32 {
        self.max_charge_voltage
    }

    pub fn cells_per_module(&self) -> usize {
        usize::from(self.cells_per_module)
    }

    pub fn contains(&self, module: ModuleId) -> bool {
        (1..=self.module_count()).contains(&module)
    }

    /// Series position and string of `module`, `None` when outside the pack.
    pub fn position(&self, module: ModuleId) -> Option<Position> {
        if !self.contains(module) {
            return None;
        }
        let index = module - 1;
        Some(Position {
            series: index % self.series + 1,
            string: index / self.series,
        })
    }

    pub fn module_ids(&self) -> impl Iterator<Item = ModuleId> {
        1..=self.module_count()
    }
}
