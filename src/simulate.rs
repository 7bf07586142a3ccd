use anyhow::{Context, Result};
use rand::rngs::ThreadRng;
use rand::Rng;
use std::io::{ErrorKind, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use ubms_lib::candump;
use ubms_lib::protocol::{
    BmsIdentity, CellVoltages, Message, ModuleStatus, OperatingMode, PackAlarms, PackCurrent,
    PackStatus, PackVoltage, VoltageTemperatureFlags, CELLS_PER_FRAME,
};
use ubms_lib::topology::PackTopology;

/// Transmit cycles between two identity frames.
const IDENTITY_EVERY: u64 = 10;
const STRING_CURRENT: f32 = -8.0;

/// A pack slowly discharging at constant current.
pub struct Simulator {
    topology: PackTopology,
    soc: f32,
    tick: u64,
    rng: ThreadRng,
}

impl Simulator {
    pub fn new(topology: PackTopology) -> Self {
        Self {
            topology,
            soc: 80.0,
            tick: 0,
            rng: rand::thread_rng(),
        }
    }

    fn cell_voltage(&mut self) -> f32 {
        3.2 + 0.002 * self.soc + self.rng.gen_range(-0.005..0.005)
    }

    /// Everything the BMS transmits in one cycle, then advances by `period`.
    pub fn cycle(&mut self, period: Duration) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut string_voltage = 0.0;
        for module in self.topology.module_ids() {
            let mut cells = [0.0; CELLS_PER_FRAME];
            for cell in cells.iter_mut().take(self.topology.cells_per_module()) {
                *cell = self.cell_voltage();
            }
            if module <= self.topology.series() {
                string_voltage += cells.iter().sum::<f32>();
            }
            messages.push(Message::ModuleCellVoltages {
                module,
                cells: CellVoltages { cells },
            });
            messages.push(Message::ModuleStatus {
                module,
                status: ModuleStatus {
                    temperature: 25.0 + self.rng.gen_range(-1.0..1.0),
                    soc_percent: self.soc.round(),
                    current: Some(STRING_CURRENT),
                    alarms: VoltageTemperatureFlags::default(),
                },
            });
        }

        let pack_current = STRING_CURRENT * f32::from(self.topology.parallel());
        messages.push(Message::PackStatus(PackStatus {
            soc_percent: self.soc.round() as u8,
            mode: Some(OperatingMode::Drive),
            charge_complete: false,
            modules_balancing: Some(0),
        }));
        messages.push(Message::PackCurrent(PackCurrent {
            current: pack_current,
        }));
        messages.push(Message::PackVoltage(PackVoltage {
            voltage: string_voltage,
        }));
        messages.push(Message::PackAlarms(PackAlarms::default()));
        if self.tick % IDENTITY_EVERY == 0 {
            messages.push(Message::BmsIdentity(BmsIdentity {
                part_number: 0x1D4C,
                firmware_version: 0x0112,
                bms_type: 1,
                hardware_revision: 3,
            }));
        }

        let drawn = -pack_current * period.as_secs_f32() / 3600.0;
        self.soc = (self.soc - 100.0 * drawn / self.topology.capacity_ah()).max(0.0);
        self.tick += 1;
        messages
    }
}

/// Writes `candump -L` lines to standard output. A closed pipe ends the run.
pub fn run(
    topology: PackTopology,
    ticks: Option<u64>,
    period: Duration,
    interface: &str,
) -> Result<()> {
    let mut simulator = Simulator::new(topology);
    let mut stdout = std::io::stdout().lock();
    let mut tick = 0;
    while ticks.map_or(true, |ticks| tick < ticks) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System clock is before the Unix epoch")?;
        let mut written = Ok(());
        for message in simulator.cycle(period) {
            // module numbers come from a validated topology
            let Some(id) = message.identifier() else {
                continue;
            };
            let line = candump::format_line(timestamp, interface, id, &message.encode());
            written = writeln!(stdout, "{line}");
            if written.is_err() {
                break;
            }
        }
        match written.and_then(|()| stdout.flush()) {
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                log::debug!("Output closed");
                return Ok(());
            }
            result => result.context("Cannot write to standard output")?,
        }
        tick += 1;
        if ticks.map_or(true, |ticks| tick < ticks) {
            std::thread::sleep(period);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use ubms_lib::protocol::RawFrame;
    use ubms_lib::{Bridge, BridgeConfig};

    #[test]
    fn cycle_covers_every_module() {
        let topology = PackTopology::new(4, 2, 200.0, 58.0).unwrap();
        let mut simulator = Simulator::new(topology);
        let first = simulator.cycle(Duration::from_secs(1));
        assert_eq!(first.len(), 2 * 8 + 5);
        let second = simulator.cycle(Duration::from_secs(1));
        assert_eq!(second.len(), 2 * 8 + 4);
    }

    #[test]
    fn simulated_traffic_aggregates_cleanly() {
        let config = BridgeConfig::reference().unwrap();
        let bridge = Bridge::new(config.clone()).unwrap();
        let mut simulator = Simulator::new(config.topology);
        let now = Instant::now();
        for message in simulator.cycle(Duration::from_secs(1)) {
            let line = candump::format_line(
                Duration::from_secs(1),
                "vcan0",
                message.identifier().unwrap(),
                &message.encode(),
            );
            let record = candump::parse_line(&line).unwrap();
            let frame = RawFrame::new(record.id, &record.payload, now).unwrap();
            bridge.ingest(&frame).unwrap();
        }
        let state = bridge.tick(now);
        assert!(state.fresh, "{state:?}");
        assert!(state.alarms.is_empty(), "{:?}", state.alarms);
        assert_eq!(state.modules_online, 16);
        assert_eq!(state.current, Some(-32.0));
        let pack_voltage = state.bms.voltage.unwrap();
        assert!((state.voltage.unwrap() - pack_voltage).abs() < 0.2);
        assert_eq!(bridge.statistics().malformed, 0);
    }
}
