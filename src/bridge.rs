use crate::aggregate;
use crate::alarms::{AlarmKind, AlarmScope};
use crate::config::BridgeConfig;
use crate::protocol::{self, Message, MessageKind, ModuleId, RawFrame};
use crate::registry::{ModuleRegistry, ModuleUpdate, PackUpdate};
use crate::state::PackState;
use crate::topology::PackTopology;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct FrameCounters {
    received: AtomicU64,
    decoded: AtomicU64,
    malformed: AtomicU64,
    unrecognized: AtomicU64,
    topology_violations: AtomicU64,
}

impl FrameCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Frame counters since the bridge was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStatistics {
    pub received: u64,
    pub decoded: u64,
    pub malformed: u64,
    pub unrecognized: u64,
    pub topology_violations: u64,
}

/// What the previous tick reported, to log only changes.
#[derive(Debug, Default)]
struct LinkStatus {
    communication_lost: bool,
    stale_modules: BTreeSet<ModuleId>,
}

impl LinkStatus {
    fn stale_modules(state: &PackState) -> BTreeSet<ModuleId> {
        state
            .alarms
            .iter()
            .filter_map(|alarm| match (alarm.kind, alarm.scope) {
                (AlarmKind::DataStale(_), AlarmScope::Module(module)) => Some(module),
                _ => None,
            })
            .collect()
    }

    fn update(&mut self, state: &PackState) {
        let lost = state.has_alarm(AlarmKind::CommunicationLost);
        match (self.communication_lost, lost) {
            (false, true) => log::warn!("Communication with all modules lost"),
            (true, false) => log::info!(
                "Communication restored, {}/{} modules online",
                state.modules_online,
                state.modules_expected
            ),
            _ => {}
        }
        self.communication_lost = lost;
        if lost {
            // per module alarms are folded into the pack alarm
            return;
        }
        let stale = Self::stale_modules(state);
        for module in stale.difference(&self.stale_modules) {
            log::warn!("Module {module} data is stale");
        }
        for module in self.stale_modules.difference(&stale) {
            log::info!("Module {module} reporting again");
        }
        self.stale_modules = stale;
    }
}

/// The current pack state and the instant it was computed for.
#[derive(Debug)]
struct Published {
    at: Instant,
    state: Arc<PackState>,
}

/// Decoding, registry and aggregation for one battery pack.
///
/// [`Bridge::ingest`] and [`Bridge::tick`] take `&self` and can be called from
/// different threads; share the bridge through an `Arc`.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    registry: ModuleRegistry,
    counters: FrameCounters,
    state: RwLock<Published>,
    link: Mutex<LinkStatus>,
}

impl Bridge {
    /// Fails on an invalid configuration, before any frame is processed.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let registry = ModuleRegistry::new();
        let created = Instant::now();
        let initial = aggregate::pack_state(&config, &registry.snapshot(), created);
        log::debug!(
            "Bridge for {}s{}p pack, {} Ah",
            config.topology.series(),
            config.topology.parallel(),
            config.topology.capacity_ah()
        );
        Ok(Self {
            link: Mutex::new(LinkStatus {
                communication_lost: initial.has_alarm(AlarmKind::CommunicationLost),
                stale_modules: LinkStatus::stale_modules(&initial),
            }),
            state: RwLock::new(Published {
                at: created,
                state: Arc::new(initial),
            }),
            config,
            registry,
            counters: FrameCounters::default(),
        })
    }

    /// Decodes one frame and records it. Dropped frames are counted and
    /// reported through the error; none of them is fatal.
    pub fn ingest(&self, frame: &RawFrame) -> Result<MessageKind> {
        FrameCounters::bump(&self.counters.received);
        let message = match protocol::decode(frame) {
            Ok(message) => message,
            Err(error) => {
                match &error {
                    Error::UnrecognizedFrame(_) => {
                        FrameCounters::bump(&self.counters.unrecognized)
                    }
                    _ => FrameCounters::bump(&self.counters.malformed),
                }
                log::debug!("Dropping frame {frame:?}: {error}");
                return Err(error);
            }
        };
        log::trace!("{frame:?} -> {message:?}");
        FrameCounters::bump(&self.counters.decoded);

        let kind = message.kind();
        let timestamp = frame.timestamp();
        match message {
            Message::PackStatus(status) => {
                self.registry.update_pack(PackUpdate::Status(status), timestamp)
            }
            Message::PackCurrent(current) => {
                self.registry.update_pack(PackUpdate::Current(current), timestamp)
            }
            Message::PackVoltage(voltage) => {
                self.registry.update_pack(PackUpdate::Voltage(voltage), timestamp)
            }
            Message::PackAlarms(alarms) => {
                self.registry.update_pack(PackUpdate::Alarms(alarms), timestamp)
            }
            Message::BmsIdentity(identity) => {
                self.registry.update_pack(PackUpdate::Identity(identity), timestamp)
            }
            Message::ModuleCellVoltages { module, cells } => {
                self.update_module(module, ModuleUpdate::CellVoltages(cells), timestamp)?
            }
            Message::ModuleStatus { module, status } => {
                self.update_module(module, ModuleUpdate::Status(status), timestamp)?
            }
        }
        Ok(kind)
    }

    fn update_module(&self, module: ModuleId, update: ModuleUpdate, timestamp: Instant) -> Result<()> {
        let created = self.registry.update(module, update, timestamp);
        let topology = self.topology();
        if topology.contains(module) {
            if created {
                log::info!("Module {module} online");
            }
            return Ok(());
        }
        FrameCounters::bump(&self.counters.topology_violations);
        if created {
            log::warn!(
                "Module {module} is outside the {}s{}p topology, its data is ignored",
                topology.series(),
                topology.parallel()
            );
        }
        Err(Error::TopologyViolation(module))
    }

    /// Recomputes the pack state as of `now` and makes it the current one,
    /// unless the current state was computed for a later instant.
    ///
    /// Concurrent ticks are serialized, so the current state only moves
    /// forward in time.
    pub fn tick(&self, now: Instant) -> Arc<PackState> {
        let mut published = self.state.write();
        let state = Arc::new(aggregate::pack_state(
            &self.config,
            &self.registry.snapshot(),
            now,
        ));
        if now < published.at {
            log::debug!("Not publishing a pack state older than the current one");
            return state;
        }
        self.link.lock().update(&state);
        *published = Published {
            at: now,
            state: Arc::clone(&state),
        };
        state
    }

    /// Result of the latest [`Bridge::tick`].
    pub fn current_state(&self) -> Arc<PackState> {
        Arc::clone(&self.state.read().state)
    }

    pub fn statistics(&self) -> FrameStatistics {
        let counters = &self.counters;
        FrameStatistics {
            received: counters.received.load(Ordering::Relaxed),
            decoded: counters.decoded.load(Ordering::Relaxed),
            malformed: counters.malformed.load(Ordering::Relaxed),
            unrecognized: counters.unrecognized.load(Ordering::Relaxed),
            topology_violations: counters.topology_violations.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn topology(&self) -> &PackTopology {
        &self.config.topology
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FieldGroup;
    use std::time::Duration;

    fn bridge() -> Bridge {
        Bridge::new(BridgeConfig::new(PackTopology::new(2, 1, 100.0, 30.0).unwrap())).unwrap()
    }

    fn frame(id: u32, payload: &[u8], timestamp: Instant) -> RawFrame {
        RawFrame::new(id, payload, timestamp).unwrap()
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut config = BridgeConfig::reference().unwrap();
        config.interval = Duration::ZERO;
        assert!(matches!(Bridge::new(config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn routes_frames_to_their_field_group() {
        let bridge = bridge();
        let now = Instant::now();
        let kind = bridge
            .ingest(&frame(0x352, &[0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4], now))
            .unwrap();
        assert_eq!(kind, MessageKind::ModuleCellVoltages);
        bridge
            .ingest(&frame(0x0C1, &[0xFF, 0x9C], now))
            .unwrap();

        let module = bridge.registry().module(2).unwrap();
        assert_eq!(module.updated(FieldGroup::CellVoltages), Some(now));
        assert_eq!(module.status, None);
        let snapshot = bridge.registry().snapshot();
        assert_eq!(snapshot.pack.current.unwrap().value.current, -10.0);
    }

    #[test]
    fn counts_dropped_frames() {
        let bridge = bridge();
        let now = Instant::now();
        assert!(matches!(
            bridge.ingest(&frame(0x351, &[0x00, 0xFA, 0x00], now)),
            Err(Error::MalformedFrame {
                kind: MessageKind::ModuleStatus,
                expected: 4,
                actual: 3
            })
        ));
        assert!(matches!(
            bridge.ingest(&frame(0x7FF, &[], now)),
            Err(Error::UnrecognizedFrame(0x7FF))
        ));
        // module 3 of a pack with two modules
        assert!(matches!(
            bridge.ingest(&frame(0x355, &[0x00, 0xFA, 0x00, 0x50], now)),
            Err(Error::TopologyViolation(3))
        ));
        bridge.ingest(&frame(0x353, &[0x00, 0xFA, 0x00, 0x50], now)).unwrap();

        assert_eq!(
            bridge.statistics(),
            FrameStatistics {
                received: 4,
                decoded: 2,
                malformed: 1,
                unrecognized: 1,
                topology_violations: 1,
            }
        );
        assert!(bridge.registry().module(1).is_none());
        assert!(bridge.registry().module(3).is_some());
    }

    #[test]
    fn tick_replaces_the_current_state() {
        let bridge = bridge();
        let now = Instant::now();
        assert!(bridge.current_state().has_alarm(AlarmKind::CommunicationLost));

        for id in [0x350, 0x352] {
            bridge
                .ingest(&frame(id, &[0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4], now))
                .unwrap();
        }
        for id in [0x351, 0x353] {
            bridge
                .ingest(&frame(id, &[0x00, 0xFA, 0x00, 0x50, 0x00, 0x64], now))
                .unwrap();
        }
        let state = bridge.tick(now);
        assert!(Arc::ptr_eq(&state, &bridge.current_state()));
        assert!(state.fresh, "{state:?}");
        assert_eq!(state.modules_online, 2);
        let voltage = state.voltage.unwrap();
        assert!((voltage - 26.4).abs() < 1e-3);
        assert_eq!(state.current, Some(10.0));

        let state = bridge.tick(now + Duration::from_secs(60));
        assert!(state.has_alarm(AlarmKind::CommunicationLost));
        assert!(!state.fresh);
    }

    #[test]
    fn an_older_tick_does_not_replace_a_newer_state() {
        let bridge = bridge();
        let now = Instant::now();
        for id in [0x350, 0x352] {
            bridge
                .ingest(&frame(id, &[0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4], now))
                .unwrap();
        }
        let newer = bridge.tick(now + Duration::from_secs(60));
        let older = bridge.tick(now);
        assert!(Arc::ptr_eq(&newer, &bridge.current_state()));
        assert!(newer.has_alarm(AlarmKind::CommunicationLost));
        assert!(!older.has_alarm(AlarmKind::CommunicationLost));
    }

    #[test]
    fn concurrent_ticks_keep_the_latest_state() {
        let bridge = Arc::new(bridge());
        let start = Instant::now();
        let handles: Vec<_> = (0..4u64)
            .map(|thread| {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || {
                    for step in 0..250u64 {
                        bridge.tick(start + Duration::from_millis(step * 4 + thread));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let latest = bridge.tick(start + Duration::from_millis(999));
        // the last tick of thread 3 was computed for 999 ms as well
        assert!(Arc::ptr_eq(&latest, &bridge.current_state()));
        let stale = bridge.tick(start);
        assert!(!Arc::ptr_eq(&stale, &bridge.current_state()));
    }
}
