use std::sync::Arc;
use std::time::{Duration, Instant};
use ubms_lib::alarms::{AlarmKind, AlarmLevel, AlarmScope};
use ubms_lib::protocol::{
    CellVoltages, Message, MessageKind, ModuleId, ModuleStatus, PackStatus, RawFrame,
    VoltageTemperatureFlags,
};
use ubms_lib::state::{DataQualityIssue, PackField};
use ubms_lib::topology::PackTopology;
use ubms_lib::{Bridge, BridgeConfig, Error};

fn frame(message: Message, timestamp: Instant) -> RawFrame {
    RawFrame::new(message.identifier().unwrap(), &message.encode(), timestamp).unwrap()
}

fn cells(module: ModuleId, voltage: f32) -> Message {
    Message::ModuleCellVoltages {
        module,
        cells: CellVoltages {
            cells: [voltage; 4],
        },
    }
}

fn status(module: ModuleId, soc: f32, current: f32) -> Message {
    Message::ModuleStatus {
        module,
        status: ModuleStatus {
            temperature: 24.5,
            soc_percent: soc,
            current: Some(current),
            alarms: VoltageTemperatureFlags::default(),
        },
    }
}

fn feed(bridge: &Bridge, messages: impl IntoIterator<Item = Message>, timestamp: Instant) {
    for message in messages {
        bridge.ingest(&frame(message, timestamp)).unwrap();
    }
}

fn close(actual: Option<f32>, expected: f32) -> bool {
    actual.is_some_and(|actual| (actual - expected).abs() < 1e-3)
}

#[test]
fn series_voltage_and_parallel_current() {
    let topology = PackTopology::new(16, 4, 400.0, 58.4)
        .unwrap()
        .with_cells_per_module(1)
        .unwrap();
    let bridge = Bridge::new(BridgeConfig::new(topology)).unwrap();
    let now = Instant::now();
    for module in 1..=64 {
        feed(
            &bridge,
            [cells(module, 3.3), status(module, 90.0, 10.0)],
            now,
        );
    }

    let state = bridge.tick(now);
    assert!(close(state.voltage, 52.8), "{:?}", state.voltage);
    assert!(close(state.current, 40.0), "{:?}", state.current);
    assert_eq!(state.modules_online, 64);
    assert_eq!(state.modules_expected, 64);
    assert!(state.fresh);
    assert!(state.is_complete());
}

#[test]
fn pack_soc_is_the_weakest_module() {
    let bridge = Bridge::new(BridgeConfig::reference().unwrap()).unwrap();
    let now = Instant::now();
    for module in 1..=16 {
        let soc = if module == 11 { 62.0 } else { 75.0 };
        feed(&bridge, [cells(module, 3.3), status(module, soc, 5.0)], now);
    }
    feed(
        &bridge,
        [Message::PackStatus(PackStatus {
            soc_percent: 74,
            mode: None,
            charge_complete: false,
            modules_balancing: None,
        })],
        now,
    );

    let state = bridge.tick(now);
    assert!(close(state.soc, 62.0));
    assert!(close(state.remaining_capacity_ah, 550.0 * 0.62));
    assert_eq!(state.bms.soc, Some(74));
}

#[test]
fn out_of_range_modules_are_flagged_and_excluded() {
    let bridge = Bridge::new(BridgeConfig::reference().unwrap()).unwrap();
    let now = Instant::now();
    for module in 1..=16 {
        feed(&bridge, [cells(module, 3.3), status(module, 80.0, 2.5)], now);
    }
    let rogue = frame(cells(17, 1.0), now);
    assert!(matches!(
        bridge.ingest(&rogue),
        Err(Error::TopologyViolation(17))
    ));

    let state = bridge.tick(now);
    assert!(close(state.voltage, 4.0 * 13.2));
    assert!(close(state.min_cell_voltage.map(|min| min.value), 3.3));
    assert_eq!(
        state.issues,
        vec![DataQualityIssue::UnassignedModule { module: 17 }]
    );
    assert!(state.alarms.iter().any(|alarm| alarm.kind
        == AlarmKind::TopologyViolation
        && alarm.scope == AlarmScope::Module(17)));
    assert_eq!(bridge.statistics().topology_violations, 1);
}

#[test]
fn topology_violation_clears_once_the_stray_module_goes_quiet() {
    let bridge = Bridge::new(BridgeConfig::reference().unwrap()).unwrap();
    let start = Instant::now();
    let stray = RawFrame::new(0x370, &[0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4], start)
        .unwrap();
    assert!(matches!(
        bridge.ingest(&stray),
        Err(Error::TopologyViolation(17))
    ));
    assert!(bridge.tick(start).has_alarm(AlarmKind::TopologyViolation));

    let later = start + Duration::from_secs(3600);
    for module in 1..=16 {
        feed(&bridge, [cells(module, 3.3), status(module, 80.0, 2.5)], later);
    }
    let state = bridge.tick(later);
    assert!(!state.has_alarm(AlarmKind::TopologyViolation), "{:?}", state.alarms);
    assert!(state.is_complete(), "{:?}", state.issues);
    assert!(state.fresh);
    assert!(bridge.registry().module(17).is_some());
}

#[test]
fn malformed_frames_leave_the_registry_untouched() {
    let bridge = Bridge::new(BridgeConfig::reference().unwrap()).unwrap();
    let now = Instant::now();
    feed(&bridge, [cells(1, 3.3)], now);
    let truncated = RawFrame::new(0x350, &[0x0C, 0xE4, 0x0C], now + Duration::from_secs(1)).unwrap();
    assert!(matches!(
        bridge.ingest(&truncated),
        Err(Error::MalformedFrame {
            kind: MessageKind::ModuleCellVoltages,
            ..
        })
    ));
    let module = bridge.registry().module(1).unwrap();
    assert_eq!(module.cell_voltages.unwrap().updated, now);
    assert!(RawFrame::new(0x350, &[0; 9], now).is_err());
}

#[test]
fn silence_escalates_to_communication_lost() {
    let bridge = Bridge::new(BridgeConfig::reference().unwrap()).unwrap();
    let start = Instant::now();
    for module in 1..=16 {
        feed(&bridge, [cells(module, 3.3), status(module, 80.0, 2.5)], start);
    }
    assert!(bridge.tick(start + Duration::from_secs(5)).fresh);

    let state = bridge.tick(start + Duration::from_secs(7));
    assert!(!state.fresh);
    assert_eq!(state.alarms.len(), 1);
    assert_eq!(state.alarms[0].kind, AlarmKind::CommunicationLost);
    assert_eq!(state.alarms[0].level, AlarmLevel::Alarm);
    assert_eq!(state.voltage, None);
    assert!(state.is_stale(PackField::Voltage));
    assert!(state.is_stale(PackField::Soc));

    // one module coming back ends the escalation
    let later = start + Duration::from_secs(8);
    feed(&bridge, [cells(3, 3.3), status(3, 80.0, 2.5)], later);
    let state = bridge.tick(later);
    assert!(!state.has_alarm(AlarmKind::CommunicationLost));
    assert!(state.has_alarm(AlarmKind::DataStale(
        ubms_lib::registry::FieldGroup::CellVoltages
    )));
    assert_eq!(state.modules_online, 1);
}

#[test]
fn readers_never_see_a_torn_field_group() {
    let bridge = Arc::new(Bridge::new(BridgeConfig::reference().unwrap()).unwrap());
    let writer = {
        let bridge = Arc::clone(&bridge);
        std::thread::spawn(move || {
            for round in 0..2_000u32 {
                let voltage = if round % 2 == 0 { 3.0 } else { 3.5 };
                let now = Instant::now();
                for module in 1..=16 {
                    bridge.ingest(&frame(cells(module, voltage), now)).unwrap();
                }
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = bridge.registry().snapshot();
                    for module in snapshot.modules.values() {
                        if let Some(stamped) = module.cell_voltages {
                            let [first, rest @ ..] = stamped.value.cells;
                            assert!(rest.iter().all(|cell| *cell == first));
                        }
                    }
                    let state = bridge.tick(Instant::now());
                    if let (Some(min), Some(max)) = (state.min_cell_voltage, state.max_cell_voltage)
                    {
                        assert!(min.value >= 3.0 - 1e-3 && max.value <= 3.5 + 1e-3);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(bridge.statistics().decoded, 2_000 * 16);
}

#[cfg(feature = "tokio-runtime")]
mod runtime {
    use super::*;
    use tokio::sync::{mpsc, watch};
    use ubms_lib::runtime;

    fn fast_bridge() -> Arc<Bridge> {
        let mut config = BridgeConfig::reference().unwrap();
        config.interval = Duration::from_millis(10);
        Arc::new(Bridge::new(config).unwrap())
    }

    #[tokio::test]
    async fn loops_publish_states_until_shutdown() {
        let bridge = fast_bridge();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, mut state_rx) = watch::channel(bridge.current_state());

        let ingest = tokio::spawn(runtime::ingest(
            Arc::clone(&bridge),
            frame_rx,
            shutdown_rx.clone(),
        ));
        let aggregate = tokio::spawn(runtime::aggregate(
            Arc::clone(&bridge),
            state_tx,
            shutdown_rx,
        ));

        for module in 1..=16 {
            let now = Instant::now();
            frame_tx.send(frame(cells(module, 3.3), now)).await.unwrap();
            frame_tx
                .send(frame(status(module, 80.0, 2.5), now))
                .await
                .unwrap();
        }

        let fresh = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                state_rx.changed().await.unwrap();
                let state = state_rx.borrow_and_update();
                if state.fresh && state.modules_online == 16 {
                    break;
                }
            }
        })
        .await;
        assert!(fresh.is_ok(), "no fresh state published");

        shutdown_tx.send_replace(true);
        let last = aggregate.await.unwrap();
        assert!(close(last.voltage, 52.8));
        assert_eq!(ingest.await.unwrap(), 32);
    }

    #[tokio::test]
    async fn ingest_stops_when_the_source_closes() {
        let bridge = fast_bridge();
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingest = tokio::spawn(runtime::ingest(Arc::clone(&bridge), frame_rx, shutdown_rx));

        frame_tx
            .send(RawFrame::new(0x7FF, &[], Instant::now()).unwrap())
            .await
            .unwrap();
        drop(frame_tx);

        assert_eq!(ingest.await.unwrap(), 1);
        assert_eq!(bridge.statistics().unrecognized, 1);
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_stops_aggregation() {
        let bridge = fast_bridge();
        let (state_tx, _state_rx) = watch::channel(bridge.current_state());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aggregate = tokio::spawn(runtime::aggregate(bridge, state_tx, shutdown_rx));
        drop(shutdown_tx);
        let last = tokio::time::timeout(Duration::from_secs(5), aggregate)
            .await
            .expect("aggregation did not stop")
            .unwrap();
        assert!(last.has_alarm(AlarmKind::CommunicationLost));
    }
}
