use trace_topology::config::BoardDescription;
use trace_topology::engine::Engine;
use trace_topology::options::{paths, ContextIdSize, MemoryOptionStore, SourceSettings};
use trace_topology::sim::{LifecycleEvent, RecordingLifecycle, SimulatedTarget};
use trace_topology::sink::{BufferMode, ProbeVariant, SinkSettings};
use trace_topology::sync::SyncState;

const BOARD: &str = include_str!("../demos/zynq7000.yaml");
const OPTIONS: &str = include_str!("../demos/options.yaml");

const CTI_0: u64 = 0xF889_8000;
const CTI_1: u64 = 0xF889_9000;
const CTI_ETB: u64 = 0xF880_2000;
const PTM_0: u64 = 0xF889_C000;

fn inen(trigger: u64) -> u64 {
    0x020 + 4 * trigger
}

fn outen(trigger: u64) -> u64 {
    0x0A0 + 4 * trigger
}

fn engine() -> Engine<SimulatedTarget, RecordingLifecycle> {
    let board = BoardDescription::from_yaml(BOARD).unwrap();
    let (topology, config) = board.resolve().unwrap();
    Engine::new(
        topology,
        config,
        SimulatedTarget::new(),
        RecordingLifecycle::new(),
    )
    .unwrap()
}

fn connections(events: &[LifecycleEvent]) -> Vec<LifecycleEvent> {
    events
        .iter()
        .filter(|event| {
            matches!(
                event,
                LifecycleEvent::Connect(_) | LifecycleEvent::Disconnect(_)
            )
        })
        .cloned()
        .collect()
}

#[test]
fn stream_ids_follow_the_board() {
    let engine = engine();
    let topology = engine.topology();
    let stream_id = |name: &str| topology.node(topology.lookup(name).unwrap()).stream_id;

    assert_eq!(stream_id("ITM"), Some(0x01));
    // The ITM block reaches into 0x10.
    assert_eq!(stream_id("PTM_0"), Some(0x20));
    assert_eq!(stream_id("PTM_1"), Some(0x21));
    assert_eq!(stream_id("Funnel"), None);
}

#[test]
fn session_from_connect_to_disconnect() {
    let mut engine = engine();
    let mut options = MemoryOptionStore::from_yaml(OPTIONS).unwrap();
    engine.apply_initial_options(&options).unwrap();
    engine.connect().unwrap();

    let events = engine.lifecycle_mut().take_events();
    let port = |port: u8, enabled: bool| LifecycleEvent::Port {
        funnel: "Funnel".to_owned(),
        port,
        enabled,
    };
    let ports: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, LifecycleEvent::Port { .. }))
        .cloned()
        .collect();
    assert_eq!(ports, [port(0, true), port(1, false), port(3, true)]);

    assert!(events.contains(&LifecycleEvent::Source {
        source: "PTM_0".to_owned(),
        settings: SourceSettings {
            timestamps: true,
            context_ids: ContextIdSize::Bits32,
            cycle_accurate: false,
        },
    }));
    assert!(events.contains(&LifecycleEvent::ComponentOrder {
        sink: "ETB".to_owned(),
        chain: vec!["Funnel".to_owned(), "Replicator".to_owned()],
    }));
    assert!(events.contains(&LifecycleEvent::Sink {
        sink: "ETB".to_owned(),
        settings: SinkSettings::Buffer {
            mode: BufferMode::Circular
        },
    }));
    assert_eq!(engine.access().register(CTI_0 + inen(6)), 1 << 2);
    assert_eq!(engine.access().register(CTI_1 + inen(6)), 0);
    assert_eq!(engine.access().register(CTI_ETB + outen(1)), 1 << 2);

    // Live: a trace range. Deferred: enabling the second PTM.
    options.set("options.trace.PTM_0.traceRange", true);
    options.set("options.trace.PTM_0.traceRange.start", "0x0010_0000");
    options.set("options.trace.PTM_0.traceRange.end", "0x001F_FFFF");
    options.set("options.trace.PTM_1.enabled", true);
    engine.apply_dynamic_options(&options).unwrap();

    let ptm_1 = engine.topology().lookup("PTM_1").unwrap();
    assert_eq!(engine.access().installed_ranges(PTM_0), 1);
    assert!(!engine.enablement().is_enabled(ptm_1));

    options.set(paths::TRACE_CAPTURE, "DSTREAM");
    engine.lifecycle_mut().take_events();
    engine.apply_dynamic_options(&options).unwrap();

    let events = engine.lifecycle_mut().take_events();
    assert_eq!(
        connections(&events),
        [
            LifecycleEvent::Disconnect("ETB".to_owned()),
            LifecycleEvent::Connect("TPIU".to_owned())
        ]
    );
    assert!(events.contains(&LifecycleEvent::Sink {
        sink: "TPIU".to_owned(),
        settings: SinkSettings::TracePort {
            probe: ProbeVariant::St,
            width: 4
        },
    }));
    assert_eq!(engine.access().register(CTI_ETB + outen(1)), 0);
    assert_eq!(engine.access().register(CTI_ETB + outen(3)), 1 << 2);

    engine.disconnect().unwrap();
    assert_eq!(engine.access().installed_ranges(PTM_0), 0);
    assert_eq!(engine.lifecycle().connected().count(), 0);
    assert!(!engine.sync().has_trace_gates());
    assert_eq!(engine.sync().groups()[0].state(), SyncState::Unconfigured);

    engine.connect().unwrap();
    assert!(engine.enablement().is_enabled(ptm_1));
    assert_eq!(engine.access().register(CTI_1 + inen(6)), 1 << 2);
    assert_eq!(engine.access().installed_ranges(PTM_0), 1);
}

#[test]
fn smp_cores_start_and_stop_together() {
    let mut engine = engine();
    engine
        .apply_initial_options(&MemoryOptionStore::new())
        .unwrap();
    engine.connect().unwrap();

    let core_0 = engine.topology().lookup("Cortex-A9_0").unwrap();
    let core_1 = engine.topology().lookup("Cortex-A9_1").unwrap();

    engine.go(core_1).unwrap();
    assert_eq!(engine.sync().group_of(core_0).unwrap().state(), SyncState::Running);
    assert_eq!(engine.access().pulses(CTI_1), [1]);

    engine.stop(core_0).unwrap();
    assert_eq!(engine.sync().group_of(core_1).unwrap().state(), SyncState::Configured);
    assert_eq!(engine.access().pulses(CTI_0), [0]);

    engine.disconnect().unwrap();
    assert_eq!(engine.access().register(CTI_0 + inen(0)), 0);
}
