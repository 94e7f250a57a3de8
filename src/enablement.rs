//! Turning trace sources on and off.
//!
//! A funnel port is never switched directly. Its state is derived from the set of enabled
//! sources whose data passes through it, so disabling one source cannot cut off another one
//! sharing the same path.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::topology::{DeviceId, DeviceKind, RouterKind, Topology, TriggerBinding, TriggerLine};

/// A single hardware change produced by an enablement decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wiring {
    Port {
        router: DeviceId,
        port: u8,
        enabled: bool,
    },
    Trigger {
        device: DeviceId,
        binding: TriggerBinding,
        enabled: bool,
    },
}

/// The trace sources of one cluster of cores, resolved once at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSelector {
    cluster: String,
    sources: Vec<DeviceId>,
}

impl SourceSelector {
    pub fn new(cluster: &str, sources: Vec<DeviceId>) -> Self {
        Self {
            cluster: cluster.to_owned(),
            sources,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn sources(&self) -> &[DeviceId] {
        &self.sources
    }

    pub fn contains(&self, source: DeviceId) -> bool {
        self.sources.contains(&source)
    }
}

#[derive(Debug)]
pub struct SourceEnablement {
    enabled: BTreeSet<DeviceId>,
    /// Funnel ports along every downstream path of a source, nearest first.
    source_ports: BTreeMap<DeviceId, Vec<(DeviceId, u8)>>,
    /// Sources whose data passes through a funnel port.
    port_users: BTreeMap<(DeviceId, u8), BTreeSet<DeviceId>>,
}

impl SourceEnablement {
    pub fn new(topology: &Topology) -> Self {
        let mut source_ports = BTreeMap::new();
        let mut port_users: BTreeMap<(DeviceId, u8), BTreeSet<DeviceId>> = BTreeMap::new();

        for source in topology.sources() {
            let ports = downstream_funnel_ports(topology, source.id);
            for port in &ports {
                port_users.entry(*port).or_default().insert(source.id);
            }
            source_ports.insert(source.id, ports);
        }

        Self {
            enabled: BTreeSet::new(),
            source_ports,
            port_users,
        }
    }

    pub fn is_enabled(&self, source: DeviceId) -> bool {
        self.enabled.contains(&source)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.enabled.iter().copied()
    }

    /// A port is enabled iff at least one enabled source routes through it.
    pub fn port_enabled(&self, router: DeviceId, port: u8) -> bool {
        self.port_users
            .get(&(router, port))
            .map(|users| !users.is_disjoint(&self.enabled))
            .unwrap_or(false)
    }

    /// Every funnel port some source can reach, with its derived state.
    pub fn ports(&self) -> impl Iterator<Item = (DeviceId, u8, bool)> + '_ {
        self.port_users
            .keys()
            .map(|&(router, port)| (router, port, self.port_enabled(router, port)))
    }

    /// Enable or disable a trace source.
    ///
    /// Returns the wiring changes to apply, port changes first. Setting a source to the state it
    /// is already in returns no changes.
    pub fn set_source_enabled(
        &mut self,
        topology: &Topology,
        source: DeviceId,
        enabled: bool,
    ) -> Vec<Wiring> {
        if !topology.node(source).kind.is_source() {
            log::warn!("{} is not a trace source", topology.name(source));
            return Vec::new();
        }

        let ports = self.source_ports.get(&source).cloned().unwrap_or_default();
        let before: Vec<bool> = ports
            .iter()
            .map(|&(router, port)| self.port_enabled(router, port))
            .collect();

        let changed = if enabled {
            self.enabled.insert(source)
        } else {
            self.enabled.remove(&source)
        };
        if !changed {
            return Vec::new();
        }

        log::debug!(
            "{} trace source {}",
            if enabled { "Enabling" } else { "Disabling" },
            topology.name(source)
        );

        let mut wiring: Vec<Wiring> = ports
            .iter()
            .zip(before)
            .filter_map(|(&(router, port), was)| {
                let now = self.port_enabled(router, port);
                (now != was).then_some(Wiring::Port {
                    router,
                    port,
                    enabled: now,
                })
            })
            .collect();

        wiring.extend(
            topology
                .trigger_bindings(source)
                .filter(|binding| matches!(binding.line, TriggerLine::Input(_)))
                .map(|binding| Wiring::Trigger {
                    device: source,
                    binding,
                    enabled,
                }),
        );

        wiring
    }
}

fn downstream_funnel_ports(topology: &Topology, source: DeviceId) -> Vec<(DeviceId, u8)> {
    let mut ports = Vec::new();
    let mut visited = BTreeSet::from([source]);
    let mut queue = VecDeque::from([source]);

    while let Some(current) = queue.pop_front() {
        for (next, port) in topology.routes_from(current) {
            let kind = topology.node(next).kind;
            if kind == DeviceKind::Router(RouterKind::Funnel) && !ports.contains(&(next, port)) {
                ports.push((next, port));
            }
            if kind.is_router() && visited.insert(next) {
                queue.push_back(next);
            }
        }
    }

    ports
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::{
        Capabilities, Edge, SinkKind, SourceFamily, TopologyBuilder,
    };

    struct Board {
        topology: Topology,
        s1: DeviceId,
        s2: DeviceId,
        s3: DeviceId,
        funnel: DeviceId,
        main_funnel: DeviceId,
        cti: DeviceId,
    }

    /// S1 and S2 feed ports 0 and 1 of a cluster funnel, which feeds port 0 of the main funnel.
    /// S3 feeds port 3 of the main funnel directly.
    fn board() -> Board {
        let mut builder = TopologyBuilder::new();
        let mut node = |name: &str, kind| {
            builder
                .register_node(name, kind, Capabilities::default(), None)
                .unwrap()
        };
        let s1 = node("ETM_0", DeviceKind::TraceSource(SourceFamily::Etm));
        let s2 = node("ETM_1", DeviceKind::TraceSource(SourceFamily::Etm));
        let s3 = node("STM", DeviceKind::TraceSource(SourceFamily::Stm));
        let funnel = node("Funnel_cluster", DeviceKind::Router(RouterKind::Funnel));
        let main_funnel = node("Funnel_main", DeviceKind::Router(RouterKind::Funnel));
        let sink = node("ETF", DeviceKind::Sink(SinkKind::Etf));
        let cti = node("CTI_sys", DeviceKind::Cti);

        for (from, to, port) in [
            (s1, funnel, 0),
            (s2, funnel, 1),
            (funnel, main_funnel, 0),
            (s3, main_funnel, 3),
            (main_funnel, sink, 0),
        ] {
            builder
                .register_edge(Edge::RoutesTo { from, to, port })
                .unwrap();
        }
        builder
            .register_edge(Edge::TriggersVia {
                device: s3,
                cti,
                line: TriggerLine::Input(4),
                channel: Some(2),
            })
            .unwrap();

        Board {
            topology: builder.build(),
            s1,
            s2,
            s3,
            funnel,
            main_funnel,
            cti,
        }
    }

    #[test]
    fn funnel_ports_follow_their_sources() {
        let board = board();
        let mut state = SourceEnablement::new(&board.topology);

        state.set_source_enabled(&board.topology, board.s1, true);
        assert!(state.port_enabled(board.funnel, 0));
        assert!(!state.port_enabled(board.funnel, 1));

        state.set_source_enabled(&board.topology, board.s2, true);
        assert!(state.port_enabled(board.funnel, 0));
        assert!(state.port_enabled(board.funnel, 1));

        state.set_source_enabled(&board.topology, board.s1, false);
        assert!(!state.port_enabled(board.funnel, 0));
        assert!(state.port_enabled(board.funnel, 1));
    }

    #[test]
    fn shared_downstream_port_stays_on_while_needed() {
        let board = board();
        let mut state = SourceEnablement::new(&board.topology);

        let wiring = state.set_source_enabled(&board.topology, board.s1, true);
        assert_eq!(
            wiring,
            [
                Wiring::Port {
                    router: board.funnel,
                    port: 0,
                    enabled: true
                },
                Wiring::Port {
                    router: board.main_funnel,
                    port: 0,
                    enabled: true
                },
            ]
        );

        // The main funnel port is already carrying S1.
        let wiring = state.set_source_enabled(&board.topology, board.s2, true);
        assert_eq!(
            wiring,
            [Wiring::Port {
                router: board.funnel,
                port: 1,
                enabled: true
            }]
        );

        state.set_source_enabled(&board.topology, board.s1, false);
        assert!(state.port_enabled(board.main_funnel, 0));
    }

    #[test]
    fn enabling_twice_is_a_no_op() {
        let board = board();
        let mut once = SourceEnablement::new(&board.topology);
        once.set_source_enabled(&board.topology, board.s1, true);

        let mut twice = SourceEnablement::new(&board.topology);
        twice.set_source_enabled(&board.topology, board.s1, true);
        let wiring = twice.set_source_enabled(&board.topology, board.s1, true);

        assert!(wiring.is_empty());
        assert_eq!(
            once.ports().collect::<Vec<_>>(),
            twice.ports().collect::<Vec<_>>()
        );

        twice.set_source_enabled(&board.topology, board.s1, false);
        assert!(!twice.port_enabled(board.funnel, 0));
    }

    #[test]
    fn ports_are_wired_before_triggers() {
        let board = board();
        let mut state = SourceEnablement::new(&board.topology);

        let wiring = state.set_source_enabled(&board.topology, board.s3, true);
        assert_eq!(
            wiring,
            [
                Wiring::Port {
                    router: board.main_funnel,
                    port: 3,
                    enabled: true
                },
                Wiring::Trigger {
                    device: board.s3,
                    binding: TriggerBinding {
                        cti: board.cti,
                        line: TriggerLine::Input(4),
                        channel: Some(2),
                    },
                    enabled: true
                },
            ]
        );
    }

    #[test]
    fn non_sources_are_ignored() {
        let board = board();
        let mut state = SourceEnablement::new(&board.topology);

        assert!(state
            .set_source_enabled(&board.topology, board.funnel, true)
            .is_empty());
        assert_eq!(state.enabled_sources().count(), 0);
    }
}
