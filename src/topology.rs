//! The topology registry.
//!
//! All debug and trace components of a board are registered once, through a
//! [`TopologyBuilder`], together with the static edges between them. The sealed [`Topology`] is
//! read-only for the rest of the session; components are referenced by [`DeviceId`] handles.
use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::access::ComponentAddress;
use crate::Error;

/// First ATB id handed out to trace sources. Lower ids are reserved.
const FIRST_STREAM_ID: u8 = 0x10;
/// Stream ids are handed out in blocks of this size per macrocell family.
const STREAM_BLOCK_SIZE: u8 = 16;
/// ATB ids from here on are reserved.
const LAST_STREAM_ID: u8 = 0x6F;

/// Handle of a registered device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceFamily {
    Etm,
    Ptm,
    Itm,
    Stm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouterKind {
    Funnel,
    Replicator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SinkKind {
    /// Embedded trace buffer.
    Etb,
    /// Embedded trace FIFO.
    Etf,
    /// Embedded trace router, writing into system memory.
    Etr,
    /// Trace port to an external probe.
    Tpiu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Core,
    TraceSource(SourceFamily),
    Router(RouterKind),
    Sink(SinkKind),
    Cti,
    /// A memory access port, connected whatever the capture mode.
    Memory,
}

impl DeviceKind {
    pub fn is_source(&self) -> bool {
        matches!(self, DeviceKind::TraceSource(_))
    }

    pub fn is_router(&self) -> bool {
        matches!(self, DeviceKind::Router(_))
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, DeviceKind::Sink(_))
    }
}

/// Optional features of a trace source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub timestamp: bool,
    pub address_range: bool,
    pub cycle_accurate: bool,
    pub context_id: bool,
}

#[derive(Clone, Debug)]
pub struct DeviceNode {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub capabilities: Capabilities,
    pub address: Option<ComponentAddress>,
    /// ATB id, only set for trace sources.
    pub stream_id: Option<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TriggerLine {
    /// An event flowing from the device into the CTI.
    Input(u8),
    /// An event flowing from the CTI into the device.
    Output(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    RoutesTo,
    TriggersVia,
    ChannelLink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Trace data from `from` enters `to` on `port`.
    RoutesTo { from: DeviceId, to: DeviceId, port: u8 },
    /// `device` is wired to `line` of `cti`. Without a channel the consumer picks one.
    TriggersVia {
        device: DeviceId,
        cti: DeviceId,
        line: TriggerLine,
        channel: Option<u8>,
    },
    /// Two CTIs exchange channel events through a cross trigger matrix.
    ChannelLink { a: DeviceId, b: DeviceId },
}

impl Edge {
    pub fn kind(&self) -> EdgeKind {
        match self {
            Edge::RoutesTo { .. } => EdgeKind::RoutesTo,
            Edge::TriggersVia { .. } => EdgeKind::TriggersVia,
            Edge::ChannelLink { .. } => EdgeKind::ChannelLink,
        }
    }

    fn starts_at(&self, id: DeviceId) -> bool {
        match *self {
            Edge::RoutesTo { from, .. } => from == id,
            Edge::TriggersVia { device, .. } => device == id,
            Edge::ChannelLink { a, b } => a == id || b == id,
        }
    }
}

/// Where a device's trigger line lands on a CTI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TriggerBinding {
    pub cti: DeviceId,
    pub line: TriggerLine,
    pub channel: Option<u8>,
}

fn blocks_overlap(a: u8, b: u8) -> bool {
    a.abs_diff(b) < STREAM_BLOCK_SIZE
}

/// Collects devices and edges during discovery.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    nodes: Vec<DeviceNode>,
    by_name: HashMap<String, DeviceId>,
    edges: Vec<Edge>,
    stream_bases: HashMap<SourceFamily, u8>,
    stream_offsets: HashMap<SourceFamily, u8>,
    allow_shared_sink_triggers: bool,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed stream id base for a macrocell family instead of the next free block.
    pub fn with_stream_base(mut self, family: SourceFamily, base: u8) -> Self {
        self.stream_bases.insert(family, base);
        self
    }

    /// Accept two sinks that halt on the same CTI output and channel.
    pub fn allow_shared_sink_triggers(mut self, allow: bool) -> Self {
        self.allow_shared_sink_triggers = allow;
        self
    }

    pub fn lookup(&self, name: &str) -> Option<DeviceId> {
        self.by_name.get(name).copied()
    }

    pub fn register_node(
        &mut self,
        name: &str,
        kind: DeviceKind,
        capabilities: Capabilities,
        address: Option<ComponentAddress>,
    ) -> Result<DeviceId, Error> {
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateDevice(name.to_owned()));
        }

        let stream_id = match kind {
            DeviceKind::TraceSource(family) => Some(self.next_stream_id(family)?),
            _ => None,
        };

        let id = DeviceId(self.nodes.len());
        log::debug!("Registered {} as {:?} ({:?})", name, kind, stream_id);
        self.nodes.push(DeviceNode {
            id,
            name: name.to_owned(),
            kind,
            capabilities,
            address,
            stream_id,
        });
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    fn next_stream_id(&mut self, family: SourceFamily) -> Result<u8, Error> {
        let base = match self.stream_bases.get(&family).copied() {
            Some(base) => {
                if !self.stream_offsets.contains_key(&family) {
                    self.check_fixed_block(family, base)?;
                }
                base
            }
            None => {
                let base = self.free_block(family)?;
                self.stream_bases.insert(family, base);
                base
            }
        };

        let offset = self.stream_offsets.entry(family).or_insert(0);
        let id = base as u16 + *offset as u16;
        if *offset >= STREAM_BLOCK_SIZE || id > LAST_STREAM_ID as u16 {
            return Err(Error::StreamIdsExhausted(family));
        }
        *offset += 1;
        Ok(id as u8)
    }

    /// The first block from [`FIRST_STREAM_ID`] on that no other family's block overlaps.
    fn free_block(&self, family: SourceFamily) -> Result<u8, Error> {
        let mut base = FIRST_STREAM_ID;
        while self
            .stream_bases
            .values()
            .any(|taken| blocks_overlap(*taken, base))
        {
            base = base
                .checked_add(STREAM_BLOCK_SIZE)
                .filter(|base| *base <= LAST_STREAM_ID)
                .ok_or(Error::StreamIdsExhausted(family))?;
        }
        Ok(base)
    }

    fn check_fixed_block(&self, family: SourceFamily, base: u8) -> Result<(), Error> {
        let other = self
            .stream_bases
            .iter()
            .find(|(other, taken)| **other != family && blocks_overlap(**taken, base));
        match other {
            Some((other, _)) => Err(Error::StreamBlocksOverlap {
                first: *other,
                second: family,
            }),
            None => Ok(()),
        }
    }

    fn kind_of(&self, id: DeviceId) -> Result<DeviceKind, Error> {
        self.nodes
            .get(id.0)
            .map(|node| node.kind)
            .ok_or_else(|| Error::InvalidEdge(format!("unknown device handle {}", id.0)))
    }

    fn name_of(&self, id: DeviceId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn register_edge(&mut self, edge: Edge) -> Result<(), Error> {
        match edge {
            Edge::RoutesTo { from, to, .. } => {
                let (from_kind, to_kind) = (self.kind_of(from)?, self.kind_of(to)?);
                if from == to || !(from_kind.is_source() || from_kind.is_router()) {
                    return Err(Error::InvalidEdge(format!(
                        "{} cannot emit trace data",
                        self.name_of(from)
                    )));
                }
                if !(to_kind.is_router() || to_kind.is_sink()) {
                    return Err(Error::InvalidEdge(format!(
                        "{} cannot receive trace data",
                        self.name_of(to)
                    )));
                }
            }
            Edge::TriggersVia {
                device,
                cti,
                line,
                channel,
            } => {
                let device_kind = self.kind_of(device)?;
                if self.kind_of(cti)? != DeviceKind::Cti || device_kind == DeviceKind::Cti {
                    return Err(Error::InvalidEdge(format!(
                        "{} cannot trigger via {}",
                        self.name_of(device),
                        self.name_of(cti)
                    )));
                }
                if let (true, TriggerLine::Output(number), Some(channel)) =
                    (device_kind.is_sink(), line, channel)
                {
                    self.check_sink_trigger(device, cti, line, number, channel)?;
                }
            }
            Edge::ChannelLink { a, b } => {
                if a == b
                    || self.kind_of(a)? != DeviceKind::Cti
                    || self.kind_of(b)? != DeviceKind::Cti
                {
                    return Err(Error::InvalidEdge(format!(
                        "channel link between {} and {} needs two CTIs",
                        self.name_of(a),
                        self.name_of(b)
                    )));
                }
            }
        }

        if self.edges.contains(&edge) {
            log::debug!("Ignoring duplicate edge {:?}", edge);
            return Ok(());
        }
        self.edges.push(edge);
        Ok(())
    }

    fn check_sink_trigger(
        &self,
        sink: DeviceId,
        cti: DeviceId,
        line: TriggerLine,
        number: u8,
        channel: u8,
    ) -> Result<(), Error> {
        let other = self.edges.iter().find_map(|edge| match *edge {
            Edge::TriggersVia {
                device,
                cti: other_cti,
                line: other_line,
                channel: Some(other_channel),
            } if device != sink
                && other_cti == cti
                && other_line == line
                && other_channel == channel
                && self.nodes[device.0].kind.is_sink() =>
            {
                Some(device)
            }
            _ => None,
        });

        let Some(other) = other else {
            return Ok(());
        };

        if self.allow_shared_sink_triggers {
            log::warn!(
                "{} and {} share CTI output {} on channel {}",
                self.name_of(other),
                self.name_of(sink),
                number,
                channel
            );
            return Ok(());
        }

        Err(Error::SharedSinkTrigger {
            first: self.name_of(other).to_owned(),
            second: self.name_of(sink).to_owned(),
            line: number,
            channel,
        })
    }

    pub fn build(self) -> Topology {
        Topology {
            nodes: self.nodes,
            by_name: self.by_name,
            edges: self.edges,
        }
    }
}

/// The sealed device graph of a debug session.
#[derive(Debug)]
pub struct Topology {
    nodes: Vec<DeviceNode>,
    by_name: HashMap<String, DeviceId>,
    edges: Vec<Edge>,
}

impl Topology {
    /// Resolve a board specific name. Absent devices are not an error.
    pub fn lookup(&self, name: &str) -> Option<DeviceId> {
        self.by_name.get(name).copied()
    }

    pub fn node(&self, id: DeviceId) -> &DeviceNode {
        &self.nodes[id.0]
    }

    pub fn name(&self, id: DeviceId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DeviceNode> {
        self.nodes.iter()
    }

    pub fn sources(&self) -> impl Iterator<Item = &DeviceNode> {
        self.nodes.iter().filter(|node| node.kind.is_source())
    }

    pub fn edges_from(&self, id: DeviceId, kind: EdgeKind) -> impl Iterator<Item = &Edge> {
        self.edges
            .iter()
            .filter(move |edge| edge.kind() == kind && edge.starts_at(id))
    }

    /// Downstream neighbours of `id` and the port each one receives the data on.
    pub fn routes_from(&self, id: DeviceId) -> impl Iterator<Item = (DeviceId, u8)> + '_ {
        self.edges_from(id, EdgeKind::RoutesTo)
            .filter_map(|edge| match *edge {
                Edge::RoutesTo { to, port, .. } => Some((to, port)),
                _ => None,
            })
    }

    /// Upstream neighbours of `id` and the port they feed.
    pub fn routes_into(&self, id: DeviceId) -> impl Iterator<Item = (DeviceId, u8)> + '_ {
        self.edges.iter().filter_map(move |edge| match *edge {
            Edge::RoutesTo { from, to, port } if to == id => Some((from, port)),
            _ => None,
        })
    }

    pub fn trigger_bindings(&self, id: DeviceId) -> impl Iterator<Item = TriggerBinding> + '_ {
        self.edges_from(id, EdgeKind::TriggersVia)
            .filter_map(|edge| match *edge {
                Edge::TriggersVia {
                    cti, line, channel, ..
                } => Some(TriggerBinding { cti, line, channel }),
                _ => None,
            })
    }

    /// The first trigger binding of `id`, if the device has a CTI at all.
    pub fn trigger_binding(&self, id: DeviceId) -> Option<TriggerBinding> {
        self.trigger_bindings(id).next()
    }

    /// All CTIs exchanging channel events with `cti`, including itself.
    pub fn cti_domain(&self, cti: DeviceId) -> BTreeSet<DeviceId> {
        let mut domain = BTreeSet::from([cti]);
        let mut queue = VecDeque::from([cti]);

        while let Some(current) = queue.pop_front() {
            for edge in self.edges_from(current, EdgeKind::ChannelLink) {
                if let Edge::ChannelLink { a, b } = *edge {
                    let other = if a == current { b } else { a };
                    if domain.insert(other) {
                        queue.push_back(other);
                    }
                }
            }
        }

        domain
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::access::Bus;

    fn source(builder: &mut TopologyBuilder, name: &str, family: SourceFamily) -> DeviceId {
        builder
            .register_node(
                name,
                DeviceKind::TraceSource(family),
                Capabilities::default(),
                None,
            )
            .unwrap()
    }

    fn plain(builder: &mut TopologyBuilder, name: &str, kind: DeviceKind) -> DeviceId {
        builder
            .register_node(
                name,
                kind,
                Capabilities::default(),
                Some(ComponentAddress::new(Bus::Apb, 0x8000_0000)),
            )
            .unwrap()
    }

    #[test]
    fn lookup_of_absent_device_is_none() {
        let mut builder = TopologyBuilder::new();
        let core = plain(&mut builder, "Cortex-A53_0", DeviceKind::Core);
        let topology = builder.build();

        assert_eq!(topology.lookup("Cortex-A53_0"), Some(core));
        assert_eq!(topology.lookup("CSCTI_9"), None);
        assert!(topology.trigger_binding(core).is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut builder = TopologyBuilder::new();
        plain(&mut builder, "CSTFunnel", DeviceKind::Router(RouterKind::Funnel));
        let result = builder.register_node(
            "CSTFunnel",
            DeviceKind::Router(RouterKind::Funnel),
            Capabilities::default(),
            None,
        );
        assert!(matches!(result, Err(Error::DuplicateDevice(_))));
    }

    #[test]
    fn stream_ids_are_grouped_per_family() {
        let mut builder = TopologyBuilder::new();
        let etm0 = source(&mut builder, "ETM_0", SourceFamily::Etm);
        let itm = source(&mut builder, "ITM", SourceFamily::Itm);
        let etm1 = source(&mut builder, "ETM_1", SourceFamily::Etm);
        let topology = builder.build();

        assert_eq!(topology.node(etm0).stream_id, Some(0x10));
        assert_eq!(topology.node(etm1).stream_id, Some(0x11));
        assert_eq!(topology.node(itm).stream_id, Some(0x20));
    }

    #[test]
    fn fixed_stream_base_is_skipped_by_other_families() {
        let mut builder = TopologyBuilder::new().with_stream_base(SourceFamily::Stm, 0x10);
        let stm = source(&mut builder, "STM", SourceFamily::Stm);
        let ptm = source(&mut builder, "PTM_0", SourceFamily::Ptm);
        let topology = builder.build();

        assert_eq!(topology.node(stm).stream_id, Some(0x10));
        assert_eq!(topology.node(ptm).stream_id, Some(0x20));
    }

    #[test]
    fn fixed_stream_base_inside_the_first_block() {
        let mut builder = TopologyBuilder::new().with_stream_base(SourceFamily::Itm, 0x18);
        let etms: Vec<DeviceId> = (0..9)
            .map(|n| source(&mut builder, &format!("ETM_{n}"), SourceFamily::Etm))
            .collect();
        let itm = source(&mut builder, "ITM", SourceFamily::Itm);
        let topology = builder.build();

        assert_eq!(topology.node(etms[0]).stream_id, Some(0x30));
        assert_eq!(topology.node(etms[8]).stream_id, Some(0x38));
        assert_eq!(topology.node(itm).stream_id, Some(0x18));

        let ids: BTreeSet<u8> = topology.sources().filter_map(|node| node.stream_id).collect();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn overlapping_fixed_stream_bases_are_rejected() {
        let mut builder = TopologyBuilder::new()
            .with_stream_base(SourceFamily::Stm, 0x20)
            .with_stream_base(SourceFamily::Itm, 0x28);

        let result = builder.register_node(
            "STM",
            DeviceKind::TraceSource(SourceFamily::Stm),
            Capabilities::default(),
            None,
        );
        assert!(matches!(
            result,
            Err(Error::StreamBlocksOverlap {
                first: SourceFamily::Itm,
                second: SourceFamily::Stm,
            })
        ));
    }

    #[test]
    fn stream_block_overflows() {
        let mut builder = TopologyBuilder::new();
        for n in 0..16 {
            source(&mut builder, &format!("ETM_{n}"), SourceFamily::Etm);
        }
        let result = builder.register_node(
            "ETM_16",
            DeviceKind::TraceSource(SourceFamily::Etm),
            Capabilities::default(),
            None,
        );
        assert!(matches!(
            result,
            Err(Error::StreamIdsExhausted(SourceFamily::Etm))
        ));
    }

    #[test]
    fn routes_must_flow_into_routers_or_sinks() {
        let mut builder = TopologyBuilder::new();
        let etm = source(&mut builder, "ETM_0", SourceFamily::Etm);
        let core = plain(&mut builder, "core", DeviceKind::Core);

        let result = builder.register_edge(Edge::RoutesTo {
            from: etm,
            to: core,
            port: 0,
        });
        assert!(matches!(result, Err(Error::InvalidEdge(_))));
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let mut builder = TopologyBuilder::new();
        let etm = source(&mut builder, "ETM_0", SourceFamily::Etm);
        let funnel = plain(&mut builder, "funnel", DeviceKind::Router(RouterKind::Funnel));
        let edge = Edge::RoutesTo {
            from: etm,
            to: funnel,
            port: 2,
        };
        builder.register_edge(edge).unwrap();
        builder.register_edge(edge).unwrap();
        let topology = builder.build();

        assert_eq!(topology.routes_into(funnel).collect::<Vec<_>>(), [(etm, 2)]);
    }

    #[test]
    fn sinks_sharing_a_cti_output_need_confirmation() {
        let edges = |builder: &mut TopologyBuilder| {
            let cti = plain(builder, "CTI_out", DeviceKind::Cti);
            let etf = plain(builder, "ETF", DeviceKind::Sink(SinkKind::Etf));
            let tpiu = plain(builder, "TPIU", DeviceKind::Sink(SinkKind::Tpiu));
            builder
                .register_edge(Edge::TriggersVia {
                    device: etf,
                    cti,
                    line: TriggerLine::Output(1),
                    channel: Some(2),
                })
                .unwrap();
            builder.register_edge(Edge::TriggersVia {
                device: tpiu,
                cti,
                line: TriggerLine::Output(1),
                channel: Some(2),
            })
        };

        let mut strict = TopologyBuilder::new();
        assert!(matches!(
            edges(&mut strict),
            Err(Error::SharedSinkTrigger { channel: 2, .. })
        ));

        let mut relaxed = TopologyBuilder::new().allow_shared_sink_triggers(true);
        assert!(edges(&mut relaxed).is_ok());
    }

    #[test]
    fn cti_domain_follows_channel_links() {
        let mut builder = TopologyBuilder::new();
        let a = plain(&mut builder, "CTI_0", DeviceKind::Cti);
        let b = plain(&mut builder, "CTI_1", DeviceKind::Cti);
        let c = plain(&mut builder, "CTI_2", DeviceKind::Cti);
        let lonely = plain(&mut builder, "CTI_3", DeviceKind::Cti);
        builder.register_edge(Edge::ChannelLink { a, b }).unwrap();
        builder.register_edge(Edge::ChannelLink { a: c, b }).unwrap();
        let topology = builder.build();

        assert_eq!(topology.cti_domain(a), BTreeSet::from([a, b, c]));
        assert_eq!(topology.cti_domain(lonely), BTreeSet::from([lonely]));
    }
}
