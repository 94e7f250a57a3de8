//! Engine configuration and board descriptions.
//!
//! A [`BoardDescription`] is the device inventory of one board: its components, how trace data
//! flows between them, how they are wired to CTIs, and which capture modes it offers. It is
//! resolved once into a [`Topology`] and an [`EngineConfig`]; names are not used after that.
use std::collections::BTreeMap;

use serde::Deserialize;

use crate::access::{Bus, ComponentAddress};
use crate::enablement::SourceSelector;
use crate::sink::{CaptureDevice, SinkFactory};
use crate::sync::{CoreTriggers, SmpGroup, SyncChannels};
use crate::topology::{
    Capabilities, DeviceId, DeviceKind, Edge, RouterKind, SinkKind, SourceFamily, Topology,
    TopologyBuilder, TriggerLine,
};
use crate::Error;

pub const DEFAULT_TRACE_CHANNEL: u8 = 2;
pub const NO_CAPTURE: &str = "none";

/// The sink behind a capture mode and how to configure it.
#[derive(Debug)]
pub struct CaptureSink {
    pub device: DeviceId,
    pub factory: Box<dyn SinkFactory>,
}

#[derive(Debug)]
pub struct CaptureMode {
    pub key: String,
    pub sink: Option<CaptureSink>,
}

#[derive(Debug)]
pub struct EngineConfig {
    /// Devices connected whatever the capture mode, such as memory access ports.
    pub platform: Vec<DeviceId>,
    pub smp_groups: Vec<SmpGroup>,
    pub clusters: Vec<SourceSelector>,
    pub modes: Vec<CaptureMode>,
    pub default_mode: String,
    pub trace_channel: u8,
    /// Halt the SMP groups when a trace trigger fires.
    pub halt_on_trace_trigger: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            platform: Vec::new(),
            smp_groups: Vec::new(),
            clusters: Vec::new(),
            modes: vec![CaptureMode {
                key: NO_CAPTURE.to_owned(),
                sink: None,
            }],
            default_mode: NO_CAPTURE.to_owned(),
            trace_channel: DEFAULT_TRACE_CHANNEL,
            halt_on_trace_trigger: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindDescription {
    Core,
    Etm,
    Ptm,
    Itm,
    Stm,
    Funnel,
    Replicator,
    Etb,
    Etf,
    Etr,
    Tpiu,
    Cti,
    Memory,
}

impl From<KindDescription> for DeviceKind {
    fn from(kind: KindDescription) -> Self {
        match kind {
            KindDescription::Core => DeviceKind::Core,
            KindDescription::Etm => DeviceKind::TraceSource(SourceFamily::Etm),
            KindDescription::Ptm => DeviceKind::TraceSource(SourceFamily::Ptm),
            KindDescription::Itm => DeviceKind::TraceSource(SourceFamily::Itm),
            KindDescription::Stm => DeviceKind::TraceSource(SourceFamily::Stm),
            KindDescription::Funnel => DeviceKind::Router(RouterKind::Funnel),
            KindDescription::Replicator => DeviceKind::Router(RouterKind::Replicator),
            KindDescription::Etb => DeviceKind::Sink(SinkKind::Etb),
            KindDescription::Etf => DeviceKind::Sink(SinkKind::Etf),
            KindDescription::Etr => DeviceKind::Sink(SinkKind::Etr),
            KindDescription::Tpiu => DeviceKind::Sink(SinkKind::Tpiu),
            KindDescription::Cti => DeviceKind::Cti,
            KindDescription::Memory => DeviceKind::Memory,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceDescription {
    pub name: String,
    pub kind: KindDescription,
    pub bus: Option<Bus>,
    pub base: Option<u64>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RouteDescription {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub port: u8,
}

/// A device wired to one CTI trigger line. Exactly one of `input` and `output` is set.
#[derive(Clone, Debug, Deserialize)]
pub struct TriggerDescription {
    pub device: String,
    pub cti: String,
    pub input: Option<u8>,
    pub output: Option<u8>,
    pub channel: Option<u8>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CoreTriggerDescription {
    pub core: String,
    pub cti: String,
    #[serde(default)]
    pub stop_input: u8,
    #[serde(default)]
    pub halt_output: u8,
    #[serde(default = "default_start_output")]
    pub start_output: u8,
}

fn default_start_output() -> u8 {
    1
}

#[derive(Clone, Debug, Deserialize)]
pub struct SmpGroupDescription {
    pub name: String,
    pub channels: SyncChannels,
    pub cores: Vec<CoreTriggerDescription>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModeDescription {
    pub key: String,
    pub sink: Option<String>,
    pub capture: Option<CaptureDevice>,
}

fn default_trace_channel() -> u8 {
    DEFAULT_TRACE_CHANNEL
}

fn default_mode() -> String {
    NO_CAPTURE.to_owned()
}

#[derive(Clone, Debug, Deserialize)]
pub struct BoardDescription {
    pub name: String,
    pub devices: Vec<DeviceDescription>,
    #[serde(default)]
    pub routes: Vec<RouteDescription>,
    #[serde(default)]
    pub triggers: Vec<TriggerDescription>,
    #[serde(default)]
    pub channel_links: Vec<(String, String)>,
    #[serde(default)]
    pub platform: Vec<String>,
    #[serde(default)]
    pub clusters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub smp_groups: Vec<SmpGroupDescription>,
    #[serde(default)]
    pub modes: Vec<ModeDescription>,
    #[serde(default = "default_mode")]
    pub default_mode: String,
    #[serde(default = "default_trace_channel")]
    pub trace_channel: u8,
    #[serde(default)]
    pub halt_on_trace_trigger: bool,
    #[serde(default)]
    pub allow_shared_sink_triggers: bool,
    #[serde(default)]
    pub stream_bases: BTreeMap<KindDescription, u8>,
}

impl BoardDescription {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Register every device and edge, and resolve the configuration against them.
    ///
    /// Edges naming a device the board does not have are skipped.
    pub fn resolve(&self) -> Result<(Topology, EngineConfig), Error> {
        let mut builder =
            TopologyBuilder::new().allow_shared_sink_triggers(self.allow_shared_sink_triggers);
        for (kind, base) in &self.stream_bases {
            match DeviceKind::from(*kind) {
                DeviceKind::TraceSource(family) => {
                    builder = builder.with_stream_base(family, *base);
                }
                other => log::warn!("{:?} has no trace stream ids", other),
            }
        }

        for device in &self.devices {
            let address = match (device.bus, device.base) {
                (Some(bus), Some(base)) => Some(ComponentAddress::new(bus, base)),
                (None, Some(base)) => Some(ComponentAddress::new(Bus::Apb, base)),
                _ => None,
            };
            builder.register_node(
                &device.name,
                device.kind.into(),
                device.capabilities,
                address,
            )?;
        }

        for route in &self.routes {
            let (Some(from), Some(to)) = (builder.lookup(&route.from), builder.lookup(&route.to))
            else {
                log::debug!("Skipping route {} -> {}", route.from, route.to);
                continue;
            };
            builder.register_edge(Edge::RoutesTo {
                from,
                to,
                port: route.port,
            })?;
        }

        for trigger in &self.triggers {
            let (Some(device), Some(cti)) = (builder.lookup(&trigger.device), builder.lookup(&trigger.cti))
            else {
                log::debug!("Skipping trigger {} -> {}", trigger.device, trigger.cti);
                continue;
            };
            let line = match (trigger.input, trigger.output) {
                (Some(input), None) => TriggerLine::Input(input),
                (None, Some(output)) => TriggerLine::Output(output),
                _ => {
                    return Err(Error::InvalidEdge(format!(
                        "trigger of {} needs either an input or an output",
                        trigger.device
                    )))
                }
            };
            builder.register_edge(Edge::TriggersVia {
                device,
                cti,
                line,
                channel: trigger.channel,
            })?;
        }

        for (a, b) in &self.channel_links {
            if let (Some(a), Some(b)) = (builder.lookup(a), builder.lookup(b)) {
                builder.register_edge(Edge::ChannelLink { a, b })?;
            }
        }

        let topology = builder.build();
        let config = self.config(&topology)?;
        Ok((topology, config))
    }

    fn config(&self, topology: &Topology) -> Result<EngineConfig, Error> {
        let clusters = self
            .clusters
            .iter()
            .map(|(cluster, sources)| SourceSelector::new(cluster, present(topology, sources)))
            .collect();

        let mut smp_groups = Vec::new();
        for group in &self.smp_groups {
            let mut members = Vec::new();
            for core in &group.cores {
                let Some(core_id) = topology.lookup(&core.core) else {
                    log::debug!("{} is not present on this board", core.core);
                    continue;
                };
                let Some(cti) = topology.lookup(&core.cti) else {
                    log::warn!("{} has no CTI, it will not be synchronized", core.core);
                    continue;
                };
                members.push(CoreTriggers {
                    core: core_id,
                    cti,
                    stop_input: core.stop_input,
                    halt_output: core.halt_output,
                    start_output: core.start_output,
                });
            }
            smp_groups.push(SmpGroup::new(&group.name, members, group.channels));
        }

        let mut modes = Vec::new();
        for mode in &self.modes {
            let sink = match (&mode.sink, &mode.capture) {
                (None, _) => None,
                (Some(name), capture) => {
                    let device = topology
                        .lookup(name)
                        .ok_or_else(|| Error::UnknownDevice(name.clone()))?;
                    let capture = (*capture).unwrap_or(CaptureDevice::Buffer {
                        mode: crate::sink::BufferMode::Circular,
                    });
                    Some(CaptureSink {
                        device,
                        factory: capture.factory(),
                    })
                }
            };
            modes.push(CaptureMode {
                key: mode.key.clone(),
                sink,
            });
        }
        if !modes.iter().any(|mode| mode.key == NO_CAPTURE) {
            modes.push(CaptureMode {
                key: NO_CAPTURE.to_owned(),
                sink: None,
            });
        }

        Ok(EngineConfig {
            platform: present(topology, &self.platform),
            smp_groups,
            clusters,
            modes,
            default_mode: self.default_mode.clone(),
            trace_channel: self.trace_channel,
            halt_on_trace_trigger: self.halt_on_trace_trigger,
        })
    }
}

fn present(topology: &Topology, names: &[String]) -> Vec<DeviceId> {
    names
        .iter()
        .filter_map(|name| {
            let id = topology.lookup(name);
            if id.is_none() {
                log::debug!("{} is not present on this board", name);
            }
            id
        })
        .collect()
}
