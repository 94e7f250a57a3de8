//! Capture devices.
//!
//! Each trace capture mode names a sink and the kind of device behind it. The device kind is
//! picked once from the board description; a [`SinkFactory`] then turns the session options
//! into the settings handed to the connection lifecycle.
use serde::Deserialize;

use crate::options::{get_int, paths, OptionStore};
use crate::topology::DeviceNode;
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    /// Trace memory is used as a circular buffer. When the buffer fills, incoming trace data will
    /// overwrite older trace memory until the trace is stopped.
    Circular,

    /// The trace memory is used as a FIFO that can be manually read. When the buffer fills, the
    /// incoming trace stream is stalled.
    Software,

    /// Trace memory is used as a FIFO that is drained through hardware to the TPIU.
    Hardware,
}

/// External trace probes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum ProbeVariant {
    #[serde(rename = "DSTREAM-ST")]
    St,
    #[serde(rename = "DSTREAM-PT")]
    Pt,
    #[serde(rename = "DSTREAM-HT")]
    Ht,
}

impl ProbeVariant {
    pub fn name(&self) -> &'static str {
        match self {
            ProbeVariant::St => "DSTREAM-ST",
            ProbeVariant::Pt => "DSTREAM-PT",
            ProbeVariant::Ht => "DSTREAM-HT",
        }
    }

    /// Trace port widths in bits, widest last.
    pub fn port_widths(&self) -> &'static [u64] {
        match self {
            ProbeVariant::St => &[1, 2, 4],
            ProbeVariant::Pt | ProbeVariant::Ht => &[1, 2, 4, 8, 16, 32],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkSettings {
    Buffer { mode: BufferMode },
    SystemMemory { base: u64, size: u64 },
    TracePort { probe: ProbeVariant, width: u64 },
}

impl SinkSettings {
    /// Whether moving from `self` to `new` can happen while trace is being captured.
    ///
    /// Only the location and size of a system memory buffer can change live.
    pub fn can_update_live(&self, new: &SinkSettings) -> bool {
        matches!(
            (self, new),
            (SinkSettings::SystemMemory { .. }, SinkSettings::SystemMemory { .. })
        )
    }
}

pub trait SinkFactory: std::fmt::Debug {
    fn settings(&self, sink: &DeviceNode, options: &dyn OptionStore)
        -> Result<SinkSettings, Error>;
}

/// ETB or ETF, configured once.
#[derive(Debug)]
pub struct OnChipBuffer {
    pub mode: BufferMode,
}

impl SinkFactory for OnChipBuffer {
    fn settings(&self, _: &DeviceNode, _: &dyn OptionStore) -> Result<SinkSettings, Error> {
        Ok(SinkSettings::Buffer { mode: self.mode })
    }
}

/// ETR writing into a buffer in system memory.
#[derive(Debug)]
pub struct SystemMemoryBuffer {
    pub base: u64,
    pub size: u64,
}

impl SinkFactory for SystemMemoryBuffer {
    fn settings(
        &self,
        sink: &DeviceNode,
        options: &dyn OptionStore,
    ) -> Result<SinkSettings, Error> {
        let base = get_int(options, &paths::trace(&sink.name, "bufferBase"))?.unwrap_or(self.base);
        let size_path = paths::trace(&sink.name, "bufferSize");
        let size = get_int(options, &size_path)?.unwrap_or(self.size);
        if size == 0 || size % 4 != 0 {
            return Err(Error::OptionType {
                path: size_path,
                expected: "a non-zero multiple of 4",
            });
        }
        Ok(SinkSettings::SystemMemory { base, size })
    }
}

/// A TPIU streaming to an external probe.
#[derive(Debug)]
pub struct ExternalProbe {
    pub probe: ProbeVariant,
}

impl SinkFactory for ExternalProbe {
    fn settings(
        &self,
        sink: &DeviceNode,
        options: &dyn OptionStore,
    ) -> Result<SinkSettings, Error> {
        let widths = self.probe.port_widths();
        let width = get_int(options, &paths::trace(&sink.name, "portWidth"))?
            .unwrap_or(widths[widths.len() - 1]);
        if !widths.contains(&width) {
            return Err(Error::UnsupportedPortWidth {
                width,
                probe: self.probe.name(),
            });
        }
        Ok(SinkSettings::TracePort {
            probe: self.probe,
            width,
        })
    }
}

/// The capture device behind a mode, as written in a board description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum CaptureDevice {
    Buffer {
        mode: BufferMode,
    },
    SystemMemory {
        #[serde(default)]
        base: u64,
        #[serde(default = "default_buffer_size")]
        size: u64,
    },
    Probe {
        variant: ProbeVariant,
    },
}

fn default_buffer_size() -> u64 {
    0x10_0000
}

impl CaptureDevice {
    pub fn factory(&self) -> Box<dyn SinkFactory> {
        match *self {
            CaptureDevice::Buffer { mode } => Box::new(OnChipBuffer { mode }),
            CaptureDevice::SystemMemory { base, size } => {
                Box::new(SystemMemoryBuffer { base, size })
            }
            CaptureDevice::Probe { variant } => Box::new(ExternalProbe { probe: variant }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::MemoryOptionStore;
    use crate::topology::{Capabilities, DeviceKind, SinkKind, Topology, TopologyBuilder};

    fn sink(name: &str, kind: SinkKind) -> Topology {
        let mut builder = TopologyBuilder::new();
        builder
            .register_node(name, DeviceKind::Sink(kind), Capabilities::default(), None)
            .unwrap();
        builder.build()
    }

    #[test]
    fn probe_port_width_is_checked() {
        let topology = sink("TPIU", SinkKind::Tpiu);
        let tpiu = topology.node(topology.lookup("TPIU").unwrap());
        let mut options = MemoryOptionStore::new();

        let st = CaptureDevice::Probe {
            variant: ProbeVariant::St,
        }
        .factory();
        assert_eq!(
            st.settings(tpiu, &options).unwrap(),
            SinkSettings::TracePort {
                probe: ProbeVariant::St,
                width: 4
            }
        );

        options.set("options.trace.TPIU.portWidth", 16u64);
        assert!(matches!(
            st.settings(tpiu, &options),
            Err(Error::UnsupportedPortWidth { width: 16, .. })
        ));

        let pt = ExternalProbe {
            probe: ProbeVariant::Pt,
        };
        assert_eq!(
            pt.settings(tpiu, &options).unwrap(),
            SinkSettings::TracePort {
                probe: ProbeVariant::Pt,
                width: 16
            }
        );
    }

    #[test]
    fn system_memory_buffer_reads_base_and_size() {
        let topology = sink("ETR", SinkKind::Etr);
        let etr = topology.node(topology.lookup("ETR").unwrap());
        let factory = SystemMemoryBuffer {
            base: 0x8000_0000,
            size: 0x1000,
        };
        let mut options = MemoryOptionStore::new();
        options.set("options.trace.ETR.bufferSize", 0x4000u64);

        let settings = factory.settings(etr, &options).unwrap();
        assert_eq!(
            settings,
            SinkSettings::SystemMemory {
                base: 0x8000_0000,
                size: 0x4000
            }
        );
        assert!(settings.can_update_live(&SinkSettings::SystemMemory { base: 0, size: 4 }));
        assert!(!SinkSettings::Buffer {
            mode: BufferMode::Circular
        }
        .can_update_live(&SinkSettings::Buffer {
            mode: BufferMode::Software
        }));

        options.set("options.trace.ETR.bufferSize", 0u64);
        assert!(factory.settings(etr, &options).is_err());
    }

    #[test]
    fn capture_devices_from_yaml() {
        let device: CaptureDevice =
            serde_yaml::from_str("device: probe\nvariant: DSTREAM-HT\n").unwrap();
        assert_eq!(
            device,
            CaptureDevice::Probe {
                variant: ProbeVariant::Ht
            }
        );

        let device: CaptureDevice = serde_yaml::from_str("device: buffer\nmode: circular\n").unwrap();
        assert_eq!(
            device,
            CaptureDevice::Buffer {
                mode: BufferMode::Circular
            }
        );
    }
}
