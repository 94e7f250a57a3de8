//! In-memory stand-ins for a debug probe and a connection lifecycle.
//!
//! Used by the command line tool to dry run a board description, and by the tests.
use std::collections::{BTreeMap, BTreeSet};

use crate::access::{AccessError, ComponentAddress, DebugRegister, DeviceAccess, RangeHandle};
use crate::cti::{AppPulse, IntAck};
use crate::engine::ConnectionLifecycle;
use crate::options::{CacheDebug, SourceSettings};
use crate::sink::SinkSettings;
use crate::topology::DeviceNode;

/// A flat register space. Registers nobody wrote read as zero.
#[derive(Debug, Default)]
pub struct SimulatedTarget {
    registers: BTreeMap<u64, u32>,
    failing: BTreeSet<u64>,
    writes: usize,
    /// Application pulses as (component base, channel).
    pulses: Vec<(u64, u8)>,
    ranges: BTreeMap<RangeHandle, u64>,
    next_handle: u32,
    comparators: Option<usize>,
}

impl SimulatedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit every trace source to `comparators` installed ranges.
    pub fn with_comparators(mut self, comparators: usize) -> Self {
        self.comparators = Some(comparators);
        self
    }

    pub fn register(&self, address: u64) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    pub fn set_register(&mut self, address: u64, value: u32) {
        self.registers.insert(address, value);
    }

    /// Make every access to `address` fail from now on.
    pub fn fail_at(&mut self, address: u64) {
        self.failing.insert(address);
    }

    /// Channels pulsed on the CTI at `base`, oldest first.
    pub fn pulses(&self, base: u64) -> Vec<u8> {
        self.pulses
            .iter()
            .filter(|(component, _)| *component == base)
            .map(|(_, channel)| *channel)
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn installed_ranges(&self, base: u64) -> usize {
        self.ranges.values().filter(|source| **source == base).count()
    }

    pub fn range_handles_issued(&self) -> u32 {
        self.next_handle
    }
}

impl DeviceAccess for SimulatedTarget {
    fn read_reg(&mut self, component: &ComponentAddress, offset: u32) -> Result<u32, AccessError> {
        let address = component.register(offset);
        if self.failing.contains(&address) {
            return Err(AccessError::Read {
                bus: component.bus,
                address,
            });
        }
        Ok(self.register(address))
    }

    fn write_reg(
        &mut self,
        component: &ComponentAddress,
        offset: u32,
        value: u32,
    ) -> Result<(), AccessError> {
        let address = component.register(offset);
        if self.failing.contains(&address) {
            return Err(AccessError::Write {
                bus: component.bus,
                address,
            });
        }
        self.writes += 1;

        match offset {
            AppPulse::ADDRESS => {
                for channel in (0..32).filter(|channel| value & (1 << channel) != 0) {
                    self.pulses.push((component.base, channel));
                }
            }
            // Write only.
            IntAck::ADDRESS => {}
            _ => {
                self.registers.insert(address, value);
            }
        }
        Ok(())
    }

    fn add_trace_range(
        &mut self,
        source: &ComponentAddress,
        start: u64,
        end: u64,
    ) -> Result<RangeHandle, AccessError> {
        if let Some(limit) = self.comparators {
            if self.installed_ranges(source.base) >= limit {
                return Err(AccessError::NoComparators(source.base));
            }
        }
        let handle = RangeHandle(self.next_handle);
        self.next_handle += 1;
        log::trace!("Range {:#X}..{:#X} on {:#X} as {:?}", start, end, source.base, handle);
        self.ranges.insert(handle, source.base);
        Ok(handle)
    }

    fn clear_trace_range(
        &mut self,
        source: &ComponentAddress,
        handle: RangeHandle,
    ) -> Result<(), AccessError> {
        match self.ranges.remove(&handle) {
            Some(base) if base == source.base => Ok(()),
            _ => Err(AccessError::Other(anyhow::anyhow!(
                "{:?} is not installed on {:#X}",
                handle,
                source.base
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connect(String),
    Disconnect(String),
    Port {
        funnel: String,
        port: u8,
        enabled: bool,
    },
    ComponentOrder {
        sink: String,
        chain: Vec<String>,
    },
    Source {
        source: String,
        settings: SourceSettings,
    },
    Sink {
        sink: String,
        settings: SinkSettings,
    },
    CacheDebug {
        core: String,
        settings: CacheDebug,
    },
}

/// Records every lifecycle call in order.
#[derive(Debug, Default)]
pub struct RecordingLifecycle {
    events: Vec<LifecycleEvent>,
    connected: BTreeSet<String>,
    failing: Option<String>,
}

impl RecordingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to connect the device called `name`.
    pub fn fail_connect(&mut self, name: &str) {
        self.failing = Some(name.to_owned());
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.connected.contains(name)
    }

    pub fn connected(&self) -> impl Iterator<Item = &str> {
        self.connected.iter().map(String::as_str)
    }
}

impl ConnectionLifecycle for RecordingLifecycle {
    fn connect(&mut self, device: &DeviceNode) -> Result<(), AccessError> {
        if self.failing.as_deref() == Some(device.name.as_str()) {
            return Err(AccessError::Other(anyhow::anyhow!(
                "{} did not power up",
                device.name
            )));
        }
        self.connected.insert(device.name.clone());
        self.events.push(LifecycleEvent::Connect(device.name.clone()));
        Ok(())
    }

    fn disconnect(&mut self, device: &DeviceNode) -> Result<(), AccessError> {
        self.connected.remove(&device.name);
        self.events
            .push(LifecycleEvent::Disconnect(device.name.clone()));
        Ok(())
    }

    fn set_funnel_port(
        &mut self,
        funnel: &DeviceNode,
        port: u8,
        enabled: bool,
    ) -> Result<(), AccessError> {
        self.events.push(LifecycleEvent::Port {
            funnel: funnel.name.clone(),
            port,
            enabled,
        });
        Ok(())
    }

    fn set_trace_component_order(
        &mut self,
        sink: &DeviceNode,
        chain: &[&DeviceNode],
    ) -> Result<(), AccessError> {
        self.events.push(LifecycleEvent::ComponentOrder {
            sink: sink.name.clone(),
            chain: chain.iter().map(|node| node.name.clone()).collect(),
        });
        Ok(())
    }

    fn configure_source(
        &mut self,
        source: &DeviceNode,
        settings: &SourceSettings,
    ) -> Result<(), AccessError> {
        self.events.push(LifecycleEvent::Source {
            source: source.name.clone(),
            settings: *settings,
        });
        Ok(())
    }

    fn configure_sink(
        &mut self,
        sink: &DeviceNode,
        settings: &SinkSettings,
    ) -> Result<(), AccessError> {
        self.events.push(LifecycleEvent::Sink {
            sink: sink.name.clone(),
            settings: *settings,
        });
        Ok(())
    }

    fn set_cache_debug(
        &mut self,
        core: &DeviceNode,
        settings: &CacheDebug,
    ) -> Result<(), AccessError> {
        self.events.push(LifecycleEvent::CacheDebug {
            core: core.name.clone(),
            settings: *settings,
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::access::Bus;

    #[test]
    fn pulses_are_not_stored() {
        let cti = ComponentAddress::new(Bus::Apb, 0x8002_0000);
        let mut target = SimulatedTarget::new();

        target.write_reg(&cti, 0x01C, 0b101).unwrap();
        target.write_reg(&cti, 0x140, 0b11).unwrap();

        assert_eq!(target.pulses(0x8002_0000), [0, 2]);
        assert_eq!(target.register(0x8002_001C), 0);
        assert_eq!(target.register(0x8002_0140), 0b11);
        assert_eq!(target.write_count(), 2);
    }

    #[test]
    fn comparators_run_out() {
        let etm = ComponentAddress::new(Bus::Apb, 0x8004_0000);
        let mut target = SimulatedTarget::new().with_comparators(1);

        let handle = target.add_trace_range(&etm, 0, 0x100).unwrap();
        assert!(matches!(
            target.add_trace_range(&etm, 0x200, 0x300),
            Err(AccessError::NoComparators(0x8004_0000))
        ));

        target.clear_trace_range(&etm, handle).unwrap();
        assert!(target.clear_trace_range(&etm, handle).is_err());
        assert!(target.add_trace_range(&etm, 0x200, 0x300).is_ok());
    }
}
