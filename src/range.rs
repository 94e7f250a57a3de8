//! Address range filters installed on trace sources.
use std::collections::BTreeMap;

use crate::access::{DeviceAccess, RangeHandle};
use crate::options::{get_bool, get_int, paths, OptionStore};
use crate::topology::{DeviceId, Topology};
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceRange {
    pub start: u64,
    pub end: u64,
}

impl TraceRange {
    pub fn new(start: u64, end: u64) -> Result<Self, Error> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// The range selected for `source`, if range filtering is switched on.
    pub fn read(store: &dyn OptionStore, source: &str) -> Result<Option<Self>, Error> {
        if !get_bool(store, &paths::trace(source, "traceRange"), false)? {
            return Ok(None);
        }
        let start = get_int(store, &paths::trace(source, "traceRange.start"))?.unwrap_or(0);
        let end = get_int(store, &paths::trace(source, "traceRange.end"))?.unwrap_or(u64::MAX);
        Self::new(start, end).map(Some)
    }
}

#[derive(Clone, Copy, Debug)]
struct Installed {
    range: TraceRange,
    handle: RangeHandle,
}

/// At most one installed range per source.
#[derive(Debug, Default)]
pub struct TraceRanges {
    installed: BTreeMap<DeviceId, Installed>,
}

impl TraceRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn range(&self, source: DeviceId) -> Option<TraceRange> {
        self.installed.get(&source).map(|installed| installed.range)
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }

    /// Install `range` on `source`, releasing the filter installed before.
    pub fn install(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
        source: DeviceId,
        range: TraceRange,
    ) -> Result<(), Error> {
        let node = topology.node(source);
        if !node.capabilities.address_range {
            return Err(Error::RangeUnsupported(node.name.clone()));
        }
        let address = node
            .address
            .ok_or_else(|| Error::InvalidEdge(format!("{} has no address", node.name)))?;

        self.clear(topology, interface, source)?;

        let handle = interface.add_trace_range(&address, range.start, range.end)?;
        log::debug!(
            "Tracing {:#X}..{:#X} on {} ({:?})",
            range.start,
            range.end,
            node.name,
            handle
        );
        self.installed.insert(source, Installed { range, handle });
        Ok(())
    }

    /// Release the filter of `source`, if any.
    pub fn clear(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
        source: DeviceId,
    ) -> Result<(), Error> {
        let Some(installed) = self.installed.get(&source).copied() else {
            return Ok(());
        };
        let node = topology.node(source);
        if let Some(address) = node.address {
            interface.clear_trace_range(&address, installed.handle)?;
        }
        self.installed.remove(&source);
        Ok(())
    }

    /// Bring `source` to `wanted`, leaving it alone if it already is.
    pub fn apply(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
        source: DeviceId,
        wanted: Option<TraceRange>,
    ) -> Result<(), Error> {
        match wanted {
            Some(range) if self.range(source) == Some(range) => Ok(()),
            Some(range) => self.install(topology, interface, source, range),
            None => self.clear(topology, interface, source),
        }
    }

    /// Release every installed filter. The first error is returned after all were visited.
    pub fn clear_all(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
    ) -> Result<(), Error> {
        let sources: Vec<DeviceId> = self.installed.keys().copied().collect();
        let mut first_error = None;
        for source in sources {
            if let Err(error) = self.clear(topology, interface, source) {
                log::warn!(
                    "Failed to clear the trace range of {}: {}",
                    topology.name(source),
                    error
                );
                self.installed.remove(&source);
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
