//! Reconciling the hardware with the selected capture mode and options.
//!
//! The engine is the only part of the crate with visible effects. Everything it changes on the
//! target goes through the injected [`DeviceAccess`] and [`ConnectionLifecycle`].
use std::collections::{BTreeMap, BTreeSet};

use crate::access::{AccessError, DeviceAccess};
use crate::config::{CaptureMode, EngineConfig};
use crate::enablement::{SourceEnablement, SourceSelector, Wiring};
use crate::managed::ManagedDeviceSet;
use crate::options::{get_bool, get_text, paths, CacheDebug, OptionStore, SourceSettings};
use crate::range::{TraceRange, TraceRanges};
use crate::resolver::{resolve_chain, static_routers};
use crate::sink::SinkSettings;
use crate::sync::SyncManager;
use crate::topology::{DeviceId, DeviceKind, DeviceNode, Topology, TriggerLine};
use crate::Error;

/// Powers, connects and configures devices on behalf of the engine.
pub trait ConnectionLifecycle {
    fn connect(&mut self, device: &DeviceNode) -> Result<(), AccessError>;

    fn disconnect(&mut self, device: &DeviceNode) -> Result<(), AccessError>;

    fn set_funnel_port(
        &mut self,
        funnel: &DeviceNode,
        port: u8,
        enabled: bool,
    ) -> Result<(), AccessError>;

    /// Tell a sink which routers sit between it and the sources, innermost first.
    fn set_trace_component_order(
        &mut self,
        sink: &DeviceNode,
        chain: &[&DeviceNode],
    ) -> Result<(), AccessError>;

    fn configure_source(
        &mut self,
        source: &DeviceNode,
        settings: &SourceSettings,
    ) -> Result<(), AccessError>;

    fn configure_sink(
        &mut self,
        sink: &DeviceNode,
        settings: &SinkSettings,
    ) -> Result<(), AccessError>;

    fn set_cache_debug(&mut self, core: &DeviceNode, settings: &CacheDebug)
        -> Result<(), AccessError>;
}

pub struct Engine<A: DeviceAccess, L: ConnectionLifecycle> {
    topology: Topology,
    access: A,
    lifecycle: L,
    enablement: SourceEnablement,
    managed: ManagedDeviceSet,
    sync: SyncManager,
    ranges: TraceRanges,
    modes: Vec<CaptureMode>,
    clusters: Vec<SourceSelector>,
    mode: String,
    /// Devices in the order they were connected. Empty while disconnected.
    connected: Vec<DeviceId>,
    is_connected: bool,
    /// Source enables changed while connected, applied at the next connect.
    pending_enables: BTreeMap<DeviceId, bool>,
    source_settings: BTreeMap<DeviceId, SourceSettings>,
    wanted_ranges: BTreeMap<DeviceId, TraceRange>,
    sink_settings: Option<SinkSettings>,
    applied_sink: Option<SinkSettings>,
    cache_debug: BTreeMap<DeviceId, CacheDebug>,
    applied_cache_debug: BTreeMap<DeviceId, CacheDebug>,
}

impl<A: DeviceAccess, L: ConnectionLifecycle> Engine<A, L> {
    pub fn new(
        topology: Topology,
        config: EngineConfig,
        access: A,
        lifecycle: L,
    ) -> Result<Self, Error> {
        let enablement = SourceEnablement::new(&topology);
        let sync = SyncManager::new(
            &topology,
            config.smp_groups,
            config.trace_channel,
            config.halt_on_trace_trigger,
        )?;

        let mut managed = ManagedDeviceSet::new();
        managed.add_platform(config.platform.iter().copied());
        managed.add_platform(sync.ctis());
        for mode in &config.modes {
            let devices = match &mode.sink {
                Some(sink) => capture_devices(&topology, sink.device),
                None => Vec::new(),
            };
            managed.add_to_mode(&mode.key, devices);
        }

        Ok(Self {
            topology,
            access,
            lifecycle,
            enablement,
            managed,
            sync,
            ranges: TraceRanges::new(),
            modes: config.modes,
            clusters: config.clusters,
            mode: config.default_mode,
            connected: Vec::new(),
            is_connected: false,
            pending_enables: BTreeMap::new(),
            source_settings: BTreeMap::new(),
            wanted_ranges: BTreeMap::new(),
            sink_settings: None,
            applied_sink: None,
            cache_debug: BTreeMap::new(),
            applied_cache_debug: BTreeMap::new(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn access(&self) -> &A {
        &self.access
    }

    pub fn access_mut(&mut self) -> &mut A {
        &mut self.access
    }

    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut L {
        &mut self.lifecycle
    }

    pub fn enablement(&self) -> &SourceEnablement {
        &self.enablement
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn trace_ranges(&self) -> &TraceRanges {
        &self.ranges
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Devices currently connected, in connection order.
    pub fn connected(&self) -> &[DeviceId] {
        &self.connected
    }

    /// Capture mode keys known to the engine.
    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.managed.modes()
    }

    /// Everything the connection lifecycle has to bring up for `mode`.
    pub fn get_managed_devices(&self, mode: &str) -> BTreeSet<DeviceId> {
        self.managed.set_for(mode)
    }

    /// The routers between the enabled sources and the current mode's sink.
    pub fn trace_chain(&self) -> Vec<DeviceId> {
        match self.capture_sink() {
            Some(sink) => resolve_chain(&self.topology, &self.enablement, sink),
            None => Vec::new(),
        }
    }

    fn capture_sink(&self) -> Option<DeviceId> {
        self.modes
            .iter()
            .find(|mode| mode.key == self.mode)
            .and_then(|mode| mode.sink.as_ref())
            .map(|sink| sink.device)
    }

    /// Read every option. Called before the first connect.
    pub fn apply_initial_options(&mut self, options: &dyn OptionStore) -> Result<(), Error> {
        if self.is_connected {
            log::warn!("Initial options applied while connected, applying live changes only");
            return self.apply_dynamic_options(options);
        }

        self.mode = self.read_mode(options)?;
        if !self.managed.is_known(&self.mode) {
            log::warn!("Unknown trace capture mode {}, only platform devices are managed", self.mode);
        }
        log::info!("Trace capture mode: {}", self.mode);

        for (source, enabled) in self.read_source_enables(options)? {
            self.enablement
                .set_source_enabled(&self.topology, source, enabled);
        }
        self.pending_enables.clear();

        self.source_settings = self.read_source_settings(options)?;
        self.wanted_ranges = self.read_ranges(options)?;
        self.sink_settings = self.read_sink_settings(options)?;
        self.cache_debug = self.read_cache_debug(options)?;
        Ok(())
    }

    /// Apply an option change.
    ///
    /// While connected only the capture mode, system memory buffer location, cache debug
    /// settings and trace ranges change live. Everything else waits for the next connect.
    pub fn apply_dynamic_options(&mut self, options: &dyn OptionStore) -> Result<(), Error> {
        if !self.is_connected {
            return self.apply_initial_options(options);
        }

        let mode = self.read_mode(options)?;
        if mode != self.mode {
            self.switch_mode(&mode, options)?;
        }

        for (source, enabled) in self.read_source_enables(options)? {
            if enabled != self.enablement.is_enabled(source) {
                log::info!(
                    "{} will be {} at the next connect",
                    self.topology.name(source),
                    if enabled { "enabled" } else { "disabled" }
                );
                self.pending_enables.insert(source, enabled);
            } else {
                self.pending_enables.remove(&source);
            }
        }

        let settings = self.read_source_settings(options)?;
        if settings != self.source_settings {
            log::info!("Trace source settings will change at the next connect");
            self.source_settings = settings;
        }

        let sink_settings = self.read_sink_settings(options)?;
        if sink_settings != self.applied_sink {
            match (self.capture_sink(), self.applied_sink, sink_settings) {
                (Some(sink), Some(old), Some(new)) if old.can_update_live(&new) => {
                    log::info!("Moving the trace buffer of {}", self.topology.name(sink));
                    self.lifecycle
                        .configure_sink(self.topology.node(sink), &new)?;
                    self.applied_sink = Some(new);
                }
                _ => log::info!("Sink settings will change at the next connect"),
            }
        }
        self.sink_settings = sink_settings;

        self.cache_debug = self.read_cache_debug(options)?;
        self.apply_cache_debug()?;

        self.wanted_ranges = self.read_ranges(options)?;
        self.apply_ranges()?;
        Ok(())
    }

    /// Connect the managed devices of the current mode and apply all wiring.
    ///
    /// If anything fails, whatever was connected is torn down again before the error is
    /// returned.
    pub fn connect(&mut self) -> Result<(), Error> {
        if self.is_connected {
            log::debug!("Already connected");
            return Ok(());
        }

        log::info!("Connecting in trace capture mode {}", self.mode);
        self.is_connected = true;
        if let Err(error) = self.bring_up() {
            log::error!("Connect failed: {}", error);
            if let Err(teardown) = self.teardown() {
                log::warn!("Teardown after failed connect: {}", teardown);
            }
            return Err(error);
        }
        Ok(())
    }

    fn bring_up(&mut self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.pending_enables);
        for (source, enabled) in pending {
            self.enablement
                .set_source_enabled(&self.topology, source, enabled);
        }

        let devices: Vec<DeviceId> = self.managed.set_for(&self.mode).into_iter().collect();
        self.connect_devices(&devices)?;
        self.sync.configure(&self.topology, &mut self.access)?;
        self.wire(&devices)?;
        self.wire_sink()?;
        self.apply_cache_debug()?;
        Ok(())
    }

    /// Release everything the session holds. Every step runs even if an earlier one fails.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        if !self.is_connected {
            return Ok(());
        }
        log::info!("Disconnecting");
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), Error> {
        let mut first_error = None;

        if let Err(error) = self.ranges.clear_all(&self.topology, &mut self.access) {
            first_error.get_or_insert(error);
        }
        if let Err(error) = self
            .sync
            .release_trace_gates(&self.topology, &mut self.access)
        {
            first_error.get_or_insert(error);
        }
        if let Err(error) = self.sync.unconfigure(&self.topology, &mut self.access) {
            first_error.get_or_insert(error);
        }
        while let Some(device) = self.connected.pop() {
            if let Err(error) = self.lifecycle.disconnect(self.topology.node(device)) {
                log::warn!(
                    "Failed to disconnect {}: {}",
                    self.topology.name(device),
                    error
                );
                first_error.get_or_insert(error.into());
            }
        }

        self.applied_sink = None;
        self.applied_cache_debug.clear();
        self.is_connected = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Move to another capture mode.
    ///
    /// While connected, devices only the old mode needs are disconnected before devices only the
    /// new mode needs are connected; shared devices stay connected. A failure tears the whole
    /// session down.
    pub fn switch_mode(&mut self, mode: &str, options: &dyn OptionStore) -> Result<(), Error> {
        if mode == self.mode {
            return Ok(());
        }
        if !self.managed.is_known(mode) {
            log::warn!("Unknown trace capture mode {}", mode);
        }

        if !self.is_connected {
            self.mode = mode.to_owned();
            self.sink_settings = self.read_sink_settings(options)?;
            return Ok(());
        }

        log::info!("Switching trace capture mode {} -> {}", self.mode, mode);
        if let Err(error) = self.move_to(mode, options) {
            log::error!("Mode switch failed: {}", error);
            if let Err(teardown) = self.teardown() {
                log::warn!("Teardown after failed mode switch: {}", teardown);
            }
            return Err(error);
        }
        Ok(())
    }

    fn move_to(&mut self, mode: &str, options: &dyn OptionStore) -> Result<(), Error> {
        let transition = self.managed.transition(&self.mode, mode);

        self.unwire_sink()?;
        for &device in &transition.disconnect {
            self.unwire_source(device)?;
        }

        let mut first_error = None;
        for device in self.connected.clone().into_iter().rev() {
            if !transition.disconnect.contains(&device) {
                continue;
            }
            if let Err(error) = self.lifecycle.disconnect(self.topology.node(device)) {
                first_error.get_or_insert(Error::from(error));
            }
            self.connected.retain(|connected| *connected != device);
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        self.mode = mode.to_owned();
        self.sink_settings = self.read_sink_settings(options)?;

        self.connect_devices(&transition.connect)?;
        self.wire(&transition.connect)?;
        self.wire_sink()?;
        Ok(())
    }

    /// Enable or disable a trace source right away.
    pub fn set_source_enabled(&mut self, source: DeviceId, enabled: bool) -> Result<(), Error> {
        self.pending_enables.remove(&source);
        let wiring = self
            .enablement
            .set_source_enabled(&self.topology, source, enabled);
        if !self.is_connected {
            return Ok(());
        }

        for change in wiring {
            match change {
                Wiring::Port {
                    router,
                    port,
                    enabled,
                } if self.connected.contains(&router) => {
                    self.lifecycle
                        .set_funnel_port(self.topology.node(router), port, enabled)?;
                }
                Wiring::Port { .. } => {}
                Wiring::Trigger {
                    device,
                    binding,
                    enabled,
                } if self.connected.contains(&device)
                    && self.connected.contains(&binding.cti) =>
                {
                    self.sync
                        .set_trace_gate(&self.topology, &mut self.access, binding, enabled)?;
                }
                Wiring::Trigger { .. } => {}
            }
        }

        if enabled && self.connected.contains(&source) {
            self.configure_source(source)?;
        } else if !enabled {
            self.ranges.clear(&self.topology, &mut self.access, source)?;
        }
        self.wire_sink_chain()
    }

    pub fn go(&mut self, core: DeviceId) -> Result<(), Error> {
        if !self.is_connected {
            return Err(Error::NotConnected);
        }
        self.sync.go(&self.topology, &mut self.access, core)
    }

    pub fn stop(&mut self, core: DeviceId) -> Result<(), Error> {
        if !self.is_connected {
            return Err(Error::NotConnected);
        }
        self.sync.stop(&self.topology, &mut self.access, core)
    }

    pub fn external_event(&mut self, channel: u8) {
        self.sync.external_event(channel)
    }

    fn connect_devices(&mut self, devices: &[DeviceId]) -> Result<(), Error> {
        for &device in devices {
            log::debug!("Connecting {}", self.topology.name(device));
            self.lifecycle.connect(self.topology.node(device))?;
            self.connected.push(device);
        }
        Ok(())
    }

    /// Funnel ports first, then source triggers and source configuration.
    fn wire(&mut self, devices: &[DeviceId]) -> Result<(), Error> {
        let ports: Vec<(DeviceId, u8, bool)> = self
            .enablement
            .ports()
            .filter(|(router, _, _)| devices.contains(router))
            .collect();
        for (router, port, enabled) in ports {
            self.lifecycle
                .set_funnel_port(self.topology.node(router), port, enabled)?;
        }

        let sources: Vec<DeviceId> = devices
            .iter()
            .copied()
            .filter(|device| self.enablement.is_enabled(*device))
            .collect();
        for source in sources {
            let bindings: Vec<_> = self
                .topology
                .trigger_bindings(source)
                .filter(|binding| matches!(binding.line, TriggerLine::Input(_)))
                .collect();
            for binding in bindings {
                self.sync
                    .set_trace_gate(&self.topology, &mut self.access, binding, true)?;
            }
            self.configure_source(source)?;
        }
        Ok(())
    }

    fn configure_source(&mut self, source: DeviceId) -> Result<(), Error> {
        let settings = self
            .source_settings
            .get(&source)
            .copied()
            .unwrap_or_default();
        self.lifecycle
            .configure_source(self.topology.node(source), &settings)?;

        let wanted = self.wanted_ranges.get(&source).copied();
        self.ranges
            .apply(&self.topology, &mut self.access, source, wanted)
    }

    fn wire_sink(&mut self) -> Result<(), Error> {
        let Some(sink) = self.capture_sink() else {
            return Ok(());
        };

        let bindings: Vec<_> = self
            .topology
            .trigger_bindings(sink)
            .filter(|binding| matches!(binding.line, TriggerLine::Output(_)))
            .collect();
        for binding in bindings {
            self.sync
                .set_trace_gate(&self.topology, &mut self.access, binding, true)?;
        }

        self.wire_sink_chain()?;

        if let Some(settings) = self.sink_settings {
            self.lifecycle
                .configure_sink(self.topology.node(sink), &settings)?;
            self.applied_sink = Some(settings);
        }
        Ok(())
    }

    fn wire_sink_chain(&mut self) -> Result<(), Error> {
        let Some(sink) = self.capture_sink() else {
            return Ok(());
        };
        if !self.connected.contains(&sink) {
            return Ok(());
        }
        let chain = resolve_chain(&self.topology, &self.enablement, sink);
        let nodes: Vec<&DeviceNode> = chain.iter().map(|id| self.topology.node(*id)).collect();
        self.lifecycle
            .set_trace_component_order(self.topology.node(sink), &nodes)?;
        Ok(())
    }

    fn unwire_sink(&mut self) -> Result<(), Error> {
        let Some(sink) = self.capture_sink() else {
            return Ok(());
        };
        let bindings: Vec<_> = self
            .topology
            .trigger_bindings(sink)
            .filter(|binding| matches!(binding.line, TriggerLine::Output(_)))
            .collect();
        for binding in bindings {
            self.sync
                .set_trace_gate(&self.topology, &mut self.access, binding, false)?;
        }
        self.applied_sink = None;
        Ok(())
    }

    /// Drop the range filter and trigger gates of a source about to be disconnected.
    fn unwire_source(&mut self, source: DeviceId) -> Result<(), Error> {
        if !self.topology.node(source).kind.is_source() {
            return Ok(());
        }
        self.ranges.clear(&self.topology, &mut self.access, source)?;
        let bindings: Vec<_> = self
            .topology
            .trigger_bindings(source)
            .filter(|binding| matches!(binding.line, TriggerLine::Input(_)))
            .collect();
        for binding in bindings {
            self.sync
                .set_trace_gate(&self.topology, &mut self.access, binding, false)?;
        }
        Ok(())
    }

    fn apply_cache_debug(&mut self) -> Result<(), Error> {
        let changed: Vec<(DeviceId, CacheDebug)> = self
            .cache_debug
            .iter()
            .filter(|(core, settings)| self.applied_cache_debug.get(*core) != Some(*settings))
            .map(|(core, settings)| (*core, *settings))
            .collect();
        for (core, settings) in changed {
            self.lifecycle
                .set_cache_debug(self.topology.node(core), &settings)?;
            self.applied_cache_debug.insert(core, settings);
        }
        Ok(())
    }

    fn apply_ranges(&mut self) -> Result<(), Error> {
        let sources: Vec<DeviceId> = self
            .topology
            .sources()
            .filter(|source| source.capabilities.address_range)
            .map(|source| source.id)
            .filter(|source| self.enablement.is_enabled(*source) && self.connected.contains(source))
            .collect();
        for source in sources {
            let wanted = self.wanted_ranges.get(&source).copied();
            self.ranges
                .apply(&self.topology, &mut self.access, source, wanted)?;
        }
        Ok(())
    }

    fn read_mode(&self, options: &dyn OptionStore) -> Result<String, Error> {
        Ok(get_text(options, paths::TRACE_CAPTURE)?.unwrap_or_else(|| self.mode.clone()))
    }

    fn read_source_enables(&self, options: &dyn OptionStore) -> Result<Vec<(DeviceId, bool)>, Error> {
        let mut cluster_enabled = BTreeMap::new();
        for cluster in &self.clusters {
            let enabled = get_bool(options, &paths::cluster_enabled(cluster.cluster()), true)?;
            cluster_enabled.insert(cluster.cluster(), enabled);
        }

        let mut enables = Vec::new();
        for source in self.topology.sources() {
            let cluster_on = self
                .clusters
                .iter()
                .filter(|cluster| cluster.contains(source.id))
                .all(|cluster| cluster_enabled[cluster.cluster()]);
            let enabled = get_bool(options, &paths::trace(&source.name, "enabled"), true)?;
            enables.push((source.id, cluster_on && enabled));
        }
        Ok(enables)
    }

    fn read_source_settings(
        &self,
        options: &dyn OptionStore,
    ) -> Result<BTreeMap<DeviceId, SourceSettings>, Error> {
        self.topology
            .sources()
            .map(|source| Ok((source.id, SourceSettings::read(options, source)?)))
            .collect()
    }

    fn read_ranges(&self, options: &dyn OptionStore) -> Result<BTreeMap<DeviceId, TraceRange>, Error> {
        let mut ranges = BTreeMap::new();
        for source in self.topology.sources() {
            let Some(range) = TraceRange::read(options, &source.name)? else {
                continue;
            };
            if !source.capabilities.address_range {
                log::warn!("{} cannot filter by address, ignoring its trace range", source.name);
                continue;
            }
            ranges.insert(source.id, range);
        }
        Ok(ranges)
    }

    fn read_sink_settings(&self, options: &dyn OptionStore) -> Result<Option<SinkSettings>, Error> {
        let Some(sink) = self
            .modes
            .iter()
            .find(|mode| mode.key == self.mode)
            .and_then(|mode| mode.sink.as_ref())
        else {
            return Ok(None);
        };
        sink.factory
            .settings(self.topology.node(sink.device), options)
            .map(Some)
    }

    fn read_cache_debug(
        &self,
        options: &dyn OptionStore,
    ) -> Result<BTreeMap<DeviceId, CacheDebug>, Error> {
        self.topology
            .nodes()
            .filter(|node| node.kind == DeviceKind::Core)
            .map(|core| Ok((core.id, CacheDebug::read(options, &core.name)?)))
            .collect()
    }
}

/// The sink, every router and source that can reach it, and the CTIs they trigger through.
fn capture_devices(topology: &Topology, sink: DeviceId) -> Vec<DeviceId> {
    let routers = static_routers(topology, sink);
    let mut devices = vec![sink];

    for hop in std::iter::once(sink).chain(routers.iter().copied()) {
        for (from, _) in topology.routes_into(hop) {
            if topology.node(from).kind.is_source() && !devices.contains(&from) {
                devices.push(from);
            }
        }
    }
    devices.extend(routers);

    let ctis: Vec<DeviceId> = devices
        .iter()
        .flat_map(|device| topology.trigger_bindings(*device).map(|binding| binding.cti))
        .collect();
    devices.extend(ctis);
    devices
}
