//! Run control and trace synchronization over CTI channels.
//!
//! An SMP group owns two channels of its cross trigger domain: a stop channel every member's
//! halt event is broadcast on and every member halts on, and a start channel every member
//! restarts on. Trace sinks and sources share a third channel, so a trace trigger can halt the
//! cores through the same mechanism without touching the run control channels.
use std::collections::BTreeSet;

use serde::Deserialize;

use crate::access::DeviceAccess;
use crate::cti::CrossTrigger;
use crate::topology::{DeviceId, DeviceKind, Topology, TriggerBinding, TriggerLine};
use crate::Error;

/// Highest channel and trigger number a CTI register can address.
const MAX_LINE: u8 = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct SyncChannels {
    pub stop: u8,
    pub start: u8,
}

/// How a core is attached to its CTI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreTriggers {
    pub core: DeviceId,
    pub cti: DeviceId,
    /// Trigger input raised when the core halts.
    pub stop_input: u8,
    /// Trigger output requesting a halt.
    pub halt_output: u8,
    /// Trigger output requesting a restart.
    pub start_output: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Unconfigured,
    /// Channels programmed, cores halted.
    Configured,
    Running,
}

#[derive(Clone, Debug)]
pub struct SmpGroup {
    name: String,
    members: Vec<CoreTriggers>,
    channels: SyncChannels,
    state: SyncState,
}

impl SmpGroup {
    pub fn new(name: &str, members: Vec<CoreTriggers>, channels: SyncChannels) -> Self {
        Self {
            name: name.to_owned(),
            members,
            channels,
            state: SyncState::Unconfigured,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[CoreTriggers] {
        &self.members
    }

    pub fn channels(&self) -> SyncChannels {
        self.channels
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn contains(&self, core: DeviceId) -> bool {
        self.members.iter().any(|member| member.core == core)
    }

    fn ctis(&self) -> BTreeSet<DeviceId> {
        self.members.iter().map(|member| member.cti).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TraceGate {
    cti: DeviceId,
    line: TriggerLine,
    channel: u8,
}

#[derive(Debug)]
pub struct SyncManager {
    groups: Vec<SmpGroup>,
    trace_channel: u8,
    halt_on_trace_trigger: bool,
    trace_gates: BTreeSet<TraceGate>,
}

impl SyncManager {
    /// Validate the channel plan of all SMP groups and the trace channel.
    pub fn new(
        topology: &Topology,
        groups: Vec<SmpGroup>,
        trace_channel: u8,
        halt_on_trace_trigger: bool,
    ) -> Result<Self, Error> {
        check_line(trace_channel)?;

        for group in &groups {
            let SyncChannels { stop, start } = group.channels;
            check_line(stop)?;
            check_line(start)?;
            if stop == start {
                return Err(Error::ChannelConflict {
                    channel: stop,
                    first: group.name.clone(),
                    second: group.name.clone(),
                });
            }
            if trace_channel == stop || trace_channel == start {
                return Err(Error::ChannelConflict {
                    channel: trace_channel,
                    first: "trace".to_owned(),
                    second: group.name.clone(),
                });
            }

            for member in &group.members {
                check_line(member.stop_input)?;
                check_line(member.halt_output)?;
                check_line(member.start_output)?;
                let cti = topology.node(member.cti);
                if cti.kind != DeviceKind::Cti || cti.address.is_none() {
                    return Err(Error::InvalidEdge(format!(
                        "{} of {} is not a programmable CTI",
                        cti.name,
                        topology.name(member.core)
                    )));
                }
            }
        }

        let domains: Vec<BTreeSet<DeviceId>> = groups
            .iter()
            .map(|group| {
                group
                    .ctis()
                    .into_iter()
                    .flat_map(|cti| topology.cti_domain(cti))
                    .collect()
            })
            .collect();

        for (index, group) in groups.iter().enumerate() {
            for other in &groups[index + 1..] {
                if domains[index].is_disjoint(&other.ctis()) {
                    continue;
                }
                let ours = [group.channels.stop, group.channels.start];
                let theirs = [other.channels.stop, other.channels.start];
                if let Some(channel) = ours.iter().find(|channel| theirs.contains(channel)) {
                    return Err(Error::ChannelConflict {
                        channel: *channel,
                        first: group.name.clone(),
                        second: other.name.clone(),
                    });
                }
            }
        }

        // Explicit trigger channels must stay off the run control channels.
        for node in topology.nodes() {
            for binding in topology.trigger_bindings(node.id) {
                let Some(channel) = binding.channel else {
                    continue;
                };
                let owner = groups.iter().zip(&domains).find(|(group, domain)| {
                    domain.contains(&binding.cti)
                        && (channel == group.channels.stop || channel == group.channels.start)
                });
                if let Some((group, _)) = owner {
                    return Err(Error::ChannelConflict {
                        channel,
                        first: node.name.clone(),
                        second: group.name.clone(),
                    });
                }
            }
        }

        Ok(Self {
            groups,
            trace_channel,
            halt_on_trace_trigger,
            trace_gates: BTreeSet::new(),
        })
    }

    pub fn groups(&self) -> &[SmpGroup] {
        &self.groups
    }

    pub fn group_of(&self, core: DeviceId) -> Option<&SmpGroup> {
        self.groups.iter().find(|group| group.contains(core))
    }

    /// CTIs used for run control, whatever the capture mode.
    pub fn ctis(&self) -> BTreeSet<DeviceId> {
        self.groups.iter().flat_map(SmpGroup::ctis).collect()
    }

    /// Program every member's CTI so the group halts and restarts together.
    pub fn configure(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
    ) -> Result<(), Error> {
        let trace_channel = self.halt_on_trace_trigger.then_some(self.trace_channel);

        for group in self.groups.iter_mut() {
            if group.state != SyncState::Unconfigured {
                continue;
            }

            // A partially programmed group is released by unconfigure.
            group.state = SyncState::Configured;
            let SyncChannels { stop, start } = group.channels;
            for member in &group.members {
                log::debug!(
                    "Synchronizing {} via {} (stop {}, start {})",
                    topology.name(member.core),
                    topology.name(member.cti),
                    stop,
                    start
                );
                let address = cti_address(topology, member.cti)?;
                let mut cti = CrossTrigger::new(interface, &address);
                cti.enable()?;
                cti.map_input(member.stop_input, stop, true)?;
                cti.map_output(member.halt_output, stop, true)?;
                cti.map_output(member.start_output, start, true)?;
                cti.set_gate(stop, true)?;
                cti.set_gate(start, true)?;
                if let Some(channel) = trace_channel {
                    cti.map_output(member.halt_output, channel, true)?;
                    cti.set_gate(channel, true)?;
                }
            }

            log::info!("SMP group {} configured", group.name);
        }

        Ok(())
    }

    /// Remove every channel route the groups own.
    ///
    /// All members are visited even if one of them fails; the first error is returned.
    pub fn unconfigure(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
    ) -> Result<(), Error> {
        let trace_channel = self.halt_on_trace_trigger.then_some(self.trace_channel);
        let traced: BTreeSet<DeviceId> = self
            .trace_gates
            .iter()
            .filter(|gate| gate.channel == self.trace_channel)
            .map(|gate| gate.cti)
            .collect();
        let mut first_error = None;

        for group in self.groups.iter_mut() {
            if group.state == SyncState::Unconfigured {
                continue;
            }

            let SyncChannels { stop, start } = group.channels;
            for member in &group.members {
                let result = cti_address(topology, member.cti).and_then(|address| {
                    let mut cti = CrossTrigger::new(interface, &address);
                    cti.map_input(member.stop_input, stop, false)?;
                    cti.map_output(member.halt_output, stop, false)?;
                    cti.map_output(member.start_output, start, false)?;
                    cti.set_gate(stop, false)?;
                    cti.set_gate(start, false)?;
                    if let Some(channel) = trace_channel {
                        cti.map_output(member.halt_output, channel, false)?;
                        if !traced.contains(&member.cti) {
                            cti.set_gate(channel, false)?;
                        }
                    }
                    Ok(())
                });

                if let Err(error) = result {
                    log::warn!(
                        "Failed to release the CTI of {}: {}",
                        topology.name(member.core),
                        error
                    );
                    first_error.get_or_insert(error);
                }
            }

            group.state = SyncState::Unconfigured;
            log::info!("SMP group {} unconfigured", group.name);
        }

        first_error.map_or(Ok(()), Err)
    }

    fn member(&self, topology: &Topology, core: DeviceId) -> Result<(usize, CoreTriggers), Error> {
        self.groups
            .iter()
            .enumerate()
            .find_map(|(index, group)| {
                group
                    .members
                    .iter()
                    .find(|member| member.core == core)
                    .map(|member| (index, *member))
            })
            .ok_or_else(|| Error::NotAMember {
                core: topology.name(core).to_owned(),
                group: "any".to_owned(),
            })
    }

    /// Restart `core` and, through the start channel, every core of its group.
    pub fn go(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
        core: DeviceId,
    ) -> Result<(), Error> {
        let (index, member) = self.member(topology, core)?;
        let group = &mut self.groups[index];
        match group.state {
            SyncState::Unconfigured => return Err(Error::NotConfigured(group.name.clone())),
            SyncState::Running => return Ok(()),
            SyncState::Configured => {}
        }

        let address = cti_address(topology, member.cti)?;
        let mut cti = CrossTrigger::new(interface, &address);
        cti.acknowledge(member.halt_output)?;
        cti.pulse(group.channels.start)?;

        group.state = SyncState::Running;
        log::debug!("SMP group {} running", group.name);
        Ok(())
    }

    /// Halt `core` and, through the stop channel, every core of its group.
    pub fn stop(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
        core: DeviceId,
    ) -> Result<(), Error> {
        let (index, member) = self.member(topology, core)?;
        let group = &mut self.groups[index];
        match group.state {
            SyncState::Unconfigured => return Err(Error::NotConfigured(group.name.clone())),
            SyncState::Configured => return Ok(()),
            SyncState::Running => {}
        }

        let address = cti_address(topology, member.cti)?;
        CrossTrigger::new(interface, &address).pulse(group.channels.stop)?;

        group.state = SyncState::Configured;
        log::debug!("SMP group {} halted", group.name);
        Ok(())
    }

    /// Track an event raised on `channel` by something outside the engine, such as a core
    /// hitting a breakpoint or a trace buffer filling up.
    pub fn external_event(&mut self, channel: u8) {
        let trace_halt = self.halt_on_trace_trigger && channel == self.trace_channel;

        for group in self.groups.iter_mut() {
            let next = match group.state {
                SyncState::Unconfigured => continue,
                SyncState::Running if channel == group.channels.stop || trace_halt => {
                    SyncState::Configured
                }
                SyncState::Configured if channel == group.channels.start => SyncState::Running,
                state => state,
            };
            if next != group.state {
                log::debug!("SMP group {} {:?} -> {:?}", group.name, group.state, next);
                group.state = next;
            }
        }
    }

    /// Route a trace source's trigger input onto its channel, or a sink's trigger output off it.
    ///
    /// Bindings without an explicit channel use the trace channel.
    pub fn set_trace_gate(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
        binding: TriggerBinding,
        enabled: bool,
    ) -> Result<(), Error> {
        let gate = TraceGate {
            cti: binding.cti,
            line: binding.line,
            channel: binding.channel.unwrap_or(self.trace_channel),
        };
        if enabled == self.trace_gates.contains(&gate) {
            return Ok(());
        }
        self.write_trace_gate(topology, interface, gate, enabled)?;
        if enabled {
            self.trace_gates.insert(gate);
        } else {
            self.trace_gates.remove(&gate);
        }
        Ok(())
    }

    fn write_trace_gate(
        &self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
        gate: TraceGate,
        enabled: bool,
    ) -> Result<(), Error> {
        log::debug!(
            "{} {:?} of {} on channel {}",
            if enabled { "Gating" } else { "Ungating" },
            gate.line,
            topology.name(gate.cti),
            gate.channel
        );
        let address = cti_address(topology, gate.cti)?;
        let mut cti = CrossTrigger::new(interface, &address);
        if enabled {
            cti.enable()?;
        }
        match gate.line {
            TriggerLine::Input(trigger) => cti.map_input(trigger, gate.channel, enabled)?,
            TriggerLine::Output(trigger) => cti.map_output(trigger, gate.channel, enabled)?,
        }

        let still_used = self
            .trace_gates
            .iter()
            .any(|other| *other != gate && other.cti == gate.cti && other.channel == gate.channel)
            || self.group_gates(gate.cti, gate.channel);
        if enabled || !still_used {
            cti.set_gate(gate.channel, enabled)?;
        }
        Ok(())
    }

    /// Whether a configured SMP group keeps `channel` gated on `cti`.
    fn group_gates(&self, cti: DeviceId, channel: u8) -> bool {
        let trace_halt = self.halt_on_trace_trigger && channel == self.trace_channel;
        self.groups.iter().any(|group| {
            group.state != SyncState::Unconfigured
                && group.members.iter().any(|member| member.cti == cti)
                && (trace_halt || channel == group.channels.stop || channel == group.channels.start)
        })
    }

    /// Remove every trace gate. The first error is returned after all gates were visited.
    pub fn release_trace_gates(
        &mut self,
        topology: &Topology,
        interface: &mut dyn DeviceAccess,
    ) -> Result<(), Error> {
        let mut first_error = None;
        while let Some(gate) = self.trace_gates.pop_first() {
            if let Err(error) = self.write_trace_gate(topology, interface, gate, false) {
                log::warn!("Failed to release trace gate {:?}: {}", gate, error);
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn has_trace_gates(&self) -> bool {
        !self.trace_gates.is_empty()
    }
}

fn check_line(number: u8) -> Result<(), Error> {
    if number > MAX_LINE {
        return Err(Error::InvalidEdge(format!(
            "CTI line {} is out of range",
            number
        )));
    }
    Ok(())
}

fn cti_address(
    topology: &Topology,
    cti: DeviceId,
) -> Result<crate::access::ComponentAddress, Error> {
    topology
        .node(cti)
        .address
        .ok_or_else(|| Error::InvalidEdge(format!("{} has no address", topology.name(cti))))
}
