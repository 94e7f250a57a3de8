//! The devices each trace capture mode needs connected.
use std::collections::{BTreeMap, BTreeSet};

use crate::topology::DeviceId;

/// What to do with the connected devices when the capture mode changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeTransition {
    /// Devices only the old mode needs. Released before anything is connected.
    pub disconnect: Vec<DeviceId>,
    /// Devices only the new mode needs.
    pub connect: Vec<DeviceId>,
}

#[derive(Clone, Debug, Default)]
pub struct ManagedDeviceSet {
    platform: BTreeSet<DeviceId>,
    modes: BTreeMap<String, BTreeSet<DeviceId>>,
}

impl ManagedDeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices that are connected in every mode.
    pub fn add_platform(&mut self, devices: impl IntoIterator<Item = DeviceId>) {
        self.platform.extend(devices);
    }

    /// Add devices to a mode. Devices already present are left as they are.
    pub fn add_to_mode(&mut self, mode: &str, devices: impl IntoIterator<Item = DeviceId>) {
        self.modes.entry(mode.to_owned()).or_default().extend(devices);
    }

    pub fn is_known(&self, mode: &str) -> bool {
        self.modes.contains_key(mode)
    }

    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.modes.keys().map(String::as_str)
    }

    /// The platform devices plus the devices registered for `mode`.
    ///
    /// Unknown modes only get the platform devices.
    pub fn set_for(&self, mode: &str) -> BTreeSet<DeviceId> {
        let mut set = self.platform.clone();
        match self.modes.get(mode) {
            Some(devices) => set.extend(devices),
            None => log::warn!("No devices registered for trace capture mode '{}'", mode),
        }
        set
    }

    pub fn transition(&self, from: &str, to: &str) -> ModeTransition {
        let old = self.set_for(from);
        let new = self.set_for(to);
        ModeTransition {
            disconnect: old.difference(&new).copied().collect(),
            connect: new.difference(&old).copied().collect(),
        }
    }
}
