//! Register level access to CoreSight components.
//!
//! The engine never talks to a probe directly. Every register read or write, and every trace
//! range installation, goes through a [`DeviceAccess`] implementation supplied by the session.
use serde::Deserialize;
use thiserror::Error;

/// The bus a component is reached through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    Apb,
    Ahb,
    Axi,
}

/// Location of a component's register block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct ComponentAddress {
    pub bus: Bus,
    pub base: u64,
}

impl ComponentAddress {
    pub fn new(bus: Bus, base: u64) -> Self {
        Self { bus, base }
    }

    /// Absolute address of the register at `offset`.
    pub fn register(&self, offset: u32) -> u64 {
        self.base + offset as u64
    }
}

/// Opaque handle for an address range installed on a trace macrocell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeHandle(pub u32);

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Reading {address:#X} on {bus:?} failed")]
    Read { bus: Bus, address: u64 },
    #[error("Writing {address:#X} on {bus:?} failed")]
    Write { bus: Bus, address: u64 },
    #[error("The component at {0:#X} has no free address comparators")]
    NoComparators(u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Synchronous, fallible access to the target's debug components.
pub trait DeviceAccess {
    fn read_reg(&mut self, component: &ComponentAddress, offset: u32) -> Result<u32, AccessError>;

    fn write_reg(
        &mut self,
        component: &ComponentAddress,
        offset: u32,
        value: u32,
    ) -> Result<(), AccessError>;

    /// Install an address range filter on a trace source.
    fn add_trace_range(
        &mut self,
        source: &ComponentAddress,
        start: u64,
        end: u64,
    ) -> Result<RangeHandle, AccessError>;

    /// Release a filter previously returned by [`DeviceAccess::add_trace_range`].
    fn clear_trace_range(
        &mut self,
        source: &ComponentAddress,
        handle: RangeHandle,
    ) -> Result<(), AccessError>;
}

/// A typed view of a single 32 bit component register.
pub trait DebugRegister: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    const ADDRESS: u32;
    const NAME: &'static str;

    fn load(
        component: &ComponentAddress,
        interface: &mut dyn DeviceAccess,
    ) -> Result<Self, AccessError> {
        Ok(Self::from(interface.read_reg(component, Self::ADDRESS)?))
    }

    /// Load the `unit`th register of an array of consecutive registers.
    fn load_unit(
        component: &ComponentAddress,
        interface: &mut dyn DeviceAccess,
        unit: u8,
    ) -> Result<Self, AccessError> {
        Ok(Self::from(
            interface.read_reg(component, Self::ADDRESS + 4 * unit as u32)?,
        ))
    }

    fn store(
        &self,
        component: &ComponentAddress,
        interface: &mut dyn DeviceAccess,
    ) -> Result<(), AccessError> {
        let value: u32 = self.clone().into();
        log::trace!("{} <- {:#010X}", Self::NAME, value);
        interface.write_reg(component, Self::ADDRESS, value)
    }

    fn store_unit(
        &self,
        component: &ComponentAddress,
        interface: &mut dyn DeviceAccess,
        unit: u8,
    ) -> Result<(), AccessError> {
        let value: u32 = self.clone().into();
        log::trace!("{}[{}] <- {:#010X}", Self::NAME, unit, value);
        interface.write_reg(component, Self::ADDRESS + 4 * unit as u32, value)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    struct ExpectedOp {
        read: bool,
        address: u64,
        value: u32,
    }

    /// Checks register accesses against a scripted sequence.
    pub struct MockProbe {
        expected_ops: Vec<ExpectedOp>,
    }

    impl MockProbe {
        pub fn new() -> Self {
            MockProbe {
                expected_ops: vec![],
            }
        }

        pub fn expected_read(&mut self, address: u64, value: u32) {
            self.expected_ops.push(ExpectedOp {
                read: true,
                address,
                value,
            });
        }

        pub fn expected_write(&mut self, address: u64, value: u32) {
            self.expected_ops.push(ExpectedOp {
                read: false,
                address,
                value,
            });
        }

        pub fn is_done(&self) -> bool {
            self.expected_ops.is_empty()
        }
    }

    impl DeviceAccess for MockProbe {
        fn read_reg(
            &mut self,
            component: &ComponentAddress,
            offset: u32,
        ) -> Result<u32, AccessError> {
            let address = component.register(offset);
            if self.expected_ops.is_empty() {
                panic!("Received unexpected read: {:#X}", address);
            }

            let expected_op = self.expected_ops.remove(0);
            assert!(expected_op.read, "Expected a write to {:#X}", expected_op.address);
            assert_eq!(expected_op.address, address, "Read from unexpected register");
            Ok(expected_op.value)
        }

        fn write_reg(
            &mut self,
            component: &ComponentAddress,
            offset: u32,
            value: u32,
        ) -> Result<(), AccessError> {
            let address = component.register(offset);
            if self.expected_ops.is_empty() {
                panic!("Received unexpected write: {:#X} <- {:#X}", address, value);
            }

            let expected_op = self.expected_ops.remove(0);
            assert!(!expected_op.read, "Expected a read of {:#X}", expected_op.address);
            assert_eq!(expected_op.address, address, "Write to unexpected register");
            assert_eq!(expected_op.value, value, "Unexpected value for {:#X}", address);
            Ok(())
        }

        fn add_trace_range(
            &mut self,
            _source: &ComponentAddress,
            _start: u64,
            _end: u64,
        ) -> Result<RangeHandle, AccessError> {
            todo!()
        }

        fn clear_trace_range(
            &mut self,
            _source: &ComponentAddress,
            _handle: RangeHandle,
        ) -> Result<(), AccessError> {
            todo!()
        }
    }
}
