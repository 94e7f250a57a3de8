//! Cross trigger interface (CTI) register access.
//!
//! A CTI maps trigger inputs from its attached devices onto channels, and channels onto
//! trigger outputs. Channels are shared with every other CTI on the same cross trigger matrix
//! as long as the channel gate is open.
use crate::access::{AccessError, ComponentAddress, DebugRegister, DeviceAccess};

use bitfield::bitfield;

const REGISTER_OFFSET_ACCESS: u32 = 0xFB0;
const UNLOCK_KEY: u32 = 0xC5AC_CE55;

pub struct CrossTrigger<'a> {
    component: &'a ComponentAddress,
    interface: &'a mut dyn DeviceAccess,
}

impl<'a> CrossTrigger<'a> {
    /// Construct a new cross trigger controller.
    pub fn new(interface: &'a mut dyn DeviceAccess, component: &'a ComponentAddress) -> Self {
        Self {
            component,
            interface,
        }
    }

    /// Unlock the CTI and enable its mapping functions.
    pub fn enable(&mut self) -> Result<(), AccessError> {
        self.interface
            .write_reg(self.component, REGISTER_OFFSET_ACCESS, UNLOCK_KEY)?;

        let mut control = Control::default();
        control.set_glben(true);
        control.store(self.component, self.interface)
    }

    /// Route trigger input `trigger` onto `channel`, or remove that route.
    ///
    /// Routes of other channels on the same input are preserved.
    pub fn map_input(&mut self, trigger: u8, channel: u8, mapped: bool) -> Result<(), AccessError> {
        let mut inen = InEn::load_unit(self.component, self.interface, trigger)?;
        inen.set_channels(with_channel(inen.channels(), channel, mapped));
        inen.store_unit(self.component, self.interface, trigger)
    }

    /// Route `channel` onto trigger output `trigger`, or remove that route.
    pub fn map_output(
        &mut self,
        trigger: u8,
        channel: u8,
        mapped: bool,
    ) -> Result<(), AccessError> {
        let mut outen = OutEn::load_unit(self.component, self.interface, trigger)?;
        outen.set_channels(with_channel(outen.channels(), channel, mapped));
        outen.store_unit(self.component, self.interface, trigger)
    }

    /// Let events on `channel` propagate to the cross trigger matrix, or keep them local.
    pub fn set_gate(&mut self, channel: u8, open: bool) -> Result<(), AccessError> {
        let mut gate = Gate::load(self.component, self.interface)?;
        gate.set_channels(with_channel(gate.channels(), channel, open));
        gate.store(self.component, self.interface)
    }

    /// Generate a single event on `channel`.
    pub fn pulse(&mut self, channel: u8) -> Result<(), AccessError> {
        let mut pulse = AppPulse::default();
        pulse.set_channels(1 << channel);
        pulse.store(self.component, self.interface)
    }

    /// Acknowledge a latched event on trigger output `trigger`.
    pub fn acknowledge(&mut self, trigger: u8) -> Result<(), AccessError> {
        let mut ack = IntAck::default();
        ack.set_triggers(1 << trigger);
        ack.store(self.component, self.interface)
    }
}

fn with_channel(mask: u32, channel: u8, set: bool) -> u32 {
    if set {
        mask | 1 << channel
    } else {
        mask & !(1 << channel)
    }
}

bitfield! {
    #[derive(Clone, Default)]
    pub struct Control(u32);
    impl Debug;

    /// Enables the CTI mapping functions.
    pub glben, set_glben: 0;
}

impl From<u32> for Control {
    fn from(raw: u32) -> Self {
        Control(raw)
    }
}

impl From<Control> for u32 {
    fn from(control: Control) -> u32 {
        control.0
    }
}

impl DebugRegister for Control {
    const ADDRESS: u32 = 0x000;
    const NAME: &'static str = "CTICONTROL";
}

bitfield! {
    #[derive(Clone, Default)]
    pub struct IntAck(u32);
    impl Debug;

    /// Trigger outputs to acknowledge.
    pub u32, triggers, set_triggers: 31, 0;
}

impl From<u32> for IntAck {
    fn from(raw: u32) -> Self {
        IntAck(raw)
    }
}

impl From<IntAck> for u32 {
    fn from(ack: IntAck) -> u32 {
        ack.0
    }
}

impl DebugRegister for IntAck {
    const ADDRESS: u32 = 0x010;
    const NAME: &'static str = "CTIINTACK";
}

bitfield! {
    #[derive(Clone, Default)]
    pub struct AppPulse(u32);
    impl Debug;

    /// Channels to generate an event on.
    pub u32, channels, set_channels: 31, 0;
}

impl From<u32> for AppPulse {
    fn from(raw: u32) -> Self {
        AppPulse(raw)
    }
}

impl From<AppPulse> for u32 {
    fn from(pulse: AppPulse) -> u32 {
        pulse.0
    }
}

impl DebugRegister for AppPulse {
    const ADDRESS: u32 = 0x01C;
    const NAME: &'static str = "CTIAPPPULSE";
}

bitfield! {
    /// One register per trigger input.
    #[derive(Clone, Default)]
    pub struct InEn(u32);
    impl Debug;

    /// Channels the trigger input generates events on.
    pub u32, channels, set_channels: 31, 0;
}

impl From<u32> for InEn {
    fn from(raw: u32) -> Self {
        InEn(raw)
    }
}

impl From<InEn> for u32 {
    fn from(inen: InEn) -> u32 {
        inen.0
    }
}

impl DebugRegister for InEn {
    const ADDRESS: u32 = 0x020;
    const NAME: &'static str = "CTIINEN";
}

bitfield! {
    /// One register per trigger output.
    #[derive(Clone, Default)]
    pub struct OutEn(u32);
    impl Debug;

    /// Channels that raise the trigger output.
    pub u32, channels, set_channels: 31, 0;
}

impl From<u32> for OutEn {
    fn from(raw: u32) -> Self {
        OutEn(raw)
    }
}

impl From<OutEn> for u32 {
    fn from(outen: OutEn) -> u32 {
        outen.0
    }
}

impl DebugRegister for OutEn {
    const ADDRESS: u32 = 0x0A0;
    const NAME: &'static str = "CTIOUTEN";
}

bitfield! {
    #[derive(Clone, Default)]
    pub struct Gate(u32);
    impl Debug;

    /// Channels propagated to the cross trigger matrix.
    pub u32, channels, set_channels: 31, 0;
}

impl From<u32> for Gate {
    fn from(raw: u32) -> Self {
        Gate(raw)
    }
}

impl From<Gate> for u32 {
    fn from(gate: Gate) -> u32 {
        gate.0
    }
}

impl DebugRegister for Gate {
    const ADDRESS: u32 = 0x140;
    const NAME: &'static str = "CTIGATE";
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::access::mock::MockProbe;
    use crate::access::Bus;

    const TEST_CTI_ADDRESS: u64 = 0x8002_0000;

    fn component() -> ComponentAddress {
        ComponentAddress::new(Bus::Apb, TEST_CTI_ADDRESS)
    }

    #[test]
    fn enable_unlocks_first() {
        let mut probe = MockProbe::new();
        probe.expected_write(TEST_CTI_ADDRESS + 0xFB0, 0xC5AC_CE55);
        probe.expected_write(TEST_CTI_ADDRESS, 1);

        let component = component();
        CrossTrigger::new(&mut probe, &component).enable().unwrap();
        assert!(probe.is_done());
    }

    #[test]
    fn mapping_keeps_other_channels() {
        let mut probe = MockProbe::new();
        // CTIINEN2 already routes onto channel 3.
        probe.expected_read(TEST_CTI_ADDRESS + 0x020 + 8, 0b1000);
        probe.expected_write(TEST_CTI_ADDRESS + 0x020 + 8, 0b1001);
        // CTIOUTEN1 routes channels 0 and 2, drop channel 0.
        probe.expected_read(TEST_CTI_ADDRESS + 0x0A0 + 4, 0b0101);
        probe.expected_write(TEST_CTI_ADDRESS + 0x0A0 + 4, 0b0100);

        let component = component();
        let mut cti = CrossTrigger::new(&mut probe, &component);
        cti.map_input(2, 0, true).unwrap();
        cti.map_output(1, 0, false).unwrap();
        drop(cti);
        assert!(probe.is_done());
    }

    #[test]
    fn gate_and_pulse() {
        let mut probe = MockProbe::new();
        probe.expected_read(TEST_CTI_ADDRESS + 0x140, 0);
        probe.expected_write(TEST_CTI_ADDRESS + 0x140, 0b10);
        probe.expected_write(TEST_CTI_ADDRESS + 0x01C, 0b10);
        probe.expected_write(TEST_CTI_ADDRESS + 0x010, 0b1);

        let component = component();
        let mut cti = CrossTrigger::new(&mut probe, &component);
        cti.set_gate(1, true).unwrap();
        cti.pulse(1).unwrap();
        cti.acknowledge(0).unwrap();
        drop(cti);
        assert!(probe.is_done());
    }
}
