//! Host-side register cells that behave like the peripheral
//!
//! Plain memory can't express toggle or write-0-to-clear fields. These cells
//! apply the same write semantics as the silicon, so the driver's register
//! discipline is tested for real.

use crate::pma::PacketMemory;
use crate::ral::{endpoint::EPR, usb};
use crate::vcell::VCell;
use crate::Peripherals;

/// Read / write bits of an endpoint register
const PLAIN: u32 = EPR::EA::mask | EPR::EP_KIND::mask | EPR::EP_TYPE::mask;
/// Bits that invert when written with 1
const TOGGLE: u32 = EPR::STAT_TX::mask | EPR::DTOG_TX::mask | EPR::STAT_RX::mask | EPR::DTOG_RX::mask;
/// Bits that clear when written with 0
const FLAGS: u32 = EPR::CTR_TX::mask | EPR::CTR_RX::mask;

/// An endpoint register (EPnR)
#[repr(transparent)]
pub struct ToggleRegister(VCell<u32>);

impl ToggleRegister {
    pub const fn new(value: u32) -> Self {
        ToggleRegister(VCell::new(value))
    }

    pub fn read(&self) -> u32 {
        self.0.read()
    }

    pub fn write(&self, value: u32) {
        let current = self.0.read();
        let plain = value & PLAIN;
        let toggled = (current ^ value) & TOGGLE;
        let flags = current & value & FLAGS;
        let setup = current & EPR::SETUP::mask;
        self.0.write(plain | toggled | flags | setup);
    }

    /// Overwrite the register, bypassing the write semantics
    pub fn set(&self, value: u32) {
        self.0.write(value);
    }

    /// The peripheral received an OUT or SETUP packet
    ///
    /// Latches CTR_RX, updates SETUP, and NAKs further reception.
    pub fn hw_receive(&self, setup: bool) {
        let mut value = self.0.read();
        value |= EPR::CTR_RX::mask;
        value &= !(EPR::SETUP::mask | EPR::STAT_RX::mask);
        value |= (setup as u32) << EPR::SETUP::offset;
        value |= 0b10 << EPR::STAT_RX::offset;
        self.0.write(value);
    }

    /// The peripheral sent an IN packet
    ///
    /// Latches CTR_TX and NAKs further transmission.
    pub fn hw_transmit(&self) {
        let mut value = self.0.read();
        value |= EPR::CTR_TX::mask;
        value &= !EPR::STAT_TX::mask;
        value |= 0b10 << EPR::STAT_TX::offset;
        self.0.write(value);
    }
}

/// A register whose flags clear when written with 0
#[repr(transparent)]
pub struct ClearRegister(VCell<u32>);

impl ClearRegister {
    pub const fn new(value: u32) -> Self {
        ClearRegister(VCell::new(value))
    }

    pub fn read(&self) -> u32 {
        self.0.read()
    }

    pub fn write(&self, value: u32) {
        self.0.write(self.0.read() & value);
    }

    /// Overwrite the register, bypassing the write semantics
    pub fn set(&self, value: u32) {
        self.0.write(value);
    }
}

/// Register block and packet memory, living in host memory
pub struct Hardware {
    pub usb: usb::RegisterBlock,
    pub pma: PacketMemory,
}

impl Hardware {
    pub fn new() -> Self {
        Hardware {
            usb: usb::RegisterBlock::new(),
            pma: PacketMemory::new(),
        }
    }

    /// The raw endpoint register
    pub fn epr(&self, endpoint: u8) -> &ToggleRegister {
        &self.usb.EPR[usize::from(endpoint)]
    }
}

unsafe impl Peripherals for &Hardware {
    fn usb(&self) -> *const () {
        &self.usb as *const _ as *const ()
    }
    fn packet_memory(&self) -> *const () {
        &self.pma as *const _ as *const ()
    }
}

#[cfg(test)]
mod test {
    use super::{ClearRegister, ToggleRegister};

    #[test]
    fn toggle_bits_invert_on_one() {
        let reg = ToggleRegister::new(0b11 << 4);
        reg.write(0b01 << 4);
        assert_eq!(reg.read(), 0b10 << 4);
    }

    #[test]
    fn flags_clear_on_zero() {
        let reg = ToggleRegister::new(1 << 15 | 1 << 7);
        reg.write(1 << 7);
        assert_eq!(reg.read(), 1 << 7);
    }

    #[test]
    fn clear_register() {
        let reg = ClearRegister::new(0b1111);
        reg.write(!0b0101);
        assert_eq!(reg.read(), 0b1010);
    }
}
