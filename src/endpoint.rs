//! Generic USB endpoints
//!
//! An [`Endpoint`] owns one EPnR register and one buffer descriptor table
//! entry. Everything that changes EPnR goes through [`compute_register_write`],
//! which knows about the register's toggle and write-0-to-clear fields.

use crate::{
    pma::{self, BufferDescriptor, PacketMemory, PMA_SIZE},
    ral,
};
use core::ops::Range;
use usb_device::{Result, UsbError};

use ral::endpoint::EPR;

/// Read / write fields of EPnR
const PLAIN_MASK: u32 = EPR::EA::mask | EPR::EP_KIND::mask | EPR::EP_TYPE::mask;
/// Fields that invert when written with 1
const TOGGLE_MASK: u32 =
    EPR::STAT_TX::mask | EPR::DTOG_TX::mask | EPR::STAT_RX::mask | EPR::DTOG_RX::mask;
/// Fields that clear when written with 0
const FLAG_MASK: u32 = EPR::CTR_TX::mask | EPR::CTR_RX::mask;

/// Size of the buffer descriptor table, in bytes
pub const BDT_SIZE: u16 = crate::NUM_ENDPOINTS as u16 * pma::DESCRIPTOR_SIZE;

/// Endpoint transfer type, as encoded in EP_TYPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EndpointType {
    Bulk = 0,
    Control = 1,
    Isochronous = 2,
    Interrupt = 3,
}

/// Transmit or receive status, as encoded in STAT_TX and STAT_RX
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// All requests are ignored
    Disabled = 0,
    /// Respond with STALL
    Stall = 1,
    /// Respond with NAK
    Nak = 2,
    /// Ready for a transaction
    Valid = 3,
}

impl Status {
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => Status::Disabled,
            1 => Status::Stall,
            2 => Status::Nak,
            _ => Status::Valid,
        }
    }
}

/// Placement and size of an endpoint's buffers in packet memory
///
/// A size of zero means the endpoint doesn't use that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferLayout {
    pub tx_addr: u16,
    pub tx_size: u16,
    pub rx_addr: u16,
    pub rx_size: u16,
}

impl BufferLayout {
    fn tx(&self) -> Range<u32> {
        u32::from(self.tx_addr)..u32::from(self.tx_addr) + u32::from(self.tx_size)
    }

    fn rx(&self) -> Range<u32> {
        u32::from(self.rx_addr)..u32::from(self.rx_addr) + u32::from(self.rx_size)
    }

    /// Check that the buffers fit in packet memory next to a table at `btable`
    pub fn validate(&self, btable: u16) -> Result<()> {
        let bdt = u32::from(btable)..u32::from(btable) + u32::from(BDT_SIZE);
        for buffer in [self.tx(), self.rx()] {
            if buffer.is_empty() {
                continue;
            }
            if buffer.start % 2 != 0 {
                return Err(UsbError::Unsupported);
            }
            if buffer.end > PMA_SIZE as u32 || overlaps(&buffer, &bdt) {
                return Err(UsbError::EndpointMemoryOverflow);
            }
        }
        if overlaps(&self.tx(), &self.rx()) {
            return Err(UsbError::EndpointMemoryOverflow);
        }
        if self.rx_size != 0 && pma::rx_count_encoding(self.rx_size).is_none() {
            return Err(UsbError::Unsupported);
        }
        Ok(())
    }

    /// Returns `true` if any buffer of `self` shares memory with any buffer of `other`
    pub fn overlaps(&self, other: &BufferLayout) -> bool {
        [self.tx(), self.rx()]
            .iter()
            .any(|ours| [other.tx(), other.rx()].iter().any(|theirs| overlaps(ours, theirs)))
    }

    fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            addr_tx: self.tx_addr,
            count_tx: 0,
            addr_rx: self.rx_addr,
            count_rx: pma::rx_count_encoding(self.rx_size).unwrap_or(0),
        }
    }
}

fn overlaps(a: &Range<u32>, b: &Range<u32>) -> bool {
    !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
}

/// A change to an endpoint register
///
/// Plain fields are replaced, toggle fields are driven to a target value, and
/// flags are either cleared or left alone. Fields not named in the update keep
/// their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterUpdate {
    replace_mask: u32,
    replace_value: u32,
    toggle_mask: u32,
    toggle_target: u32,
    clear: u32,
}

impl RegisterUpdate {
    pub const fn new() -> Self {
        RegisterUpdate {
            replace_mask: 0,
            replace_value: 0,
            toggle_mask: 0,
            toggle_target: 0,
            clear: 0,
        }
    }

    /// Replace the plain field(s) in `mask` with `value`
    pub const fn replace(mut self, mask: u32, value: u32) -> Self {
        let mask = mask & PLAIN_MASK;
        self.replace_mask |= mask;
        self.replace_value = (self.replace_value & !mask) | (value & mask);
        self
    }

    /// Drive the toggle field(s) in `mask` to `target`
    pub const fn target(mut self, mask: u32, target: u32) -> Self {
        let mask = mask & TOGGLE_MASK;
        self.toggle_mask |= mask;
        self.toggle_target = (self.toggle_target & !mask) | (target & mask);
        self
    }

    /// Clear the flag(s) in `mask`
    pub const fn clear_flags(mut self, mask: u32) -> Self {
        self.clear |= mask & FLAG_MASK;
        self
    }
}

/// Compute the value to write to an endpoint register that reads `current`
///
/// Toggle fields are written with the XOR of their current and target values,
/// so untouched toggles see zero. Flags are written with 1 unless they should
/// be cleared.
pub const fn compute_register_write(current: u32, update: &RegisterUpdate) -> u32 {
    let plain = (current & PLAIN_MASK & !update.replace_mask) | update.replace_value;
    let toggles = (current ^ update.toggle_target) & update.toggle_mask;
    let flags = FLAG_MASK & !update.clear;
    plain | toggles | flags
}

/// Apply `update` to endpoint register `number` in a single write
pub(crate) fn update_register(usb: &ral::usb::RegisterBlock, number: u8, update: RegisterUpdate) {
    let epr = ral::endpoint::register(usb, number);
    ral::modify_reg!(ral::endpoint, &epr, EPR, |current| {
        compute_register_write(current, &update)
    });
}

/// A USB endpoint
///
/// The endpoint knows its number, type and buffers. Register and packet
/// memory access goes through the instances owned by the device.
pub struct Endpoint {
    number: u8,
    kind: EndpointType,
    layout: BufferLayout,
    /// Address of this endpoint's BDT entry
    descriptor: u16,
}

impl Endpoint {
    pub const fn new(number: u8, kind: EndpointType, btable: u16) -> Self {
        Endpoint {
            number,
            kind,
            layout: BufferLayout {
                tx_addr: 0,
                tx_size: 0,
                rx_addr: 0,
                rx_size: 0,
            },
            descriptor: pma::descriptor_address(btable, number),
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn kind(&self) -> EndpointType {
        self.kind
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn tx_size(&self) -> u16 {
        self.layout.tx_size
    }

    pub fn rx_size(&self) -> u16 {
        self.layout.rx_size
    }

    /// Configure the buffers
    ///
    /// Takes effect on the next [`init_buffer_descriptor`](Self::init_buffer_descriptor).
    pub fn set_buffer_descriptor(&mut self, layout: BufferLayout) {
        self.layout = layout;
    }

    /// Write the buffer configuration into the BDT
    pub(crate) fn init_buffer_descriptor(&self, pma: &PacketMemory) {
        pma::write_descriptor(pma, self.descriptor, &self.layout.descriptor());
    }

    /// Re-apply the endpoint configuration after a bus reset
    ///
    /// The peripheral resets EPnR, but not packet memory.
    pub(crate) fn reset(&self, ral: &ral::Instances) {
        self.init_buffer_descriptor(&ral.pma);
        self.set_address(&ral.usb, self.number);
    }

    fn update(&self, usb: &ral::usb::RegisterBlock, update: RegisterUpdate) {
        update_register(usb, self.number, update);
    }

    pub(crate) fn read_register(&self, usb: &ral::usb::RegisterBlock) -> u32 {
        let epr = ral::endpoint::register(usb, self.number);
        ral::read_reg!(ral::endpoint, &epr, EPR)
    }

    pub(crate) fn set_address(&self, usb: &ral::usb::RegisterBlock, address: u8) {
        self.update(
            usb,
            RegisterUpdate::new().replace(EPR::EA::mask, u32::from(address) << EPR::EA::offset),
        );
    }

    pub(crate) fn set_type(&self, usb: &ral::usb::RegisterBlock, kind: EndpointType) {
        self.update(
            usb,
            RegisterUpdate::new().replace(EPR::EP_TYPE::mask, (kind as u32) << EPR::EP_TYPE::offset),
        );
    }

    pub(crate) fn set_tx_status(&self, usb: &ral::usb::RegisterBlock, status: Status) {
        self.update(
            usb,
            RegisterUpdate::new()
                .target(EPR::STAT_TX::mask, (status as u32) << EPR::STAT_TX::offset),
        );
    }

    pub(crate) fn set_rx_status(&self, usb: &ral::usb::RegisterBlock, status: Status) {
        self.update(
            usb,
            RegisterUpdate::new()
                .target(EPR::STAT_RX::mask, (status as u32) << EPR::STAT_RX::offset),
        );
    }

    pub(crate) fn tx_status(&self, usb: &ral::usb::RegisterBlock) -> Status {
        let epr = ral::endpoint::register(usb, self.number);
        Status::from_bits(ral::read_reg!(ral::endpoint, &epr, EPR, STAT_TX))
    }

    pub(crate) fn rx_status(&self, usb: &ral::usb::RegisterBlock) -> Status {
        let epr = ral::endpoint::register(usb, self.number);
        Status::from_bits(ral::read_reg!(ral::endpoint, &epr, EPR, STAT_RX))
    }

    /// Clear the CTR_RX and CTR_TX flags that are set in `flags`, in one write
    ///
    /// Flags that the peripheral sets after `flags` was read survive.
    pub(crate) fn clear_transfer_flags(&self, usb: &ral::usb::RegisterBlock, flags: u32) {
        self.update(usb, RegisterUpdate::new().clear_flags(flags));
    }

    /// Copy `data` into the TX buffer and arm the transmission
    ///
    /// Silently truncates `data` to the TX buffer size. Returns the number of
    /// bytes that will be sent.
    pub(crate) fn transmit(&self, ral: &ral::Instances, data: &[u8]) -> usize {
        let size = data.len().min(usize::from(self.layout.tx_size));
        ral.pma.write(self.layout.tx_addr, &data[..size]);
        pma::write_tx_count(&ral.pma, self.descriptor, size as u16);
        self.set_tx_status(&ral.usb, Status::Valid);
        size
    }

    /// Copy received data into `buffer` and re-arm reception
    ///
    /// Returns the number of bytes copied.
    pub(crate) fn receive(&self, ral: &ral::Instances, buffer: &mut [u8]) -> usize {
        let size = buffer.len().min(usize::from(self.received_len(&ral.pma)));
        ral.pma.read(self.layout.rx_addr, &mut buffer[..size]);
        self.set_rx_status(&ral.usb, Status::Valid);
        size
    }

    /// Number of bytes received by the last OUT or SETUP transaction
    pub(crate) fn received_len(&self, pma: &PacketMemory) -> u16 {
        pma::read_rx_count(pma, self.descriptor)
    }
}
